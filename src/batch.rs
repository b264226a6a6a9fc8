//! Bounded-parallel execution of many jobs
//!
//! Every task is spawned up front; a semaphore decides how many of them run at
//! the same time. A failing or panicking job only produces a failed
//! [`JobOutcome`], the rest of the batch is unaffected.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

pub const DEFAULT_WORKERS: usize = 7;

type JobFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'static>>;

/// A labelled unit of work for the orchestrator.
pub struct BatchTask<T> {
    pub label: String,
    future: JobFuture<T>,
}

impl<T> BatchTask<T> {
    pub fn new<F>(label: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            label: label.into(),
            future: Box::pin(future),
        }
    }
}

#[derive(Debug)]
pub struct JobOutcome<T> {
    pub label: String,
    pub result: Option<T>,
    pub error: Option<anyhow::Error>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl<T> JobOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl<T: Serialize> JobOutcome<T> {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "label": self.label,
            "success": self.is_success(),
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "duration_ms": self.duration().num_milliseconds(),
            "result": self.result,
            "error": self.error.as_ref().map(|e| format!("{:#}", e)),
        })
    }
}

/// Outcomes of one batch, ordered by start time.
#[derive(Debug)]
pub struct BatchResults<T> {
    outcomes: Vec<JobOutcome<T>>,
}

impl<T> BatchResults<T> {
    pub fn all(&self) -> &[JobOutcome<T>] {
        &self.outcomes
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &JobOutcome<T>> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobOutcome<T>> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn into_outcomes(self) -> Vec<JobOutcome<T>> {
        self.outcomes
    }
}

pub struct BatchOrchestrator {
    workers: usize,
    semaphore: Arc<Semaphore>,
}

impl BatchOrchestrator {
    /// At most `workers` jobs run at the same time (at least one).
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn execute<T>(&self, tasks: Vec<BatchTask<T>>) -> BatchResults<T>
    where
        T: Send + 'static,
    {
        info!("🧵 Running {} jobs with {} workers", tasks.len(), self.workers);
        let outcomes = Arc::new(Mutex::new(Vec::with_capacity(tasks.len())));
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let semaphore = Arc::clone(&self.semaphore);
            let outcomes = Arc::clone(&outcomes);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    error!("Worker pool closed before {} could start", task.label);
                    return;
                };
                let started_at = Utc::now();
                info!("▶️ {} started", task.label);

                // the job runs as its own task so that a panic is caught here
                let (result, error) = match tokio::spawn(task.future).await {
                    Ok(Ok(value)) => (Some(value), None),
                    Ok(Err(e)) => (None, Some(e)),
                    Err(e) => (None, Some(anyhow::anyhow!("job task failed: {}", e))),
                };
                let finished_at = Utc::now();

                match &error {
                    None => info!("🏁 {} finished in {} ms", task.label, (finished_at - started_at).num_milliseconds()),
                    Some(e) => warn!("💥 {} failed: {:#}", task.label, e),
                }
                outcomes.lock().await.push(JobOutcome {
                    label: task.label,
                    result,
                    error,
                    started_at,
                    finished_at,
                });
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Batch worker failed: {}", e);
            }
        }

        let mut outcomes = std::mem::take(&mut *outcomes.lock().await);
        outcomes.sort_by_key(|o| o.started_at);
        BatchResults { outcomes }
    }
}
