//! guacshot - batch screenshot extraction from Guacamole session recordings

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use guacshot::batch::{BatchOrchestrator, BatchTask};
use guacshot::config::Cli;
use guacshot::job::{run_job, JobReport};
use guacshot::source;

fn init_tracing(debug: bool) {
    let default = if debug { "guacshot=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = cli.threads {
        builder.worker_threads(threads.max(1));
    }
    let runtime = builder.build().context("building tokio runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!("Starting guacshot");
    let jobs = cli.jobs()?;
    let client = source::http_client(cli.connect_timeout(), cli.insecure)?;
    let ctx = Arc::new(cli.job_context(client));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling running jobs");
                cancel.cancel();
            }
        });
    }

    let tasks: Vec<BatchTask<JobReport>> = jobs
        .into_iter()
        .map(|spec| {
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.child_token();
            BatchTask::new(spec.label(), async move { Ok(run_job(&spec, &ctx, cancel).await?) })
        })
        .collect();

    let started_at = Utc::now();
    let results = BatchOrchestrator::new(cli.workers).execute(tasks).await;
    let finished_at = Utc::now();

    let ok = results.succeeded().count();
    let failed = results.failed().count();
    let saved: usize = results
        .succeeded()
        .filter_map(|o| o.result.as_ref())
        .map(|r| r.artifacts.len())
        .sum();
    info!(
        "📊 {} recordings processed, {} failed, {} screenshots saved in {} s",
        ok + failed,
        failed,
        saved,
        (finished_at - started_at).num_seconds()
    );
    for outcome in results.failed() {
        if let Some(e) = &outcome.error {
            error!("❌ {}: {:#}", outcome.label, e);
        }
    }

    if let Some(path) = &cli.summary {
        let summary = json!({
            "started_at": started_at,
            "finished_at": finished_at,
            "succeeded": ok,
            "failed": failed,
            "jobs": results.all().iter().map(|o| o.to_json()).collect::<Vec<_>>(),
        });
        let text = serde_json::to_string_pretty(&summary)?;
        tokio::fs::write(path, text)
            .await
            .with_context(|| format!("writing summary {:?}", path))?;
        info!("Summary written to {:?}", path);
    }

    if ok == 0 {
        anyhow::bail!("all {} recordings failed", failed);
    }
    Ok(())
}
