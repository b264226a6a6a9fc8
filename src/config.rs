//! Command line configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::batch::DEFAULT_WORKERS;
use crate::job::{JobContext, JobSpec, DEFAULT_TRIGGERS};
use crate::pipeline::{PipelineConfig, DEFAULT_QUEUE_CAPACITY};

/// Rebuild Guacamole session recordings into frames and export screenshots.
#[derive(Debug, Clone, Parser)]
#[command(name = "guacshot", version, about)]
pub struct Cli {
    /// Recording URLs (http, https, file) or local paths
    pub urls: Vec<String>,

    /// JSON file holding an array of job specifications
    #[arg(long)]
    pub jobs_file: Option<PathBuf>,

    /// Recordings processed at the same time
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Runtime worker threads (defaults to the number of cores)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Progress percentages to export, comma separated
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_TRIGGERS)]
    pub triggers: Vec<u32>,

    /// Export every complete frame instead of sampling by progress
    #[arg(long, conflicts_with = "triggers")]
    pub all_frames: bool,

    #[arg(long, default_value = "screenshots")]
    pub out_dir: PathBuf,

    /// Screenshot file name prefix
    #[arg(long)]
    pub prefix: Option<String>,

    /// Rebuild frames and select triggers without writing images
    #[arg(long)]
    pub no_export: bool,

    /// Verbose logs and a per-instruction trace
    #[arg(long)]
    pub debug: bool,

    /// Accepted for compatibility, live replay is not supported
    #[arg(long)]
    pub replay: bool,

    /// Seconds to wait for each chunk of a stream
    #[arg(long, default_value_t = 120)]
    pub read_timeout: u64,

    /// Seconds to wait for an HTTP connection
    #[arg(long, default_value_t = 30)]
    pub connect_timeout: u64,

    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// Save a raw copy of every stream into this directory
    #[arg(long, value_name = "DIR")]
    pub dump_raw: Option<PathBuf>,

    /// Write a JSON summary of all outcomes to this file
    #[arg(long, value_name = "FILE")]
    pub summary: Option<PathBuf>,
}

impl Cli {
    fn triggers(&self) -> Vec<u32> {
        if self.all_frames {
            Vec::new()
        } else {
            self.triggers.clone()
        }
    }

    /// Job specifications from the jobs file followed by the positional URLs.
    pub fn jobs(&self) -> anyhow::Result<Vec<JobSpec>> {
        let mut jobs = match &self.jobs_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| format!("reading jobs file {:?}", path))?;
                serde_json::from_str::<Vec<JobSpec>>(&text)
                    .with_context(|| format!("parsing jobs file {:?}", path))?
            }
            None => Vec::new(),
        };

        let numbered = self.urls.len() > 1;
        for (i, url) in self.urls.iter().enumerate() {
            let prefix = match &self.prefix {
                Some(p) if numbered => Some(format!("{}-{}", p, i)),
                other => other.clone(),
            };
            jobs.push(JobSpec {
                url: url.clone(),
                export: !self.no_export,
                triggers: self.triggers(),
                prefix,
                replay: self.replay,
                debug: self.debug,
                session_url: None,
            });
        }

        if jobs.is_empty() {
            anyhow::bail!("no recordings given, pass URLs or --jobs-file");
        }
        Ok(jobs)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.queue_capacity.max(1),
            read_timeout: Duration::from_secs(self.read_timeout.max(1)),
            debug: self.debug,
            raw_dump: None,
        }
    }

    pub fn job_context(&self, client: reqwest::Client) -> JobContext {
        JobContext {
            client,
            out_dir: self.out_dir.clone(),
            pipeline: self.pipeline_config(),
            dump_dir: self.dump_raw.clone(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}
