//! One recording, end to end: fetch, rebuild frames, pick triggers, export

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ExportError, JobError, TransportError};
use crate::pipeline::{self, PipelineConfig};
use crate::render::{self, Artifact, Exporter, SelectedFrame};
use crate::source;
use crate::trigger::{self, TriggerPlan};

pub const DEFAULT_TRIGGERS: [u32; 3] = [4, 50, 99];

fn default_export() -> bool {
    true
}

fn default_triggers() -> Vec<u32> {
    DEFAULT_TRIGGERS.to_vec()
}

/// What to do with one recording. Deserializable from JSON job files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// `http(s)://` URL, `file://` URL or local path
    pub url: String,
    #[serde(default = "default_export")]
    pub export: bool,
    /// Progress percentages to export. Empty means every frame.
    #[serde(default = "default_triggers")]
    pub triggers: Vec<u32>,
    #[serde(default)]
    pub prefix: Option<String>,
    /// Live replay is not supported, the flag is only acknowledged
    #[serde(default)]
    pub replay: bool,
    #[serde(default)]
    pub debug: bool,
    /// Link back to the recorded session, copied into artifacts
    #[serde(default)]
    pub session_url: Option<String>,
}

impl JobSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            export: default_export(),
            triggers: default_triggers(),
            prefix: None,
            replay: false,
            debug: false,
            session_url: None,
        }
    }

    /// Name used in logs and summaries.
    pub fn label(&self) -> String {
        self.prefix.clone().unwrap_or_else(|| self.url.clone())
    }

    fn dump_file_name(&self) -> String {
        let stem: String = self
            .label()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("{}.guac", stem)
    }
}

/// Resources shared by every job of a batch.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub client: reqwest::Client,
    pub out_dir: PathBuf,
    pub pipeline: PipelineConfig,
    /// Directory receiving a raw copy of every stream
    pub dump_dir: Option<PathBuf>,
}

impl JobContext {
    pub fn new(client: reqwest::Client, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            out_dir: out_dir.into(),
            pipeline: PipelineConfig::default(),
            dump_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub url: String,
    pub prefix: Option<String>,
    pub frames_total: usize,
    /// Frames that are both complete and synced
    pub frames_exportable: usize,
    pub instructions: u64,
    pub plan: TriggerPlan,
    pub selected: Vec<SelectedFrame>,
    pub artifacts: Vec<Artifact>,
    pub skipped: usize,
}

/// Process one recording.
///
/// A pipeline failure is returned as [`JobError::Pipeline`] together with the
/// frames rebuilt before it; nothing is exported in that case.
pub async fn run_job(spec: &JobSpec, ctx: &JobContext, cancel: CancellationToken) -> Result<JobReport, JobError> {
    if spec.replay {
        warn!("Replay was requested for {} but is not supported, ignoring", spec.url);
    }

    let mut config = ctx.pipeline.clone();
    config.debug |= spec.debug;
    if let Some(dir) = &ctx.dump_dir {
        tokio::fs::create_dir_all(dir).await.map_err(ExportError::from)?;
        config.raw_dump = Some(dir.join(spec.dump_file_name()));
    }

    info!("🚀 Processing {}", spec.url);
    // the request phase is bounded like every chunk read
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(JobError::Cancelled),
        opened = tokio::time::timeout(config.read_timeout, source::open(&ctx.client, &spec.url)) => match opened {
            Ok(stream) => stream?,
            Err(_) => return Err(TransportError::Timeout(config.read_timeout).into()),
        },
    };
    let output = pipeline::run(stream, &config, cancel).await;

    let instructions = output.instructions_folded;
    let frames = output.frames;
    if let Some(source) = output.failure {
        return Err(JobError::Pipeline { source, frames });
    }

    let plan = trigger::plan(&trigger::frame_timestamps(&frames), &spec.triggers);
    let frames_total = frames.len();
    let frames_exportable = frames.iter().filter(|f| f.is_complete() && f.is_synced()).count();

    let exporter = if spec.export {
        tokio::fs::create_dir_all(&ctx.out_dir).await.map_err(ExportError::from)?;
        let session_url = spec.session_url.clone().unwrap_or_else(|| spec.url.clone());
        Some(Exporter::new(ctx.out_dir.clone(), spec.prefix.clone(), session_url))
    } else {
        None
    };

    let render_plan = plan.clone();
    let summary = tokio::task::spawn_blocking(move || render::render_selected(&frames, &render_plan, exporter.as_ref()))
        .await
        .map_err(|e| JobError::TaskFailed(format!("render: {}", e)))?;

    info!(
        "✅ {}: {} frames, {} selected, {} saved",
        spec.label(),
        frames_total,
        summary.selected.len(),
        summary.artifacts.len()
    );

    Ok(JobReport {
        url: spec.url.clone(),
        prefix: spec.prefix.clone(),
        frames_total,
        frames_exportable,
        instructions,
        plan,
        selected: summary.selected,
        artifacts: summary.artifacts,
        skipped: summary.skipped,
    })
}
