//! Ingestion pipeline: stream reader and frame builder tasks
//!
//! The reader pulls chunks from a [`StreamSource`], decodes them and pushes
//! sequenced instructions into a bounded channel. The builder drains the
//! channel in order and folds every instruction into frames. Dropping the
//! sender is the end-of-input signal; the builder finishes once it has drained
//! everything that was sent before it.

use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decoder::StreamDecoder;
use crate::error::{AssemblyError, PipelineError, TransportError};
use crate::frame::{Frame, FrameAssembler};
use crate::instruction::SequencedInstruction;
use crate::source::StreamSource;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bound of the reader → builder channel
    pub queue_capacity: usize,
    /// Maximum wait for a single chunk
    pub read_timeout: Duration,
    /// Trace every folded instruction at debug level
    pub debug: bool,
    /// Copy the raw stream to this file while decoding
    pub raw_dump: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            debug: false,
            raw_dump: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineOutput {
    /// Frames emitted before the pipeline stopped, in stream order
    pub frames: Vec<Frame>,
    pub instructions_read: u64,
    pub instructions_folded: u64,
    pub failure: Option<PipelineError>,
}

impl PipelineOutput {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

struct ReaderSummary {
    sent: u64,
    failure: Option<PipelineError>,
}

struct BuilderSummary {
    frames: Vec<Frame>,
    folded: u64,
    failure: Option<AssemblyError>,
}

enum Read {
    Chunk(bytes::Bytes),
    Exhausted,
    Failed(PipelineError),
}

/// Run one recording through the reader and builder tasks.
///
/// Cancelling `cancel` stops the reader between reads; the builder still
/// drains whatever was already queued.
pub async fn run<S>(source: S, config: &PipelineConfig, cancel: CancellationToken) -> PipelineOutput
where
    S: StreamSource + 'static,
{
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let reader_cancel = cancel.child_token();

    let reader = tokio::spawn(read_stream(source, tx, config.clone(), reader_cancel.clone()));
    let builder = tokio::spawn(build_frames(rx, config.debug, reader_cancel));
    let (reader, builder) = tokio::join!(reader, builder);

    let mut output = PipelineOutput::default();
    let reader_failure = match reader {
        Ok(summary) => {
            output.instructions_read = summary.sent;
            summary.failure
        }
        Err(e) => Some(PipelineError::TaskFailed(format!("stream reader: {}", e))),
    };
    match builder {
        Ok(summary) => {
            output.frames = summary.frames;
            output.instructions_folded = summary.folded;
            // an assembly violation is what stopped the reader, report it first
            output.failure = summary.failure.map(PipelineError::from).or(reader_failure);
        }
        Err(e) => {
            output.failure = Some(PipelineError::TaskFailed(format!("frame builder: {}", e)));
        }
    }

    match &output.failure {
        None => info!(
            "🎞️ Rebuilt {} frames from {} instructions",
            output.frames.len(),
            output.instructions_folded
        ),
        Some(e) => warn!(
            "Pipeline stopped after {} frames / {} instructions: {}",
            output.frames.len(),
            output.instructions_folded,
            e
        ),
    }
    output
}

async fn open_dump(config: &PipelineConfig) -> Option<BufWriter<File>> {
    let path = config.raw_dump.as_ref()?;
    match File::create(path).await {
        Ok(file) => {
            info!("Dumping raw stream to {:?}", path);
            Some(BufWriter::new(file))
        }
        Err(e) => {
            error!("Failed to create raw dump file {:?}: {}", path, e);
            None
        }
    }
}

async fn read_stream<S: StreamSource>(
    mut source: S,
    tx: mpsc::Sender<SequencedInstruction>,
    config: PipelineConfig,
    cancel: CancellationToken,
) -> ReaderSummary {
    let origin = source.describe();
    let mut decoder = StreamDecoder::new();
    let mut dump = open_dump(&config).await;
    let mut next_id = 0u64;
    let mut failure = None;

    debug!("Stream reader started for {}", origin);

    'read: loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => Read::Failed(PipelineError::Cancelled),
            next = tokio::time::timeout(config.read_timeout, source.next_chunk()) => match next {
                Ok(Ok(Some(chunk))) if !chunk.is_empty() => Read::Chunk(chunk),
                Ok(Ok(_)) => Read::Exhausted,
                Ok(Err(e)) => Read::Failed(e.into()),
                Err(_) => Read::Failed(TransportError::Timeout(config.read_timeout).into()),
            },
        };

        let chunk = match read {
            Read::Chunk(chunk) => chunk,
            Read::Exhausted => break,
            Read::Failed(e) => {
                if !matches!(e, PipelineError::Cancelled) {
                    error!("❌ Stream {} failed: {}", origin, e);
                }
                failure = Some(e);
                break;
            }
        };

        if let Some(writer) = dump.as_mut() {
            if let Err(e) = writer.write_all(&chunk).await {
                error!("Failed to write raw dump: {}", e);
                dump = None;
            }
        }

        let batch = decoder.feed(&chunk);
        for instruction in batch.instructions {
            let item = SequencedInstruction {
                sequence_id: next_id,
                instruction,
            };
            if tx.send(item).await.is_err() {
                debug!("Frame builder is gone, stopping reader");
                break 'read;
            }
            next_id += 1;
        }

        if let Some(e) = batch.error.filter(|e| e.is_fatal()) {
            failure = Some(e.into());
            break;
        }
    }

    if let Some(tail) = decoder.finish() {
        if failure.is_none() {
            warn!("Discarding {} bytes of an unterminated trailing instruction", tail.len());
        }
    }
    if let Some(mut writer) = dump {
        if let Err(e) = writer.flush().await {
            error!("Failed to flush raw dump: {}", e);
        }
    }

    info!("📦 {} instructions enqueued from {}", next_id, origin);
    ReaderSummary {
        sent: next_id,
        failure,
    }
}

async fn build_frames(
    mut rx: mpsc::Receiver<SequencedInstruction>,
    trace: bool,
    reader_cancel: CancellationToken,
) -> BuilderSummary {
    let mut assembler = FrameAssembler::new();
    let mut frames = Vec::new();
    let mut folded = 0u64;
    let mut failure = None;

    while let Some(item) = rx.recv().await {
        if trace {
            match item.instruction.raw_payload() {
                Some(data) => debug!("#{} {} ({} bytes)", item.sequence_id, item.instruction.opcode(), data.len()),
                None => debug!("#{} {:?}", item.sequence_id, item.instruction),
            }
        }
        match assembler.fold(&item) {
            Ok(done) => {
                folded += 1;
                frames.extend(done);
            }
            Err(e) => {
                error!("❌ {}", e);
                failure = Some(e);
                reader_cancel.cancel();
                break;
            }
        }
    }

    if failure.is_none() {
        frames.extend(assembler.finish());
        debug!("No more instructions to process");
    }

    BuilderSummary {
        frames,
        folded,
        failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{encode_all, Instruction};
    use crate::source::ChunkSource;

    fn recording(frames: usize) -> Vec<Instruction> {
        let mut out = vec![Instruction::Size { layer_index: 0, width: 800, height: 600 }];
        for i in 0..frames {
            out.push(Instruction::Img {
                stream_index: 1,
                channel_mask: 14,
                layer: 0,
                mimetype: "image/png".to_string(),
                x: i as i64,
                y: 0,
            });
            out.push(Instruction::Blob { stream_index: 1, data: b"AAAA".to_vec() });
            out.push(Instruction::End { stream_index: 1 });
            out.push(Instruction::Sync { timestamp: 1000 + i as i64 });
        }
        out
    }

    fn debug_config(capacity: usize) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: capacity,
            debug: true,
            ..PipelineConfig::default()
        }
    }

    /// Every frame of `recording(n)` in order, starting at the expected id.
    fn assert_frames_in_order(frames: &[Frame], n: usize) {
        assert_eq!(frames.len(), n);
        for (i, frame) in frames.iter().enumerate() {
            let first_id = if i == 0 { 0 } else { 1 + 4 * i as u64 };
            assert_eq!(frame.first_sequence_id, Some(first_id), "frame {}", i);
            assert_eq!(frame.x, i as i64);
            assert_eq!(frame.timestamp, Some(1000 + i as i64));
            assert_eq!(frame.buffer, b"AAAA");
        }
    }

    #[tokio::test]
    async fn test_rebuilds_all_frames() {
        let wire = encode_all(&recording(20));
        let source = ChunkSource::split(&wire, 7);
        let output = run(source, &PipelineConfig::default(), CancellationToken::new()).await;

        assert!(output.is_success(), "{:?}", output.failure);
        assert_eq!(output.frames.len(), 20);
        assert_eq!(output.instructions_read, 81);
        assert_eq!(output.instructions_folded, 81);
        assert_eq!(output.frames[19].timestamp, Some(1019));
    }

    #[tokio::test]
    async fn test_no_instruction_loss_with_tiny_queue() {
        let instructions = recording(50);
        let wire = encode_all(&instructions);
        let output = run(ChunkSource::split(&wire, 3), &debug_config(1), CancellationToken::new()).await;

        assert!(output.is_success(), "{:?}", output.failure);
        assert_eq!(output.instructions_read, instructions.len() as u64);
        assert_eq!(output.instructions_folded, instructions.len() as u64);
        assert_frames_in_order(&output.frames, 50);
    }

    #[tokio::test]
    async fn test_no_instruction_loss_with_slow_reader() {
        let instructions = recording(5);
        let wire = encode_all(&instructions);
        let source = ChunkSource::split(&wire, 16).with_delay(Duration::from_millis(1));
        let output = run(source, &debug_config(4), CancellationToken::new()).await;

        assert_eq!(output.instructions_folded, instructions.len() as u64);
        assert_frames_in_order(&output.frames, 5);
    }

    #[tokio::test]
    async fn test_transport_error_keeps_drained_frames() {
        let wire = encode_all(&recording(3));
        let source = ChunkSource::new(vec![wire]).failing_with(TransportError::Status(502));
        let output = run(source, &PipelineConfig::default(), CancellationToken::new()).await;

        assert!(matches!(
            output.failure,
            Some(PipelineError::Transport(TransportError::Status(502)))
        ));
        assert_eq!(output.frames.len(), 3);
    }

    #[tokio::test]
    async fn test_unsupported_opcode_is_fatal() {
        let mut wire = encode_all(&recording(2));
        wire.push_str("4.rect,1.0;");
        wire.push_str(&encode_all(&recording(2)));
        let output = run(ChunkSource::new(vec![wire]), &PipelineConfig::default(), CancellationToken::new()).await;

        assert!(matches!(output.failure, Some(PipelineError::Decode(_))));
        assert_eq!(output.instructions_read, 9);
        assert_eq!(output.frames.len(), 2);
    }

    #[tokio::test]
    async fn test_assembly_violation_stops_pipeline() {
        let img = Instruction::Img {
            stream_index: 1,
            channel_mask: 14,
            layer: 0,
            mimetype: "image/png".to_string(),
            x: 0,
            y: 0,
        };
        let wire = encode_all(&[img.clone(), img]);
        let output = run(ChunkSource::new(vec![wire]), &PipelineConfig::default(), CancellationToken::new()).await;

        assert!(matches!(
            output.failure,
            Some(PipelineError::Assembly(AssemblyError::DuplicateOpcode { opcode: "img", .. }))
        ));
        assert!(output.frames.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_stops_reader() {
        let wire = encode_all(&recording(100));
        let source = ChunkSource::split(&wire, 64).with_delay(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let output = run(source, &PipelineConfig::default(), cancel).await;

        assert!(matches!(output.failure, Some(PipelineError::Cancelled)));
        assert_eq!(output.instructions_read, 0);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let source = ChunkSource::new(vec!["1.i;"]).with_delay(Duration::from_millis(200));
        let config = PipelineConfig {
            read_timeout: Duration::from_millis(20),
            ..PipelineConfig::default()
        };
        let output = run(source, &config, CancellationToken::new()).await;
        assert!(matches!(
            output.failure,
            Some(PipelineError::Transport(TransportError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_raw_dump_copies_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw_stream.bin");
        let wire = encode_all(&recording(2));
        let config = PipelineConfig {
            raw_dump: Some(path.clone()),
            ..PipelineConfig::default()
        };
        let output = run(ChunkSource::split(&wire, 5), &config, CancellationToken::new()).await;
        assert!(output.is_success());
        assert_eq!(std::fs::read(&path).unwrap(), wire.as_bytes());
    }
}
