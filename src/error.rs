//! Error types shared across the decoder, assembler, pipeline and jobs

use std::time::Duration;

/// Schema mismatches between a decoded instruction and its registry entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("opcode '{opcode}' declares no argument at index {index}")]
    ArgumentIndex { opcode: &'static str, index: usize },

    #[error("opcode '{opcode}' is missing argument '{name}'")]
    MissingArgument { opcode: &'static str, name: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed element: {0}")]
    Malformed(String),

    #[error("unsupported instruction: {0}")]
    UnsupportedOpcode(String),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
}

impl DecodeError {
    /// Fatal errors end the job; malformed elements only cost the current chunk.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecodeError::Malformed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("the instruction opcode '{opcode}' is already part of the frame (sequence id {sequence_id})")]
    DuplicateOpcode { opcode: &'static str, sequence_id: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to retrieve stream: HTTP {0}")]
    Status(u16),

    #[error("no data received for {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("protocol decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("assembly violation: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("pipeline task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("frame buffer is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("cannot open recording: {0}")]
    Source(#[from] TransportError),

    #[error("{source} ({} frames recovered)", .frames.len())]
    Pipeline {
        #[source]
        source: PipelineError,
        frames: Vec<crate::frame::Frame>,
    },

    #[error("export failed: {0}")]
    Export(#[from] ExportError),

    #[error("job cancelled")]
    Cancelled,

    #[error("job task failed: {0}")]
    TaskFailed(String),
}
