//! guacshot - rebuild Guacamole session recordings into frames
//!
//! A recording is a stream of length-prefixed instructions. This crate decodes
//! the stream chunk by chunk, folds the instructions into display frames,
//! picks the frames that mark given progress points and exports them as JPEG
//! screenshots. Many recordings can be processed concurrently.

#![forbid(unsafe_code)]

/// Bounded-parallel job execution
pub mod batch;
/// Command line configuration
pub mod config;
/// Wire protocol decoder
pub mod decoder;
pub mod error;
/// Frame reconstruction
pub mod frame;
pub mod instruction;
/// Per-recording job
pub mod job;
/// Reader and builder tasks
pub mod pipeline;
/// Canvas and JPEG exporter
pub mod render;
/// Opcode argument schemas
pub mod schema;
/// Recording byte sources
pub mod source;
/// Progress-based frame selection
pub mod trigger;

pub use error::{AssemblyError, DecodeError, JobError, PipelineError, TransportError};
pub use frame::{Frame, FrameAssembler};
pub use instruction::{Instruction, Opcode, SequencedInstruction};
