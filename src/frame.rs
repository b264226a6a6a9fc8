//! Frame reconstruction
//!
//! Frames are rebuilt by folding instructions one at a time. A frame is closed
//! lazily: it is only emitted when the instruction that starts the next frame
//! shows up, i.e. when a non-repeatable opcode repeats on a frame that
//! already holds `end`.

use base64::Engine;
use tracing::{debug, trace};

use crate::error::{AssemblyError, ExportError};
use crate::instruction::{Instruction, Opcode, SequencedInstruction};

pub const DEFAULT_LAYER_WIDTH: u32 = 640;
pub const DEFAULT_LAYER_HEIGHT: u32 = 480;

/// Size of the default (index 0) layer, shared by every frame of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultLayer {
    pub width: u32,
    pub height: u32,
}

impl Default for DefaultLayer {
    fn default() -> Self {
        Self {
            width: DEFAULT_LAYER_WIDTH,
            height: DEFAULT_LAYER_HEIGHT,
        }
    }
}

/// One renderable display update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub elements: Vec<Opcode>,
    /// Concatenated base64 payloads of every `blob` in the frame
    pub buffer: Vec<u8>,
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
    pub layer_index: i32,
    pub mimetype: Option<String>,
    /// Seconds since the epoch, set by `sync`
    pub timestamp: Option<i64>,
    /// Sequence id of the first instruction folded into this frame
    pub first_sequence_id: Option<u64>,
}

impl Frame {
    pub fn contains(&self, opcode: Opcode) -> bool {
        self.elements.contains(&opcode)
    }

    pub fn is_complete(&self) -> bool {
        self.contains(Opcode::End)
    }

    pub fn is_synced(&self) -> bool {
        self.contains(Opcode::Sync)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Decoded image bytes of the frame.
    pub fn decoded_buffer(&self) -> Result<Vec<u8>, ExportError> {
        Ok(base64::engine::general_purpose::STANDARD.decode(&self.buffer)?)
    }

    fn apply(&mut self, item: &SequencedInstruction, layer: &mut DefaultLayer) -> Result<(), AssemblyError> {
        let opcode = item.instruction.opcode();
        if self.contains(opcode) && !opcode.is_repeatable() {
            return Err(AssemblyError::DuplicateOpcode {
                opcode: opcode.as_str(),
                sequence_id: item.sequence_id,
            });
        }
        self.elements.push(opcode);
        self.first_sequence_id.get_or_insert(item.sequence_id);

        match &item.instruction {
            Instruction::Blob { data, .. } => self.buffer.extend_from_slice(data),
            Instruction::Sync { timestamp } => self.timestamp = Some(*timestamp),
            Instruction::Img { layer: index, mimetype, x, y, .. } => {
                self.layer_index = *index;
                self.mimetype = Some(mimetype.clone());
                self.x = *x;
                self.y = *y;
            }
            Instruction::Size { layer_index, width, height } => {
                self.layer_index = *layer_index;
                self.width = *width;
                self.height = *height;
                if *layer_index == 0 {
                    layer.width = *width;
                    layer.height = *height;
                }
            }
            Instruction::End { .. } => {
                if self.width == 0 || self.height == 0 {
                    self.width = layer.width;
                    self.height = layer.height;
                }
            }
            Instruction::Init | Instruction::Custom { .. } => {}
        }
        Ok(())
    }
}

/// Fold one instruction into the frame under construction.
///
/// Returns the frame to keep building and, when `item` opened a new frame,
/// the finished previous one.
pub fn fold(
    current: Option<Frame>,
    item: &SequencedInstruction,
    layer: &mut DefaultLayer,
) -> Result<(Frame, Option<Frame>), AssemblyError> {
    let mut frame = current.unwrap_or_default();
    let opcode = item.instruction.opcode();

    if frame.is_complete() && frame.contains(opcode) && !opcode.is_repeatable() {
        let mut next = Frame::default();
        next.apply(item, layer)?;
        return Ok((next, Some(frame)));
    }

    frame.apply(item, layer)?;
    Ok((frame, None))
}

/// Stateful wrapper around [`fold`] for one pipeline run.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    current: Option<Frame>,
    layer: DefaultLayer,
    emitted: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(layer: DefaultLayer) -> Self {
        Self {
            layer,
            ..Self::default()
        }
    }

    pub fn default_layer(&self) -> DefaultLayer {
        self.layer
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn fold(&mut self, item: &SequencedInstruction) -> Result<Option<Frame>, AssemblyError> {
        let (frame, done) = fold(self.current.take(), item, &mut self.layer)?;
        self.current = Some(frame);
        if let Some(done) = &done {
            self.emitted += 1;
            trace!(
                "Frame #{} closed: {:?} {}x{} ts={:?}",
                self.emitted,
                done.elements,
                done.width,
                done.height,
                done.timestamp
            );
        }
        Ok(done)
    }

    /// Flush the frame under construction at end of stream.
    pub fn finish(mut self) -> Option<Frame> {
        let last = self.current.take().filter(|f| !f.is_empty())?;
        self.emitted += 1;
        debug!(
            "Flushing trailing frame #{} (complete: {}, synced: {})",
            self.emitted,
            last.is_complete(),
            last.is_synced()
        );
        Some(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(instructions: Vec<Instruction>) -> Vec<SequencedInstruction> {
        instructions
            .into_iter()
            .enumerate()
            .map(|(i, instruction)| SequencedInstruction { sequence_id: i as u64, instruction })
            .collect()
    }

    fn img(x: i64, y: i64) -> Instruction {
        Instruction::Img {
            stream_index: 1,
            channel_mask: 14,
            layer: 0,
            mimetype: "image/png".to_string(),
            x,
            y,
        }
    }

    fn assemble(instructions: Vec<Instruction>) -> Result<Vec<Frame>, AssemblyError> {
        let mut assembler = FrameAssembler::new();
        let mut frames = Vec::new();
        for item in seq(instructions) {
            frames.extend(assembler.fold(&item)?);
        }
        frames.extend(assembler.finish());
        Ok(frames)
    }

    #[test]
    fn test_two_frames_with_own_sizes() {
        let frames = assemble(vec![
            Instruction::Size { layer_index: 0, width: 800, height: 600 },
            img(0, 0),
            Instruction::Blob { stream_index: 1, data: b"AAAA".to_vec() },
            Instruction::End { stream_index: 1 },
            Instruction::Sync { timestamp: 1 },
            Instruction::Size { layer_index: 0, width: 1024, height: 768 },
            Instruction::End { stream_index: 1 },
            Instruction::Sync { timestamp: 2 },
        ])
        .unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].width, frames[0].height), (800, 600));
        assert_eq!(frames[0].timestamp, Some(1));
        assert_eq!(frames[0].buffer, b"AAAA");
        assert!(frames[0].is_complete() && frames[0].is_synced());
        assert_eq!((frames[1].width, frames[1].height), (1024, 768));
        assert_eq!(frames[1].timestamp, Some(2));
        assert_eq!(frames[1].first_sequence_id, Some(5));
    }

    #[test]
    fn test_default_layer_fallback() {
        let frames = assemble(vec![
            img(5, 6),
            Instruction::End { stream_index: 1 },
            Instruction::Sync { timestamp: 10 },
        ])
        .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].width, frames[0].height), (640, 480));
        assert_eq!((frames[0].x, frames[0].y), (5, 6));
        assert_eq!(frames[0].mimetype.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_base_layer_size_carries_to_later_frames() {
        let frames = assemble(vec![
            Instruction::Size { layer_index: 0, width: 1280, height: 720 },
            img(0, 0),
            Instruction::End { stream_index: 1 },
            Instruction::Sync { timestamp: 1 },
            img(0, 0),
            Instruction::End { stream_index: 1 },
            Instruction::Sync { timestamp: 2 },
            img(1, 1),
            Instruction::End { stream_index: 1 },
        ])
        .unwrap();
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert_eq!((frame.width, frame.height), (1280, 720));
        }
    }

    #[test]
    fn test_non_base_layer_size_leaves_default_alone() {
        let mut assembler = FrameAssembler::new();
        for item in seq(vec![
            Instruction::Size { layer_index: 2, width: 10, height: 10 },
            Instruction::End { stream_index: 1 },
        ]) {
            assembler.fold(&item).unwrap();
        }
        assert_eq!(assembler.default_layer(), DefaultLayer::default());
    }

    #[test]
    fn test_repeatable_opcodes_stay_in_frame() {
        let frames = assemble(vec![
            img(0, 0),
            Instruction::Blob { stream_index: 1, data: b"AAAA".to_vec() },
            Instruction::Blob { stream_index: 1, data: b"BBBB".to_vec() },
            Instruction::Custom { data: b"{}".to_vec() },
            Instruction::Custom { data: b"{}".to_vec() },
            Instruction::End { stream_index: 1 },
            Instruction::Sync { timestamp: 1 },
            Instruction::Sync { timestamp: 3 },
        ])
        .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].buffer, b"AAAABBBB");
        assert_eq!(frames[0].timestamp, Some(3));
    }

    #[test]
    fn test_duplicate_in_incomplete_frame_is_violation() {
        let err = assemble(vec![img(0, 0), img(1, 1)]).unwrap_err();
        assert_eq!(err, AssemblyError::DuplicateOpcode { opcode: "img", sequence_id: 1 });
    }

    #[test]
    fn test_emission_is_one_instruction_late() {
        let mut assembler = FrameAssembler::new();
        let items = seq(vec![
            img(0, 0),
            Instruction::End { stream_index: 1 },
            Instruction::Sync { timestamp: 1 },
            img(2, 2),
        ]);
        assert!(assembler.fold(&items[0]).unwrap().is_none());
        assert!(assembler.fold(&items[1]).unwrap().is_none());
        assert!(assembler.fold(&items[2]).unwrap().is_none());
        let emitted = assembler.fold(&items[3]).unwrap().expect("frame should be emitted");
        assert_eq!(emitted.x, 0);
        assert_eq!(assembler.emitted(), 1);
    }

    #[test]
    fn test_fold_threads_layer_explicitly() {
        let mut layer = DefaultLayer::default();
        let size = SequencedInstruction {
            sequence_id: 0,
            instruction: Instruction::Size { layer_index: 0, width: 320, height: 200 },
        };
        let (frame, done) = fold(None, &size, &mut layer).unwrap();
        assert!(done.is_none());
        assert_eq!(frame.elements, vec![Opcode::Size]);
        assert_eq!(layer, DefaultLayer { width: 320, height: 200 });
    }

    #[test]
    fn test_finish_skips_empty_frame() {
        assert!(FrameAssembler::new().finish().is_none());
    }

    #[test]
    fn test_decoded_buffer() {
        let frame = Frame { buffer: b"aGVsbG8=".to_vec(), ..Frame::default() };
        assert_eq!(frame.decoded_buffer().unwrap(), b"hello");
        let broken = Frame { buffer: b"!!!".to_vec(), ..Frame::default() };
        assert!(broken.decoded_buffer().is_err());
    }
}
