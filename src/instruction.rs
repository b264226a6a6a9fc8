//! Typed protocol instructions
//!
//! Each opcode of the recording protocol maps to one [`Instruction`] variant
//! with its own strongly-typed fields.

use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

/// Closed set of supported opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Init,
    Size,
    End,
    Sync,
    Img,
    Blob,
    Custom,
}

impl Opcode {
    pub const ALL: [Opcode; 7] = [
        Opcode::Init,
        Opcode::Size,
        Opcode::End,
        Opcode::Sync,
        Opcode::Img,
        Opcode::Blob,
        Opcode::Custom,
    ];

    /// Wire name of the opcode
    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Init => "i",
            Opcode::Size => "size",
            Opcode::End => "end",
            Opcode::Sync => "sync",
            Opcode::Img => "img",
            Opcode::Blob => "blob",
            Opcode::Custom => "custom",
        }
    }

    /// Opcodes that may appear more than once within a single frame.
    pub fn is_repeatable(&self) -> bool {
        matches!(self, Opcode::Blob | Opcode::Custom | Opcode::Sync)
    }
}

impl FromStr for Opcode {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Opcode::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| DecodeError::UnsupportedOpcode(s.to_string()))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Init,
    Size {
        layer_index: i32,
        width: u32,
        height: u32,
    },
    End {
        stream_index: i64,
    },
    /// Frame timestamp in seconds since the epoch
    Sync {
        timestamp: i64,
    },
    Img {
        stream_index: i64,
        channel_mask: i64,
        layer: i32,
        mimetype: String,
        x: i64,
        y: i64,
    },
    /// `data` holds the base64 payload exactly as it appeared on the wire
    Blob {
        stream_index: i64,
        data: Vec<u8>,
    },
    Custom {
        data: Vec<u8>,
    },
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Init => Opcode::Init,
            Instruction::Size { .. } => Opcode::Size,
            Instruction::End { .. } => Opcode::End,
            Instruction::Sync { .. } => Opcode::Sync,
            Instruction::Img { .. } => Opcode::Img,
            Instruction::Blob { .. } => Opcode::Blob,
            Instruction::Custom { .. } => Opcode::Custom,
        }
    }

    /// Raw payload bytes for opcodes that carry one.
    pub fn raw_payload(&self) -> Option<&[u8]> {
        match self {
            Instruction::Blob { data, .. } | Instruction::Custom { data } => Some(data),
            _ => None,
        }
    }
}

/// An instruction tagged with its position in the recording stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedInstruction {
    pub sequence_id: u64,
    pub instruction: Instruction,
}

fn push_element(out: &mut String, value: &str) {
    out.push_str(&value.chars().count().to_string());
    out.push('.');
    out.push_str(value);
}

/// Encode an instruction back into its wire form, terminating `;` included.
///
/// `Sync` timestamps are written as milliseconds. Raw payloads are written
/// lossily if they are not valid UTF-8.
pub fn encode(instruction: &Instruction) -> String {
    let mut out = String::new();
    push_element(&mut out, instruction.opcode().as_str());

    let args: Vec<String> = match instruction {
        Instruction::Init => vec![],
        Instruction::Size { layer_index, width, height } => {
            vec![layer_index.to_string(), width.to_string(), height.to_string()]
        }
        Instruction::End { stream_index } => vec![stream_index.to_string()],
        Instruction::Sync { timestamp } => vec![(timestamp * 1000).to_string()],
        Instruction::Img { stream_index, channel_mask, layer, mimetype, x, y } => vec![
            stream_index.to_string(),
            channel_mask.to_string(),
            layer.to_string(),
            mimetype.clone(),
            x.to_string(),
            y.to_string(),
        ],
        Instruction::Blob { stream_index, data } => {
            vec![stream_index.to_string(), String::from_utf8_lossy(data).into_owned()]
        }
        Instruction::Custom { data } => vec![String::from_utf8_lossy(data).into_owned()],
    };

    for arg in &args {
        out.push(',');
        push_element(&mut out, arg);
    }
    out.push(';');
    out
}

/// Encode a whole instruction sequence.
pub fn encode_all<'a>(instructions: impl IntoIterator<Item = &'a Instruction>) -> String {
    instructions.into_iter().map(encode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_parse() {
        assert_eq!("size".parse::<Opcode>().unwrap(), Opcode::Size);
        assert_eq!("i".parse::<Opcode>().unwrap(), Opcode::Init);
        match "rect".parse::<Opcode>() {
            Err(DecodeError::UnsupportedOpcode(op)) => assert_eq!(op, "rect"),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_repeatable_opcodes() {
        let repeatable: Vec<_> = Opcode::ALL.into_iter().filter(Opcode::is_repeatable).collect();
        assert_eq!(repeatable, [Opcode::Sync, Opcode::Blob, Opcode::Custom]);
    }

    #[test]
    fn test_encode_size() {
        let size = Instruction::Size { layer_index: 0, width: 1024, height: 768 };
        assert_eq!(encode(&size), "4.size,1.0,4.1024,3.768;");
    }

    #[test]
    fn test_encode_counts_characters_not_bytes() {
        let custom = Instruction::Custom { data: "héllo".as_bytes().to_vec() };
        assert_eq!(encode(&custom), "6.custom,5.héllo;");
    }

    #[test]
    fn test_raw_payload() {
        let blob = Instruction::Blob { stream_index: 1, data: b"AAAA".to_vec() };
        assert_eq!(blob.raw_payload(), Some(&b"AAAA"[..]));
        assert_eq!(Instruction::End { stream_index: 1 }.raw_payload(), None);
    }
}
