//! Streaming decoder for the recording wire protocol
//!
//! Instructions are `;`-terminated lists of `,`-separated `LENGTH.VALUE`
//! elements, the first element being the opcode:
//!
//! ```text
//! 4.size,1.0,4.1024,3.768;
//! ```
//!
//! Network reads do not respect instruction boundaries, so [`decode`] hands
//! back the unterminated tail of its input as a remainder, and
//! [`StreamDecoder`] carries that remainder into the next chunk.

use crate::error::{DecodeError, SchemaError};
use crate::instruction::{Instruction, Opcode};
use crate::schema::{schema_for, ArgValue, OpcodeSchema};
use tracing::{debug, warn};

/// Result of one decode call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Instructions parsed before the end of the buffer or the first error
    pub instructions: Vec<Instruction>,
    /// Unterminated trailing instruction, to be prefixed to the next chunk
    pub remainder: Vec<u8>,
    /// First failure, if parsing stopped early
    pub error: Option<DecodeError>,
}

/// Decode every complete instruction in `buffer`.
///
/// Parsing stops at the first failing instruction; whatever was parsed before
/// it is still returned alongside the error.
pub fn decode(buffer: &[u8]) -> Decoded {
    let mut decoded = Decoded::default();
    if buffer.is_empty() {
        return decoded;
    }

    let mut segments: Vec<&[u8]> = buffer.split(|b| *b == b';').collect();
    // The last segment is empty when the buffer ends on ';', and is the whole
    // buffer when there is no ';' at all.
    let tail = segments.pop().unwrap_or_default();
    decoded.remainder = tail.to_vec();

    for segment in segments {
        match parse_instruction(segment) {
            Ok(instruction) => decoded.instructions.push(instruction),
            Err(e) => {
                decoded.error = Some(e);
                break;
            }
        }
    }

    decoded
}

/// Split `LENGTH.VALUE` and return `VALUE`.
///
/// The length is framing only; it must be decimal but is not checked
/// against the value.
fn element_value(element: &[u8]) -> Result<&[u8], DecodeError> {
    let dot = element
        .iter()
        .position(|b| *b == b'.')
        .ok_or_else(|| malformed("missing length prefix", element))?;
    let (length, value) = (&element[..dot], &element[dot + 1..]);
    if length.is_empty() || !length.iter().all(u8::is_ascii_digit) {
        return Err(malformed("bad length prefix", element));
    }
    Ok(value)
}

fn malformed(what: &str, element: &[u8]) -> DecodeError {
    let preview: String = String::from_utf8_lossy(element).chars().take(32).collect();
    DecodeError::Malformed(format!("{} in '{}'", what, preview))
}

fn parse_instruction(segment: &[u8]) -> Result<Instruction, DecodeError> {
    let (head, rest) = match segment.iter().position(|b| *b == b',') {
        Some(p) => (&segment[..p], Some(&segment[p + 1..])),
        None => (segment, None),
    };

    let name = std::str::from_utf8(element_value(head)?)
        .map_err(|_| malformed("opcode is not UTF-8", head))?;
    let schema = schema_for(name).ok_or_else(|| DecodeError::UnsupportedOpcode(name.to_string()))?;

    // custom payloads are free-form and may contain commas
    let elements: Vec<&[u8]> = match rest {
        None => Vec::new(),
        Some(rest) if schema.opcode == Opcode::Custom => vec![rest],
        Some(rest) => rest.split(|b| *b == b',').collect(),
    };

    let mut values = Vec::with_capacity(elements.len());
    for (index, element) in elements.into_iter().enumerate() {
        values.push(schema.coerce(index, element_value(element)?)?);
    }

    build(schema, values)
}

/// Positional reader over coerced argument values.
struct Args {
    schema: &'static OpcodeSchema,
    values: std::vec::IntoIter<ArgValue>,
    index: usize,
}

impl Args {
    fn next(&mut self) -> Result<ArgValue, DecodeError> {
        let index = self.index;
        self.index += 1;
        self.values.next().ok_or_else(|| {
            let name = self.schema.args.get(index).map(|a| a.name).unwrap_or("?");
            DecodeError::Schema(SchemaError::MissingArgument {
                opcode: self.schema.opcode.as_str(),
                name,
            })
        })
    }

    fn int<T: TryFrom<i64>>(&mut self) -> Result<T, DecodeError> {
        match self.next()? {
            ArgValue::Int(n) => T::try_from(n).map_err(|_| {
                DecodeError::Malformed(format!(
                    "{} argument {} out of range: {}",
                    self.schema.opcode,
                    self.index - 1,
                    n
                ))
            }),
            other => Err(DecodeError::Malformed(format!("expected integer, got {:?}", other))),
        }
    }

    fn text(&mut self) -> Result<String, DecodeError> {
        match self.next()? {
            ArgValue::Text(s) => Ok(s),
            other => Err(DecodeError::Malformed(format!("expected text, got {:?}", other))),
        }
    }

    fn raw(&mut self) -> Result<Vec<u8>, DecodeError> {
        match self.next()? {
            ArgValue::Raw(bytes) => Ok(bytes),
            other => Err(DecodeError::Malformed(format!("expected raw payload, got {:?}", other))),
        }
    }
}

fn build(schema: &'static OpcodeSchema, values: Vec<ArgValue>) -> Result<Instruction, DecodeError> {
    let mut args = Args { schema, values: values.into_iter(), index: 0 };
    let instruction = match schema.opcode {
        Opcode::Init => Instruction::Init,
        Opcode::Size => Instruction::Size {
            layer_index: args.int()?,
            width: args.int()?,
            height: args.int()?,
        },
        Opcode::End => Instruction::End { stream_index: args.int()? },
        Opcode::Sync => Instruction::Sync { timestamp: args.int()? },
        Opcode::Img => Instruction::Img {
            stream_index: args.int()?,
            channel_mask: args.int()?,
            layer: args.int()?,
            mimetype: args.text()?,
            x: args.int()?,
            y: args.int()?,
        },
        Opcode::Blob => Instruction::Blob {
            stream_index: args.int()?,
            data: args.raw()?,
        },
        Opcode::Custom => Instruction::Custom { data: args.raw()? },
    };
    Ok(instruction)
}

/// Decoder state carried across the chunks of one stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    remainder: Vec<u8>,
    chunks: u64,
}

/// Instructions recovered from one chunk.
#[derive(Debug, Default)]
pub struct Batch {
    pub instructions: Vec<Instruction>,
    pub error: Option<DecodeError>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, prefixed with the remainder of the previous call.
    pub fn feed(&mut self, chunk: &[u8]) -> Batch {
        self.chunks += 1;
        let decoded = if self.remainder.is_empty() {
            decode(chunk)
        } else {
            let mut buffer = std::mem::take(&mut self.remainder);
            buffer.extend_from_slice(chunk);
            decode(&buffer)
        };

        if let Some(e) = &decoded.error {
            if e.is_fatal() {
                warn!("Chunk {}: {}", self.chunks, e);
            } else {
                warn!(
                    "Chunk {}: {} ({} instructions kept)",
                    self.chunks,
                    e,
                    decoded.instructions.len()
                );
            }
        }

        self.remainder = decoded.remainder;
        Batch {
            instructions: decoded.instructions,
            error: decoded.error,
        }
    }

    /// Bytes waiting for their terminating `;`.
    pub fn pending(&self) -> &[u8] {
        &self.remainder
    }

    /// End of stream; returns the incomplete trailing instruction, if any.
    pub fn finish(self) -> Option<Vec<u8>> {
        if self.remainder.is_empty() {
            None
        } else {
            debug!("Stream ended with {} undecoded bytes", self.remainder.len());
            Some(self.remainder)
        }
    }
}
