//! Instruction schema registry
//!
//! Static table describing, for every supported opcode, the positional
//! arguments it carries and how each raw argument value is coerced.

use crate::error::{DecodeError, SchemaError};
use crate::instruction::Opcode;

/// A single coercion step applied to a raw argument value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// UTF-8 decimal text to a signed integer
    Int,
    /// UTF-8 text to an owned string
    Utf8,
    /// Integer milliseconds to integer seconds (floored)
    MillisToSeconds,
}

/// Value of an argument at some stage of its coercion chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Raw(Vec<u8>),
    Int(i64),
    Text(String),
}

impl Coercion {
    pub fn apply(self, value: ArgValue) -> Result<ArgValue, DecodeError> {
        match (self, value) {
            (Coercion::Int, ArgValue::Raw(bytes)) => {
                let text = std::str::from_utf8(&bytes)
                    .map_err(|_| DecodeError::Malformed("integer argument is not UTF-8".into()))?;
                text.parse::<i64>()
                    .map(ArgValue::Int)
                    .map_err(|_| DecodeError::Malformed(format!("invalid integer argument '{}'", text)))
            }
            (Coercion::Int, ArgValue::Text(text)) => text
                .parse::<i64>()
                .map(ArgValue::Int)
                .map_err(|_| DecodeError::Malformed(format!("invalid integer argument '{}'", text))),
            (Coercion::Utf8, ArgValue::Raw(bytes)) => String::from_utf8(bytes)
                .map(ArgValue::Text)
                .map_err(|_| DecodeError::Malformed("text argument is not UTF-8".into())),
            (Coercion::Utf8, ArgValue::Int(n)) => Ok(ArgValue::Text(n.to_string())),
            (Coercion::MillisToSeconds, ArgValue::Int(ms)) => Ok(ArgValue::Int(ms.div_euclid(1000))),
            (coercion, value) => Err(DecodeError::Malformed(format!(
                "cannot apply {:?} to {:?}",
                coercion, value
            ))),
        }
    }
}

/// One positional argument of an opcode.
#[derive(Debug)]
pub struct ArgSpec {
    pub name: &'static str,
    /// Empty for raw payloads (`blob` data, `custom` data)
    pub coercions: &'static [Coercion],
}

#[derive(Debug)]
pub struct OpcodeSchema {
    pub opcode: Opcode,
    pub args: &'static [ArgSpec],
}

impl OpcodeSchema {
    /// Argument declared at `index` (0-based, opcode slot excluded).
    pub fn arg(&self, index: usize) -> Result<&'static ArgSpec, SchemaError> {
        self.args.get(index).ok_or(SchemaError::ArgumentIndex {
            opcode: self.opcode.as_str(),
            index,
        })
    }

    /// Run the declared coercion chain of argument `index` over `raw`.
    pub fn coerce(&self, index: usize, raw: &[u8]) -> Result<ArgValue, DecodeError> {
        let spec = self.arg(index)?;
        spec.coercions
            .iter()
            .try_fold(ArgValue::Raw(raw.to_vec()), |value, coercion| coercion.apply(value))
    }
}

const INT: &[Coercion] = &[Coercion::Int];
const TEXT: &[Coercion] = &[Coercion::Utf8];
const RAW: &[Coercion] = &[];

/// Registry, in declaration order.
pub static REGISTRY: &[OpcodeSchema] = &[
    OpcodeSchema { opcode: Opcode::Init, args: &[] },
    OpcodeSchema {
        opcode: Opcode::Size,
        args: &[
            ArgSpec { name: "layer_index", coercions: INT },
            ArgSpec { name: "width", coercions: INT },
            ArgSpec { name: "height", coercions: INT },
        ],
    },
    OpcodeSchema {
        opcode: Opcode::End,
        args: &[ArgSpec { name: "stream_index", coercions: INT }],
    },
    OpcodeSchema {
        opcode: Opcode::Sync,
        args: &[ArgSpec {
            name: "timestamp",
            coercions: &[Coercion::Int, Coercion::MillisToSeconds],
        }],
    },
    OpcodeSchema {
        opcode: Opcode::Img,
        args: &[
            ArgSpec { name: "stream_index", coercions: INT },
            ArgSpec { name: "channel_mask", coercions: INT },
            ArgSpec { name: "layer", coercions: INT },
            ArgSpec { name: "mimetype", coercions: TEXT },
            ArgSpec { name: "x", coercions: INT },
            ArgSpec { name: "y", coercions: INT },
        ],
    },
    OpcodeSchema {
        opcode: Opcode::Blob,
        args: &[
            ArgSpec { name: "stream_index", coercions: INT },
            ArgSpec { name: "data", coercions: RAW },
        ],
    },
    OpcodeSchema {
        opcode: Opcode::Custom,
        args: &[ArgSpec { name: "data", coercions: RAW }],
    },
];

/// Look up the schema of an opcode by its wire name.
pub fn schema_for(name: &str) -> Option<&'static OpcodeSchema> {
    REGISTRY.iter().find(|schema| schema.opcode.as_str() == name)
}
