// Host array <-> Caps conversion
use std::sync::Arc;

use crate::{Caps, CodecError, HostValue, MemberType};

/// Maximum number of nested containers accepted by [`encode`] and [`decode`].
pub const MAX_DEPTH: usize = 64;

/// A payload handed to the bridge at any boundary that accepts one.
///
/// `Raw` host arrays are encoded on the way in; `Encoded` containers (for
/// example a message received earlier) are forwarded without copying.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(Vec<HostValue>),
    Encoded(Arc<Caps>),
}

impl Payload {
    pub fn into_caps(self) -> Result<Arc<Caps>, CodecError> {
        match self {
            Payload::Raw(values) => encode(&values).map(Arc::new),
            Payload::Encoded(caps) => Ok(caps),
        }
    }
}

impl From<Vec<HostValue>> for Payload {
    fn from(values: Vec<HostValue>) -> Self {
        Payload::Raw(values)
    }
}

impl From<Arc<Caps>> for Payload {
    fn from(caps: Arc<Caps>) -> Self {
        Payload::Encoded(caps)
    }
}

/// Encode a host array into a new container.
pub fn encode(values: &[HostValue]) -> Result<Caps, CodecError> {
    encode_at(values, 0, &mut Vec::new())
}

fn encode_at(values: &[HostValue], depth: usize, path: &mut Vec<usize>) -> Result<Caps, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep { limit: MAX_DEPTH });
    }
    let mut caps = Caps::new();
    for (idx, value) in values.iter().enumerate() {
        path.push(idx);
        match value {
            HostValue::Number(v) => {
                caps.write_f64(*v);
            }
            HostValue::Int(v) => {
                caps.write_i32(*v);
            }
            HostValue::Long(v) => {
                caps.write_i64(*v);
            }
            HostValue::String(v) => {
                caps.write_str(v.as_str());
            }
            HostValue::Buffer(v) => {
                caps.write_binary(v.as_slice());
            }
            HostValue::Array(items) => {
                let sub = encode_at(items, depth + 1, path)?;
                caps.write_object(Arc::new(sub));
            }
            HostValue::Undefined | HostValue::Null => {
                caps.write_void();
            }
            HostValue::Bool(_) | HostValue::Object(_) => {
                return Err(CodecError::Unsupported {
                    kind: value.kind(),
                    path: format_path(path),
                });
            }
        }
        path.pop();
    }
    Ok(caps)
}

fn format_path(path: &[usize]) -> String {
    path.iter().map(|i| format!("[{i}]")).collect()
}

/// Decode a container into a host array, one element per member.
pub fn decode(caps: &Caps) -> Result<Vec<HostValue>, CodecError> {
    decode_at(caps, 0)
}

/// Decode an optional payload; an absent payload is an empty array.
pub fn decode_opt(caps: Option<&Caps>) -> Result<Vec<HostValue>, CodecError> {
    match caps {
        Some(caps) => decode(caps),
        None => Ok(Vec::new()),
    }
}

fn decode_at(caps: &Caps, depth: usize) -> Result<Vec<HostValue>, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep { limit: MAX_DEPTH });
    }
    let mut out = Vec::with_capacity(caps.len());
    let mut reader = caps.reader();
    while let Some(kind) = reader.next_type() {
        let value = match kind {
            MemberType::Integer => HostValue::Int(reader.read_i32()?),
            MemberType::Long => HostValue::Long(reader.read_i64()?),
            MemberType::Float => HostValue::Number(f64::from(reader.read_f32()?)),
            MemberType::Double => HostValue::Number(reader.read_f64()?),
            MemberType::String => HostValue::String(reader.read_str()?.to_string()),
            MemberType::Binary => HostValue::Buffer(reader.read_binary()?.to_vec()),
            MemberType::Object => {
                let sub = reader.read_object()?;
                HostValue::Array(decode_at(&sub, depth + 1)?)
            }
            MemberType::Void => {
                reader.read_void()?;
                HostValue::Undefined
            }
        };
        out.push(value);
    }
    Ok(out)
}
