// Tether Caps
// Tagged value container and the codec to and from host arrays

pub mod codec;
pub mod host;
pub mod value;

pub use codec::{decode, decode_opt, encode, Payload, MAX_DEPTH};
pub use host::HostValue;
pub use value::{Caps, CapsReader, CapsValue, MemberType};

use thiserror::Error;

/// Misuse of the step-wise reader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapsError {
    #[error("end of object")]
    EndOfObject,

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: MemberType,
        found: MemberType,
    },
}

/// Failure to convert between host values and a container.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported value kind '{kind}' at {path}")]
    Unsupported { kind: &'static str, path: String },

    #[error("nesting exceeds {limit} levels")]
    TooDeep { limit: usize },

    #[error("malformed container: {0}")]
    Read(#[from] CapsError),
}
