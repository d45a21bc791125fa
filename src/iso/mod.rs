//! ISO 8583 message body codec.
//!
//! Messages are ASCII encoded: a four-digit MTI, the primary bitmap (and the
//! secondary bitmap when any field above 64 is present) as upper-case hex,
//! then each present field in ascending order.
//!
//! ```text
//! 0210 723A40010A818002 160000000000000000 570000 ...
//! ^MTI ^primary bitmap  ^field 2 (LLVAR)   ^field 3 (N6)
//! ```
//!
//! Response bodies are wrapped in the `ISO015000017` envelope tag on both
//! sides before being framed.

pub mod field;
pub mod message;
pub mod payment;

pub use message::Message;
pub use payment::{BodyCodec, ENVELOPE_TAG};

/// Body codec errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// MTI missing or not four digits.
    InvalidMti,
    /// Bitmap missing or not valid hex.
    InvalidBitmap,
    /// Field number has no schema entry.
    UnknownField(u8),
    /// Value longer than the field allows.
    FieldTooLong { field: u8, len: usize, max: usize },
    /// Length prefix is not a number or exceeds the field maximum.
    InvalidLength(u8),
    /// Input ended inside a field.
    Truncated(u8),
    /// Body is not wrapped in the envelope tag.
    MissingEnvelope,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::InvalidMti => write!(f, "invalid MTI"),
            CodecError::InvalidBitmap => write!(f, "invalid bitmap"),
            CodecError::UnknownField(n) => write!(f, "unknown field {n}"),
            CodecError::FieldTooLong { field, len, max } => {
                write!(f, "field {field} is {len} bytes, maximum is {max}")
            }
            CodecError::InvalidLength(n) => write!(f, "invalid length prefix for field {n}"),
            CodecError::Truncated(n) => write!(f, "input ends inside field {n}"),
            CodecError::MissingEnvelope => write!(f, "missing {ENVELOPE_TAG} envelope"),
        }
    }
}

impl std::error::Error for CodecError {}
