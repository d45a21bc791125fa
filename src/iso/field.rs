//! Field kinds and the field schema.

use super::CodecError;
use bytes::BytesMut;

/// Wire representation of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Fixed width, left-padded with `0`.
    Numeric(usize),
    /// Two-digit length prefix, at most `n` bytes.
    Llvar(usize),
    /// Three-digit length prefix, at most `n` bytes.
    Lllvar(usize),
}

/// Schema entry for one field number.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub number: u8,
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn spec(number: u8, name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { number, name, kind }
}

/// Fields understood by the simulator, in ascending order.
pub const SCHEMA: &[FieldSpec] = &[
    spec(2, "primary account number", FieldKind::Llvar(16)),
    spec(3, "processing code", FieldKind::Numeric(6)),
    spec(4, "transaction amount", FieldKind::Numeric(12)),
    spec(7, "transmission date and time", FieldKind::Numeric(10)),
    spec(11, "system trace audit number", FieldKind::Numeric(6)),
    spec(12, "local transaction time", FieldKind::Numeric(6)),
    spec(13, "local transaction date", FieldKind::Numeric(4)),
    spec(15, "settlement date", FieldKind::Numeric(4)),
    spec(18, "merchant type", FieldKind::Numeric(4)),
    spec(32, "acquiring institution id", FieldKind::Llvar(4)),
    spec(37, "retrieval reference number", FieldKind::Numeric(12)),
    spec(39, "response code", FieldKind::Numeric(2)),
    spec(41, "card acceptor terminal id", FieldKind::Numeric(16)),
    spec(48, "additional data", FieldKind::Lllvar(120)),
    spec(49, "transaction currency code", FieldKind::Numeric(3)),
    spec(63, "bank id", FieldKind::Lllvar(2)),
    spec(70, "network management code", FieldKind::Numeric(3)),
];

/// Look up the schema entry for a field number.
pub fn lookup(number: u8) -> Option<&'static FieldSpec> {
    SCHEMA.iter().find(|s| s.number == number)
}

impl FieldSpec {
    /// Append the encoded field to `out`.
    pub fn encode(&self, value: &[u8], out: &mut BytesMut) -> Result<(), CodecError> {
        match self.kind {
            FieldKind::Numeric(width) => {
                self.check_len(value.len(), width)?;
                out.extend(std::iter::repeat(b'0').take(width - value.len()));
                out.extend_from_slice(value);
            }
            FieldKind::Llvar(max) => {
                self.check_len(value.len(), max)?;
                out.extend_from_slice(format!("{:02}", value.len()).as_bytes());
                out.extend_from_slice(value);
            }
            FieldKind::Lllvar(max) => {
                self.check_len(value.len(), max)?;
                out.extend_from_slice(format!("{:03}", value.len()).as_bytes());
                out.extend_from_slice(value);
            }
        }
        Ok(())
    }

    /// Decode the field at the front of `input`.
    ///
    /// Returns the value and the number of bytes consumed.
    pub fn decode<'a>(&self, input: &'a [u8]) -> Result<(&'a [u8], usize), CodecError> {
        let (prefix, len) = match self.kind {
            FieldKind::Numeric(width) => (0, width),
            FieldKind::Llvar(max) => (2, self.read_len(input, 2, max)?),
            FieldKind::Lllvar(max) => (3, self.read_len(input, 3, max)?),
        };
        let end = prefix + len;
        if input.len() < end {
            return Err(CodecError::Truncated(self.number));
        }
        Ok((&input[prefix..end], end))
    }

    fn check_len(&self, len: usize, max: usize) -> Result<(), CodecError> {
        if len > max {
            return Err(CodecError::FieldTooLong {
                field: self.number,
                len,
                max,
            });
        }
        Ok(())
    }

    fn read_len(&self, input: &[u8], digits: usize, max: usize) -> Result<usize, CodecError> {
        if input.len() < digits {
            return Err(CodecError::Truncated(self.number));
        }
        let len = std::str::from_utf8(&input[..digits])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(CodecError::InvalidLength(self.number))?;
        if len > max {
            return Err(CodecError::InvalidLength(self.number));
        }
        Ok(len)
    }
}
