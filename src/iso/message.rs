//! ISO 8583 message assembly and parsing (ASCII encoding, hex bitmaps).

use super::field;
use super::CodecError;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

const MTI_LEN: usize = 4;
const BITMAP_HEX_LEN: usize = 16;

/// An ISO 8583 message: MTI plus field values keyed by field number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mti: String,
    fields: BTreeMap<u8, Bytes>,
}

impl Message {
    pub fn new(mti: impl Into<String>) -> Self {
        Self {
            mti: mti.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Set a field value, replacing any previous value.
    pub fn set(&mut self, number: u8, value: impl Into<Bytes>) -> &mut Self {
        self.fields.insert(number, value.into());
        self
    }

    pub fn get(&self, number: u8) -> Option<&[u8]> {
        self.fields.get(&number).map(|v| v.as_ref())
    }

    /// Get a field as text.
    pub fn get_str(&self, number: u8) -> Option<&str> {
        self.get(number).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Encode as `MTI ++ bitmap(s) ++ fields`.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.mti.len() != MTI_LEN || !self.mti.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodecError::InvalidMti);
        }

        let secondary = self.fields.keys().any(|&n| n > 64);
        let mut bitmap = [0u8; 16];
        for &number in self.fields.keys() {
            if number == 0 || number == 1 || number > 128 {
                return Err(CodecError::UnknownField(number));
            }
            set_bit(&mut bitmap, number);
        }
        if secondary {
            set_bit(&mut bitmap, 1);
        }
        let bitmap_len = if secondary { 16 } else { 8 };

        let mut out = BytesMut::with_capacity(256);
        out.extend_from_slice(self.mti.as_bytes());
        for byte in &bitmap[..bitmap_len] {
            out.extend_from_slice(format!("{byte:02X}").as_bytes());
        }
        for (&number, value) in &self.fields {
            let spec = field::lookup(number).ok_or(CodecError::UnknownField(number))?;
            spec.encode(value, &mut out)?;
        }
        Ok(out.freeze())
    }

    /// Parse a message produced by [`Message::encode`].
    ///
    /// Trailing bytes after the last field are ignored.
    pub fn parse(input: &[u8]) -> Result<Self, CodecError> {
        if input.len() < MTI_LEN {
            return Err(CodecError::InvalidMti);
        }
        let mti = std::str::from_utf8(&input[..MTI_LEN])
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .ok_or(CodecError::InvalidMti)?
            .to_string();

        let mut pos = MTI_LEN;
        let mut bitmap = [0u8; 16];
        read_bitmap(input, &mut pos, &mut bitmap[..8])?;
        let secondary = bitmap[0] & 0x80 != 0;
        if secondary {
            read_bitmap(input, &mut pos, &mut bitmap[8..])?;
        }

        let mut message = Message::new(mti);
        let last = if secondary { 128 } else { 64 };
        for number in 2..=last {
            if !bit_set(&bitmap, number) {
                continue;
            }
            let spec = field::lookup(number).ok_or(CodecError::UnknownField(number))?;
            let (value, consumed) = spec.decode(&input[pos..])?;
            message.set(number, Bytes::copy_from_slice(value));
            pos += consumed;
        }
        Ok(message)
    }
}

fn set_bit(bitmap: &mut [u8; 16], number: u8) {
    let idx = (number - 1) as usize;
    bitmap[idx / 8] |= 0x80 >> (idx % 8);
}

fn bit_set(bitmap: &[u8; 16], number: u8) -> bool {
    let idx = (number - 1) as usize;
    bitmap[idx / 8] & (0x80 >> (idx % 8)) != 0
}

fn read_bitmap(input: &[u8], pos: &mut usize, out: &mut [u8]) -> Result<(), CodecError> {
    let end = *pos + BITMAP_HEX_LEN;
    if input.len() < end {
        return Err(CodecError::InvalidBitmap);
    }
    let hex = &input[*pos..end];
    if !hex.iter().all(u8::is_ascii_hexdigit) {
        return Err(CodecError::InvalidBitmap);
    }
    let hex = std::str::from_utf8(hex).map_err(|_| CodecError::InvalidBitmap)?;
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| CodecError::InvalidBitmap)?;
    }
    *pos = end;
    Ok(())
}
