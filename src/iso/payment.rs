//! Canned payment response bodies.

use super::{CodecError, Message};
use bytes::{Bytes, BytesMut};
use chrono::NaiveDateTime;

/// Tag written before and after every response message.
pub const ENVELOPE_TAG: &str = "ISO015000017";

/// MTI of a financial transaction response.
pub const PAYMENT_RESPONSE_MTI: &str = "0210";

/// Date and time fields stamped into a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamps {
    /// Field 7, `MMDDhhmmss`.
    pub transmission: String,
    /// Field 12, `hhmmss`.
    pub local_time: String,
    /// Field 13, `MMDD`.
    pub local_date: String,
    /// Field 15, `MMDD`.
    pub settlement_date: String,
}

impl Timestamps {
    /// The fixed stamps every canned response carries by default.
    pub fn fixed() -> Self {
        Self {
            transmission: "0826180731".to_string(),
            local_time: "180731".to_string(),
            local_date: "0826".to_string(),
            settlement_date: "0826".to_string(),
        }
    }

    pub fn at(now: NaiveDateTime) -> Self {
        let date = now.format("%m%d").to_string();
        Self {
            transmission: now.format("%m%d%H%M%S").to_string(),
            local_time: now.format("%H%M%S").to_string(),
            local_date: date.clone(),
            settlement_date: date,
        }
    }
}

/// Builds response bodies from a response code and routing token.
#[derive(Debug, Clone, Copy, Default)]
pub struct BodyCodec {
    live_timestamps: bool,
}

impl BodyCodec {
    pub fn new(live_timestamps: bool) -> Self {
        Self { live_timestamps }
    }

    /// Build the enveloped payment response body (unframed).
    pub fn build_payment_response(
        &self,
        response_code: &str,
        routing_token: &str,
    ) -> Result<Bytes, CodecError> {
        let stamps = if self.live_timestamps {
            Timestamps::at(chrono::Local::now().naive_local())
        } else {
            Timestamps::fixed()
        };
        let message = payment_message(response_code, routing_token, &stamps);
        Ok(wrap(&message.encode()?))
    }
}

/// Assemble the 0210 response message.
pub fn payment_message(response_code: &str, routing_token: &str, stamps: &Timestamps) -> Message {
    let mut msg = Message::new(PAYMENT_RESPONSE_MTI);
    msg.set(2, "0000000000000000")
        .set(3, "570000")
        .set(4, "021600000000")
        .set(7, stamps.transmission.clone())
        .set(11, "000514")
        .set(12, stamps.local_time.clone())
        .set(13, stamps.local_date.clone())
        .set(15, stamps.settlement_date.clone())
        .set(18, "7011")
        .set(32, "9750")
        .set(37, "GE2DGMBYGQ4T")
        .set(39, response_code.to_string())
        .set(41, "7874279955272435")
        .set(48, format!("62{routing_token} 0002500000B20210826170851360"))
        .set(49, "360")
        .set(63, "00");
    msg
}

/// Surround an encoded message with the envelope tag.
pub fn wrap(iso: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(iso.len() + 2 * ENVELOPE_TAG.len());
    out.extend_from_slice(ENVELOPE_TAG.as_bytes());
    out.extend_from_slice(iso);
    out.extend_from_slice(ENVELOPE_TAG.as_bytes());
    out.freeze()
}

/// Strip the envelope tag from both ends of a body.
pub fn unwrap(body: &[u8]) -> Result<&[u8], CodecError> {
    body.strip_prefix(ENVELOPE_TAG.as_bytes())
        .and_then(|rest| rest.strip_suffix(ENVELOPE_TAG.as_bytes()))
        .ok_or(CodecError::MissingEnvelope)
}

/// Parse an enveloped response body.
pub fn parse_response(body: &[u8]) -> Result<Message, CodecError> {
    Message::parse(unwrap(body)?)
}
