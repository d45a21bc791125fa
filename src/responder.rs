//! Request classification and canned response selection.
//!
//! Requests are not parsed field by field. Whitespace is removed and the
//! result is matched against two fixed markers:
//!
//! ```text
//! offset:   0   1                 18
//! sign-on:  ?   QISO0150000170800
//! payment:  ?   ? ISO0150000170200
//! ```
//!
//! The first two bytes are the length header and are never stripped, even
//! when a header byte is a whitespace value such as `0x09` or `0x20`. A payment is answered according to the first routing
//! token (in table order) found anywhere in the request.

use crate::config::UnrecognizedPolicy;
use crate::framing;
use crate::iso::BodyCodec;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{trace, warn};

/// Sign-on marker, compared against `m[1..18]`.
pub const SIGN_ON_MARKER: &[u8] = b"QISO0150000170800";

/// Payment marker, compared against `m[2..18]`.
pub const PAYMENT_MARKER: &[u8] = b"ISO0150000170200";

/// Body of the sign-on acknowledgement. The trailing `\n` is a literal
/// backslash followed by `n`.
pub const SIGN_ON_ACK_BODY: &[u8] =
    b"FISO015000017081082200000020000000400000000000000012117475957895700001\\n";

/// Response codes served by the standard table, in match order.
const STANDARD_CODES: [&str; 14] = [
    "00", "10", "11", "12", "16", "17", "18", "21", "25", "26", "31", "32", "33", "61",
];

/// Prefix shared by every standard routing token.
const TOKEN_PREFIX: &str = "812888888";

/// A response code and the token that selects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub response_code: String,
    pub token: String,
}

/// Immutable response-code to routing-token table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    /// The 14-entry table: each code `CC` is selected by `812888888CC`.
    pub fn standard() -> Self {
        let routes = STANDARD_CODES
            .iter()
            .map(|code| Route {
                response_code: code.to_string(),
                token: format!("{TOKEN_PREFIX}{code}"),
            })
            .collect();
        Self { routes }
    }

    /// First route, in table order, whose token occurs in `request`.
    pub fn find(&self, request: &[u8]) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| contains(request, route.token.as_bytes()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }
}

/// What a request was recognized as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    SignOn,
    Payment { response_code: String, token: String },
    Unrecognized,
}

/// A selected reply and the bytes to write for it.
#[derive(Debug, Clone)]
pub struct Response {
    pub reply: Reply,
    pub frame: Bytes,
}

/// Chooses and builds the response for each inbound message.
#[derive(Debug, Clone)]
pub struct Responder {
    table: Arc<RoutingTable>,
    codec: BodyCodec,
    unrecognized: UnrecognizedPolicy,
}

impl Responder {
    pub fn new(table: Arc<RoutingTable>, codec: BodyCodec, unrecognized: UnrecognizedPolicy) -> Self {
        Self {
            table,
            codec,
            unrecognized,
        }
    }

    /// Classify a raw inbound message.
    pub fn classify(&self, raw: &[u8]) -> Reply {
        let m = normalize(raw);
        let mut reply = Reply::Unrecognized;

        if is_sign_on(&m) {
            reply = Reply::SignOn;
        }

        // Payment is checked independently and wins if both match
        if is_payment(&m) {
            if let Some(route) = self.table.find(&m) {
                reply = Reply::Payment {
                    response_code: route.response_code.clone(),
                    token: route.token.clone(),
                };
            }
        }

        reply
    }

    /// Classify `raw` and build the framed response.
    pub fn respond(&self, raw: &[u8]) -> Response {
        let reply = self.classify(raw);
        trace!(?reply, "Selected reply");

        let frame = match &reply {
            Reply::SignOn => sign_on_ack(),
            Reply::Payment {
                response_code,
                token,
            } => match self.payment_frame(response_code, token) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, response_code = %response_code, "Failed to build payment response");
                    return Response {
                        reply: Reply::Unrecognized,
                        frame: self.unrecognized_frame(),
                    };
                }
            },
            Reply::Unrecognized => self.unrecognized_frame(),
        };

        Response { reply, frame }
    }

    fn payment_frame(
        &self,
        response_code: &str,
        token: &str,
    ) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
        let body = self.codec.build_payment_response(response_code, token)?;
        Ok(framing::frame(&body)?)
    }

    fn unrecognized_frame(&self) -> Bytes {
        match self.unrecognized {
            UnrecognizedPolicy::EmptyFrame => Bytes::from_static(&[0, 0]),
            UnrecognizedPolicy::Silent => Bytes::new(),
        }
    }
}

/// The framed sign-on acknowledgement.
pub fn sign_on_ack() -> Bytes {
    let header = [0, SIGN_ON_ACK_BODY.len() as u8];
    let mut out = Vec::with_capacity(header.len() + SIGN_ON_ACK_BODY.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(SIGN_ON_ACK_BODY);
    Bytes::from(out)
}

/// Remove whitespace, keeping the two header bytes as they are.
pub fn normalize(raw: &[u8]) -> Vec<u8> {
    let (header, body) = raw.split_at(raw.len().min(framing::HEADER_LEN));
    let mut out = Vec::with_capacity(raw.len());
    out.extend_from_slice(header);
    out.extend(body.iter().copied().filter(|b| !b.is_ascii_whitespace()));
    out
}

pub fn is_sign_on(m: &[u8]) -> bool {
    marker_at(m, 1, SIGN_ON_MARKER)
}

pub fn is_payment(m: &[u8]) -> bool {
    marker_at(m, 2, PAYMENT_MARKER)
}

fn marker_at(m: &[u8], offset: usize, marker: &[u8]) -> bool {
    m.get(offset..offset + marker.len())
        .is_some_and(|window| window.eq_ignore_ascii_case(marker))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
