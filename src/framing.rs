//! Two-byte length-prefix framing.
//!
//! Every message on the wire is preceded by a two-byte header carrying the
//! body length:
//!
//! ```text
//! len < 256:   [0x00][len]
//! len >= 256:  [len / 256][len % 256]
//! ```
//!
//! Both header bytes are raw values (0-255), never ASCII digits.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 2;

/// Largest body length the header can describe.
pub const MAX_BODY_LEN: usize = 255 * 256 + 255;

/// Framing errors
#[derive(Debug)]
pub enum FramingError {
    /// Body does not fit in a two-byte header.
    BodyTooLarge(usize),
    /// Stream closed part-way through the header.
    TruncatedHeader,
    /// Stream closed before the declared body length was read.
    TruncatedBody { expected: usize, received: usize },
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::BodyTooLarge(len) => {
                write!(f, "body of {len} bytes exceeds maximum of {MAX_BODY_LEN}")
            }
            FramingError::TruncatedHeader => write!(f, "stream closed inside length header"),
            FramingError::TruncatedBody { expected, received } => write!(
                f,
                "stream closed after {received} of {expected} body bytes"
            ),
            FramingError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for FramingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FramingError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FramingError {
    fn from(e: std::io::Error) -> Self {
        FramingError::Io(e)
    }
}

/// Result of decoding a frame from a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeResult {
    /// A complete frame: the body and the total bytes consumed (header + body).
    Complete(Bytes, usize),
    /// Need more data.
    Incomplete,
}

/// Encode a body length into the two-byte header.
pub fn encode_header(body_len: usize) -> Result<[u8; HEADER_LEN], FramingError> {
    if body_len > MAX_BODY_LEN {
        return Err(FramingError::BodyTooLarge(body_len));
    }
    if body_len < 256 {
        Ok([0, body_len as u8])
    } else {
        Ok([(body_len / 256) as u8, (body_len % 256) as u8])
    }
}

/// Decode the body length carried by a header.
pub fn decode_header(header: [u8; HEADER_LEN]) -> usize {
    header[0] as usize * 256 + header[1] as usize
}

/// Prefix `body` with its length header.
pub fn frame(body: &[u8]) -> Result<Bytes, FramingError> {
    let header = encode_header(body.len())?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(body);
    Ok(out.freeze())
}

/// Decode one frame from the front of `buffer`.
pub fn decode(buffer: &[u8]) -> DecodeResult {
    if buffer.len() < HEADER_LEN {
        return DecodeResult::Incomplete;
    }
    let body_len = decode_header([buffer[0], buffer[1]]);
    let total = HEADER_LEN + body_len;
    if buffer.len() < total {
        return DecodeResult::Incomplete;
    }
    DecodeResult::Complete(Bytes::copy_from_slice(&buffer[HEADER_LEN..total]), total)
}

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` if the stream closes cleanly before any header byte.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FramingError::TruncatedHeader)
            };
        }
        filled += n;
    }

    let expected = decode_header(header);
    let mut body = BytesMut::zeroed(expected);
    let mut received = 0;
    while received < expected {
        let n = reader.read(&mut body[received..]).await?;
        if n == 0 {
            return Err(FramingError::TruncatedBody { expected, received });
        }
        received += n;
    }

    Ok(Some(body.freeze()))
}

/// Frame `body` and write it to `writer`.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame(body)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}
