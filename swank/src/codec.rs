//! SWANK wire framing.
//!
//! Every frame is a six-digit, zero-padded, lowercase hexadecimal byte count
//! followed by that many bytes of UTF-8 S-expression text. There is no
//! delimiter and no trailing newline. This module provides [`encode`],
//! [`FrameReader`] and [`FrameWriter`] over any async byte source or sink.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{MessageError, WireMessage};

/// Length of the hexadecimal size header.
pub const HEADER_LEN: usize = 6;

/// Largest payload a six-digit header can describe.
pub const MAX_PAYLOAD_BYTES: usize = 0xff_ffff;

/// Payload bytes are read at most this many at a time.
const READ_CHUNK_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("reading frame: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed after {got} of {HEADER_LEN} header bytes")]
    TruncatedHeader { got: usize },
    #[error("invalid frame length header {header:?}")]
    InvalidHeader { header: String },
    #[error("connection closed after {got} of {expected} payload bytes")]
    TruncatedPayload { expected: usize, got: usize },
    #[error("frame payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Message(#[from] MessageError),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {len} bytes does not fit a {HEADER_LEN}-digit length header")]
    TooLarge { len: usize },
    #[error("writing frame: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame `text` for the wire.
pub fn encode(text: &str) -> Result<Vec<u8>, EncodeError> {
    let len = text.len();
    if len > MAX_PAYLOAD_BYTES {
        return Err(EncodeError::TooLarge { len });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + len);
    frame.extend_from_slice(format!("{len:06x}").as_bytes());
    frame.extend_from_slice(text.as_bytes());
    Ok(frame)
}

fn parse_header(header: &[u8; HEADER_LEN]) -> Result<usize, DecodeError> {
    let invalid = || DecodeError::InvalidHeader {
        header: String::from_utf8_lossy(header).into_owned(),
    };
    if !header.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }
    let text = std::str::from_utf8(header).map_err(|_| invalid())?;
    usize::from_str_radix(text, 16).map_err(|_| invalid())
}

/// Reads SWANK frames from an async reader.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read and parse the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream before sending any
    /// byte of a new frame. Everything else that goes wrong is an error.
    pub async fn read_message(&mut self) -> Result<Option<WireMessage>, DecodeError> {
        let Some(text) = self.read_frame().await? else {
            return Ok(None);
        };
        Ok(Some(WireMessage::parse(text)?))
    }

    /// Read the next frame's payload text without parsing it.
    pub async fn read_frame(&mut self) -> Result<Option<String>, DecodeError> {
        let mut header = [0u8; HEADER_LEN];
        let mut got = 0;
        while got < HEADER_LEN {
            let n = self.reader.read(&mut header[got..]).await?;
            if n == 0 {
                if got == 0 {
                    return Ok(None);
                }
                return Err(DecodeError::TruncatedHeader { got });
            }
            got += n;
        }

        let len = parse_header(&header)?;
        let mut payload = Vec::with_capacity(len.min(READ_CHUNK_BYTES));
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        while payload.len() < len {
            // A single read may return only part of the frame.
            let want = (len - payload.len()).min(READ_CHUNK_BYTES);
            let n = self.reader.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(DecodeError::TruncatedPayload {
                    expected: len,
                    got: payload.len(),
                });
            }
            payload.extend_from_slice(&chunk[..n]);
        }

        Ok(Some(String::from_utf8(payload)?))
    }
}

/// Writes SWANK frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_message(&mut self, text: &str) -> Result<(), EncodeError> {
        let frame = encode(text)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
