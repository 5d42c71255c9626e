/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Content-Length framing for JSON-RPC streams.
//!
//! The same codec sits on both sides of the bridge: on each backend's
//! stdin/stdout and on the bridge's own stdin/stdout facing the MCP client.
//! The decoder additionally accepts newline-delimited JSON so that stock MCP
//! clients, which do not send headers, can talk to the bridge.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::CodecError;

/// Largest header block accepted before the decoder gives up on it.
const MAX_HEADER_LEN: usize = 8 * 1024;

/// Largest body accepted. Anything bigger tears the connection down.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

const CONTENT_LENGTH: &[u8] = b"content-length";

/// How a message was (or should be) delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// `Content-Length: N\r\n\r\n` followed by exactly N bytes of JSON.
    #[default]
    Header,
    /// One JSON document per line.
    Line,
}

/// A decoded message together with the framing it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Delimiting style of the inbound message.
    pub framing: Framing,
    /// The parsed JSON-RPC payload.
    pub value: Value,
}

/// Incremental decoder; bytes go in as they arrive, whole messages come out.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates a decoder with the default frame size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    /// Creates a decoder that rejects bodies larger than `max_frame` bytes.
    #[must_use]
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame,
        }
    }

    /// Appends raw bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes received but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Tries to pull one complete message out of the buffer.
    ///
    /// Returns `Ok(None)` while the next message is still incomplete.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Framing`] for a malformed header block (the
    /// decoder skips ahead to the next `Content-Length` header before
    /// returning, unless the error is fatal) and [`CodecError::Parse`] for a
    /// complete body that is not valid JSON (the body is consumed).
    pub fn decode(&mut self) -> Result<Option<Frame>, CodecError> {
        let skip = self
            .buffer
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buffer.advance(skip);

        match self.buffer.first() {
            None => Ok(None),
            Some(b'{' | b'[') => self.decode_line(),
            Some(_) => self.decode_header(),
        }
    }

    fn decode_line(&mut self) -> Result<Option<Frame>, CodecError> {
        let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') else {
            if self.buffer.len() > self.max_frame {
                self.buffer.clear();
                return Err(CodecError::fatal(format!(
                    "unterminated line exceeds {} bytes",
                    self.max_frame
                )));
            }
            return Ok(None);
        };

        let line = self.buffer.split_to(newline + 1);
        let value = serde_json::from_slice(&line)?;
        Ok(Some(Frame {
            framing: Framing::Line,
            value,
        }))
    }

    fn decode_header(&mut self) -> Result<Option<Frame>, CodecError> {
        let Some(header_end) = self.buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
            if self.buffer.len() > MAX_HEADER_LEN {
                self.resync();
                return Err(CodecError::framing(format!(
                    "no header terminator within {MAX_HEADER_LEN} bytes"
                )));
            }
            return Ok(None);
        };

        let content_length = match parse_content_length(&self.buffer[..header_end]) {
            Ok(len) => len,
            Err(message) => {
                self.resync();
                return Err(CodecError::framing(message));
            }
        };

        if content_length > self.max_frame {
            self.buffer.clear();
            return Err(CodecError::fatal(format!(
                "declared length {content_length} exceeds limit of {} bytes",
                self.max_frame
            )));
        }

        let total = header_end + 4 + content_length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        self.buffer.advance(header_end + 4);
        let body = self.buffer.split_to(content_length);
        let value = serde_json::from_slice(&body)?;
        Ok(Some(Frame {
            framing: Framing::Header,
            value,
        }))
    }

    /// Drops bytes up to the next `Content-Length` header after the current
    /// position. A trailing partial header name is kept for the next read.
    fn resync(&mut self) {
        let next = (1..self.buffer.len()).find(|&i| starts_with_ignore_case(&self.buffer[i..]));
        if let Some(pos) = next {
            trace!("Resynchronising: skipping {} bytes", pos);
            self.buffer.advance(pos);
            return;
        }

        let keep = (1..CONTENT_LENGTH.len())
            .rev()
            .find(|&n| {
                n <= self.buffer.len()
                    && self.buffer[self.buffer.len() - n..]
                        .eq_ignore_ascii_case(&CONTENT_LENGTH[..n])
            })
            .unwrap_or(0);
        let drop = self.buffer.len() - keep;
        trace!("Resynchronising: discarding {} bytes", drop);
        self.buffer.advance(drop);
    }
}

fn starts_with_ignore_case(bytes: &[u8]) -> bool {
    bytes.len() >= CONTENT_LENGTH.len()
        && bytes[..CONTENT_LENGTH.len()].eq_ignore_ascii_case(CONTENT_LENGTH)
}

fn parse_content_length(headers: &[u8]) -> Result<usize, String> {
    let headers =
        std::str::from_utf8(headers).map_err(|_| "header block is not UTF-8".to_string())?;

    let mut content_length = None;
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(format!("malformed header line: {line:?}"));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|e| format!("invalid Content-Length {:?}: {e}", value.trim()))?;
            content_length = Some(len);
        }
    }

    content_length.ok_or_else(|| "missing Content-Length header".to_string())
}

/// Serialises `value` with the given framing.
///
/// The header carries the byte length of the UTF-8 body, not its character
/// count.
///
/// # Errors
///
/// Returns an error if `value` cannot be serialised.
pub fn encode(framing: Framing, value: &impl serde::Serialize) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_string(value)?;
    let mut out = match framing {
        Framing::Header => {
            let header = format!("Content-Length: {}\r\n\r\n", body.len());
            let mut out = Vec::with_capacity(header.len() + body.len());
            out.extend_from_slice(header.as_bytes());
            out
        }
        Framing::Line => Vec::with_capacity(body.len() + 1),
    };
    out.extend_from_slice(body.as_bytes());
    if framing == Framing::Line {
        out.push(b'\n');
    }
    Ok(out)
}

/// Async message source over any byte stream.
///
/// Each connection gets its own reader; the sequence ends when the stream
/// closes.
pub struct FramedReader<R> {
    reader: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    /// Wraps `reader` with a fresh decoder.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
        }
    }

    /// Reads until one message is available.
    ///
    /// Returns `None` once the stream is closed. Errors that are not
    /// [fatal](CodecError::is_fatal) can be skipped by calling `next` again.
    pub async fn next(&mut self) -> Option<Result<Frame, CodecError>> {
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            match self.reader.read_buf(&mut self.decoder.buffer).await {
                Ok(0) => {
                    if self.decoder.buffered() > 0 {
                        trace!(
                            "Stream closed with {} undecoded bytes",
                            self.decoder.buffered()
                        );
                    }
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(CodecError::Io(e))),
            }
        }
    }
}

/// Async message sink over any byte stream.
pub struct FramedWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    /// Wraps `writer`.
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one message and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation or the write fails.
    pub async fn send(&mut self, framing: Framing, value: &Value) -> Result<(), CodecError> {
        let bytes = encode(framing, value)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
