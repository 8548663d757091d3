//! Line framing
//!
//! `LineFramer` turns an arbitrarily chunked byte stream into complete lines.
//! `LineCodec` plugs it into `tokio_util::codec` so a socket can be read with
//! `FramedRead` and written with `FramedWrite`.

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{AppError, FrameError};
use crate::message::ServerMessage;

/// Default limit on characters buffered without a line terminator
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Incremental line splitter
///
/// A line ends at `\r\n`, `\r` or `\n`; the terminator is dropped. Text after
/// the last terminator stays pending until the next `feed`.
#[derive(Debug)]
pub struct LineFramer {
    pending: Vec<u8>,
    max_pending: usize,
    /// Previous chunk ended in `\r`, so a leading `\n` belongs to it
    skip_lf: bool,
}

impl LineFramer {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_pending,
            skip_lf: false,
        }
    }

    /// Append a chunk and return every line it completes, in order
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        if self.skip_lf && !rest.is_empty() {
            self.skip_lf = false;
            if let Some(stripped) = rest.strip_prefix(b"\n") {
                rest = stripped;
            }
        }

        while let Some(pos) = rest.iter().position(|b| *b == b'\n' || *b == b'\r') {
            self.pending.extend_from_slice(&rest[..pos]);
            lines.push(self.take_line());

            let terminator_len = match (rest[pos], rest.get(pos + 1)) {
                (b'\r', Some(b'\n')) => 2,
                (b'\r', None) => {
                    self.skip_lf = true;
                    1
                }
                _ => 1,
            };
            rest = &rest[pos + terminator_len..];
        }

        self.pending.extend_from_slice(rest);
        lines
    }

    /// Number of characters waiting for a terminator
    pub fn pending_chars(&self) -> usize {
        // UTF-8 continuation bytes do not start a character
        self.pending
            .iter()
            .filter(|b| (**b & 0xC0) != 0x80)
            .count()
    }

    /// True once the unterminated remainder is longer than the limit
    pub fn is_overflowing(&self) -> bool {
        self.pending.len() > self.max_pending && self.pending_chars() > self.max_pending
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    fn take_line(&mut self) -> String {
        let line = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&line).into_owned()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

/// Codec for the line protocol
///
/// Decodes raw bytes into lines and encodes `ServerMessage` values followed
/// by `\n`. Lines completed by a read are all handed out before an overflow
/// of the remainder is reported.
#[derive(Debug, Default)]
pub struct LineCodec {
    framer: LineFramer,
    ready: VecDeque<String>,
}

impl LineCodec {
    pub fn new(max_pending: usize) -> Self {
        Self {
            framer: LineFramer::new(max_pending),
            ready: VecDeque::new(),
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FrameError> {
        if !src.is_empty() {
            let chunk = src.split();
            self.ready.extend(self.framer.feed(&chunk));
        }

        if let Some(line) = self.ready.pop_front() {
            return Ok(Some(line));
        }

        if self.framer.is_overflowing() {
            return Err(FrameError::Overflow {
                limit: self.framer.max_pending(),
            });
        }

        Ok(None)
    }
}

impl Encoder<ServerMessage> for LineCodec {
    type Error = AppError;

    fn encode(&mut self, item: ServerMessage, dst: &mut BytesMut) -> Result<(), AppError> {
        let line = item.encode()?;
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
