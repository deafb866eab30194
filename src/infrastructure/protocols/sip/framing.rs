//! Message re-assembly for the stream transport
//!
//! A byte stream carries no message boundaries. Bytes are accumulated until
//! the blank line ending a header block shows up; a declared Content-Length
//! then defers completion until that many more bytes arrived. One physical
//! read may complete several messages, or none.

use super::message::{find, DecodeError, SipMessage, HEADER_TERMINATOR};
use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

/// Largest header block accepted before the buffer is discarded
pub const MAX_HEADER_BLOCK: usize = 64 * 1024;
/// Largest body accepted from a Content-Length
pub const MAX_BODY: usize = 4 * 1024 * 1024;

/// Incremental decoder for stream reads
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
    /// Header block already decoded, waiting for `usize` body bytes
    pending: Option<(SipMessage, usize)>,
    /// Body bytes of a rejected message still to be thrown away
    discard: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes from one physical read
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held that do not yet form a complete message
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_waiting_for_body(&self) -> bool {
        self.pending.is_some()
    }

    /// Forget partial data, e.g. after a reconnect
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pending = None;
        self.discard = 0;
    }

    /// Next complete message, `None` when more bytes are needed.
    ///
    /// A malformed header block is consumed and reported as an error; the
    /// decoder stays usable for whatever follows it.
    pub fn next_message(&mut self) -> Option<Result<SipMessage, DecodeError>> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(self.buf.len());
                self.buf.advance(n);
                self.discard -= n;
                if self.discard > 0 {
                    return None;
                }
            }

            if let Some((mut msg, len)) = self.pending.take() {
                if self.buf.len() < len {
                    self.pending = Some((msg, len));
                    return None;
                }
                let body = self.buf.split_to(len).freeze();
                msg.set_body(body);
                return Some(Ok(msg));
            }

            // Bare CRLFs between messages are keep-alives
            let skip = self
                .buf
                .iter()
                .take_while(|b| **b == b'\r' || **b == b'\n')
                .count();
            self.buf.advance(skip);
            if self.buf.is_empty() {
                return None;
            }

            let idx = match find(&self.buf, HEADER_TERMINATOR) {
                Some(idx) => idx,
                None => {
                    if self.buf.len() > MAX_HEADER_BLOCK {
                        warn!("Discarding {} bytes without a header terminator", self.buf.len());
                        self.buf.clear();
                        return Some(Err(DecodeError::Oversized(MAX_HEADER_BLOCK)));
                    }
                    return None;
                }
            };

            let head = self.buf.split_to(idx);
            self.buf.advance(HEADER_TERMINATOR.len());

            match SipMessage::decode_head(&head) {
                Ok((msg, declared)) => match declared {
                    Some(len) if len > MAX_BODY => {
                        warn!("Dropping message declaring a {} byte body", len);
                        self.discard = len;
                        return Some(Err(DecodeError::ContentLength(len.to_string())));
                    }
                    Some(len) if len > 0 => {
                        debug!("Header block complete, waiting for {} body bytes", len);
                        self.pending = Some((msg, len));
                    }
                    _ => return Some(Ok(msg)),
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Feed one read and collect every message it completes, logging and
    /// skipping malformed ones.
    pub fn decode(&mut self, data: &[u8]) -> Vec<SipMessage> {
        self.push(data);
        let mut messages = Vec::new();
        while let Some(result) = self.next_message() {
            match result {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Dropping malformed stream message: {}", e),
            }
        }
        messages
    }
}
