//! Receive-side framing state machine.
//!
//! Bytes arrive in arbitrary chunks. [`FrameDecoder`] buffers them and yields
//! one complete frame body at a time, so a single read can produce several
//! packets and a packet can span several reads.

use crate::message::decode_length;
use bytes::{Bytes, BytesMut};
use von_types::{VonError, VonResult};

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeader,
    AwaitingBody(usize),
}

/// Length-prefixed frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    buf: BytesMut,
    max_frame: u32,
}

impl FrameDecoder {
    pub fn new(max_frame: u32) -> Self {
        Self {
            state: State::AwaitingHeader,
            buf: BytesMut::with_capacity(4096),
            max_frame,
        }
    }

    /// Buffer to read into directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    #[cfg(test)]
    fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet returned as part of a frame.
    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame body, if one is buffered.
    ///
    /// An oversized length header is an error; the stream cannot be resynchronised after it.
    pub fn next_frame(&mut self) -> VonResult<Option<Bytes>> {
        loop {
            match self.state {
                State::AwaitingHeader => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let header = self.buf.split_to(HEADER_LEN);
                    let len = decode_length(&[header[0], header[1], header[2], header[3]]);
                    if len > self.max_frame {
                        return Err(VonError::MessageTooLarge {
                            size: len,
                            max: self.max_frame,
                        });
                    }
                    self.state = State::AwaitingBody(len as usize);
                }
                State::AwaitingBody(len) => {
                    if self.buf.len() < len {
                        self.buf.reserve(len - self.buf.len());
                        return Ok(None);
                    }
                    self.state = State::AwaitingHeader;
                    return Ok(Some(self.buf.split_to(len).freeze()));
                }
            }
        }
    }
}
