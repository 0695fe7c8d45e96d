//! Joins notification chunks back into complete frames.

use crate::protocol::{Frame, FRAME_OVERHEAD, LENGTH_OFFSET, START_BYTE};
use crate::{Error, Result};

/// Accumulates chunks until `declared length + 7` bytes are buffered.
///
/// A chunk arriving while the buffer is empty starts a new frame and must begin with the
/// header byte. Chunks that continue a frame are appended without inspection.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    expected_len: Option<usize>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one notification into the buffer.
    ///
    /// Returns `Ok(Some(frame))` once the frame is complete, `Ok(None)` while more bytes are
    /// needed. An invalid frame start is dropped and reported as [`Error::InvalidHeader`];
    /// overshooting the declared length resets the buffer and reports [`Error::Desync`].
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<Option<Frame>> {
        log::trace!("ingest chunk: {chunk:02X?}");
        let Some(&first) = chunk.first() else {
            return Ok(None);
        };
        if self.buffer.is_empty() && first != START_BYTE {
            log::warn!("Invalid response - dropping chunk {chunk:02X?}");
            return Err(Error::InvalidHeader { found: first });
        }
        self.buffer.extend_from_slice(chunk);

        if self.expected_len.is_none() && self.buffer.len() > LENGTH_OFFSET {
            let expected_len = self.buffer[LENGTH_OFFSET] as usize + FRAME_OVERHEAD;
            log::trace!("frame start, expecting {expected_len} bytes");
            self.expected_len = Some(expected_len);
        }

        match self.expected_len {
            Some(expected) if self.buffer.len() == expected => {
                let bytes = std::mem::take(&mut self.buffer);
                self.expected_len = None;
                Ok(Some(Frame::new(bytes)?))
            }
            Some(expected) if self.buffer.len() > expected => {
                let received = self.buffer.len();
                self.reset();
                log::warn!("Frame overrun - expected={expected} received={received}");
                Err(Error::Desync { expected, received })
            }
            _ => Ok(None),
        }
    }

    /// Number of bytes of the frame in progress.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total length of the frame in progress, once its length byte has arrived.
    pub fn expected_len(&self) -> Option<usize> {
        self.expected_len
    }

    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drops any partial frame. Returns how many bytes were discarded.
    pub fn reset(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.expected_len = None;
        discarded
    }
}
