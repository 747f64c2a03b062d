//! Newline delimited JSON -> [`ChatRecord`] decoding.
//!
//! Bytes arrive in arbitrary chunks. The decoder keeps everything after the
//! last newline until the next chunk (or [`FrameDecoder::finish`]) completes it.

use chat_core::ChatRecord;

use crate::error::DecodeError;

const SEPARATOR: u8 = b'\n';

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    decode_errors: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and iterate the records completed by them.
    ///
    /// A malformed segment is dropped and ends the iteration; segments after
    /// it stay buffered and are yielded by the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(bytes);
        Frames {
            decoder: self,
            flush: false,
            halted: false,
        }
    }

    /// Iterate everything still buffered, including a final record that has
    /// no trailing separator. Malformed segments are skipped.
    pub fn finish(&mut self) -> Frames<'_> {
        Frames {
            decoder: self,
            flush: true,
            halted: false,
        }
    }

    /// Bytes waiting for a separator
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Segments dropped because they were not valid records
    pub fn decode_errors(&self) -> usize {
        self.decode_errors
    }

    fn next_segment(&mut self, flush: bool) -> Option<Vec<u8>> {
        match self.buffer.iter().position(|b| *b == SEPARATOR) {
            Some(idx) => Some(self.buffer.drain(..=idx).collect()),
            None if flush && !self.buffer.is_empty() => Some(std::mem::take(&mut self.buffer)),
            None => None,
        }
    }
}

/// Lazy iterator over the records of one [`FrameDecoder::feed`] or
/// [`FrameDecoder::finish`] call
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    flush: bool,
    halted: bool,
}

impl Iterator for Frames<'_> {
    type Item = ChatRecord;

    fn next(&mut self) -> Option<ChatRecord> {
        while !self.halted {
            let segment = self.decoder.next_segment(self.flush)?;
            match decode_segment(&segment) {
                Ok(Some(record)) => return Some(record),
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Dropping response segment: {}", e);
                    self.decoder.decode_errors += 1;
                    if !self.flush {
                        self.halted = true;
                    }
                }
            }
        }
        None
    }
}

/// Parse one separated segment; blank segments yield `Ok(None)`
pub fn decode_segment(segment: &[u8]) -> Result<Option<ChatRecord>, DecodeError> {
    if segment.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }

    serde_json::from_slice::<ChatRecord>(segment)
        .map(Some)
        .map_err(|source| DecodeError {
            segment: String::from_utf8_lossy(segment).trim_end().to_string(),
            source,
        })
}
