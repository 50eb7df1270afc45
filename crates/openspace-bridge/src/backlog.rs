//! Bounded output buffer for sessions nobody is listening to yet.
//!
//! Keeps the most recent `capacity` bytes of output. Pushing costs time
//! proportional to the chunk, not to the buffer. The oldest byte kept may
//! fall inside a multibyte character; reads skip that partial character, so
//! text read back may be up to three bytes shorter than [`len`](Backlog::len).

use std::collections::VecDeque;

/// A keep-newest byte buffer for UTF-8 text, capped in bytes.
#[derive(Debug)]
pub struct Backlog {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Total bytes dropped from the front since creation.
    dropped: u64,
}

impl Backlog {
    /// Create an empty backlog holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Append `data`, dropping the oldest bytes if the cap is exceeded.
    pub fn push(&mut self, data: &str) {
        let bytes = data.as_bytes();
        if bytes.len() >= self.capacity {
            // The new chunk alone fills the buffer.
            let start = bytes.len() - self.capacity;
            self.dropped += (self.buf.len() + start) as u64;
            self.buf.clear();
            self.buf.extend(&bytes[start..]);
            return;
        }

        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.buf.extend(bytes);
    }

    /// Consume the backlog, returning its text from the first whole
    /// character on.
    pub fn into_string(self) -> String {
        decode(Vec::from(self.buf))
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes dropped to respect the cap.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

fn decode(mut bytes: Vec<u8>) -> String {
    // UTF-8 continuation bytes look like 0b10xx_xxxx.
    let start = bytes
        .iter()
        .position(|b| b & 0xC0 != 0x80)
        .unwrap_or(bytes.len());
    bytes.drain(..start);
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
