//! Fixed-capacity ring buffers.
//!
//! Both the scanner's carry-over and the output tail are bounded: pushing
//! past capacity evicts the oldest data instead of growing.

use std::collections::VecDeque;

/// Byte ring with a hard capacity. Oldest bytes are evicted first.
#[derive(Debug, Clone)]
pub struct ByteRing {
    buf: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Append bytes, evicting from the front once capacity is reached.
    pub fn push(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            self.dropped += data.len() as u64;
            return;
        }
        // Only the last `capacity` bytes of an oversized push can survive.
        let data = if data.len() > self.capacity {
            let skip = data.len() - self.capacity;
            self.dropped += skip as u64;
            &data[skip..]
        } else {
            data
        };
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.buf.extend(data.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of bytes evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    /// Remove and return the whole contents.
    pub fn take(&mut self) -> Vec<u8> {
        self.buf.drain(..).collect()
    }
}

/// Char-bounded ring used for human-readable text.
#[derive(Debug, Clone)]
pub struct CharRing {
    buf: VecDeque<char>,
    capacity: usize,
}

impl CharRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(16 * 1024)),
            capacity,
        }
    }

    pub fn push(&mut self, c: char) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(c);
    }

    pub fn push_str(&mut self, s: &str) {
        for c in s.chars() {
            self.push(c);
        }
    }

    /// Last char pushed, if any.
    pub fn last(&self) -> Option<char> {
        self.buf.back().copied()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_string(&self) -> String {
        self.buf.iter().collect()
    }
}
