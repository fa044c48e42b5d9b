//! A bounded FIFO of bytes used as the response / accumulation buffer of both
//! tracker sessions. Bytes arrive in arbitrary chunks from the device and are
//! taken off the front once a complete response or frame has been recognised.

use log::trace;
use std::collections::VecDeque;

/// Byte queue with a fixed capacity. Appending past the capacity drops the
/// excess instead of growing.
#[derive(Debug, Clone)]
pub struct ByteQueue {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl ByteQueue {
    /// Make an empty queue that will hold at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        ByteQueue {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Room left before appends start dropping bytes.
    pub fn free(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    /// Append as much of `data` as fits and return how many bytes were
    /// accepted.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let accepted = data.len().min(self.free());
        if accepted < data.len() {
            trace!("byte queue full, dropping {} bytes", data.len() - accepted);
        }
        self.bytes.extend(&data[..accepted]);
        accepted
    }

    /// Copy of the first `n` bytes, or `None` if fewer than `n` are buffered.
    pub fn peek(&self, n: usize) -> Option<Vec<u8>> {
        if self.bytes.len() < n {
            return None;
        }
        Some(self.bytes.iter().take(n).copied().collect())
    }

    /// Drop up to `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.bytes.len());
        self.bytes.drain(..n);
    }

    /// Remove and return the first `n` bytes, or `None` (leaving the queue
    /// untouched) if fewer than `n` are buffered.
    pub fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.bytes.len() < n {
            return None;
        }
        Some(self.bytes.drain(..n).collect())
    }

    /// All buffered bytes as one slice.
    pub fn as_slice(&mut self) -> &[u8] {
        self.bytes.make_contiguous()
    }

    /// Forget everything buffered.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
