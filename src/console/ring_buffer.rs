//! Fixed-capacity circular buffer for console history.
//!
//! Keeps the last N captured lines so a viewer joining late can be sent
//! recent output without the session growing without bound.

/// Default number of lines kept per console
pub const DEFAULT_BUFFER_LINES: usize = 1000;

/// A fixed-capacity circular buffer.
///
/// Reads always come back oldest to newest, whatever the wrap offset.
#[derive(Debug)]
pub struct RingBuffer<T> {
    buf: Vec<Option<T>>,
    capacity: usize,
    /// Next slot to write (wraps around).
    write_pos: usize,
    /// Total items ever pushed.
    total_written: u64,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);
        Self {
            buf,
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Append, overwriting the oldest item when full. A zero-capacity buffer ignores pushes.
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        self.buf[self.write_pos] = Some(item);
        self.write_pos = (self.write_pos + 1) % self.capacity;
        self.total_written += 1;
    }

    /// Everything currently held, oldest first.
    pub fn lines(&self) -> Vec<T> {
        self.last(self.len())
    }

    /// The newest `n` items, oldest first. `n` larger than `len()` returns everything.
    pub fn last(&self, n: usize) -> Vec<T> {
        let len = self.len();
        let n = n.min(len);
        if n == 0 {
            return Vec::new();
        }

        // Oldest slot is 0 before the first wrap, write_pos afterwards
        let start = if self.total_written <= self.capacity as u64 {
            len - n
        } else {
            (self.write_pos + len - n) % self.capacity
        };

        (0..n)
            .filter_map(|i| self.buf[(start + i) % self.capacity].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        if self.total_written >= self.capacity as u64 {
            self.capacity
        } else {
            self.total_written as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items ever pushed, including overwritten ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn clear(&mut self) {
        self.buf.iter_mut().for_each(|slot| *slot = None);
        self.write_pos = 0;
        self.total_written = 0;
    }
}
