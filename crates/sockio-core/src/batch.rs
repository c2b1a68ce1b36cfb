//! Bounded read-ahead window for batch reads
//!
//! A receive asks the OS for a whole window of bytes at once and hands
//! them out to later, possibly much smaller, logical reads. This trades
//! one copy for far fewer syscalls.
//!
//! ```text
//!   0            pos               len          capacity
//!   |  consumed   |  fetched, unread |   free      |
//! ```
//!
//! Invariant: `pos <= len <= capacity`, before and after every call.
//! The backing storage is allocated on the first fill, so sockets that
//! never receive (listeners) never pay for it.

/// Read-ahead window over a fixed-size buffer
#[derive(Debug)]
pub struct BatchWindow {
    buf: Option<Box<[u8]>>,
    capacity: usize,
    len: usize,
    pos: usize,
    fills: u64,
}

impl BatchWindow {
    /// Create an empty window. Nothing is allocated yet.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "batch window capacity must be non-zero");
        Self {
            buf: None,
            capacity,
            len: 0,
            pos: 0,
            fills: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read cursor
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// End of fetched data
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Fetched bytes not yet handed out
    #[inline]
    pub fn available(&self) -> usize {
        self.len - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Number of refills performed so far
    #[inline]
    pub fn fills(&self) -> u64 {
        self.fills
    }

    /// Whether the backing storage has been allocated
    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.buf.is_some()
    }

    /// Move up to `want` unread bytes into `dst`. Returns the count moved.
    pub fn drain_into(&mut self, dst: &mut Vec<u8>, want: usize) -> usize {
        let n = self.available().min(want);
        if n == 0 {
            return 0;
        }
        if let Some(buf) = &self.buf {
            dst.extend_from_slice(&buf[self.pos..self.pos + n]);
        }
        self.pos += n;
        n
    }

    /// Refill the window with `read`, which gets the whole buffer and
    /// returns how many bytes it wrote.
    ///
    /// Only legal once every fetched byte was handed out. On error the
    /// window is left empty.
    pub fn fill<F, E>(&mut self, read: F) -> Result<usize, E>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, E>,
    {
        debug_assert!(self.is_empty(), "refill with unread data");
        let capacity = self.capacity;
        let buf = self
            .buf
            .get_or_insert_with(|| vec![0u8; capacity].into_boxed_slice());
        self.len = 0;
        self.pos = 0;
        let n = read(&mut buf[..])?;
        self.len = n.min(capacity);
        self.fills += 1;
        Ok(self.len)
    }

    /// Forget any unread bytes
    pub fn clear(&mut self) {
        self.len = 0;
        self.pos = 0;
    }
}
