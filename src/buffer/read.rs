use super::pool::{BufferPool, PooledBuffer};

/// Per-connection read buffer.
///
/// Bytes are appended at the write position and consumed from the read
/// position. `compact` moves the unread tail to the front so the free
/// space always sits at the end.
///
/// ```text
/// [ consumed | unread | spare ]
/// 0          read     write    limit
/// ```
#[derive(Default)]
pub(crate) struct ReadBuffer {
    block: Option<PooledBuffer>,
    read: usize,
    write: usize,
    limit: usize,
}

impl ReadBuffer {
    /// Wraps a pooled block, using at most `limit` bytes of it.
    pub(crate) fn new(block: PooledBuffer, limit: usize) -> Self {
        let limit = limit.min(block.capacity());

        Self {
            block: Some(block),
            read: 0,
            write: 0,
            limit,
        }
    }

    /// Usable capacity in bytes.
    pub(crate) fn capacity(&self) -> usize {
        self.limit
    }

    /// Number of unread bytes.
    pub(crate) fn available(&self) -> usize {
        self.write - self.read
    }

    /// Free bytes at the tail.
    pub(crate) fn spare(&self) -> usize {
        if self.block.is_none() {
            return 0;
        }
        self.limit - self.write
    }

    /// The unread bytes.
    pub(crate) fn unread(&self) -> &[u8] {
        match &self.block {
            Some(block) => &block[self.read..self.write],
            None => &[],
        }
    }

    /// Free tail space to read into.
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        match &mut self.block {
            Some(block) => &mut block[self.write..self.limit],
            None => &mut [],
        }
    }

    /// Marks `n` bytes of the tail as filled.
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.spare(), "commit({n}) exceeds spare space");
        self.write = (self.write + n).min(self.limit);
    }

    /// Marks `n` unread bytes as consumed.
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available(), "consume({n}) exceeds unread bytes");
        self.read = (self.read + n).min(self.write);

        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    /// Moves the unread bytes to the front of the block.
    pub(crate) fn compact(&mut self) {
        if self.read == 0 {
            return;
        }

        if let Some(block) = &mut self.block {
            block.copy_within(self.read..self.write, 0);
        }
        self.write -= self.read;
        self.read = 0;
    }

    /// Discards every buffered byte.
    pub(crate) fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Returns `true` once the block went back to the pool.
    pub(crate) fn is_released(&self) -> bool {
        self.block.is_none()
    }

    /// Gives the block back to `pool`.
    pub(crate) fn release(&mut self, pool: &BufferPool) {
        if let Some(block) = self.block.take() {
            pool.give(block);
        }
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(limit: usize) -> ReadBuffer {
        ReadBuffer::new(BufferPool::new().take(limit), limit)
    }

    fn fill(buf: &mut ReadBuffer, data: &[u8]) {
        buf.spare_mut()[..data.len()].copy_from_slice(data);
        buf.commit(data.len());
    }

    #[test]
    fn fill_and_consume() {
        let mut buf = buffer(16);
        fill(&mut buf, b"hello world");
        assert_eq!(buf.unread(), b"hello world");

        buf.consume(6);
        assert_eq!(buf.unread(), b"world");
        assert_eq!(buf.spare(), 5);
    }

    #[test]
    fn compact_moves_tail_to_front() {
        let mut buf = buffer(8);
        fill(&mut buf, b"abcdefgh");
        assert_eq!(buf.spare(), 0);

        buf.consume(5);
        buf.compact();
        assert_eq!(buf.unread(), b"fgh");
        assert_eq!(buf.spare(), 5);
    }

    #[test]
    fn consuming_everything_resets_positions() {
        let mut buf = buffer(8);
        fill(&mut buf, b"abcd");
        buf.consume(4);
        assert_eq!(buf.spare(), 8);
    }

    #[test]
    fn limit_caps_larger_blocks() {
        let pool = BufferPool::new();
        pool.give(pool.take(300));
        let buf = ReadBuffer::new(pool.take(16), 16);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.spare(), 16);
    }

    #[test]
    fn release_returns_block() {
        let pool = BufferPool::new();
        let mut buf = ReadBuffer::new(pool.take(32), 32);
        buf.release(&pool);
        assert!(buf.is_released());
        assert_eq!(buf.spare(), 0);
        assert_eq!(pool.stats().free_buffers, 1);
    }
}
