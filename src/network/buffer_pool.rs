use bytes::BytesMut;
use parking_lot::Mutex;

/// Capacity of pooled read buffers. Headers and bodies that fit are read
/// into recycled storage; anything larger is allocated ad hoc.
pub const DEFAULT_BUFFER_LEN: usize = 1024;

const MAX_IDLE_BUFFERS: usize = 64;

/// A free list of fixed-capacity read buffers shared by all sessions of a
/// server. Purely a throughput optimization; there is no ordering or
/// fairness guarantee across tasks.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Returns a buffer with `DEFAULT_BUFFER_LEN` capacity. Contents beyond
    /// the caller's own writes are stale from previous use.
    pub fn acquire(&self) -> BytesMut {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(DEFAULT_BUFFER_LEN))
    }

    /// Returns `buf` to the pool. Oversized buffers are dropped instead of
    /// pooled, as are buffers beyond the idle cap.
    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() != DEFAULT_BUFFER_LEN {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_IDLE_BUFFERS {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_default_capacity() {
        let pool = BufferPool::new();
        let buf = pool.acquire();
        assert_eq!(buf.capacity(), DEFAULT_BUFFER_LEN);
        assert!(buf.is_empty());
    }

    #[test]
    fn released_buffer_is_reused() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        buf.resize(16, 7);
        let ptr = buf.as_ptr();
        pool.release(buf);

        let again = pool.acquire();
        assert_eq!(again.as_ptr(), ptr);
        assert!(again.is_empty());
    }

    #[test]
    fn oversized_buffer_is_dropped() {
        let pool = BufferPool::new();
        pool.release(BytesMut::with_capacity(DEFAULT_BUFFER_LEN * 4));
        assert_eq!(pool.free.lock().len(), 0);
    }
}
