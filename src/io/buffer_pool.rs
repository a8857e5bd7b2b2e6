use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use bytes::BytesMut;
use tracing::{debug, trace};

/// A bounded pool of equally sized buffers. Buffers are leased as [PooledBuffer]s, which return
///  themselves to the pool when they are dropped; buffers in excess of the pool size are discarded
///  at that point.
pub struct BufferPool {
    buf_size: usize,
    max_pool_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool {
            buf_size,
            max_pool_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// The number of idle buffers currently in the pool
    pub fn len(&self) -> usize {
        self.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_from_pool(self: &Arc<Self>) -> PooledBuffer {
        let pooled = self.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let buf = match pooled {
            Some(buf) => {
                trace!("returning buffer from pool");
                buf
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                BytesMut::with_capacity(self.buf_size)
            }
        };

        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.buf_size {
            debug!("returned buffer lost its capacity ({} instead of {} bytes): discarding it", buffer.capacity(), self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_pool_size {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

/// A buffer leased from a [BufferPool]. It goes back to the pool exactly once, when the lease is
///  dropped.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        // only None during drop
        self.buf.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.return_to_pool(buf);
        }
    }
}
