//! Bounded pool of reusable copy buffers shared by all readers.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{CacheError, Result};

/// At most `count` buffers of `buffer_size` bytes exist at any time.
///
/// Buffers are allocated lazily and recycled through a free list. A reader
/// waiting for a buffer is suspended until another reader returns one.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    permits: Arc<Semaphore>,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size: buffer_size.max(1),
            permits: Arc::new(Semaphore::new(count.max(1))),
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers that can be checked out without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Checks out a buffer, waiting until one is free.
    ///
    /// # Errors
    ///
    /// - `CacheError::Cancelled` - If the pool has been closed
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledBuffer> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| CacheError::Cancelled)?;
        let buffer = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        Ok(PooledBuffer {
            buffer,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Wakes every waiter with an error and refuses further checkouts.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// A checked-out buffer, returned to its pool on drop.
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<BufferPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.free.lock().push(buffer);
    }
}
