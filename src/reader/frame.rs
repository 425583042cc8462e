//! Frames of separator-terminated messages and the pool backing them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Byte terminating every message on the wire.
pub const SEPARATOR: u8 = b';';

/// Free-list of equally sized byte buffers.
///
/// Buffers leave the pool wrapped in a [`PooledBuffer`] and come back when
/// that wrapper is dropped. `outstanding` counts buffers currently lent out,
/// which lets callers check that every frame was released.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_idle: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_idle)),
            buffer_size,
            max_idle,
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Size every pooled buffer is grown to.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffers currently lent out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Idle buffers ready for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Lends out a zero-filled buffer of `buffer_size` bytes.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let mut buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        buf.resize(self.buffer_size, 0);
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            // More returns than loans: refuse the buffer rather than hand it out twice.
            self.outstanding.store(0, Ordering::Release);
            tracing::error!("buffer returned to pool more times than it was lent out");
            return;
        }

        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_idle && buf.capacity() >= self.buffer_size {
            free.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`]; returned to the pool on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Shortens the visible part of the buffer.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

/// One or more complete messages read from a single connection.
///
/// The underlying bytes always end with [`SEPARATOR`]. Call
/// [`release`](Frame::release) once the messages have been consumed.
pub struct Frame {
    data: PooledBuffer,
}

impl Frame {
    /// Wraps `data`, which must end with a separator.
    pub(crate) fn new(data: PooledBuffer) -> Self {
        debug_assert_eq!(data.as_slice().last(), Some(&SEPARATOR));
        Self { data }
    }

    /// Raw frame bytes including separators.
    pub fn bytes(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Messages in arrival order, separators stripped.
    pub fn messages(&self) -> impl Iterator<Item = &[u8]> {
        let bytes = self.data.as_slice();
        let body = bytes.strip_suffix(&[SEPARATOR]).unwrap_or(bytes);
        body.split(|b| *b == SEPARATOR)
    }

    /// Returns the frame's buffer to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .finish()
    }
}
