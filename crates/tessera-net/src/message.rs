//! Fixed-capacity message buffers and the pool that recycles them.
//!
//! A [`NetworkMessage`] is one frame: a 2-byte length header followed by up
//! to [`MAX_PAYLOAD`] payload bytes. Buffers are checked out of a
//! [`MessagePool`] as [`PooledMessage`] guards; dropping a guard resets the
//! buffer and returns it to the free list, so a buffer is owned by exactly
//! one context or sits in the pool, never both.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::codec::CodecError;

/// Bytes in the frame length header.
pub const HEADER_SIZE: usize = 2;
/// Maximum payload bytes carried by one frame.
pub const MAX_PAYLOAD: usize = 1280;
/// Full buffer size including the header.
pub const BUFFER_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD;
/// Buffers preallocated by [`MessagePool::default`].
pub const DEFAULT_POOL_SIZE: usize = 128;

/// One frame worth of bytes with a write end (`size`) and a read cursor.
pub struct NetworkMessage {
    data: [u8; BUFFER_SIZE],
    size: usize,
    cursor: usize,
}

impl NetworkMessage {
    fn boxed() -> Box<Self> {
        Box::new(Self {
            data: [0; BUFFER_SIZE],
            size: 0,
            cursor: 0,
        })
    }

    /// Payload bytes written so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current read position within the payload.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Payload bytes still free for writing.
    pub fn empty_space(&self) -> usize {
        MAX_PAYLOAD - self.size
    }

    /// Payload bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.size - self.cursor
    }

    pub fn reset(&mut self) {
        self.size = 0;
        self.cursor = 0;
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_SIZE..HEADER_SIZE + self.size]
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_raw(&[value]);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_raw(&value.to_le_bytes());
    }

    /// Append bytes that are known to fit.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        debug_assert!(
            bytes.len() <= self.empty_space(),
            "write of {} bytes overflows message with {} free",
            bytes.len(),
            self.empty_space()
        );
        let start = HEADER_SIZE + self.size;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.size += bytes.len();
    }

    /// Append as many bytes as fit and return how many were written.
    pub fn write_partial(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.empty_space());
        self.write_raw(&bytes[..n]);
        n
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_raw(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.read_raw(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Borrow the next `len` payload bytes and advance the cursor.
    pub fn read_raw(&mut self, len: usize) -> Result<&[u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEnd {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let start = HEADER_SIZE + self.cursor;
        self.cursor += len;
        Ok(&self.data[start..start + len])
    }

    /// Writable payload region of `len` bytes, used when filling from a socket.
    pub(crate) fn fill_payload(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(len <= MAX_PAYLOAD);
        self.size = len;
        self.cursor = 0;
        &mut self.data[HEADER_SIZE..HEADER_SIZE + len]
    }

    /// Encode the length header and return the full frame.
    pub fn frame_bytes(&mut self) -> &[u8] {
        let len = self.size as u16;
        self.data[..HEADER_SIZE].copy_from_slice(&len.to_le_bytes());
        &self.data[..HEADER_SIZE + self.size]
    }
}

impl std::fmt::Debug for NetworkMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMessage")
            .field("size", &self.size)
            .field("cursor", &self.cursor)
            .finish()
    }
}

struct PoolInner {
    free: Mutex<Vec<Box<NetworkMessage>>>,
    allocated: AtomicUsize,
}

/// Shared free list of message buffers.
///
/// Cloning the pool clones the handle; all clones share one free list.
#[derive(Clone)]
pub struct MessagePool {
    inner: Arc<PoolInner>,
}

impl MessagePool {
    /// Create a pool with `capacity` preallocated buffers.
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| NetworkMessage::boxed()).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                allocated: AtomicUsize::new(capacity),
            }),
        }
    }

    /// Check a buffer out of the pool, allocating if the free list is empty.
    pub fn get(&self) -> PooledMessage {
        let recycled = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let message = recycled.unwrap_or_else(|| {
            let total = self.inner.allocated.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(total, "message pool exhausted, allocating a new buffer");
            NetworkMessage::boxed()
        });

        PooledMessage {
            message: Some(message),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Buffers currently in the free list.
    pub fn available(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Buffers ever allocated by this pool, checked out or free.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool")
            .field("available", &self.available())
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// A buffer checked out of a [`MessagePool`]; returned to it on drop.
pub struct PooledMessage {
    message: Option<Box<NetworkMessage>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledMessage {
    type Target = NetworkMessage;

    fn deref(&self) -> &NetworkMessage {
        self.message
            .as_deref()
            .expect("pooled message is present until dropped")
    }
}

impl DerefMut for PooledMessage {
    fn deref_mut(&mut self) -> &mut NetworkMessage {
        self.message
            .as_deref_mut()
            .expect("pooled message is present until dropped")
    }
}

impl Drop for PooledMessage {
    fn drop(&mut self) {
        if let Some(mut message) = self.message.take() {
            message.reset();
            self.pool
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message);
        }
    }
}

impl std::fmt::Debug for PooledMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}
