// weir-rs - The Weir SIP Stack
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Mutex;

use bytes::BytesMut;

/// Size of each pooled receive buffer: the UDP maximum datagram size.
pub const RECV_BUFFER_SIZE: usize = 65_535;

/// Pool of fixed-size receive buffers shared across transport receive loops.
///
/// A buffer is taken before each asynchronous receive and returned once the
/// datagram has been dispatched, so steady-state traffic does not allocate.
/// Taking from an exhausted pool falls back to a fresh allocation rather
/// than blocking the receive loop.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// Creates a pool with `capacity` preallocated buffers.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(BytesMut::zeroed(RECV_BUFFER_SIZE));
        }
        Self {
            free: Mutex::new(free),
        }
    }

    /// Takes a buffer from the pool, allocating a fresh one when empty.
    /// The returned buffer is always `RECV_BUFFER_SIZE` bytes long.
    pub fn take(&self) -> BytesMut {
        self.free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| BytesMut::zeroed(RECV_BUFFER_SIZE))
    }

    /// Returns a buffer to the pool, restoring its full length first.
    pub fn put(&self, mut buf: BytesMut) {
        if buf.len() != RECV_BUFFER_SIZE {
            buf.resize(RECV_BUFFER_SIZE, 0);
        }
        self.free
            .lock()
            .expect("buffer pool lock poisoned")
            .push(buf);
    }

    /// Number of buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().expect("buffer pool lock poisoned").len()
    }
}
