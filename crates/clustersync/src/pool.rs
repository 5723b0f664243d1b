// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reusable byte buffers for datagram payloads and frame buffers.
//!
//! Buffers are grouped by power-of-two size classes starting at
//! [`MIN_BUFFER_CLASS`]. A [`PooledBuffer`] goes back to its class free list
//! when dropped, so ownership of a lease is the release token.
//!
//! # Example
//!
//! ```ignore
//! let pool = BufferPool::new();
//! let mut buffer = pool.rent(1500);
//! buffer[..4].copy_from_slice(b"data");
//! drop(buffer); // storage is reused by the next rent of <= 2048 bytes
//! ```

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::MIN_BUFFER_CLASS;

/// Free buffers kept per size class, extra returns are freed.
const MAX_FREE_PER_CLASS: usize = 64;

/// Number of size classes (256 B .. 2 GiB).
const CLASS_COUNT: usize = 24;

struct PoolInner {
    free: Vec<Mutex<Vec<Vec<u8>>>>,
    outstanding: Mutex<HashSet<u64>>,
    next_lease: AtomicU64,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

/// Pool of byte buffers shared by every component of one transport.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers created because the class free list was empty
    pub allocations: u64,
    /// Rents served from a free list
    pub reuses: u64,
    /// Buffers currently leased
    pub outstanding: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: (0..CLASS_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
                outstanding: Mutex::new(HashSet::new()),
                next_lease: AtomicU64::new(1),
                allocations: AtomicU64::new(0),
                reuses: AtomicU64::new(0),
            }),
        }
    }

    /// Lease a zero-filled buffer of exactly `len` bytes.
    pub fn rent(&self, len: usize) -> PooledBuffer {
        let class = class_of(len);
        let capacity = class_capacity(class);

        let recycled = self
            .inner
            .free
            .get(class)
            .and_then(|free_list| free_list.lock().pop());
        let mut data = match recycled {
            Some(data) => {
                self.inner.reuses.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => {
                self.inner.allocations.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(capacity)
            }
        };
        data.clear();
        data.resize(len, 0);

        let lease = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
        self.inner.outstanding.lock().insert(lease);

        PooledBuffer {
            data,
            lease: Some(Lease {
                id: lease,
                class,
                pool: Arc::downgrade(&self.inner),
            }),
        }
    }

    /// Lease a buffer holding a copy of `bytes`.
    pub fn rent_copy(&self, bytes: &[u8]) -> PooledBuffer {
        let mut buffer = self.rent(bytes.len());
        buffer.copy_from_slice(bytes);
        buffer
    }

    /// Give a buffer back explicitly (same as dropping it).
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.inner.allocations.load(Ordering::Relaxed),
            reuses: self.inner.reuses.load(Ordering::Relaxed),
            outstanding: self.inner.outstanding.lock().len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl PoolInner {
    fn give_back(&self, lease: u64, class: usize, data: Vec<u8>) {
        if !self.outstanding.lock().remove(&lease) {
            panic!("pooled buffer lease {} released twice", lease);
        }
        if let Some(free_list) = self.free.get(class) {
            let mut free_list = free_list.lock();
            if free_list.len() < MAX_FREE_PER_CLASS {
                free_list.push(data);
            }
        }
    }
}

#[inline]
fn class_of(len: usize) -> usize {
    let rounded = len.max(MIN_BUFFER_CLASS).next_power_of_two();
    (rounded.trailing_zeros() - MIN_BUFFER_CLASS.trailing_zeros()) as usize
}

#[inline]
fn class_capacity(class: usize) -> usize {
    MIN_BUFFER_CLASS << class.min(CLASS_COUNT - 1)
}

// ============================================================================
// PooledBuffer
// ============================================================================

struct Lease {
    id: u64,
    class: usize,
    pool: Weak<PoolInner>,
}

/// Byte buffer leased from a [`BufferPool`].
///
/// Dereferences to exactly the requested length. Storage returns to the
/// pool on drop; if the pool is gone it is simply freed.
pub struct PooledBuffer {
    data: Vec<u8>,
    lease: Option<Lease>,
}

impl PooledBuffer {
    /// Wrap a vector that does not belong to any pool.
    pub fn unpooled(data: Vec<u8>) -> Self {
        Self { data, lease: None }
    }

    /// Whether dropping this buffer returns storage to a pool.
    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    /// Copy of the content as a plain vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.clone()
    }
}

impl From<Vec<u8>> for PooledBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self::unpooled(data)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("lease", &self.lease.as_ref().map(|lease| lease.id))
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Some(pool) = lease.pool.upgrade() {
                pool.give_back(lease.id, lease.class, std::mem::take(&mut self.data));
            }
        }
    }
}
