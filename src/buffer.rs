//! Pooled byte buffers.
//!
//! Payload I/O obtains buffers from a shared pool of class sizes instead of
//! allocating per request. The pool is bounded by an aggregate byte cap:
//! `try_obtain` refuses to allocate past it, and a release that would leave
//! the pool over the cap frees the buffer instead of retaining it.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Smallest buffer class.
const MIN_CLASS: usize = 4 * 1024;

/// Number of classes; sizes double from `MIN_CLASS` up to 1 MiB.
const NUM_CLASS: usize = 9;

fn class_of(min_size: usize) -> Option<usize> {
    let mut sz = MIN_CLASS;
    for c in 0..NUM_CLASS {
        if min_size <= sz {
            return Some(c);
        }
        sz *= 2;
    }
    None
}

fn class_size(class: usize) -> usize {
    MIN_CLASS << class
}

#[derive(Default)]
struct PoolStats {
    reqs: u64,
    allocs: u64,
    frees: u64,
}

struct PoolInner {
    classes: [Vec<Vec<u8>>; NUM_CLASS],
    /// Bytes in pool custody: idle plus checked out.
    live_bytes: usize,
    stats: PoolStats,
}

/// Shared buffer pool, bounded by an aggregate byte cap.
pub struct BuffPool {
    inner: Mutex<PoolInner>,
    cap: usize,
}

impl std::fmt::Debug for BuffPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BuffPool(cap={})", self.cap)
    }
}

impl BuffPool {
    /// Create a pool whose custody is capped at `cap` bytes.
    pub fn new(cap: usize) -> Arc<BuffPool> {
        Arc::new(BuffPool {
            inner: Mutex::new(PoolInner {
                classes: Default::default(),
                live_bytes: 0,
                stats: PoolStats::default(),
            }),
            cap,
        })
    }

    /// Obtain a buffer of at least `min_size` bytes, allocating a fresh one
    /// if the matching class is empty. This always succeeds; over-cap
    /// allocations are freed rather than retained when released. Requests
    /// above the largest class get an exact-size allocation.
    pub fn obtain(self: &Arc<Self>, min_size: usize) -> PooledBuf {
        let mut inner = self.inner.lock();
        inner.stats.reqs += 1;
        if let Some(class) = class_of(min_size) {
            if let Some(buf) = inner.classes[class].pop() {
                return PooledBuf::new(buf, self.clone());
            }
            inner.stats.allocs += 1;
            inner.live_bytes += class_size(class);
            drop(inner);
            return PooledBuf::new(vec![0u8; class_size(class)], self.clone());
        }
        inner.stats.allocs += 1;
        inner.live_bytes += min_size;
        drop(inner);
        PooledBuf::new(vec![0u8; min_size], self.clone())
    }

    /// Like `obtain` but refuses (returns `None`) when allocating would put
    /// the pool past its cap. The async read path uses this to fall back to
    /// synchronous single-buffer behavior under memory pressure.
    pub fn try_obtain(self: &Arc<Self>, min_size: usize) -> Option<PooledBuf> {
        let class = class_of(min_size)?;
        let mut inner = self.inner.lock();
        inner.stats.reqs += 1;
        if let Some(buf) = inner.classes[class].pop() {
            return Some(PooledBuf::new(buf, self.clone()));
        }
        if inner.live_bytes + class_size(class) > self.cap {
            return None;
        }
        inner.stats.allocs += 1;
        inner.live_bytes += class_size(class);
        drop(inner);
        Some(PooledBuf::new(vec![0u8; class_size(class)], self.clone()))
    }

    fn release(&self, buf: Vec<u8>) {
        let mut inner = self.inner.lock();
        match class_of(buf.capacity()) {
            Some(class)
                if class_size(class) == buf.capacity() && inner.live_bytes <= self.cap =>
            {
                inner.classes[class].push(buf);
            }
            _ => {
                inner.live_bytes -= buf.capacity().min(inner.live_bytes);
                inner.stats.frees += 1;
            }
        }
    }

    /// (requests, fresh allocations, releases freed past the cap).
    pub fn stats(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock();
        (inner.stats.reqs, inner.stats.allocs, inner.stats.frees)
    }

    /// Bytes currently in pool custody.
    pub fn live_bytes(&self) -> usize {
        self.inner.lock().live_bytes
    }
}

/// A buffer checked out of a [`BuffPool`]; returns to the pool on drop.
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<BuffPool>,
}

impl PooledBuf {
    fn new(buf: Vec<u8>, pool: Arc<BuffPool>) -> PooledBuf {
        PooledBuf {
            buf: Some(buf),
            pool,
        }
    }

    /// Usable capacity of this buffer.
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, Vec::len)
    }

    /// True if the buffer has zero capacity.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deref for PooledBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledBuf({} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_rounding() {
        assert_eq!(class_of(1), Some(0));
        assert_eq!(class_of(4096), Some(0));
        assert_eq!(class_of(4097), Some(1));
        assert_eq!(class_of(1024 * 1024), Some(NUM_CLASS - 1));
        assert_eq!(class_of(1024 * 1024 + 1), None);
    }

    #[test]
    fn reuse_same_class() {
        let pool = BuffPool::new(1 << 20);
        let b = pool.obtain(5000);
        assert_eq!(b.len(), 8192);
        drop(b);
        let (_, allocs_before, _) = pool.stats();
        let b2 = pool.obtain(8192);
        assert_eq!(b2.len(), 8192);
        let (_, allocs_after, _) = pool.stats();
        assert_eq!(allocs_before, allocs_after, "second obtain must reuse");
    }

    #[test]
    fn cap_refuses_try_obtain() {
        let pool = BuffPool::new(4096);
        let a = pool.try_obtain(4096).unwrap();
        assert!(pool.try_obtain(4096).is_none());
        drop(a);
        assert!(pool.try_obtain(4096).is_some());
    }
}
