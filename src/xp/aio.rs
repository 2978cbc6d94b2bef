//! Async read/write ops.
//!
//! An async op owns its buffer from enqueue to completion. The session is
//! referred to by a weak (slot, generation) handle; if the handle no longer
//! resolves when the op completes, the buffer is released and the result
//! discarded. The queue is bounded: when full, callers run synchronously.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use super::reply::Response;
use super::session::{OpenFile, SessHandle, SessionSet};
use crate::buffer::PooledBuf;
use crate::sched::{Job, Scheduler};

/// Bounded admission for async ops.
pub struct AioQueue {
    max: usize,
    inflight: AtomicUsize,
}

impl AioQueue {
    /// A queue admitting at most `max` concurrent ops; zero disables
    /// async I/O entirely.
    pub fn new(max: usize) -> Arc<AioQueue> {
        Arc::new(AioQueue {
            max,
            inflight: AtomicUsize::new(0),
        })
    }

    /// Claim a slot; the caller must run synchronously on `false`.
    pub fn try_reserve(&self) -> bool {
        self.inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Release a slot claimed by `try_reserve`.
    pub fn release(&self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Ops currently in flight.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AioQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AioQueue({}/{})", self.inflight(), self.max)
    }
}

fn finish(
    queue: &AioQueue,
    sessions: &SessionSet,
    handle: SessHandle,
    file: &OpenFile,
    streamid: u16,
    response: Response<'_>,
) {
    let sess = sessions.get(handle);
    let discard = file.closing.load(Ordering::Acquire) || sess.is_none();
    if let Some(sess) = &sess {
        if !discard {
            if let Err(e) = response.send(sess.link(), streamid) {
                debug!("aio: reply to {} failed: {e}", sess.peer_name());
            }
        }
    }
    file.inflight.fetch_sub(1, Ordering::AcqRel);
    queue.release();
    if let Some(sess) = sess {
        sess.notify_drain();
    }
}

/// A queued read.
pub(crate) struct AioRead {
    pub(crate) queue: Arc<AioQueue>,
    pub(crate) sessions: Arc<SessionSet>,
    pub(crate) handle: SessHandle,
    pub(crate) streamid: u16,
    pub(crate) file: Arc<OpenFile>,
    pub(crate) offset: u64,
    pub(crate) len: usize,
    pub(crate) buf: parking_lot::Mutex<Option<PooledBuf>>,
}

impl Job for AioRead {
    fn comment(&self) -> &'static str {
        "async read"
    }

    fn run(self: Arc<Self>, _sched: &Arc<Scheduler>) {
        let Some(mut buf) = self.buf.lock().take() else {
            return;
        };
        let response = match self.file.file.read_at(&mut buf[..self.len], self.offset) {
            Ok(n) => Response::Data(&buf[..n]),
            Err(errno) => Response::Error(errno, errno.message()),
        };
        finish(
            &self.queue,
            &self.sessions,
            self.handle,
            &self.file,
            self.streamid,
            response,
        );
    }
}

/// A queued write; the payload was copied into `buf` at enqueue.
pub(crate) struct AioWrite {
    pub(crate) queue: Arc<AioQueue>,
    pub(crate) sessions: Arc<SessionSet>,
    pub(crate) handle: SessHandle,
    pub(crate) streamid: u16,
    pub(crate) file: Arc<OpenFile>,
    pub(crate) offset: u64,
    pub(crate) len: usize,
    pub(crate) buf: parking_lot::Mutex<Option<PooledBuf>>,
}

impl Job for AioWrite {
    fn comment(&self) -> &'static str {
        "async write"
    }

    fn run(self: Arc<Self>, _sched: &Arc<Scheduler>) {
        let Some(buf) = self.buf.lock().take() else {
            return;
        };
        let response = match self.file.file.write_at(&buf[..self.len], self.offset) {
            Ok(()) => Response::Empty,
            Err(errno) => Response::Error(errno, errno.message()),
        };
        finish(
            &self.queue,
            &self.sessions,
            self.handle,
            &self.file,
            self.streamid,
            response,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_admits_up_to_max() {
        let q = AioQueue::new(2);
        assert!(q.try_reserve());
        assert!(q.try_reserve());
        assert!(!q.try_reserve());
        q.release();
        assert!(q.try_reserve());
    }

    #[test]
    fn zero_max_disables_async() {
        let q = AioQueue::new(0);
        assert!(!q.try_reserve());
    }
}
