//! Per-client session: state machine and request dispatch.
//!
//! A session starts in a text phase (hello, login, optional auth
//! continuation) and then switches to binary framed requests. Filesystem
//! errors are mapped to protocol errors here, exactly once; protocol
//! violations (unknown opcode, truncated frame, oversized payload) send an
//! error and terminate the session.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, IntoBytes};

use super::aio::{AioQueue, AioRead, AioWrite};
use super::reply::{self, Response, ResponseBuf};
use super::request::{Op, ReadSeg, Request};
use super::wire::{self, ReqHeader};
use crate::buffer::BuffPool;
use crate::config::Config;
use crate::finder::{Finder, Located};
use crate::fs::{Errno, FileStore, OpenMode, StoredFile};
use crate::link::{Link, LinkError, Tokens};
use crate::prepare::{PrepError, PrepQ, PrepReq};
use crate::sched::Scheduler;

/// Auth handshake step result.
#[derive(Debug)]
pub enum AuthStep {
    /// Send these parameters and wait for more credentials.
    Continue(String),
    /// Authenticated as this identity.
    Done(String),
    /// Authentication denied.
    Deny(String),
}

/// An authentication protocol, opaque to the session.
pub trait AuthProtocol: Send + Sync {
    /// Protocol name advertised in the hello line.
    fn name(&self) -> &str;
    /// Initial parameters for the first continuation.
    fn first(&self) -> String;
    /// Process one credential message.
    fn step(&self, cred: &str) -> AuthStep;
}

/// Weak reference to a session: slot plus generation. Resolving fails once
/// the slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessHandle {
    slot: usize,
    generation: u32,
}

struct SetEntry {
    generation: u32,
    sess: Option<Arc<Session>>,
}

/// The live session registry; admin targeting and async-op completion
/// resolve sessions through it.
pub struct SessionSet {
    inner: Mutex<Vec<SetEntry>>,
    served: AtomicU64,
    requests: AtomicU64,
}

impl Default for SessionSet {
    fn default() -> Self {
        SessionSet::new_plain()
    }
}

impl SessionSet {
    fn new_plain() -> SessionSet {
        SessionSet {
            inner: Mutex::new(Vec::new()),
            served: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        }
    }

    /// An empty registry.
    pub fn new() -> Arc<SessionSet> {
        Arc::new(SessionSet::new_plain())
    }

    fn insert(&self, sess: Arc<Session>) -> SessHandle {
        self.served.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        for (slot, entry) in inner.iter_mut().enumerate() {
            if entry.sess.is_none() {
                entry.generation += 1;
                entry.sess = Some(sess);
                return SessHandle {
                    slot,
                    generation: entry.generation,
                };
            }
        }
        inner.push(SetEntry {
            generation: 1,
            sess: Some(sess),
        });
        SessHandle {
            slot: inner.len() - 1,
            generation: 1,
        }
    }

    pub(crate) fn get(&self, h: SessHandle) -> Option<Arc<Session>> {
        let inner = self.inner.lock();
        inner
            .get(h.slot)
            .filter(|e| e.generation == h.generation)
            .and_then(|e| e.sess.clone())
    }

    fn remove(&self, h: SessHandle) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(h.slot) {
            if entry.generation == h.generation {
                entry.sess = None;
            }
        }
    }

    /// Snapshot of live sessions.
    pub fn list(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.lock();
        inner.iter().filter_map(|e| e.sess.clone()).collect()
    }

    /// (sessions ever served, live now, requests dispatched).
    pub fn stats(&self) -> (u64, usize, u64) {
        let live = self.inner.lock().iter().filter(|e| e.sess.is_some()).count();
        (
            self.served.load(Ordering::Relaxed),
            live,
            self.requests.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for SessionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (served, live, _) = self.stats();
        write!(f, "SessionSet(live={live} served={served})")
    }
}

/// Everything a session needs from its process.
pub struct SessionCtx {
    /// Tunables.
    pub cfg: Arc<Config>,
    /// Backing store.
    pub fs: Arc<dyn FileStore>,
    /// Payload buffers.
    pub bufs: Arc<BuffPool>,
    /// Worker pool for async ops.
    pub sched: Arc<Scheduler>,
    /// Async-op admission.
    pub aio: Arc<AioQueue>,
    /// Live session registry.
    pub sessions: Arc<SessionSet>,
    /// Manager link for locate; absent on a standalone server.
    pub finder: Option<Arc<Finder>>,
    /// Prepare queue; absent when staging is not configured.
    pub prepq: Option<Arc<PrepQ>>,
    /// Authentication protocol; absent means open access.
    pub auth: Option<Arc<dyn AuthProtocol>>,
    /// Summary-document source for admin queries.
    pub stats: Option<Arc<dyn Fn() -> String + Send + Sync>>,
}

impl std::fmt::Debug for SessionCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionCtx")
    }
}

/// One open file in a session's table.
pub struct OpenFile {
    pub(crate) file: Arc<dyn StoredFile>,
    pub(crate) path: String,
    pub(crate) inflight: AtomicUsize,
    pub(crate) closing: AtomicBool,
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpenFile({})", self.path)
    }
}

/// A connected client.
pub struct Session {
    ctx: Arc<SessionCtx>,
    link: Arc<Link>,
    handle: OnceLock<SessHandle>,
    user: Mutex<String>,
    legacy32: AtomicBool,
    files: Mutex<Vec<Option<Arc<OpenFile>>>>,
    drain_lock: Mutex<()>,
    drain_cv: Condvar,
}

impl Session {
    /// Run one accepted client connection to completion.
    pub fn serve(ctx: Arc<SessionCtx>, link: Arc<Link>) {
        let sess = Arc::new(Session {
            ctx: ctx.clone(),
            link,
            handle: OnceLock::new(),
            user: Mutex::new(String::new()),
            legacy32: AtomicBool::new(true),
            files: Mutex::new(Vec::new()),
            drain_lock: Mutex::new(()),
            drain_cv: Condvar::new(),
        });
        let handle = ctx.sessions.insert(sess.clone());
        let _ = sess.handle.set(handle);
        if let Err(e) = sess.run() {
            debug!("session {}: {e}", sess.link.name());
        }
        sess.teardown();
        ctx.sessions.remove(handle);
    }

    /// The client's link, for unsolicited admin frames.
    pub(crate) fn link(&self) -> &Link {
        &self.link
    }

    /// Peer `host:port`.
    pub fn peer_name(&self) -> &str {
        self.link.name()
    }

    /// Peer host only.
    pub fn peer_host(&self) -> &str {
        self.link.host()
    }

    /// Authenticated or claimed username.
    pub fn user(&self) -> String {
        self.user.lock().clone()
    }

    /// Tear the connection down (admin abort/disc).
    pub fn disconnect(&self) {
        self.link.close();
    }

    pub(crate) fn notify_drain(&self) {
        let _guard = self.drain_lock.lock();
        self.drain_cv.notify_all();
    }

    fn drain_file(&self, file: &OpenFile) {
        let mut guard = self.drain_lock.lock();
        while file.inflight.load(Ordering::Acquire) > 0 {
            self.drain_cv
                .wait_for(&mut guard, Duration::from_millis(100));
        }
    }

    fn teardown(&self) {
        let files: Vec<Arc<OpenFile>> = {
            let mut table = self.files.lock();
            table.drain(..).flatten().collect()
        };
        for file in files {
            file.closing.store(true, Ordering::Release);
            self.drain_file(&file);
        }
        self.link.close();
    }

    // ----------------------------------------------------------- text phase

    fn run(&self) -> Result<(), LinkError> {
        let auth_name = self.ctx.auth.as_ref().map_or("none", |a| a.name());
        self.link.send_line(&format!(
            "hello serverd proto {:x} auth {auth_name}",
            wire::PROTO_VERSION
        ))?;

        let Some(line) = self.link.get_line()? else {
            return Ok(());
        };
        if !self.do_login(&line)? {
            return Ok(());
        }
        if let Some(auth) = self.ctx.auth.clone() {
            if !self.do_auth(&*auth)? {
                return Ok(());
            }
        }
        self.link.send_line("ok")?;
        info!("session {}: {} logged in", self.link.name(), self.user());
        self.active_loop()
    }

    fn do_login(&self, line: &str) -> Result<bool, LinkError> {
        let mut t = Tokens::new(line);
        if t.next() != Some("login") {
            self.link.send_line("err first command not login")?;
            return Ok(false);
        }
        let (Some(user), Some(_role)) = (t.next(), t.next()) else {
            self.link.send_line("err login needs user and role")?;
            return Ok(false);
        };
        *self.user.lock() = user.to_owned();
        let mut legacy = true;
        while let Some(tok) = t.next() {
            match tok {
                "port" => {
                    let _ = t.next();
                }
                "proto" => {
                    if let Some(v) = t.next().and_then(|v| u32::from_str_radix(v, 16).ok()) {
                        legacy = v < wire::PROTO_64BIT_VERSION;
                    }
                }
                "nostage" | "suspend" => {}
                other => {
                    debug!("session {}: ignoring login option {other}", self.link.name());
                }
            }
        }
        self.legacy32.store(legacy, Ordering::Release);
        Ok(true)
    }

    fn do_auth(&self, auth: &dyn AuthProtocol) -> Result<bool, LinkError> {
        let mut challenge = auth.first();
        loop {
            self.link.send_line(&format!("auth continue {challenge}"))?;
            let Some(line) = self.link.get_line()? else {
                return Ok(false);
            };
            let mut t = Tokens::new(&line);
            if t.next() != Some("auth") {
                self.link.send_line("auth err expected credentials")?;
                return Ok(false);
            }
            match auth.step(t.rest()) {
                AuthStep::Continue(params) => challenge = params,
                AuthStep::Done(identity) => {
                    *self.user.lock() = identity;
                    self.link.send_line("auth ok")?;
                    return Ok(true);
                }
                AuthStep::Deny(msg) => {
                    warn!("session {}: auth denied: {msg}", self.link.name());
                    self.link.send_line(&format!("auth err {msg}"))?;
                    return Ok(false);
                }
            }
        }
    }

    // --------------------------------------------------------- binary phase

    fn active_loop(&self) -> Result<(), LinkError> {
        let mut hdr_buf = [0u8; std::mem::size_of::<ReqHeader>()];
        loop {
            if self.link.recv_exact(&mut hdr_buf).is_err() {
                return Ok(());
            }
            let hdr = ReqHeader::read_from_bytes(&hdr_buf).expect("buffer is header-sized");
            let dlen = hdr.dlen.get();
            if dlen > wire::MAX_DLEN {
                let _ = Response::Error(
                    Errno::from_raw(libc::EMSGSIZE),
                    format!("frame of {dlen} bytes exceeds the protocol limit"),
                )
                .send(&self.link, hdr.streamid.get());
                return Ok(());
            }
            let payload = if dlen > 0 {
                let mut buf = self.ctx.bufs.obtain(dlen as usize);
                self.link.recv_exact(&mut buf[..dlen as usize])?;
                Some(buf)
            } else {
                None
            };
            let payload_bytes = payload.as_deref().map_or(&[][..], |b| &b[..dlen as usize]);
            let req = match Request::parse(&hdr, payload_bytes) {
                Ok(req) => req,
                Err(e) => {
                    warn!("session {}: protocol failure: {e}", self.link.name());
                    let _ = Response::Error(Errno::from_raw(libc::EPROTO), e.to_string())
                        .send(&self.link, hdr.streamid.get());
                    return Ok(());
                }
            };
            self.ctx.sessions.requests.fetch_add(1, Ordering::Relaxed);
            if !self.dispatch(req.streamid, req.op)? {
                return Ok(());
            }
        }
    }

    fn file(&self, fh: u32) -> Option<Arc<OpenFile>> {
        let table = self.files.lock();
        table.get(fh as usize).and_then(Clone::clone)
    }

    /// Legacy clients get `EFBIG` for offsets that would truncate.
    fn offset_ok(&self, streamid: u16, offset: u64) -> io::Result<bool> {
        if self.legacy32.load(Ordering::Acquire) && offset >= 1 << 31 {
            Response::Error(
                Errno::from_raw(libc::EFBIG),
                "offset beyond this client's 31-bit horizon".to_owned(),
            )
            .send(&self.link, streamid)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn send_errno(&self, streamid: u16, errno: Errno) -> io::Result<()> {
        Response::Error(errno, errno.message()).send(&self.link, streamid)
    }

    fn dispatch(&self, streamid: u16, op: Op<'_>) -> io::Result<bool> {
        match op {
            Op::Auth { .. } => {
                // Auth frames only belong to the text phase.
                Response::Error(
                    Errno::from_raw(libc::EPROTO),
                    "unexpected auth in active state".to_owned(),
                )
                .send(&self.link, streamid)?;
                Ok(false)
            }
            Op::Open {
                path,
                info,
                flags,
                mode,
            } => {
                let omode = OpenMode {
                    write: flags
                        .intersects(wire::OpenFlags::UPDATE | wire::OpenFlags::NEW | wire::OpenFlags::DELETE),
                    create: flags.contains(wire::OpenFlags::NEW),
                    trunc: flags.contains(wire::OpenFlags::DELETE),
                    mkpath: flags.contains(wire::OpenFlags::MKPATH),
                };
                match self.ctx.fs.open(path, omode, mode, info) {
                    Ok(file) => {
                        let entry = Arc::new(OpenFile {
                            file,
                            path: path.to_owned(),
                            inflight: AtomicUsize::new(0),
                            closing: AtomicBool::new(false),
                        });
                        let fh = {
                            let mut table = self.files.lock();
                            match table.iter().position(Option::is_none) {
                                Some(i) => {
                                    table[i] = Some(entry);
                                    i as u32
                                }
                                None => {
                                    table.push(Some(entry));
                                    (table.len() - 1) as u32
                                }
                            }
                        };
                        debug!("session {}: open {path} -> fh {fh}", self.link.name());
                        let mut b = ResponseBuf::new();
                        b.extend_from_slice(U32::new(fh).as_bytes());
                        Response::Buf(b).send(&self.link, streamid)?;
                    }
                    Err(errno) => self.send_errno(streamid, errno)?,
                }
                Ok(true)
            }
            Op::Close { fh } => {
                let entry = {
                    let mut table = self.files.lock();
                    match table.get_mut(fh as usize) {
                        Some(slot) => slot.take(),
                        None => None,
                    }
                };
                match entry {
                    Some(file) => {
                        file.closing.store(true, Ordering::Release);
                        self.drain_file(&file);
                        debug!("session {}: close {} (fh {fh})", self.link.name(), file.path);
                        Response::Empty.send(&self.link, streamid)?;
                    }
                    None => self.send_errno(streamid, Errno::from_raw(libc::EBADF))?,
                }
                Ok(true)
            }
            Op::Read {
                fh,
                offset,
                len,
                preread,
            } => {
                if !preread.is_empty() {
                    debug!(
                        "session {}: {} pre-read hints (advisory)",
                        self.link.name(),
                        preread.len()
                    );
                }
                if !self.offset_ok(streamid, offset)? {
                    return Ok(true);
                }
                let Some(file) = self.file(fh) else {
                    self.send_errno(streamid, Errno::from_raw(libc::EBADF))?;
                    return Ok(true);
                };
                let len = len.min(self.ctx.cfg.max_read) as usize;
                if self.try_async_read(streamid, &file, offset, len) {
                    return Ok(true);
                }
                let mut buf = self.ctx.bufs.obtain(len);
                match file.file.read_at(&mut buf[..len], offset) {
                    Ok(n) => Response::Data(&buf[..n]).send(&self.link, streamid)?,
                    Err(errno) => self.send_errno(streamid, errno)?,
                }
                Ok(true)
            }
            Op::Readv { segs } => {
                self.do_readv(streamid, &segs)?;
                Ok(true)
            }
            Op::Write { fh, offset, data } => {
                if !self.offset_ok(streamid, offset)? {
                    return Ok(true);
                }
                let Some(file) = self.file(fh) else {
                    self.send_errno(streamid, Errno::from_raw(libc::EBADF))?;
                    return Ok(true);
                };
                if self.try_async_write(streamid, &file, offset, data) {
                    return Ok(true);
                }
                match file.file.write_at(data, offset) {
                    Ok(()) => Response::Empty.send(&self.link, streamid)?,
                    Err(errno) => self.send_errno(streamid, errno)?,
                }
                Ok(true)
            }
            Op::Sync { fh } => {
                match self.file(fh) {
                    Some(file) => match file.file.sync() {
                        Ok(()) => Response::Empty.send(&self.link, streamid)?,
                        Err(errno) => self.send_errno(streamid, errno)?,
                    },
                    None => self.send_errno(streamid, Errno::from_raw(libc::EBADF))?,
                }
                Ok(true)
            }
            Op::Stat { path } => {
                match self.ctx.fs.stat(path) {
                    Ok(info) => {
                        let flags = if info.is_dir {
                            1
                        } else if info.is_other {
                            2
                        } else {
                            0
                        };
                        let text = format!("{} {} {flags} {}\0", info.id, info.size, info.mtime);
                        let mut b = ResponseBuf::new();
                        b.extend_from_slice(text.as_bytes());
                        Response::Buf(b).send(&self.link, streamid)?;
                    }
                    Err(errno) => self.send_errno(streamid, errno)?,
                }
                Ok(true)
            }
            Op::Mkdir { path, mode } => {
                self.meta_result(streamid, self.ctx.fs.mkdir(path, mode))?;
                Ok(true)
            }
            Op::Mv { from, to } => {
                self.meta_result(streamid, self.ctx.fs.rename(from, to))?;
                Ok(true)
            }
            Op::Rm { path } => {
                self.meta_result(streamid, self.ctx.fs.remove(path))?;
                Ok(true)
            }
            Op::Rmdir { path } => {
                self.meta_result(streamid, self.ctx.fs.rmdir(path))?;
                Ok(true)
            }
            Op::Chmod { path, mode } => {
                self.meta_result(streamid, self.ctx.fs.chmod(path, mode))?;
                Ok(true)
            }
            Op::Locate {
                path,
                mode,
                refresh,
            } => {
                let Some(finder) = &self.ctx.finder else {
                    Response::Error(
                        Errno::from_raw(libc::EOPNOTSUPP),
                        "not clustered; no manager to consult".to_owned(),
                    )
                    .send(&self.link, streamid)?;
                    return Ok(true);
                };
                match finder.locate(mode, path, refresh) {
                    Located::Target(host, port) => {
                        Response::Redirect { host, port }.send(&self.link, streamid)?;
                    }
                    Located::Wait(secs) => Response::Wait(secs).send(&self.link, streamid)?,
                    Located::Fail(errno, msg) => {
                        Response::Error(errno, msg).send(&self.link, streamid)?;
                    }
                }
                Ok(true)
            }
            Op::Prepare {
                reqid,
                user,
                prty,
                mode,
                path,
            } => {
                let Some(prepq) = &self.ctx.prepq else {
                    Response::Error(
                        Errno::from_raw(libc::EOPNOTSUPP),
                        "staging not configured".to_owned(),
                    )
                    .send(&self.link, streamid)?;
                    return Ok(true);
                };
                let req = PrepReq {
                    reqid: reqid.to_owned(),
                    user: user.to_owned(),
                    prty,
                    mode: mode.to_owned(),
                    path: path.to_owned(),
                };
                match prepq.add(&req) {
                    Ok(()) => {
                        // Quiet mode suppresses the operator notice only.
                        if !req.mode.contains('q') {
                            info!("prepare {} queued for {}", req.reqid, req.path);
                        }
                        Response::Empty.send(&self.link, streamid)?;
                    }
                    Err(e @ PrepError::NotConfigured) => {
                        Response::Error(Errno::from_raw(libc::EOPNOTSUPP), e.to_string())
                            .send(&self.link, streamid)?;
                    }
                    Err(e @ PrepError::IfDown) => {
                        Response::Error(Errno::from_raw(libc::EAGAIN), e.to_string())
                            .send(&self.link, streamid)?;
                    }
                }
                Ok(true)
            }
            Op::Query { subcode, args: _ } => {
                if subcode == wire::QUERY_STATS {
                    if let Some(stats) = &self.ctx.stats {
                        let doc = stats();
                        Response::Data(doc.as_bytes()).send(&self.link, streamid)?;
                        return Ok(true);
                    }
                }
                self.send_errno(streamid, Errno::from_raw(libc::EINVAL))?;
                Ok(true)
            }
        }
    }

    fn meta_result(&self, streamid: u16, res: Result<(), Errno>) -> io::Result<()> {
        match res {
            Ok(()) => Response::Empty.send(&self.link, streamid),
            Err(errno) => self.send_errno(streamid, errno),
        }
    }

    fn do_readv(&self, streamid: u16, segs: &[ReadSeg]) -> io::Result<()> {
        const BATCH_BYTES: usize = 1 << 20;
        let mut batch: Vec<(wire::ReadvSeg, crate::buffer::PooledBuf, usize)> = Vec::new();
        let mut batch_bytes = 0usize;
        for (i, seg) in segs.iter().enumerate() {
            if !self.offset_ok(streamid, seg.offset)? {
                return Ok(());
            }
            let Some(file) = self.file(seg.fh) else {
                return self.send_errno(streamid, Errno::from_raw(libc::EBADF));
            };
            let len = seg.len.min(self.ctx.cfg.max_read) as usize;
            let mut buf = self.ctx.bufs.obtain(len);
            let n = match file.file.read_at(&mut buf[..len], seg.offset) {
                Ok(n) => n,
                Err(errno) => return self.send_errno(streamid, errno),
            };
            let (hi, lo) = wire::split_offset(seg.offset);
            let echo = wire::ReadvSeg {
                fhandle: U32::new(seg.fh),
                rlen: U32::new(n as u32),
                off_hi: U32::new(hi),
                off_lo: U32::new(lo),
            };
            batch_bytes += n;
            batch.push((echo, buf, n));
            let last = i == segs.len() - 1;
            if batch_bytes >= BATCH_BYTES || last {
                let refs: Vec<(wire::ReadvSeg, &[u8])> = batch
                    .iter()
                    .map(|(echo, buf, n)| (*echo, &buf[..*n]))
                    .collect();
                reply::send_readv_batch(&self.link, streamid, &refs, last)?;
                batch.clear();
                batch_bytes = 0;
            }
        }
        Ok(())
    }

    fn try_async_read(&self, streamid: u16, file: &Arc<OpenFile>, offset: u64, len: usize) -> bool {
        let aio: &Arc<AioQueue> = &self.ctx.aio;
        if !aio.try_reserve() {
            return false;
        }
        let Some(buf) = self.ctx.bufs.try_obtain(len) else {
            aio.release();
            return false;
        };
        let Some(handle) = self.handle.get().copied() else {
            aio.release();
            return false;
        };
        file.inflight.fetch_add(1, Ordering::AcqRel);
        self.ctx.sched.schedule(Arc::new(AioRead {
            queue: aio.clone(),
            sessions: self.ctx.sessions.clone(),
            handle,
            streamid,
            file: file.clone(),
            offset,
            len,
            buf: Mutex::new(Some(buf)),
        }));
        true
    }

    fn try_async_write(
        &self,
        streamid: u16,
        file: &Arc<OpenFile>,
        offset: u64,
        data: &[u8],
    ) -> bool {
        let aio: &Arc<AioQueue> = &self.ctx.aio;
        if !aio.try_reserve() {
            return false;
        }
        let Some(mut buf) = self.ctx.bufs.try_obtain(data.len()) else {
            aio.release();
            return false;
        };
        let Some(handle) = self.handle.get().copied() else {
            aio.release();
            return false;
        };
        buf[..data.len()].copy_from_slice(data);
        file.inflight.fetch_add(1, Ordering::AcqRel);
        self.ctx.sched.schedule(Arc::new(AioWrite {
            queue: aio.clone(),
            sessions: self.ctx.sessions.clone(),
            handle,
            streamid,
            file: file.clone(),
            offset,
            len: data.len(),
            buf: Mutex::new(Some(buf)),
        }));
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session({})", self.link.name())
    }
}
