//! Framed I/O over one connected socket.
//!
//! A [`Link`] owns its socket and provides two framings over it: a bounded
//! line reader for the newline-terminated ASCII control protocol, and exact
//! binary reads plus vectored writes for the data protocol. Concurrent
//! senders are serialized by a per-link lock so message order is preserved
//! per connection. Links are recycled through a [`LinkPool`] bounded by
//! `max_links`.

use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, warn};
use memchr::memchr;
use parking_lot::Mutex;
use smallvec::SmallVec;
use thiserror::Error;

/// Capacity of the line receive buffer; a control line may not exceed it.
const LINE_BUF_SIZE: usize = 4096;

/// Errors surfaced by link reads.
#[derive(Debug, Error)]
pub enum LinkError {
    /// A control line overflowed the receive buffer.
    #[error("line exceeds {LINE_BUF_SIZE} byte receive buffer")]
    ShortLine,
    /// The peer spoke mid-frame EOF or the socket failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

enum Transport {
    Stream(TcpStream),
    Dgram(UdpSocket, SocketAddr),
}

struct RecvBuf {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl RecvBuf {
    fn with_storage(buf: Vec<u8>) -> RecvBuf {
        RecvBuf {
            buf,
            start: 0,
            end: 0,
        }
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }
}

/// One accepted or connected socket with line and binary framing.
pub struct Link {
    name: String,
    host: String,
    transport: Transport,
    send_lock: Mutex<()>,
    rcv: Mutex<RecvBuf>,
    closed: AtomicBool,
    pool: Arc<LinkPool>,
}

impl Link {
    /// `host:port` name of the peer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host part of the peer name, for admin target matching.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// True once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read one newline-terminated line. `Ok(None)` is a clean EOF; any
    /// error other than an interrupted call is fatal to the link.
    pub fn get_line(&self) -> LinkResult<Option<String>> {
        match &self.transport {
            Transport::Stream(stream) => {
                let mut rcv = self.rcv.lock();
                loop {
                    if let Some(nl) = memchr(b'\n', &rcv.buf[rcv.start..rcv.end]) {
                        let line = String::from_utf8_lossy(&rcv.buf[rcv.start..rcv.start + nl])
                            .trim_end_matches('\r')
                            .to_owned();
                        rcv.start += nl + 1;
                        self.pool.recvs.fetch_add(1, Ordering::Relaxed);
                        return Ok(Some(line));
                    }
                    rcv.compact();
                    if rcv.end == rcv.buf.len() {
                        return Err(LinkError::ShortLine);
                    }
                    let end = rcv.end;
                    let n = loop {
                        match (&*stream).read(&mut rcv.buf[end..]) {
                            Ok(n) => break n,
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(e) => return Err(e.into()),
                        }
                    };
                    if n == 0 {
                        if rcv.start < rcv.end {
                            warn!("link {}: EOF inside a partial line", self.name);
                        }
                        return Ok(None);
                    }
                    rcv.end += n;
                }
            }
            Transport::Dgram(sock, _) => {
                let mut buf = vec![0u8; LINE_BUF_SIZE];
                let (n, _from) = sock.recv_from(&mut buf)?;
                self.pool.recvs.fetch_add(1, Ordering::Relaxed);
                Ok(Some(
                    String::from_utf8_lossy(&buf[..n])
                        .trim_end_matches(['\n', '\r'])
                        .to_owned(),
                ))
            }
        }
    }

    /// Read exactly `out.len()` bytes of binary frame data, draining any
    /// residue left in the line buffer first.
    pub fn recv_exact(&self, out: &mut [u8]) -> io::Result<()> {
        let stream = match &self.transport {
            Transport::Stream(s) => s,
            Transport::Dgram(..) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "binary frames on a datagram link",
                ));
            }
        };
        let mut rcv = self.rcv.lock();
        let have = (rcv.end - rcv.start).min(out.len());
        out[..have].copy_from_slice(&rcv.buf[rcv.start..rcv.start + have]);
        rcv.start += have;
        drop(rcv);
        if have < out.len() {
            (&*stream).read_exact(&mut out[have..])?;
        }
        Ok(())
    }

    /// Send a control line, appending the terminator if absent. The write
    /// is completed in full under the per-link send lock.
    pub fn send_line(&self, text: &str) -> io::Result<()> {
        debug!("link {}: send {}", self.name, text.trim_end());
        if text.ends_with('\n') {
            self.send_vec(&[IoSlice::new(text.as_bytes())])
        } else {
            self.send_vec(&[IoSlice::new(text.as_bytes()), IoSlice::new(b"\n")])
        }
    }

    /// Send a gathered write atomically with respect to other senders,
    /// retrying partial writes until the frame is complete.
    pub fn send_vec(&self, bufs: &[IoSlice<'_>]) -> io::Result<()> {
        let _guard = self.send_lock.lock();
        match &self.transport {
            Transport::Stream(stream) => {
                let mut iovs: SmallVec<[IoSlice<'_>; 8]> = SmallVec::from_slice(bufs);
                let mut slices = &mut iovs[..];
                while !slices.is_empty() && slices.iter().map(|s| s.len()).sum::<usize>() > 0 {
                    match (&*stream).write_vectored(slices) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => {
                            self.pool.sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
                            IoSlice::advance_slices(&mut slices, n);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            Transport::Dgram(sock, peer) => {
                let mut datagram = Vec::new();
                for b in bufs {
                    datagram.extend_from_slice(b);
                }
                sock.send_to(&datagram, peer)?;
                self.pool
                    .sent_bytes
                    .fetch_add(datagram.len() as u64, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Shut the socket down. Framing buffers are retained so the link can
    /// still be recycled.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Transport::Stream(stream) = &self.transport {
                let _ = stream.shutdown(Shutdown::Both);
            }
            debug!("link {}: closed", self.name);
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Link({})", self.name)
    }
}

/// Whitespace tokenizer over one control line.
#[derive(Debug)]
pub struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    /// Start tokenizing `line`.
    pub fn new(line: &'a str) -> Tokens<'a> {
        Tokens { rest: line }
    }

    /// Next whitespace-delimited token, or `None` at end of line.
    pub fn next(&mut self) -> Option<&'a str> {
        self.rest = self.rest.trim_start();
        if self.rest.is_empty() {
            return None;
        }
        let end = self
            .rest
            .find(char::is_whitespace)
            .unwrap_or(self.rest.len());
        let (tok, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(tok)
    }

    /// Everything not yet consumed, with surrounding whitespace trimmed.
    pub fn rest(&mut self) -> &'a str {
        let r = self.rest.trim();
        self.rest = "";
        r
    }
}

/// Bounded recycle pool for links; also the home of link-level counters
/// for the statistics document.
pub struct LinkPool {
    stack: Mutex<Vec<Vec<u8>>>,
    max_links: usize,
    total: AtomicU64,
    in_use: AtomicU64,
    recvs: AtomicU64,
    sent_bytes: AtomicU64,
}

impl LinkPool {
    /// Create a pool retaining at most `max_links` idle link buffers.
    pub fn new(max_links: usize) -> Arc<LinkPool> {
        Arc::new(LinkPool {
            stack: Mutex::new(Vec::new()),
            max_links,
            total: AtomicU64::new(0),
            in_use: AtomicU64::new(0),
            recvs: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
        })
    }

    fn storage(&self) -> Vec<u8> {
        self.stack
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; LINE_BUF_SIZE])
    }

    /// Wrap an accepted stream; `peer` is its remote address.
    pub fn alloc_stream(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Arc<Link> {
        let host = peer.ip().to_string();
        self.alloc_named(stream, host.clone(), format!("{host}:{}", peer.port()))
    }

    fn alloc_named(self: &Arc<Self>, stream: TcpStream, host: String, name: String) -> Arc<Link> {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Arc::new(Link {
            name,
            host,
            transport: Transport::Stream(stream),
            send_lock: Mutex::new(()),
            rcv: Mutex::new(RecvBuf::with_storage(self.storage())),
            closed: AtomicBool::new(false),
            pool: self.clone(),
        })
    }

    /// Connect to `host:port` and wrap the stream.
    pub fn connect(self: &Arc<Self>, host: &str, port: u16) -> io::Result<Arc<Link>> {
        let stream = TcpStream::connect((host, port))?;
        Ok(self.alloc_named(stream, host.to_owned(), format!("{host}:{port}")))
    }

    /// Wrap a bound datagram socket with a fixed peer.
    pub fn alloc_dgram(self: &Arc<Self>, sock: UdpSocket, peer: SocketAddr) -> Arc<Link> {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Arc::new(Link {
            name: peer.to_string(),
            host: peer.ip().to_string(),
            transport: Transport::Dgram(sock, peer),
            send_lock: Mutex::new(()),
            rcv: Mutex::new(RecvBuf::with_storage(Vec::new())),
            closed: AtomicBool::new(false),
            pool: self.clone(),
        })
    }

    /// Close the link and return its buffers to the pool if this was the
    /// last reference and the pool is not full; otherwise the link is
    /// simply dropped.
    pub fn recycle(&self, link: Arc<Link>) {
        link.close();
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        if let Ok(mut link) = Arc::try_unwrap(link) {
            let storage = std::mem::take(&mut link.rcv.lock().buf);
            let mut stack = self.stack.lock();
            if stack.len() < self.max_links && storage.len() == LINE_BUF_SIZE {
                stack.push(storage);
            }
        }
    }

    /// (links ever created, links in use, lines received, bytes sent).
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.in_use.load(Ordering::Relaxed),
            self.recvs.load(Ordering::Relaxed),
            self.sent_bytes.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for LinkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LinkPool(max={})", self.max_links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (Arc<Link>, Arc<Link>) {
        let pool = LinkPool::new(4);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (
            pool.alloc_stream(client, addr),
            pool.alloc_stream(server, peer),
        )
    }

    #[test]
    fn line_round_trip() {
        let (a, b) = pair();
        a.send_line("1 select r /data/f1").unwrap();
        a.send_line("2 ping\n").unwrap();
        assert_eq!(b.get_line().unwrap().unwrap(), "1 select r /data/f1");
        assert_eq!(b.get_line().unwrap().unwrap(), "2 ping");
        drop(a);
        assert!(b.get_line().unwrap().is_none());
    }

    #[test]
    fn send_order_preserved_across_threads() {
        let (a, b) = pair();
        let mut handles = Vec::new();
        for t in 0..4 {
            let a = a.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    a.send_line(&format!("{t} msg {i}")).unwrap();
                }
            }));
        }
        let mut seen = std::collections::HashMap::new();
        for _ in 0..200 {
            let line = b.get_line().unwrap().unwrap();
            let mut toks = Tokens::new(&line);
            let t: usize = toks.next().unwrap().parse().unwrap();
            assert_eq!(toks.next(), Some("msg"));
            let i: usize = toks.next().unwrap().parse().unwrap();
            let next = seen.entry(t).or_insert(0);
            assert_eq!(*next, i, "per-sender order must be preserved");
            *next += 1;
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn binary_after_line() {
        let (a, b) = pair();
        a.send_line("login done").unwrap();
        a.send_vec(&[IoSlice::new(&[1, 2, 3, 4])]).unwrap();
        assert_eq!(b.get_line().unwrap().unwrap(), "login done");
        let mut frame = [0u8; 4];
        b.recv_exact(&mut frame).unwrap();
        assert_eq!(frame, [1, 2, 3, 4]);
    }

    #[test]
    fn short_line_detected() {
        let (a, b) = pair();
        let long = "x".repeat(LINE_BUF_SIZE + 10);
        a.send_line(&long).unwrap();
        assert!(matches!(b.get_line(), Err(LinkError::ShortLine)));
    }

    #[test]
    fn tokens() {
        let mut t = Tokens::new("  7 select  r /a/b  extra stuff ");
        assert_eq!(t.next(), Some("7"));
        assert_eq!(t.next(), Some("select"));
        assert_eq!(t.next(), Some("r"));
        assert_eq!(t.next(), Some("/a/b"));
        assert_eq!(t.rest(), "extra stuff");
        assert_eq!(t.next(), None);
    }
}
