//! Response framing for the data protocol.
//!
//! Every response is a [`RespHeader`] plus payload, sent as one gathered
//! write so concurrent repliers cannot interleave. Readv segments are
//! framed individually (same streamid) but coalesced into a single
//! scatter-write per batch. Async frames ride streamid 0 with an action
//! code prefix.

use std::io::{self, IoSlice};

use smallvec::SmallVec;
use zerocopy::IntoBytes;
use zerocopy::byteorder::big_endian::{U16, U32};

use super::wire::{self, AsyncAction, RespHeader, Status};
use crate::fs::Errno;
use crate::link::Link;

const INLINE_DATA: usize = 64;

/// Small payloads build inline; big ones borrow the caller's buffer.
pub type ResponseBuf = SmallVec<[u8; INLINE_DATA]>;

/// One response about to be framed.
#[derive(Debug)]
pub enum Response<'a> {
    /// Success with no payload.
    Empty,
    /// Success with borrowed payload.
    Data(&'a [u8]),
    /// Success with built payload.
    Buf(ResponseBuf),
    /// Permanent failure: errno plus message.
    Error(Errno, String),
    /// Go talk to this server instead.
    Redirect {
        /// Data server host.
        host: String,
        /// Data server port.
        port: u16,
    },
    /// Try again after this many seconds.
    Wait(u32),
}

impl<'a> Response<'a> {
    fn status(&self) -> Status {
        match self {
            Response::Empty | Response::Data(_) | Response::Buf(_) => Status::Ok,
            Response::Error(..) => Status::Error,
            Response::Redirect { .. } => Status::Redirect,
            Response::Wait(_) => Status::Wait,
        }
    }

    /// Frame and send over `link`, echoing `streamid`.
    pub fn send(&self, link: &Link, streamid: u16) -> io::Result<()> {
        // Variants with structured payloads build them here so one
        // gathered write covers header and body.
        let built: ResponseBuf = match self {
            Response::Error(errno, msg) => {
                let mut b = ResponseBuf::new();
                b.extend_from_slice(U32::new(errno.code() as u32).as_bytes());
                b.extend_from_slice(msg.as_bytes());
                b.push(0);
                b
            }
            Response::Redirect { host, port } => {
                let mut b = ResponseBuf::new();
                b.extend_from_slice(U32::new(u32::from(*port)).as_bytes());
                b.extend_from_slice(host.as_bytes());
                b
            }
            Response::Wait(secs) => {
                let mut b = ResponseBuf::new();
                b.extend_from_slice(U32::new(*secs).as_bytes());
                b
            }
            _ => ResponseBuf::new(),
        };
        let payload: &[u8] = match self {
            Response::Empty => &[],
            Response::Data(d) => d,
            Response::Buf(b) => b,
            _ => &built,
        };
        let header = RespHeader {
            streamid: U16::new(streamid),
            status: U16::new(self.status() as u16),
            dlen: U32::new(payload.len() as u32),
        };
        let iov = [IoSlice::new(header.as_bytes()), IoSlice::new(payload)];
        link.send_vec(&iov)
    }
}

/// Send one batch of readv segments: each segment is its own response
/// frame (header, segment descriptor, data) but the whole batch goes out
/// in a single scatter-write. `last` marks the final batch, which closes
/// the request with `Ok` instead of `OkSoFar`.
pub fn send_readv_batch(
    link: &Link,
    streamid: u16,
    segs: &[(wire::ReadvSeg, &[u8])],
    last: bool,
) -> io::Result<()> {
    let mut headers: SmallVec<[RespHeader; 8]> = SmallVec::new();
    for (i, (_seg, data)) in segs.iter().enumerate() {
        let final_seg = last && i == segs.len() - 1;
        headers.push(RespHeader {
            streamid: U16::new(streamid),
            status: U16::new(if final_seg {
                Status::Ok as u16
            } else {
                Status::OkSoFar as u16
            }),
            dlen: U32::new((std::mem::size_of::<wire::ReadvSeg>() + data.len()) as u32),
        });
    }
    let mut iov: SmallVec<[IoSlice<'_>; 24]> = SmallVec::new();
    for (i, (seg, data)) in segs.iter().enumerate() {
        iov.push(IoSlice::new(headers[i].as_bytes()));
        iov.push(IoSlice::new(seg.as_bytes()));
        iov.push(IoSlice::new(data));
    }
    link.send_vec(&iov)
}

/// Send an unsolicited response frame: reserved streamid, `Attn` status,
/// and the action code followed by its argument bytes.
pub fn send_async(link: &Link, action: AsyncAction, args: &[u8]) -> io::Result<()> {
    let header = RespHeader {
        streamid: U16::new(wire::ASYNC_STREAMID),
        status: U16::new(Status::Attn as u16),
        dlen: U32::new((2 + args.len()) as u32),
    };
    let code = U16::new(action as u16);
    let iov = [
        IoSlice::new(header.as_bytes()),
        IoSlice::new(code.as_bytes()),
        IoSlice::new(args),
    ];
    link.send_vec(&iov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkPool;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    fn pair() -> (Arc<Link>, Arc<Link>) {
        let pool = LinkPool::new(2);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (
            pool.alloc_stream(server, peer),
            pool.alloc_stream(client, addr),
        )
    }

    fn read_resp(link: &Link) -> (RespHeader, Vec<u8>) {
        let mut hdr = [0u8; std::mem::size_of::<RespHeader>()];
        link.recv_exact(&mut hdr).unwrap();
        let hdr = RespHeader::read_from_bytes(&hdr).unwrap();
        let mut payload = vec![0u8; hdr.dlen.get() as usize];
        link.recv_exact(&mut payload).unwrap();
        (hdr, payload)
    }

    use zerocopy::FromBytes;

    #[test]
    fn data_response_round_trip() {
        let (tx, rx) = pair();
        Response::Data(b"hello").send(&tx, 42).unwrap();
        let (hdr, payload) = read_resp(&rx);
        assert_eq!(hdr.streamid.get(), 42);
        assert_eq!(hdr.status.get(), Status::Ok as u16);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn error_response_carries_errno_and_text() {
        let (tx, rx) = pair();
        Response::Error(Errno::from_raw(libc::ENOENT), "not here".to_owned())
            .send(&tx, 1)
            .unwrap();
        let (hdr, payload) = read_resp(&rx);
        assert_eq!(hdr.status.get(), Status::Error as u16);
        let errno = u32::from_be_bytes(payload[..4].try_into().unwrap());
        assert_eq!(errno as i32, libc::ENOENT);
        assert_eq!(&payload[4..payload.len() - 1], b"not here");
        assert_eq!(*payload.last().unwrap(), 0);
    }

    #[test]
    fn redirect_and_wait_payloads() {
        let (tx, rx) = pair();
        Response::Redirect {
            host: "b.example".to_owned(),
            port: 1094,
        }
        .send(&tx, 9)
        .unwrap();
        let (hdr, payload) = read_resp(&rx);
        assert_eq!(hdr.status.get(), Status::Redirect as u16);
        assert_eq!(u32::from_be_bytes(payload[..4].try_into().unwrap()), 1094);
        assert_eq!(&payload[4..], b"b.example");

        Response::Wait(30).send(&tx, 9).unwrap();
        let (hdr, payload) = read_resp(&rx);
        assert_eq!(hdr.status.get(), Status::Wait as u16);
        assert_eq!(u32::from_be_bytes(payload[..4].try_into().unwrap()), 30);
    }

    #[test]
    fn readv_batch_frames_each_segment() {
        let (tx, rx) = pair();
        use zerocopy::byteorder::big_endian::U32 as BU32;
        let seg1 = wire::ReadvSeg {
            fhandle: BU32::new(1),
            rlen: BU32::new(3),
            off_hi: BU32::new(0),
            off_lo: BU32::new(0),
        };
        let seg2 = wire::ReadvSeg {
            fhandle: BU32::new(1),
            rlen: BU32::new(2),
            off_hi: BU32::new(0),
            off_lo: BU32::new(3),
        };
        send_readv_batch(&tx, 5, &[(seg1, b"abc"), (seg2, b"de")], true).unwrap();
        let (h1, p1) = read_resp(&rx);
        assert_eq!(h1.status.get(), Status::OkSoFar as u16);
        assert_eq!(&p1[16..], b"abc");
        let (h2, p2) = read_resp(&rx);
        assert_eq!(h2.status.get(), Status::Ok as u16);
        assert_eq!(&p2[16..], b"de");
    }

    #[test]
    fn async_frame_uses_reserved_streamid() {
        let (tx, rx) = pair();
        send_async(&tx, AsyncAction::Wait, &30u32.to_be_bytes()).unwrap();
        let (hdr, payload) = read_resp(&rx);
        assert_eq!(hdr.streamid.get(), wire::ASYNC_STREAMID);
        assert_eq!(hdr.status.get(), Status::Attn as u16);
        let action = u16::from_be_bytes(payload[..2].try_into().unwrap());
        assert_eq!(action, AsyncAction::Wait as u16);
    }
}
