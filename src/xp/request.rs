//! Request parsing: header plus payload into a tagged operation.

#![allow(missing_docs)]

use std::fmt;

use zerocopy::FromBytes;

use super::wire::{self, Opcode, ReqHeader};

/// Errors that make a frame unusable; all of them terminate the session.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestError {
    /// The opcode is not one we know.
    UnknownOpcode(u16),
    /// The payload was shorter than its opcode requires.
    ShortPayload(Opcode),
    /// The payload failed structural validation.
    BadPayload(&'static str),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::UnknownOpcode(op) => write!(f, "unknown opcode {op}"),
            RequestError::ShortPayload(op) => write!(f, "short payload for {op:?}"),
            RequestError::BadPayload(what) => write!(f, "bad payload: {what}"),
        }
    }
}

impl std::error::Error for RequestError {}

/// One readv segment, offsets joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSeg {
    /// File handle.
    pub fh: u32,
    /// Byte offset.
    pub offset: u64,
    /// Segment length.
    pub len: u32,
}

/// A parsed request.
#[derive(Debug, PartialEq, Eq)]
pub enum Op<'a> {
    Auth {
        cred: &'a [u8],
    },
    Open {
        path: &'a str,
        info: &'a str,
        flags: wire::OpenFlags,
        mode: u32,
    },
    Close {
        fh: u32,
    },
    Read {
        fh: u32,
        offset: u64,
        len: u32,
        /// Advisory pre-read hints; no replies are produced for these.
        preread: Vec<ReadSeg>,
    },
    Readv {
        segs: Vec<ReadSeg>,
    },
    Write {
        fh: u32,
        offset: u64,
        data: &'a [u8],
    },
    Sync {
        fh: u32,
    },
    Stat {
        path: &'a str,
    },
    Mkdir {
        path: &'a str,
        mode: u32,
    },
    Mv {
        from: &'a str,
        to: &'a str,
    },
    Rm {
        path: &'a str,
    },
    Rmdir {
        path: &'a str,
    },
    Chmod {
        path: &'a str,
        mode: u32,
    },
    Locate {
        path: &'a str,
        mode: char,
        refresh: bool,
    },
    Prepare {
        reqid: &'a str,
        user: &'a str,
        prty: u8,
        mode: &'a str,
        path: &'a str,
    },
    Query {
        subcode: u16,
        args: &'a str,
    },
}

/// A request frame after parsing.
#[derive(Debug)]
pub struct Request<'a> {
    /// Client-chosen stream id, echoed in every response.
    pub streamid: u16,
    /// The operation.
    pub op: Op<'a>,
}

fn params<T: FromBytes + zerocopy::KnownLayout + zerocopy::Immutable>(hdr: &ReqHeader) -> &T {
    T::ref_from_bytes(&hdr.params).expect("params structs are exactly 16 bytes")
}

fn path_str(payload: &[u8]) -> Result<&str, RequestError> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end]).map_err(|_| RequestError::BadPayload("path not utf-8"))
}

fn split_info(full: &str) -> (&str, &str) {
    match full.split_once('?') {
        Some((path, info)) => (path, info),
        None => (full, ""),
    }
}

fn parse_segs(data: &[u8]) -> Result<Vec<ReadSeg>, RequestError> {
    let seg_len = std::mem::size_of::<wire::ReadvSeg>();
    if data.len() % seg_len != 0 {
        return Err(RequestError::BadPayload("segment list not a whole number of segments"));
    }
    Ok(data
        .chunks_exact(seg_len)
        .map(|chunk| {
            let seg = wire::ReadvSeg::ref_from_bytes(chunk).expect("chunk is seg-sized");
            ReadSeg {
                fh: seg.fhandle.get(),
                offset: wire::join_offset(seg.off_hi.get(), seg.off_lo.get()),
                len: seg.rlen.get(),
            }
        })
        .collect())
}

impl<'a> Request<'a> {
    /// Parse a frame. The payload slice must be exactly `hdr.dlen` long.
    pub fn parse(hdr: &ReqHeader, payload: &'a [u8]) -> Result<Request<'a>, RequestError> {
        let opcode = Opcode::try_from(hdr.opcode.get())
            .map_err(|_| RequestError::UnknownOpcode(hdr.opcode.get()))?;
        let op = match opcode {
            Opcode::Auth => Op::Auth { cred: payload },
            Opcode::Open => {
                let p: &wire::OpenParams = params(hdr);
                let (path, info) = split_info(path_str(payload)?);
                if path.is_empty() {
                    return Err(RequestError::ShortPayload(opcode));
                }
                Op::Open {
                    path,
                    info,
                    flags: wire::OpenFlags::from_bits_truncate(p.options.get()),
                    mode: u32::from(p.mode.get()),
                }
            }
            Opcode::Close => {
                let p: &wire::FhParams = params(hdr);
                Op::Close {
                    fh: p.fhandle.get(),
                }
            }
            Opcode::Read => {
                let p: &wire::ReadParams = params(hdr);
                Op::Read {
                    fh: p.fhandle.get(),
                    offset: wire::join_offset(p.off_hi.get(), p.off_lo.get()),
                    len: p.rlen.get(),
                    preread: parse_segs(payload)?,
                }
            }
            Opcode::Readv => {
                let segs = parse_segs(payload)?;
                if segs.is_empty() {
                    return Err(RequestError::ShortPayload(opcode));
                }
                Op::Readv { segs }
            }
            Opcode::Write => {
                let p: &wire::WriteParams = params(hdr);
                Op::Write {
                    fh: p.fhandle.get(),
                    offset: wire::join_offset(p.off_hi.get(), p.off_lo.get()),
                    data: payload,
                }
            }
            Opcode::Sync => {
                let p: &wire::FhParams = params(hdr);
                Op::Sync {
                    fh: p.fhandle.get(),
                }
            }
            Opcode::Stat => Op::Stat {
                path: path_str(payload)?,
            },
            Opcode::Mkdir => {
                let p: &wire::ModeParams = params(hdr);
                Op::Mkdir {
                    path: path_str(payload)?,
                    mode: u32::from(p.mode.get()),
                }
            }
            Opcode::Mv => {
                let full = path_str(payload)?;
                let (from, to) = full
                    .split_once(' ')
                    .ok_or(RequestError::BadPayload("mv needs two paths"))?;
                Op::Mv { from, to }
            }
            Opcode::Rm => Op::Rm {
                path: path_str(payload)?,
            },
            Opcode::Rmdir => Op::Rmdir {
                path: path_str(payload)?,
            },
            Opcode::Chmod => {
                let p: &wire::ModeParams = params(hdr);
                Op::Chmod {
                    path: path_str(payload)?,
                    mode: u32::from(p.mode.get()),
                }
            }
            Opcode::Locate => {
                let p: &wire::LocateParams = params(hdr);
                let mode = p.mode as char;
                if !matches!(mode, 'r' | 'w' | 'c' | 'x') {
                    return Err(RequestError::BadPayload("locate mode"));
                }
                Op::Locate {
                    path: path_str(payload)?,
                    mode,
                    refresh: p.refresh != 0,
                }
            }
            Opcode::Prepare => {
                // Payload: "<reqid> <user> <prty> <mode> <path>"
                let text = path_str(payload)?;
                let mut it = text.split_whitespace();
                let (reqid, user, prty, mode, path) = (
                    it.next().ok_or(RequestError::ShortPayload(opcode))?,
                    it.next().ok_or(RequestError::ShortPayload(opcode))?,
                    it.next().ok_or(RequestError::ShortPayload(opcode))?,
                    it.next().ok_or(RequestError::ShortPayload(opcode))?,
                    it.next().ok_or(RequestError::ShortPayload(opcode))?,
                );
                Op::Prepare {
                    reqid,
                    user,
                    prty: prty
                        .parse()
                        .map_err(|_| RequestError::BadPayload("prepare priority"))?,
                    mode,
                    path,
                }
            }
            Opcode::Query => {
                let p: &wire::QueryParams = params(hdr);
                Op::Query {
                    subcode: p.subcode.get(),
                    args: path_str(payload)?,
                }
            }
        };
        Ok(Request {
            streamid: hdr.streamid.get(),
            op,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;
    use zerocopy::byteorder::big_endian::{U16, U32};

    fn header(op: Opcode, params: [u8; 16], dlen: u32) -> ReqHeader {
        ReqHeader {
            streamid: U16::new(7),
            opcode: U16::new(op as u16),
            params,
            dlen: U32::new(dlen),
        }
    }

    #[test]
    fn parses_open_with_info() {
        let p = wire::OpenParams {
            mode: U16::new(0o644),
            options: U16::new((wire::OpenFlags::NEW | wire::OpenFlags::UPDATE).bits()),
            reserved: [0; 12],
        };
        let payload = b"/d/f1?tag=alpha";
        let mut params = [0u8; 16];
        params.copy_from_slice(p.as_bytes());
        let hdr = header(Opcode::Open, params, payload.len() as u32);
        let req = Request::parse(&hdr, payload).unwrap();
        assert_eq!(req.streamid, 7);
        match req.op {
            Op::Open {
                path,
                info,
                flags,
                mode,
            } => {
                assert_eq!(path, "/d/f1");
                assert_eq!(info, "tag=alpha");
                assert!(flags.contains(wire::OpenFlags::NEW));
                assert_eq!(mode, 0o644);
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn parses_read_offset_halves() {
        let p = wire::ReadParams {
            fhandle: U32::new(3),
            off_hi: U32::new(1),
            off_lo: U32::new(2),
            rlen: U32::new(100),
        };
        let mut params = [0u8; 16];
        params.copy_from_slice(p.as_bytes());
        let hdr = header(Opcode::Read, params, 0);
        match Request::parse(&hdr, &[]).unwrap().op {
            Op::Read {
                fh, offset, len, ..
            } => {
                assert_eq!(fh, 3);
                assert_eq!(offset, (1u64 << 32) | 2);
                assert_eq!(len, 100);
            }
            other => panic!("expected read, got {other:?}"),
        }
    }

    #[test]
    fn readv_segments_parse() {
        let seg = wire::ReadvSeg {
            fhandle: U32::new(1),
            rlen: U32::new(10),
            off_hi: U32::new(0),
            off_lo: U32::new(4096),
        };
        let mut payload = Vec::new();
        payload.extend_from_slice(seg.as_bytes());
        payload.extend_from_slice(seg.as_bytes());
        let hdr = header(Opcode::Readv, [0; 16], payload.len() as u32);
        match Request::parse(&hdr, &payload).unwrap().op {
            Op::Readv { segs } => {
                assert_eq!(segs.len(), 2);
                assert_eq!(segs[0].offset, 4096);
            }
            other => panic!("expected readv, got {other:?}"),
        }
    }

    #[test]
    fn truncated_and_unknown_frames_fail() {
        let hdr = header(Opcode::Readv, [0; 16], 7);
        assert!(Request::parse(&hdr, &[0u8; 7]).is_err());
        let mut bad = header(Opcode::Read, [0; 16], 0);
        bad.opcode = U16::new(2999);
        assert_eq!(
            Request::parse(&bad, &[]).unwrap_err(),
            RequestError::UnknownOpcode(2999)
        );
    }
}
