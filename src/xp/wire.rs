//! Data-protocol wire definitions.
//!
//! Requests carry a fixed header `{ streamid, opcode, params[16], dlen }`
//! followed by `dlen` payload bytes; responses carry `{ streamid, status,
//! dlen }`. All integers are big-endian on the wire. Unsolicited (async)
//! responses use the reserved streamid 0 and an action code in the payload.
//! Offsets ride as paired 32-bit halves in the affected opcodes for legacy
//! reasons; they are 64-bit everywhere else.

#![allow(missing_docs)]

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Protocol version exchanged in the hello line.
pub const PROTO_VERSION: u32 = 0x0400;

/// Versions below this predate 64-bit offsets; such clients get `EFBIG`
/// for offsets at or above 2^31.
pub const PROTO_64BIT_VERSION: u32 = 0x0300;

/// Streamid reserved for unsolicited responses.
pub const ASYNC_STREAMID: u16 = 0;

/// Largest payload accepted in one frame.
pub const MAX_DLEN: u32 = 16 * 1024 * 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ReqHeader {
    pub streamid: U16,
    pub opcode: U16,
    pub params: [u8; 16],
    pub dlen: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RespHeader {
    pub streamid: U16,
    pub status: U16,
    pub dlen: U32,
}

/// Request opcodes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Opcode {
    Auth = 3000,
    Query = 3001,
    Chmod = 3002,
    Close = 3003,
    Locate = 3004,
    Mkdir = 3005,
    Mv = 3006,
    Open = 3007,
    Prepare = 3009,
    Read = 3010,
    Rm = 3011,
    Rmdir = 3012,
    Stat = 3013,
    Sync = 3014,
    Write = 3015,
    Readv = 3016,
}

/// Response status codes.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum Status {
    Ok = 0,
    OkSoFar = 4000,
    Attn = 4001,
    AuthMore = 4002,
    Error = 4003,
    Redirect = 4004,
    Wait = 4005,
}

/// Action codes carried on the async streamid.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum AsyncAction {
    /// Abort whatever is in flight and disconnect.
    Abort = 5001,
    /// Resume after a pause.
    Cont = 5002,
    /// Disconnect and reconnect later.
    Disc = 5003,
    /// Operator message.
    Msg = 5004,
    /// Pause for the carried number of seconds.
    Wait = 5005,
    /// Reconnect to the carried host:port.
    Redirect = 5006,
}

bitflags! {
    /// Open request options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u16 {
        /// Truncate an existing file.
        const DELETE = 0x0002;
        /// Create if absent.
        const NEW    = 0x0004;
        /// Open for update (read-write).
        const UPDATE = 0x0008;
        /// Create missing parent directories.
        const MKPATH = 0x0100;
        /// Advisory: client intends sequential streaming.
        const SEQIO  = 0x0200;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct OpenParams {
    pub mode: U16,
    pub options: U16,
    pub reserved: [u8; 12],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ReadParams {
    pub fhandle: U32,
    pub off_hi: U32,
    pub off_lo: U32,
    pub rlen: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct WriteParams {
    pub fhandle: U32,
    pub off_hi: U32,
    pub off_lo: U32,
    pub reserved: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct FhParams {
    pub fhandle: U32,
    pub reserved: [u8; 12],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ModeParams {
    pub mode: U16,
    pub reserved: [u8; 14],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct LocateParams {
    /// ASCII access mode: `r`, `w`, `c`, or `x`.
    pub mode: u8,
    /// Nonzero forces a cache refresh at the manager.
    pub refresh: u8,
    pub reserved: [u8; 14],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct QueryParams {
    pub subcode: U16,
    pub reserved: [u8; 14],
}

/// Query subcode: the summary statistics document.
pub const QUERY_STATS: u16 = 1;

/// One segment of a readv payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ReadvSeg {
    pub fhandle: U32,
    pub rlen: U32,
    pub off_hi: U32,
    pub off_lo: U32,
}

/// Join a legacy offset pair into the 64-bit offset used internally.
pub fn join_offset(hi: u32, lo: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Split a 64-bit offset into the wire's legacy pair.
pub fn split_offset(off: u64) -> (u32, u32) {
    ((off >> 32) as u32, off as u32)
}
