//! The data-server client protocol: wire format, request parsing, reply
//! framing, async ops, and the per-client session engine.

pub mod aio;
pub mod reply;
pub mod request;
pub mod session;
pub mod wire;
