//! Client-side driver for the Network Block Device (NBD) wire protocol.
//!
//! The driver connects to an external NBD server over a Unix-domain or TCP
//! stream, negotiates a session (both handshake styles, structured replies,
//! and the `base:allocation` meta context), and exposes block-device style
//! operations that many threads may issue concurrently against one
//! connection. A dedicated reader thread demultiplexes replies back to
//! their callers by cookie.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the protocol description.

pub mod client;
pub mod config;
pub mod handshake;
pub mod proto;
pub mod transport;

pub use client::{CacheMode, Driver, Extent, Extents, FuaMode, Handle, OpFlags};
pub use config::Config;
