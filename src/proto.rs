//! NBD protocol constants and struct definitions.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]

use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;
use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Default TCP port assigned to NBD by IANA.
pub const DEFAULT_PORT: u16 = 10809;

pub const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT"
/// Version field of the original, fixed-layout handshake.
pub const OLD_VERSION: u64 = 0x00420281861253;
/// Version field of the newstyle handshake (the same bytes as IHAVEOPT).
pub const NEW_VERSION: u64 = IHAVEOPT;
pub const OPTION_REPLY_MAGIC: u64 = 0x3e889045565a9;

// transmission constants
pub const REQUEST_MAGIC: u32 = 0x25609513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// Bound on option reply payloads, to limit abuse during the handshake.
pub const MAX_OPTION_REPLY_LEN: u32 = 16 * 1024 * 1024;
/// Bound on a single structured reply chunk during transmission.
pub const MAX_CHUNK_LEN: u32 = 64 * 1024 * 1024;

/// The one metadata context this client knows how to negotiate.
pub const BASE_ALLOCATION: &str = "base:allocation";

#[derive(Debug, Clone)]
pub struct ProtocolError(String);

impl ProtocolError {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

bitflags! {
  /// Global flags announced in the newstyle greeting. The client echoes
  /// back the subset it understands as its 32-bit client flags.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct HandshakeFlags: u16 {
    const FIXED_NEWSTYLE = 0b01;
    const NO_ZEROES = 0b10;
  }

  /// Per-export transmission flags, fixed for the life of the session.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct TransmitFlags: u16 {
    const HAS_FLAGS = 1 << 0;
    const READ_ONLY = 1 << 1;
    const SEND_FLUSH = 1 << 2;
    const SEND_FUA = 1 << 3;
    const ROTATIONAL = 1 << 4;
    const SEND_TRIM = 1 << 5;
    const SEND_WRITE_ZEROES = 1 << 6;
    const SEND_DF = 1 << 7;
    const CAN_MULTI_CONN = 1 << 8;
    const SEND_RESIZE = 1 << 9;
    const SEND_CACHE = 1 << 10;
    const SEND_FAST_ZERO = 1 << 11;
  }

  /// Flags attached to individual request frames.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct CmdFlags: u16 {
    const FUA = 1 << 0;
    const NO_HOLE = 1 << 1;
    // "don't fragment"
    const DF = 1 << 2;
    const REQ_ONE = 1 << 3;
    const FAST_ZERO = 1 << 4;
  }
}

/// Flag bit marking the terminal chunk of a structured reply.
pub const REPLY_FLAG_DONE: u16 = 1 << 0;

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    EXPORT_NAME = 1,
    ABORT = 2,
    LIST = 3,
    PEEK_EXPORT = 4,
    STARTTLS = 5,
    INFO = 6,
    GO = 7,
    STRUCTURED_REPLY = 8,
    LIST_META_CONTEXT = 9,
    SET_META_CONTEXT = 10,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyType {
    ACK = 1,
    SERVER = 2,
    INFO = 3,
    META_CONTEXT = 4,
    ERR_UNSUP = (1 << 31) + 1,
    ERR_POLICY = (1 << 31) + 2,
    ERR_INVALID = (1 << 31) + 3,
    ERR_PLATFORM = (1 << 31) + 4,
    ERR_TLS_REQD = (1 << 31) + 5,
    ERR_UNKNOWN = (1 << 31) + 6,
    ERR_SHUTDOWN = (1 << 31) + 7,
    ERR_BLOCK_SIZE_REQD = (1 << 31) + 8,
    ERR_TOO_BIG = (1 << 31) + 9,
}

impl ReplyType {
    /// Error replies have the high bit set.
    pub fn is_err(self) -> bool {
        u32::from(self) & (1 << 31) != 0
    }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum InfoType {
    EXPORT = 0,
    NAME = 1,
    DESCRIPTION = 2,
    BLOCK_SIZE = 3,
}

// -------------------
// Transmission phase
// -------------------

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Cmd {
    READ = 0,
    WRITE = 1,
    // NBD_CMD_DISC
    DISCONNECT = 2,
    FLUSH = 3,
    TRIM = 4,
    CACHE = 5,
    WRITE_ZEROES = 6,
    BLOCK_STATUS = 7,
    RESIZE = 8,
}

/// Bit marking the error family of structured reply chunk types.
pub const CHUNK_TYPE_ERR_BIT: u16 = 1 << 15;

/// Content chunk types of a structured reply. Error chunks are matched by
/// [`CHUNK_TYPE_ERR_BIT`] instead, since unknown error subtypes must still
/// parse.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum ChunkType {
    NONE = 0,
    OFFSET_DATA = 1,
    OFFSET_HOLE = 2,
    BLOCK_STATUS = 5,
}

/// Error codes a server may put on the wire. The values mirror common
/// errno numbers but only this closed set is legal in replies.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorType {
    OK = 0,
    EPERM = 1,
    EIO = 5,
    ENOMEM = 12,
    EINVAL = 22,
    ENOSPC = 28,
    EOVERFLOW = 75,
    ENOTSUP = 95,
    ESHUTDOWN = 108,
}

/// An option sent to the server during newstyle haggling.
#[derive(Debug, Clone)]
pub struct Opt {
    pub typ: OptType,
    pub data: Vec<u8>,
}

impl Opt {
    pub fn put<IO: Write>(&self, mut stream: IO) -> io::Result<()> {
        // C: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT') (note same newstyle handshake's magic number)
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above.
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u32::<BE>(u32::from(self.typ))?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

/// A server's reply to one option, with its payload consumed.
#[derive(Debug, Clone)]
pub struct OptionReply {
    pub typ: ReplyType,
    pub payload: Vec<u8>,
}

impl OptionReply {
    /// Read the reply to `expect`, validating the magic, the echoed option,
    /// and the payload bounds.
    pub fn get<IO: Read>(mut stream: IO, expect: OptType) -> Result<Self> {
        // S: 64 bits, 0x3e889045565a9 (magic number for replies)
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type (e.g., NBD_REP_ACK)
        // S: 32 bits, length of the reply
        let magic = stream.read_u64::<BE>()?;
        if magic != OPTION_REPLY_MAGIC {
            bail!(ProtocolError::new(format!(
                "unexpected option reply magic {magic:#x}"
            )));
        }
        let option = stream.read_u32::<BE>()?;
        if option != u32::from(expect) {
            bail!(ProtocolError::new(format!(
                "reply to option {option} while haggling {expect:?}"
            )));
        }
        let reply = stream.read_u32::<BE>()?;
        let typ = ReplyType::try_from(reply)
            .map_err(|_| ProtocolError::new(format!("unexpected reply type {reply:#x}")))?;
        let len = stream.read_u32::<BE>()?;
        ensure!(
            typ != ReplyType::ACK || len == 0,
            ProtocolError::new(format!("ACK should not have a {len} byte payload"))
        );
        ensure!(
            len <= MAX_OPTION_REPLY_LEN,
            ProtocolError::new(format!("option reply length {len} is suspiciously large"))
        );
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload)?;
        Ok(Self { typ, payload })
    }

    /// Error reply payloads are human-readable strings destined for the logs.
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A transmission-phase request frame.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub flags: CmdFlags,
    pub typ: Cmd,
    pub cookie: u64,
    pub offset: u64,
    pub len: u32,
}

impl Request {
    /// Write the frame and any attached payload, flushing both together.
    pub fn put<IO: Write>(&self, mut stream: IO, payload: Option<&[u8]>) -> io::Result<()> {
        // C: 32 bits, 0x25609513, magic (NBD_REQUEST_MAGIC)
        // C: 16 bits, command flags
        // C: 16 bits, type
        // C: 64 bits, handle
        // C: 64 bits, offset (unsigned)
        // C: 32 bits, length (unsigned)
        // C: (length bytes of data if the request is of type NBD_CMD_WRITE)
        stream.write_u32::<BE>(REQUEST_MAGIC)?;
        stream.write_u16::<BE>(self.flags.bits())?;
        stream.write_u16::<BE>(u16::from(self.typ))?;
        stream.write_u64::<BE>(self.cookie)?;
        stream.write_u64::<BE>(self.offset)?;
        stream.write_u32::<BE>(self.len)?;
        if let Some(data) = payload {
            stream.write_all(data)?;
        }
        stream.flush()?;
        Ok(())
    }
}
