//! NBD client driver: one connection per [`Handle`], a dedicated reply
//! reader thread, and block-device style operations that any number of
//! threads may issue concurrently.
//!
//! Requests are correlated with replies by cookie. A caller serializes its
//! request frame under the write lock, parks on a per-transaction completion
//! channel, and is woken by the reader once the terminal reply chunk for its
//! cookie has been parsed into its buffer or extents sink.
#![deny(missing_docs)]

use std::collections::HashMap;
use std::fmt;
use std::io::prelude::*;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, BE};
use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;
use log::debug;
use nix::errno::Errno;

use crate::config::{Config, Settings};
use crate::handshake;
use crate::proto::*;
use crate::transport::{self, Conn};

bitflags! {
    /// Flags accepted on host-facing operations. Each operation asserts
    /// that no bits it does not support are present.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// Zeroing may punch a hole instead of writing zeroes.
        const MAY_TRIM = 1 << 0;
        /// Force unit access: do not acknowledge before the data is durable.
        const FUA = 1 << 1;
        /// Request at most one extent per block-status reply.
        const REQ_ONE = 1 << 2;
    }
}

/// How the server honors forced-unit-access requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuaMode {
    /// FUA is not advertised; the host must emulate or skip it.
    None,
    /// The server executes FUA natively.
    Native,
}

/// How the server honors cache requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// CACHE is not advertised.
    None,
    /// The server executes CACHE natively.
    Native,
}

/// A run of blocks sharing an allocation status.
///
/// The driver passes status flags through untouched; their meaning belongs
/// to the host layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Absolute offset of the run.
    pub offset: u64,
    /// Length of the run in bytes.
    pub length: u32,
    /// Status flags as the server reported them.
    pub status: u32,
}

/// Append-only collector for block-status descriptors.
///
/// The caller hands the sink to [`Handle::extents`] and receives it back,
/// filled, once the reply completes.
#[derive(Debug, Default)]
pub struct Extents {
    extents: Vec<Extent>,
}

impl Extents {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&mut self, offset: u64, length: u32, status: u32) -> core::result::Result<(), Errno> {
        self.extents.try_reserve(1).map_err(|_| Errno::ENOMEM)?;
        self.extents.push(Extent {
            offset,
            length,
            status,
        });
        Ok(())
    }

    /// The collected extents, in reply order.
    pub fn as_slice(&self) -> &[Extent] {
        &self.extents
    }

    /// Consume the sink, yielding the collected extents.
    pub fn into_vec(self) -> Vec<Extent> {
        self.extents
    }

    /// Number of collected extents.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// True if nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}

// What the reader hands back through the completion channel: the outcome
// plus the caller-owned buffer and sink that were parked on the transaction.
#[derive(Debug)]
struct Completion {
    err: Option<Errno>,
    buf: Vec<u8>,
    extents: Option<Extents>,
}

// One in-flight request. Lives in the pending table from just before its
// frame hits the wire until the terminal reply chunk (or connection death).
#[derive(Debug)]
struct Transaction {
    done: SyncSender<Completion>,
    buf: Option<Vec<u8>>,
    offset: u64,
    err: Option<Errno>,
    extents: Option<Extents>,
}

impl Transaction {
    // The first non-zero error wins and is replayed on the terminal chunk.
    fn record_err(&mut self, err: Errno) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    // Post the completion signal exactly once; consuming self enforces it.
    fn complete(self, err: Option<Errno>) {
        let _ = self.done.send(Completion {
            err: self.err.or(err),
            buf: self.buf.unwrap_or_default(),
            extents: self.extents,
        });
    }

    // Release a waiter on a connection that is going away.
    fn abort(self) {
        let _ = self.done.send(Completion {
            err: Some(Errno::ESHUTDOWN),
            buf: self.buf.unwrap_or_default(),
            extents: self.extents,
        });
    }
}

// Everything guarded by the transaction lock.
#[derive(Debug, Default)]
struct TransTable {
    pending: HashMap<u64, Transaction>,
    next_cookie: u64,
    dead: bool,
}

/// One open session with an NBD server.
///
/// The handle owns the socket. Its write half sits behind the write lock so
/// request frames never interleave; its read half belongs exclusively to the
/// reader thread for the handle's lifetime. Handles are shared as
/// [`Arc<Handle>`] and every operation takes `&self`, so any number of
/// threads may issue requests concurrently.
#[derive(Debug)]
pub struct Handle {
    size: u64,
    flags: TransmitFlags,
    structured: bool,
    extents: bool,
    server: String,
    writer: Mutex<Conn>,
    trans: Mutex<TransTable>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Handle {
    /// Connect, handshake, and start the reader thread.
    pub(crate) fn open(settings: &Settings, readonly: bool) -> Result<Arc<Handle>> {
        let mut conn = transport::connect(settings)?;
        let negotiation = handshake::negotiate(&mut conn, &settings.export)
            .wrap_err_with(|| format!("handshake with {} failed", settings.server))?;
        let mut flags = negotiation.flags;
        if readonly {
            flags |= TransmitFlags::READ_ONLY;
        }
        debug!(
            "connected to {}: size {}, flags {flags:?}, structured {}, extents {}",
            settings.server, negotiation.size, negotiation.structured, negotiation.extents
        );
        let reader_conn = conn.try_clone()?;
        let handle = Arc::new(Handle {
            size: negotiation.size,
            flags,
            structured: negotiation.structured,
            extents: negotiation.extents,
            server: settings.server.clone(),
            writer: Mutex::new(conn),
            trans: Mutex::new(TransTable {
                // cookie 0 is reserved for the courtesy disconnect
                next_cookie: 1,
                ..TransTable::default()
            }),
            reader: Mutex::new(None),
        });
        let reader = {
            let handle = Arc::clone(&handle);
            thread::Builder::new()
                .name("nbd-reader".to_string())
                .spawn(move || handle.reader_loop(reader_conn))?
        };
        *handle.reader.lock().unwrap() = Some(reader);
        Ok(handle)
    }

    /// Write a courtesy disconnect, wait for the reader to drain, and let
    /// the socket close. Safe to call on a dead handle.
    pub(crate) fn close(&self) {
        let dead = self.trans.lock().unwrap().dead;
        if !dead {
            let mut writer = self.writer.lock().unwrap();
            let disc = Request {
                flags: CmdFlags::empty(),
                typ: Cmd::DISCONNECT,
                cookie: 0,
                offset: 0,
                len: 0,
            };
            // best effort: the server answers by closing, which the reader
            // observes as EOF
            let _ = disc.put(&mut *writer, None);
            let _ = writer.shutdown_write();
        }
        let reader = self.reader.lock().unwrap().take();
        if let Some(reader) = reader {
            let _ = reader.join();
        }
    }

    // ------------------------------------------------------------------
    // Capability queries, answered from the negotiated transmission flags.
    // ------------------------------------------------------------------

    /// Size of the export in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether writes are allowed (the host may also have forced read-only
    /// at open time).
    pub fn can_write(&self) -> bool {
        !self.flags.contains(TransmitFlags::READ_ONLY)
    }

    /// Whether the server accepts FLUSH.
    pub fn can_flush(&self) -> bool {
        self.flags.contains(TransmitFlags::SEND_FLUSH)
    }

    /// Whether the export behaves like a rotational device.
    pub fn is_rotational(&self) -> bool {
        self.flags.contains(TransmitFlags::ROTATIONAL)
    }

    /// Whether the server accepts TRIM.
    pub fn can_trim(&self) -> bool {
        self.flags.contains(TransmitFlags::SEND_TRIM)
    }

    /// Whether the server accepts WRITE_ZEROES.
    pub fn can_zero(&self) -> bool {
        self.flags.contains(TransmitFlags::SEND_WRITE_ZEROES)
    }

    /// Whether the server accepts the fast-zero probe flag.
    pub fn can_fast_zero(&self) -> bool {
        self.flags.contains(TransmitFlags::SEND_FAST_ZERO)
    }

    /// Whether forced unit access is executed natively.
    pub fn can_fua(&self) -> FuaMode {
        if self.flags.contains(TransmitFlags::SEND_FUA) {
            FuaMode::Native
        } else {
            FuaMode::None
        }
    }

    /// Whether multiple connections to the export are consistent.
    pub fn can_multi_conn(&self) -> bool {
        self.flags.contains(TransmitFlags::CAN_MULTI_CONN)
    }

    /// Whether the server accepts CACHE.
    pub fn can_cache(&self) -> CacheMode {
        if self.flags.contains(TransmitFlags::SEND_CACHE) {
            CacheMode::Native
        } else {
            CacheMode::None
        }
    }

    /// Whether block-status queries are available: structured replies and
    /// the base:allocation context must both have been negotiated.
    pub fn can_extents(&self) -> bool {
        self.extents
    }

    // ------------------------------------------------------------------
    // Request half: allocate a cookie, enqueue the transaction, serialize
    // the frame. The write lock covers header and payload together.
    // ------------------------------------------------------------------

    fn submit(
        &self,
        flags: CmdFlags,
        typ: Cmd,
        offset: u64,
        count: u32,
        payload: Option<&[u8]>,
        buf: Option<Vec<u8>>,
        extents: Option<Extents>,
    ) -> core::result::Result<Receiver<Completion>, Errno> {
        let (done, wait) = sync_channel(1);
        let trans = Transaction {
            done,
            buf,
            offset,
            err: None,
            extents,
        };
        let cookie = {
            let mut table = self.trans.lock().unwrap();
            if table.dead {
                return Err(Errno::ESHUTDOWN);
            }
            let cookie = table.next_cookie;
            table.next_cookie += 1;
            table.pending.insert(cookie, trans);
            cookie
        };
        let request = Request {
            flags,
            typ,
            cookie,
            offset,
            len: count,
        };
        let written = {
            let mut writer = self.writer.lock().unwrap();
            debug!(
                "sending request {typ:?}, flags {:#x}, offset {offset:#x}, count {count:#x}, cookie {cookie:#x}",
                flags.bits()
            );
            request.put(&mut *writer, payload)
        };
        if let Err(err) = written {
            self.trans.lock().unwrap().pending.remove(&cookie);
            self.mark_dead(&err);
            return Err(wire_safe_errno(&err));
        }
        Ok(wait)
    }

    // Reply half: park until the reader posts the completion.
    fn wait(&self, wait: Receiver<Completion>) -> core::result::Result<Completion, Errno> {
        // a closed channel means the reader died before completing us
        let done = wait.recv().map_err(|_| Errno::ESHUTDOWN)?;
        match done.err {
            Some(err) => Err(err),
            None => Ok(done),
        }
    }

    // ------------------------------------------------------------------
    // Host-facing operations. Each returns the wire-translated errno of
    // the server's reply.
    // ------------------------------------------------------------------

    /// Read `buf.len()` bytes at `offset` into `buf`.
    pub fn pread(
        &self,
        buf: &mut [u8],
        offset: u64,
        flags: OpFlags,
    ) -> core::result::Result<(), Errno> {
        assert!(flags.is_empty());
        assert!(buf.len() <= u32::MAX as usize);
        let wait = self.submit(
            CmdFlags::empty(),
            Cmd::READ,
            offset,
            buf.len() as u32,
            None,
            Some(vec![0; buf.len()]),
            None,
        )?;
        let done = self.wait(wait)?;
        buf.copy_from_slice(&done.buf);
        Ok(())
    }

    /// Write `buf` at `offset`.
    pub fn pwrite(
        &self,
        buf: &[u8],
        offset: u64,
        flags: OpFlags,
    ) -> core::result::Result<(), Errno> {
        assert!((flags & !OpFlags::FUA).is_empty());
        assert!(buf.len() <= u32::MAX as usize);
        let wait = self.submit(
            self.fua_flag(flags),
            Cmd::WRITE,
            offset,
            buf.len() as u32,
            Some(buf),
            None,
            None,
        )?;
        self.wait(wait).map(|_| ())
    }

    /// Zero `count` bytes at `offset`, punching a hole when `MAY_TRIM` is
    /// given.
    pub fn zero(&self, count: u32, offset: u64, flags: OpFlags) -> core::result::Result<(), Errno> {
        assert!((flags & !(OpFlags::FUA | OpFlags::MAY_TRIM)).is_empty());
        assert!(self.can_zero());
        let mut cmd_flags = self.fua_flag(flags);
        if !flags.contains(OpFlags::MAY_TRIM) {
            cmd_flags |= CmdFlags::NO_HOLE;
        }
        let wait = self.submit(cmd_flags, Cmd::WRITE_ZEROES, offset, count, None, None, None)?;
        self.wait(wait).map(|_| ())
    }

    /// Discard `count` bytes at `offset`.
    pub fn trim(&self, count: u32, offset: u64, flags: OpFlags) -> core::result::Result<(), Errno> {
        assert!((flags & !OpFlags::FUA).is_empty());
        let wait = self.submit(self.fua_flag(flags), Cmd::TRIM, offset, count, None, None, None)?;
        self.wait(wait).map(|_| ())
    }

    /// Flush outstanding writes to stable storage.
    pub fn flush(&self, flags: OpFlags) -> core::result::Result<(), Errno> {
        assert!(flags.is_empty());
        let wait = self.submit(CmdFlags::empty(), Cmd::FLUSH, 0, 0, None, None, None)?;
        self.wait(wait).map(|_| ())
    }

    /// Query block status over `[offset, offset+count)`, appending
    /// base:allocation extents to `sink` and handing it back.
    pub fn extents(
        &self,
        count: u32,
        offset: u64,
        flags: OpFlags,
        sink: Extents,
    ) -> core::result::Result<Extents, Errno> {
        assert!((flags & !OpFlags::REQ_ONE).is_empty());
        assert!(self.extents);
        let cmd_flags = if flags.contains(OpFlags::REQ_ONE) {
            CmdFlags::REQ_ONE
        } else {
            CmdFlags::empty()
        };
        let wait = self.submit(
            cmd_flags,
            Cmd::BLOCK_STATUS,
            offset,
            count,
            None,
            None,
            Some(sink),
        )?;
        let done = self.wait(wait)?;
        Ok(done.extents.unwrap_or_default())
    }

    /// Hint that `count` bytes at `offset` are worth caching server-side.
    pub fn cache(&self, count: u32, offset: u64, flags: OpFlags) -> core::result::Result<(), Errno> {
        assert!(flags.is_empty());
        let wait = self.submit(CmdFlags::empty(), Cmd::CACHE, offset, count, None, None, None)?;
        self.wait(wait).map(|_| ())
    }

    fn fua_flag(&self, flags: OpFlags) -> CmdFlags {
        if flags.contains(OpFlags::FUA) && self.flags.contains(TransmitFlags::SEND_FUA) {
            CmdFlags::FUA
        } else {
            CmdFlags::empty()
        }
    }

    // ------------------------------------------------------------------
    // Reply demultiplexer. Runs on the dedicated reader thread for the
    // handle's lifetime; sole reader of the socket.
    // ------------------------------------------------------------------

    fn reader_loop(&self, mut conn: Conn) {
        loop {
            match self.read_reply(&mut conn) {
                Ok(()) => {
                    if self.trans.lock().unwrap().dead {
                        break;
                    }
                }
                Err(err) => {
                    self.mark_dead(&err);
                    break;
                }
            }
        }
        // clean up any stranded in-flight requests
        let pending = {
            let mut table = self.trans.lock().unwrap();
            std::mem::take(&mut table.pending)
        };
        for (_, trans) in pending {
            trans.abort();
        }
    }

    // Any error out of here is fatal for the connection: there is no hope
    // of resynchronizing with the server.
    fn read_reply(&self, conn: &mut Conn) -> Result<()> {
        let magic = conn.read_u32::<BE>()?;
        match magic {
            SIMPLE_REPLY_MAGIC => self.simple_reply(conn),
            STRUCTURED_REPLY_MAGIC => self.structured_reply(conn),
            _ => bail!(ProtocolError::new(format!(
                "unexpected magic in reply: {magic:#x}"
            ))),
        }
    }

    fn take_trans(&self, cookie: u64) -> Result<Transaction> {
        match self.trans.lock().unwrap().pending.remove(&cookie) {
            Some(trans) => Ok(trans),
            None => bail!(ProtocolError::new(format!(
                "reply with unexpected cookie {cookie:#x}"
            ))),
        }
    }

    // Put a transaction back to wait for more chunks, or complete it.
    fn finish_chunk(&self, cookie: u64, mut trans: Transaction, done: bool, err: Option<Errno>) {
        if let Some(err) = err {
            trans.record_err(err);
        }
        if done {
            trans.complete(None);
        } else {
            debug!("partial reply for cookie {cookie:#x}, waiting for the final chunk");
            self.trans.lock().unwrap().pending.insert(cookie, trans);
        }
    }

    // A simple reply is always terminal: error, cookie, then the payload
    // for a successful read.
    fn simple_reply(&self, conn: &mut Conn) -> Result<()> {
        let error = conn.read_u32::<BE>()?;
        let cookie = conn.read_u64::<BE>()?;
        debug!("received simple reply for cookie {cookie:#x}, error {error}");
        let mut trans = self.take_trans(cookie)?;
        if trans.buf.is_some() && self.structured {
            trans.abort();
            bail!(ProtocolError::new(
                "simple read reply when structured was expected"
            ));
        }
        let err = errno_of_wire(error);
        if err.is_none() {
            if let Some(buf) = trans.buf.as_mut() {
                if let Err(read_err) = conn.read_exact(buf) {
                    trans.abort();
                    return Err(read_err).wrap_err("reading simple reply payload");
                }
            }
        }
        trans.complete(err);
        Ok(())
    }

    // One chunk of a structured reply. The chunk flagged DONE closes the
    // transaction; errors from earlier chunks are preserved until then.
    fn structured_reply(&self, conn: &mut Conn) -> Result<()> {
        if !self.structured {
            bail!(ProtocolError::new(
                "structured reply without negotiation"
            ));
        }
        let flags = conn.read_u16::<BE>()?;
        let typ = conn.read_u16::<BE>()?;
        let cookie = conn.read_u64::<BE>()?;
        let length = conn.read_u32::<BE>()?;
        debug!(
            "received structured reply chunk {typ:#x} for cookie {cookie:#x}, payload length {length}"
        );
        ensure!(
            length <= MAX_CHUNK_LEN,
            ProtocolError::new(format!(
                "structured reply length is suspiciously large: {length}"
            ))
        );
        let done = flags & REPLY_FLAG_DONE != 0;

        if typ & CHUNK_TYPE_ERR_BIT != 0 {
            ensure!(
                length >= 6,
                ProtocolError::new("error chunk size incorrect")
            );
            let error = conn.read_u32::<BE>()?;
            let msglen = conn.read_u16::<BE>()?;
            ensure!(
                u32::from(msglen) <= length - 6,
                ProtocolError::new("error chunk message size incorrect")
            );
            // the rest of the payload is the message plus any subtype
            // specific trailer, which is not needed here
            let mut rest = vec![0u8; (length - 6) as usize];
            conn.read_exact(&mut rest)?;
            if msglen > 0 {
                debug!(
                    "received error {error} with message: {}",
                    String::from_utf8_lossy(&rest[..msglen as usize])
                );
            }
            let trans = self.take_trans(cookie)?;
            self.finish_chunk(cookie, trans, done, errno_of_wire(error));
            return Ok(());
        }

        match ChunkType::try_from(typ) {
            Ok(ChunkType::NONE) => {
                ensure!(
                    length == 0,
                    ProtocolError::new("NONE chunk with invalid payload")
                );
                ensure!(done, ProtocolError::new("NONE chunk without done flag"));
                let trans = self.take_trans(cookie)?;
                trans.complete(None);
            }
            Ok(ChunkType::OFFSET_DATA) => {
                ensure!(
                    length > 8,
                    ProtocolError::new("OFFSET_DATA chunk too small")
                );
                let offset = conn.read_u64::<BE>()?;
                let len = length - 8;
                let mut trans = self.take_trans(cookie)?;
                // the tail of the chunk streams straight into the caller's
                // buffer at the right position
                let streamed = chunk_window(&mut trans, offset, len)
                    .and_then(|window| Ok(conn.read_exact(window)?));
                if let Err(err) = streamed {
                    trans.abort();
                    return Err(err).wrap_err("reading data chunk payload");
                }
                self.finish_chunk(cookie, trans, done, None);
            }
            Ok(ChunkType::OFFSET_HOLE) => {
                ensure!(
                    length == 12,
                    ProtocolError::new("OFFSET_HOLE chunk size incorrect")
                );
                let offset = conn.read_u64::<BE>()?;
                let len = conn.read_u32::<BE>()?;
                ensure!(
                    len != 0,
                    ProtocolError::new("OFFSET_HOLE chunk length incorrect")
                );
                let mut trans = self.take_trans(cookie)?;
                let zeroed = chunk_window(&mut trans, offset, len).map(|window| window.fill(0));
                if let Err(err) = zeroed {
                    trans.abort();
                    return Err(err);
                }
                self.finish_chunk(cookie, trans, done, None);
            }
            Ok(ChunkType::BLOCK_STATUS) => {
                ensure!(
                    self.extents,
                    ProtocolError::new("block status response without negotiation")
                );
                ensure!(
                    length >= 12 && length % 8 == 4,
                    ProtocolError::new("block status chunk size incorrect")
                );
                let id = conn.read_u32::<BE>()?;
                let count = (length - 4) / 8;
                debug!("parsing {count} extents for context id {id}");
                let mut descriptors = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let len = conn.read_u32::<BE>()?;
                    let status = conn.read_u32::<BE>()?;
                    descriptors.push((len, status));
                }
                let mut trans = self.take_trans(cookie)?;
                let base = trans.offset;
                let err = match trans.extents.as_mut() {
                    Some(sink) => {
                        // each status chunk restarts at the request's base
                        // offset
                        let mut err = None;
                        let mut offset = base;
                        for (len, status) in descriptors {
                            if let Err(rejected) = sink.append(offset, len, status) {
                                err = Some(rejected);
                                break;
                            }
                            offset += u64::from(len);
                        }
                        err
                    }
                    None => {
                        trans.abort();
                        bail!(ProtocolError::new(
                            "block status response to a non-status command"
                        ));
                    }
                };
                self.finish_chunk(cookie, trans, done, err);
            }
            Err(_) => bail!(ProtocolError::new(format!(
                "received unexpected structured reply type {typ:#x}"
            ))),
        }
        Ok(())
    }

    // Called when there is no hope of resynchronizing with the server; all
    // further requests on this handle will fail. Idempotent.
    fn mark_dead(&self, err: &dyn fmt::Display) {
        let mut table = self.trans.lock().unwrap();
        if !table.dead {
            debug!(
                "permanent failure while talking to server {}: {err}",
                self.server
            );
            table.dead = true;
        }
    }
}

/// Validated driver state: connection settings plus the shared handle when
/// shared mode is configured.
///
/// In shared mode a single eagerly opened connection is multiplexed across
/// every host-level client and per-client open/close become no-ops; in
/// exclusive mode every open dials its own connection.
#[derive(Debug)]
pub struct Driver {
    settings: Settings,
    shared: Option<Arc<Handle>>,
}

impl Driver {
    /// Validate the configuration; in shared mode, also open the one
    /// connection every client will use.
    pub fn new(config: Config) -> Result<Self> {
        let settings = config.finish()?;
        let shared = if settings.shared {
            Some(Handle::open(&settings, false)?)
        } else {
            None
        };
        Ok(Self { settings, shared })
    }

    /// Open a session for one host-level client.
    pub fn open(&self, readonly: bool) -> Result<Arc<Handle>> {
        match &self.shared {
            Some(handle) => Ok(Arc::clone(handle)),
            None => Handle::open(&self.settings, readonly),
        }
    }

    /// Release a session obtained from [`Driver::open`]. The shared handle
    /// outlives its clients and is only torn down with the driver.
    pub fn close(&self, handle: Arc<Handle>) {
        if self.shared.is_none() {
            handle.close();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.take() {
            handle.close();
        }
    }
}

// Validate that [offset, offset+len) sits inside the transaction's request
// window and hand back the matching slice of the caller's buffer.
fn chunk_window(trans: &mut Transaction, offset: u64, len: u32) -> Result<&mut [u8]> {
    let base = trans.offset;
    let buf = match trans.buf.as_mut() {
        Some(buf) => buf,
        None => bail!(ProtocolError::new(
            "structured read response to a non-read command"
        )),
    };
    ensure!(
        offset >= base && offset - base + u64::from(len) <= buf.len() as u64,
        ProtocolError::new("structured read reply with unexpected offset/length")
    );
    let start = (offset - base) as usize;
    Ok(&mut buf[start..start + len as usize])
}

// Convert from wire value to local errno. Only a fixed set is legal on the
// wire; anything else squashes to EINVAL.
fn errno_of_wire(error: u32) -> Option<Errno> {
    match ErrorType::try_from(error) {
        Ok(ErrorType::OK) => None,
        Ok(ErrorType::EPERM) => Some(Errno::EPERM),
        Ok(ErrorType::EIO) => Some(Errno::EIO),
        Ok(ErrorType::ENOMEM) => Some(Errno::ENOMEM),
        Ok(ErrorType::ENOSPC) => Some(Errno::ENOSPC),
        Ok(ErrorType::EOVERFLOW) => Some(Errno::EOVERFLOW),
        Ok(ErrorType::ESHUTDOWN) => Some(Errno::ESHUTDOWN),
        Ok(ErrorType::EINVAL) => Some(Errno::EINVAL),
        Ok(other) => {
            debug!("unexpected error {other:?}, squashing to EINVAL");
            Some(Errno::EINVAL)
        }
        Err(_) => {
            debug!("unexpected error {error}, squashing to EINVAL");
            Some(Errno::EINVAL)
        }
    }
}

// The host can only relay errors that are legal on the NBD wire. A death by
// broken pipe or bad framing is reported as a shutdown instead.
fn wire_safe_errno(err: &std::io::Error) -> Errno {
    match err.raw_os_error().map(Errno::from_raw) {
        Some(Errno::EPIPE | Errno::EBADMSG) | None => Errno::ESHUTDOWN,
        Some(errno) => errno,
    }
}
