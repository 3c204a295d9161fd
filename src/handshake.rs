//! Session negotiation: both handshake styles, option haggling, and the
//! structured-reply and meta-context upgrades.
//!
//! The server speaks first. The first 16 bytes of its greeting pick between
//! the fixed "oldstyle" layout and the "newstyle" option haggle; in the
//! newstyle case the client tries `STRUCTURED_REPLY`, `SET_META_CONTEXT`
//! (for `base:allocation` only) and `GO`, falling back to the older
//! `EXPORT_NAME` finale when the server lacks `GO` support.

use std::io::{self, prelude::*};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;
use log::debug;

use crate::proto::*;

/// Everything the transmission phase needs to know about the session.
#[derive(Debug, Clone, Copy)]
pub struct Negotiation {
    /// Size of the export in bytes.
    pub size: u64,
    /// Transmission flags advertised for the export.
    pub flags: TransmitFlags,
    /// Structured replies were negotiated.
    pub structured: bool,
    /// The base:allocation meta context was negotiated.
    pub extents: bool,
}

/// Drive the handshake on a fresh connection and return the negotiated
/// session parameters.
pub fn negotiate<IO: Read + Write>(stream: &mut IO, export: &str) -> Result<Negotiation> {
    let magic = stream.read_u64::<BE>()?;
    if magic != MAGIC {
        bail!(ProtocolError::new("wrong magic, not an NBD server"));
    }
    let version = stream.read_u64::<BE>()?;
    match version {
        OLD_VERSION => {
            debug!("trying oldstyle connection");
            oldstyle(stream)
        }
        NEW_VERSION => {
            debug!("trying newstyle connection");
            newstyle(stream, export)
        }
        _ => bail!(ProtocolError::new(format!(
            "unexpected version {version:#x}"
        ))),
    }
}

// The remainder of the fixed oldstyle greeting: export size, transmission
// flags, reserved zeroes. There is nothing to haggle over.
fn oldstyle<IO: Read>(stream: &mut IO) -> Result<Negotiation> {
    let size = stream.read_u64::<BE>()?;
    let eflags = stream.read_u16::<BE>()?;
    let mut zeroes = [0u8; 124];
    stream.read_exact(&mut zeroes)?;
    debug!("oldstyle export: size {size}, eflags {eflags:#x}");
    Ok(Negotiation {
        size,
        flags: TransmitFlags::from_bits_truncate(eflags),
        structured: false,
        extents: false,
    })
}

fn newstyle<IO: Read + Write>(stream: &mut IO, export: &str) -> Result<Negotiation> {
    let gflags = HandshakeFlags::from_bits_truncate(stream.read_u16::<BE>()?);
    // echo back only the bits the server advertised
    let cflags = gflags & (HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES);
    stream.write_u32::<BE>(u32::from(cflags.bits()))?;
    stream.flush()?;

    // structured replies and extents survive a fall back to EXPORT_NAME:
    // the server granted them for the session, not for one option
    let mut structured = false;
    let mut extents = false;

    let (size, eflags) = if gflags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
        match haggle(stream, export, &mut structured, &mut extents)? {
            Some(info) => info,
            // haggling failed, use the older EXPORT_NAME finale
            None => export_name(stream, export, gflags)?,
        }
    } else {
        // haggling requires fixed newstyle
        export_name(stream, export, gflags)?
    };
    Ok(Negotiation {
        size,
        flags: TransmitFlags::from_bits_truncate(eflags),
        structured,
        extents,
    })
}

/// Attempt structured replies, block status, and `GO`. Returns `None` when
/// the server lacks `GO` support and `EXPORT_NAME` is still viable.
fn haggle<IO: Read + Write>(
    stream: &mut IO,
    export: &str,
    structured: &mut bool,
    extents: &mut bool,
) -> Result<Option<(u64, u16)>> {
    debug!("trying option STRUCTURED_REPLY");
    Opt {
        typ: OptType::STRUCTURED_REPLY,
        data: vec![],
    }
    .put(&mut *stream)?;
    let reply = OptionReply::get(&mut *stream, OptType::STRUCTURED_REPLY)?;
    if reply.typ == ReplyType::ACK {
        *structured = true;
        debug!("structured replies enabled, trying option SET_META_CONTEXT");
        Opt {
            typ: OptType::SET_META_CONTEXT,
            data: meta_context_query(export, BASE_ALLOCATION)?,
        }
        .put(&mut *stream)?;
        let mut reply = OptionReply::get(&mut *stream, OptType::SET_META_CONTEXT)?;
        while reply.typ == ReplyType::META_CONTEXT {
            // The reply assigns a context id. With a single query the id is
            // unambiguous, so trust the server to reuse it rather than
            // recording it.
            *extents = true;
            reply = OptionReply::get(&mut *stream, OptType::SET_META_CONTEXT)?;
        }
        if reply.typ != ReplyType::ACK {
            if *extents {
                bail!(ProtocolError::new("unexpected response to set meta context"));
            }
            debug!("ignoring meta context response {:?}", reply.typ);
        } else if *extents {
            debug!("extents enabled");
        }
    } else {
        debug!("structured replies disabled");
    }

    debug!("trying option GO");
    Opt {
        typ: OptType::GO,
        data: go_request(export)?,
    }
    .put(&mut *stream)?;
    let mut info = None;
    loop {
        let reply = OptionReply::get(&mut *stream, OptType::GO)?;
        match reply.typ {
            ReplyType::INFO => {
                if let Some(export_info) = parse_info_export(&reply.payload)? {
                    info = Some(export_info);
                }
            }
            ReplyType::ACK => {
                // end of replies, valid only if the export info arrived
                match info {
                    Some(info) => {
                        debug!("option GO complete");
                        return Ok(Some(info));
                    }
                    None => bail!(ProtocolError::new(
                        "server omitted export info in reply to GO"
                    )),
                }
            }
            ReplyType::ERR_UNSUP => {
                debug!("server lacks GO support");
                return Ok(None);
            }
            typ if typ.is_err() => bail!(ProtocolError::new(format!(
                "server rejected GO with {typ:?}: {}",
                reply.message()
            ))),
            typ => bail!(ProtocolError::new(format!(
                "unexpected reply {typ:?} to GO"
            ))),
        }
    }
}

/// The pre-`GO` finale: request the export by name and read the fixed reply.
fn export_name<IO: Read + Write>(
    stream: &mut IO,
    export: &str,
    gflags: HandshakeFlags,
) -> Result<(u64, u16)> {
    debug!("trying option EXPORT_NAME");
    Opt {
        typ: OptType::EXPORT_NAME,
        data: export.as_bytes().to_vec(),
    }
    .put(&mut *stream)?;
    // S: 64 bits, size of the export in bytes (unsigned)
    // S: 16 bits, transmission flags
    // S: 124 bytes, zeroes (reserved) (unless `NBD_FLAG_C_NO_ZEROES` was negotiated by the client)
    let size = stream.read_u64::<BE>()?;
    let eflags = stream.read_u16::<BE>()?;
    if !gflags.contains(HandshakeFlags::NO_ZEROES) {
        let mut zeroes = [0u8; 124];
        stream.read_exact(&mut zeroes)?;
    }
    debug!("export {export:?}: size {size}, eflags {eflags:#x}");
    Ok((size, eflags))
}

// REP_INFO payload: 16-bit info type, then type-specific data. Only
// INFO_EXPORT (size and transmission flags) matters here; the server's other
// infos are ignored.
fn parse_info_export(payload: &[u8]) -> Result<Option<(u64, u16)>> {
    ensure!(payload.len() >= 2, ProtocolError::new("INFO reply too short"));
    let mut cursor = io::Cursor::new(payload);
    let info = cursor.read_u16::<BE>()?;
    match InfoType::try_from(info) {
        Ok(InfoType::EXPORT) => {
            ensure!(
                payload.len() == 12,
                ProtocolError::new("INFO_EXPORT reply wrong size")
            );
            let size = cursor.read_u64::<BE>()?;
            let eflags = cursor.read_u16::<BE>()?;
            Ok(Some((size, eflags)))
        }
        _ => {
            debug!("ignoring server info {info}");
            Ok(None)
        }
    }
}

// option data for SET_META_CONTEXT: the export name, then exactly one query
fn meta_context_query(export: &str, query: &str) -> io::Result<Vec<u8>> {
    let mut data = vec![];
    data.write_u32::<BE>(export.len() as u32)?;
    data.write_all(export.as_bytes())?;
    data.write_u32::<BE>(1)?;
    data.write_u32::<BE>(query.len() as u32)?;
    data.write_all(query.as_bytes())?;
    Ok(data)
}

// option data for GO: the export name and no info requests, relying on the
// server to send its defaults
fn go_request(export: &str) -> io::Result<Vec<u8>> {
    let mut data = vec![];
    data.write_u32::<BE>(export.len() as u32)?;
    data.write_all(export.as_bytes())?;
    data.write_u16::<BE>(0)?;
    Ok(data)
}
