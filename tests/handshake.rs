//! Handshake negotiation against scripted server byte streams.
//!
//! Each test plays the server's side of the conversation from a canned
//! buffer and checks both the negotiated session parameters and the option
//! sequence the client put on the wire.

use std::io::{Cursor, Read};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use color_eyre::Result;
use readwrite::ReadWrite;

use nbd_client::handshake;
use nbd_client::proto::*;

type Scripted = ReadWrite<Cursor<Vec<u8>>, Vec<u8>>;

fn scripted(server: Vec<u8>) -> Scripted {
    ReadWrite::new(Cursor::new(server), Vec::new())
}

fn old_greeting(size: u64, eflags: u16) -> Vec<u8> {
    let mut script = vec![];
    script.write_u64::<BE>(MAGIC).unwrap();
    script.write_u64::<BE>(OLD_VERSION).unwrap();
    script.write_u64::<BE>(size).unwrap();
    script.write_u16::<BE>(eflags).unwrap();
    script.extend_from_slice(&[0u8; 124]);
    script
}

fn new_greeting(gflags: HandshakeFlags) -> Vec<u8> {
    let mut script = vec![];
    script.write_u64::<BE>(MAGIC).unwrap();
    script.write_u64::<BE>(NEW_VERSION).unwrap();
    script.write_u16::<BE>(gflags.bits()).unwrap();
    script
}

fn option_reply(opt: OptType, reply: ReplyType, payload: &[u8]) -> Vec<u8> {
    let mut script = vec![];
    script.write_u64::<BE>(OPTION_REPLY_MAGIC).unwrap();
    script.write_u32::<BE>(u32::from(opt)).unwrap();
    script.write_u32::<BE>(u32::from(reply)).unwrap();
    script.write_u32::<BE>(payload.len() as u32).unwrap();
    script.extend_from_slice(payload);
    script
}

fn info_export(size: u64, eflags: u16) -> Vec<u8> {
    let mut payload = vec![];
    payload.write_u16::<BE>(u16::from(InfoType::EXPORT)).unwrap();
    payload.write_u64::<BE>(size).unwrap();
    payload.write_u16::<BE>(eflags).unwrap();
    payload
}

fn meta_context_reply(id: u32, name: &str) -> Vec<u8> {
    let mut payload = vec![];
    payload.write_u32::<BE>(id).unwrap();
    payload.extend_from_slice(name.as_bytes());
    payload
}

/// Split the bytes the client wrote into its 32-bit client flags and the
/// sequence of (option, data) frames that followed.
fn parse_client_options(written: &[u8]) -> (u32, Vec<(u32, Vec<u8>)>) {
    let mut cursor = Cursor::new(written);
    let cflags = cursor.read_u32::<BE>().unwrap();
    let mut options = vec![];
    while (cursor.position() as usize) < written.len() {
        assert_eq!(cursor.read_u64::<BE>().unwrap(), IHAVEOPT);
        let option = cursor.read_u32::<BE>().unwrap();
        let len = cursor.read_u32::<BE>().unwrap();
        let mut data = vec![0; len as usize];
        cursor.read_exact(&mut data).unwrap();
        options.push((option, data));
    }
    (cflags, options)
}

#[test]
fn oldstyle_greeting_records_export() -> Result<()> {
    let mut stream = scripted(old_greeting(1048576, 0x0001));
    let negotiation = handshake::negotiate(&mut stream, "")?;
    assert_eq!(negotiation.size, 1048576);
    assert!(negotiation.flags.contains(TransmitFlags::HAS_FLAGS));
    assert!(!negotiation.structured);
    assert!(!negotiation.extents);
    // the client says nothing during an oldstyle handshake
    let (_, written) = stream.into_inner();
    assert!(written.is_empty());
    Ok(())
}

#[test]
fn newstyle_go_with_meta_context() -> Result<()> {
    let mut script = new_greeting(HandshakeFlags::FIXED_NEWSTYLE);
    script.extend(option_reply(OptType::STRUCTURED_REPLY, ReplyType::ACK, &[]));
    script.extend(option_reply(
        OptType::SET_META_CONTEXT,
        ReplyType::META_CONTEXT,
        &meta_context_reply(1, BASE_ALLOCATION),
    ));
    script.extend(option_reply(OptType::SET_META_CONTEXT, ReplyType::ACK, &[]));
    script.extend(option_reply(
        OptType::GO,
        ReplyType::INFO,
        &info_export(65536, TransmitFlags::HAS_FLAGS.bits()),
    ));
    script.extend(option_reply(OptType::GO, ReplyType::ACK, &[]));

    let mut stream = scripted(script);
    let negotiation = handshake::negotiate(&mut stream, "disk")?;
    assert_eq!(negotiation.size, 65536);
    assert!(negotiation.structured);
    assert!(negotiation.extents);

    let (_, written) = stream.into_inner();
    let (cflags, options) = parse_client_options(&written);
    assert_eq!(cflags, u32::from(HandshakeFlags::FIXED_NEWSTYLE.bits()));
    let sent: Vec<u32> = options.iter().map(|(option, _)| *option).collect();
    assert_eq!(
        sent,
        vec![
            u32::from(OptType::STRUCTURED_REPLY),
            u32::from(OptType::SET_META_CONTEXT),
            u32::from(OptType::GO),
        ]
    );
    // the meta context request names the export and the single query
    let meta = &options[1].1;
    let query = BASE_ALLOCATION.as_bytes();
    assert!(meta.windows(query.len()).any(|window| window == query));
    let export = b"disk".as_slice();
    assert!(meta.windows(export.len()).any(|window| window == export));
    Ok(())
}

#[test]
fn go_unsupported_falls_back_to_export_name() -> Result<()> {
    // the server refuses every upgrade but offered NO_ZEROES, so the
    // EXPORT_NAME finale is the short ten-byte form
    let gflags = HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES;
    let mut script = new_greeting(gflags);
    script.extend(option_reply(
        OptType::STRUCTURED_REPLY,
        ReplyType::ERR_UNSUP,
        &[],
    ));
    script.extend(option_reply(OptType::GO, ReplyType::ERR_UNSUP, &[]));
    script.write_u64::<BE>(4096)?;
    script.write_u16::<BE>(TransmitFlags::HAS_FLAGS.bits())?;

    let mut stream = scripted(script);
    let negotiation = handshake::negotiate(&mut stream, "")?;
    assert_eq!(negotiation.size, 4096);
    assert!(!negotiation.structured);
    assert!(!negotiation.extents);

    let (_, written) = stream.into_inner();
    let (cflags, options) = parse_client_options(&written);
    assert_eq!(cflags, u32::from(gflags.bits()));
    let sent: Vec<u32> = options.iter().map(|(option, _)| *option).collect();
    assert_eq!(
        sent,
        vec![
            u32::from(OptType::STRUCTURED_REPLY),
            u32::from(OptType::GO),
            u32::from(OptType::EXPORT_NAME),
        ]
    );
    Ok(())
}

#[test]
fn structured_replies_survive_export_name_fallback() -> Result<()> {
    let mut script = new_greeting(HandshakeFlags::FIXED_NEWSTYLE);
    script.extend(option_reply(OptType::STRUCTURED_REPLY, ReplyType::ACK, &[]));
    script.extend(option_reply(OptType::SET_META_CONTEXT, ReplyType::ACK, &[]));
    script.extend(option_reply(OptType::GO, ReplyType::ERR_UNSUP, &[]));
    script.write_u64::<BE>(8192)?;
    script.write_u16::<BE>(TransmitFlags::HAS_FLAGS.bits())?;
    script.extend_from_slice(&[0u8; 124]);

    let mut stream = scripted(script);
    let negotiation = handshake::negotiate(&mut stream, "")?;
    assert_eq!(negotiation.size, 8192);
    // the server granted structured replies before refusing GO
    assert!(negotiation.structured);
    assert!(!negotiation.extents);
    Ok(())
}

#[test]
fn meta_context_refusal_is_tolerated() -> Result<()> {
    let mut script = new_greeting(HandshakeFlags::FIXED_NEWSTYLE);
    script.extend(option_reply(OptType::STRUCTURED_REPLY, ReplyType::ACK, &[]));
    script.extend(option_reply(
        OptType::SET_META_CONTEXT,
        ReplyType::ERR_UNSUP,
        &[],
    ));
    script.extend(option_reply(
        OptType::GO,
        ReplyType::INFO,
        &info_export(65536, TransmitFlags::HAS_FLAGS.bits()),
    ));
    script.extend(option_reply(OptType::GO, ReplyType::ACK, &[]));

    let mut stream = scripted(script);
    let negotiation = handshake::negotiate(&mut stream, "")?;
    assert!(negotiation.structured);
    assert!(!negotiation.extents);
    Ok(())
}

#[test]
fn meta_context_error_after_acceptance_fails() {
    let mut script = new_greeting(HandshakeFlags::FIXED_NEWSTYLE);
    script.extend(option_reply(OptType::STRUCTURED_REPLY, ReplyType::ACK, &[]));
    script.extend(option_reply(
        OptType::SET_META_CONTEXT,
        ReplyType::META_CONTEXT,
        &meta_context_reply(1, BASE_ALLOCATION),
    ));
    script.extend(option_reply(
        OptType::SET_META_CONTEXT,
        ReplyType::ERR_INVALID,
        &[],
    ));
    let mut stream = scripted(script);
    assert!(handshake::negotiate(&mut stream, "").is_err());
}

#[test]
fn wrong_magic_is_rejected() {
    let mut script = vec![];
    script.write_u64::<BE>(0x1122334455667788).unwrap();
    script.write_u64::<BE>(NEW_VERSION).unwrap();
    let mut stream = scripted(script);
    assert!(handshake::negotiate(&mut stream, "").is_err());
}

#[test]
fn unknown_version_is_rejected() {
    let mut script = vec![];
    script.write_u64::<BE>(MAGIC).unwrap();
    script.write_u64::<BE>(0xdeadbeef).unwrap();
    let mut stream = scripted(script);
    assert!(handshake::negotiate(&mut stream, "").is_err());
}

#[test]
fn ack_with_payload_is_rejected() {
    let mut script = new_greeting(HandshakeFlags::FIXED_NEWSTYLE);
    script.extend(option_reply(
        OptType::STRUCTURED_REPLY,
        ReplyType::ACK,
        &[0u8; 4],
    ));
    let mut stream = scripted(script);
    assert!(handshake::negotiate(&mut stream, "").is_err());
}

#[test]
fn oversized_option_reply_is_rejected() {
    let mut script = new_greeting(HandshakeFlags::FIXED_NEWSTYLE);
    script.write_u64::<BE>(OPTION_REPLY_MAGIC).unwrap();
    script
        .write_u32::<BE>(u32::from(OptType::STRUCTURED_REPLY))
        .unwrap();
    script
        .write_u32::<BE>(u32::from(ReplyType::ERR_UNSUP))
        .unwrap();
    script.write_u32::<BE>(MAX_OPTION_REPLY_LEN + 1).unwrap();
    let mut stream = scripted(script);
    assert!(handshake::negotiate(&mut stream, "").is_err());
}

#[test]
fn mismatched_option_echo_is_rejected() {
    let mut script = new_greeting(HandshakeFlags::FIXED_NEWSTYLE);
    // the server echoes LIST while the client is haggling STRUCTURED_REPLY
    script.extend(option_reply(OptType::LIST, ReplyType::ACK, &[]));
    let mut stream = scripted(script);
    assert!(handshake::negotiate(&mut stream, "").is_err());
}

#[test]
fn go_without_export_info_is_rejected() {
    let mut script = new_greeting(HandshakeFlags::FIXED_NEWSTYLE);
    script.extend(option_reply(
        OptType::STRUCTURED_REPLY,
        ReplyType::ERR_UNSUP,
        &[],
    ));
    script.extend(option_reply(OptType::GO, ReplyType::ACK, &[]));
    let mut stream = scripted(script);
    assert!(handshake::negotiate(&mut stream, "").is_err());
}
