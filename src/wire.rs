// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Node-to-node control frames.
//!
//! Every frame starts with `[version:u16][type:u16]`, both big-endian. Strings
//! are raw bytes with one NUL terminator, integers are big-endian u16. The
//! codec is stateless: encoding cannot fail, decoding fails by reporting a
//! malformed frame which the caller discards.

use std::io;

use byteorder::{BigEndian, ByteOrder};

use global::{invalid_data_io_error, UUID_LEN};

/// Interoperability version, bumped on any frame layout change.
pub const WIRE_VERSION: u16 = 1;

/// Channels longer than this are refused at the API and on the wire.
pub const MAX_CHANNEL_LEN: usize = 4095;

const TYPE_CONNECT_REQ: u16 = 1;
const TYPE_CONNECT_REP: u16 = 2;
const TYPE_PUB_ADDED: u16 = 3;
const TYPE_PUB_REMOVED: u16 = 4;
const TYPE_SUBSCRIBE: u16 = 5;
const TYPE_UNSUBSCRIBE: u16 = 6;
const TYPE_SHUTDOWN: u16 = 7;
const TYPE_NODE_INFO: u16 = 8;
const TYPE_DEBUG: u16 = 9;

/// Descriptor of a publisher as it travels inside control frames:
/// `channel\0uuid\0implType:u16 port:u16`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubInfo {
    pub channel: String,
    pub uuid: String,
    pub impl_type: u16,
    pub port: u16,
}

/// Descriptor of a subscriber: `channel\0uuid\0implType:u16`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubInfo {
    pub channel: String,
    pub uuid: String,
    pub impl_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ConnectReq,
    ConnectRep { uuid: String, pubs: Vec<PubInfo> },
    PubAdded { uuid: String, publisher: PubInfo },
    PubRemoved { uuid: String, publisher: PubInfo },
    Subscribe { subscriber: SubInfo, publisher: PubInfo },
    Unsubscribe { subscriber: SubInfo, publisher: PubInfo },
    Shutdown { uuid: String },
    NodeInfo { uuid: String, pubs: Vec<PubInfo> },
    Debug,
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match *self {
            Frame::ConnectReq { .. } => "CONNECT_REQ",
            Frame::ConnectRep { .. } => "CONNECT_REP",
            Frame::PubAdded { .. } => "PUB_ADDED",
            Frame::PubRemoved { .. } => "PUB_REMOVED",
            Frame::Subscribe { .. } => "SUBSCRIBE",
            Frame::Unsubscribe { .. } => "UNSUBSCRIBE",
            Frame::Shutdown { .. } => "SHUTDOWN",
            Frame::NodeInfo { .. } => "NODE_INFO",
            Frame::Debug => "DEBUG",
        }
    }

    fn type_id(&self) -> u16 {
        match *self {
            Frame::ConnectReq { .. } => TYPE_CONNECT_REQ,
            Frame::ConnectRep { .. } => TYPE_CONNECT_REP,
            Frame::PubAdded { .. } => TYPE_PUB_ADDED,
            Frame::PubRemoved { .. } => TYPE_PUB_REMOVED,
            Frame::Subscribe { .. } => TYPE_SUBSCRIBE,
            Frame::Unsubscribe { .. } => TYPE_UNSUBSCRIBE,
            Frame::Shutdown { .. } => TYPE_SHUTDOWN,
            Frame::NodeInfo { .. } => TYPE_NODE_INFO,
            Frame::Debug => TYPE_DEBUG,
        }
    }
}

/// Outcome of looking at a received buffer.
///
/// Frames stamped with a version we do not speak are not an error: the peer
/// may simply be newer. The caller logs and discards them without touching
/// the session.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    ForeignVersion(u16),
}

pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);

    write_u16(&mut buf, WIRE_VERSION);
    write_u16(&mut buf, frame.type_id());

    match *frame {
        Frame::ConnectReq | Frame::Debug => {}
        Frame::ConnectRep { ref uuid, ref pubs } |
        Frame::NodeInfo { ref uuid, ref pubs } => {
            write_str(&mut buf, uuid);
            for publisher in pubs {
                write_pub_info(&mut buf, publisher);
            }
        }
        Frame::PubAdded { ref uuid, ref publisher } |
        Frame::PubRemoved { ref uuid, ref publisher } => {
            write_str(&mut buf, uuid);
            write_pub_info(&mut buf, publisher);
        }
        Frame::Subscribe { ref subscriber, ref publisher } |
        Frame::Unsubscribe { ref subscriber, ref publisher } => {
            write_sub_info(&mut buf, subscriber);
            write_pub_info(&mut buf, publisher);
        }
        Frame::Shutdown { ref uuid } => {
            write_str(&mut buf, uuid);
        }
    }

    buf
}

pub fn decode(buf: &[u8]) -> io::Result<Decoded> {
    if buf.len() < 4 {
        return Err(invalid_data_io_error("frame shorter than its header"));
    }

    let version = BigEndian::read_u16(&buf[0..2]);
    if version != WIRE_VERSION {
        return Ok(Decoded::ForeignVersion(version));
    }

    let type_id = BigEndian::read_u16(&buf[2..4]);
    let mut pos = 4;

    let frame = match type_id {
        TYPE_CONNECT_REQ => Frame::ConnectReq,
        TYPE_DEBUG => Frame::Debug,
        TYPE_CONNECT_REP => {
            let uuid = read_uuid(buf, &mut pos)?;
            let pubs = read_pub_infos(buf, &mut pos)?;
            Frame::ConnectRep { uuid: uuid, pubs: pubs }
        }
        TYPE_NODE_INFO => {
            let uuid = read_uuid(buf, &mut pos)?;
            let pubs = read_pub_infos(buf, &mut pos)?;
            Frame::NodeInfo { uuid: uuid, pubs: pubs }
        }
        TYPE_PUB_ADDED => {
            let uuid = read_uuid(buf, &mut pos)?;
            let publisher = read_pub_info(buf, &mut pos)?;
            Frame::PubAdded { uuid: uuid, publisher: publisher }
        }
        TYPE_PUB_REMOVED => {
            let uuid = read_uuid(buf, &mut pos)?;
            let publisher = read_pub_info(buf, &mut pos)?;
            Frame::PubRemoved { uuid: uuid, publisher: publisher }
        }
        TYPE_SUBSCRIBE => {
            let subscriber = read_sub_info(buf, &mut pos)?;
            let publisher = read_pub_info(buf, &mut pos)?;
            Frame::Subscribe { subscriber: subscriber, publisher: publisher }
        }
        TYPE_UNSUBSCRIBE => {
            let subscriber = read_sub_info(buf, &mut pos)?;
            let publisher = read_pub_info(buf, &mut pos)?;
            Frame::Unsubscribe { subscriber: subscriber, publisher: publisher }
        }
        TYPE_SHUTDOWN => {
            let uuid = read_uuid(buf, &mut pos)?;
            Frame::Shutdown { uuid: uuid }
        }
        _ => return Err(invalid_data_io_error("unknown frame type")),
    };

    if pos != buf.len() {
        return Err(invalid_data_io_error("frame carries trailing bytes"));
    }

    Ok(Decoded::Frame(frame))
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    let mut bytes = [0u8; 2];
    BigEndian::write_u16(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn write_pub_info(buf: &mut Vec<u8>, info: &PubInfo) {
    write_str(buf, &info.channel);
    write_str(buf, &info.uuid);
    write_u16(buf, info.impl_type);
    write_u16(buf, info.port);
}

fn write_sub_info(buf: &mut Vec<u8>, info: &SubInfo) {
    write_str(buf, &info.channel);
    write_str(buf, &info.uuid);
    write_u16(buf, info.impl_type);
}

fn read_u16(buf: &[u8], pos: &mut usize) -> io::Result<u16> {
    if *pos + 2 > buf.len() {
        return Err(invalid_data_io_error("frame truncated inside an integer"));
    }
    let value = BigEndian::read_u16(&buf[*pos..*pos + 2]);
    *pos += 2;
    Ok(value)
}

/// Read a NUL-terminated string of at most `max` bytes.
fn read_str(buf: &[u8], pos: &mut usize, max: usize) -> io::Result<String> {
    let limit = ::std::cmp::min(buf.len(), *pos + max + 1);
    let nul = buf[*pos..limit].iter().position(|&b| b == 0)
        .ok_or_else(|| invalid_data_io_error("unterminated string in frame"))?;
    let s = ::std::str::from_utf8(&buf[*pos..*pos + nul])
        .map_err(|_| invalid_data_io_error("string in frame is not utf-8"))?
        .to_string();
    *pos += nul + 1;
    Ok(s)
}

fn read_uuid(buf: &[u8], pos: &mut usize) -> io::Result<String> {
    let uuid = read_str(buf, pos, UUID_LEN)?;
    if uuid.len() != UUID_LEN {
        return Err(invalid_data_io_error("uuid has the wrong length"));
    }
    Ok(uuid)
}

fn read_pub_info(buf: &[u8], pos: &mut usize) -> io::Result<PubInfo> {
    let channel = read_str(buf, pos, MAX_CHANNEL_LEN)?;
    let uuid = read_uuid(buf, pos)?;
    let impl_type = read_u16(buf, pos)?;
    let port = read_u16(buf, pos)?;

    Ok(PubInfo {
        channel: channel,
        uuid: uuid,
        impl_type: impl_type,
        port: port,
    })
}

fn read_sub_info(buf: &[u8], pos: &mut usize) -> io::Result<SubInfo> {
    let channel = read_str(buf, pos, MAX_CHANNEL_LEN)?;
    let uuid = read_uuid(buf, pos)?;
    let impl_type = read_u16(buf, pos)?;

    Ok(SubInfo {
        channel: channel,
        uuid: uuid,
        impl_type: impl_type,
    })
}

fn read_pub_infos(buf: &[u8], pos: &mut usize) -> io::Result<Vec<PubInfo>> {
    let mut pubs = Vec::new();

    while *pos < buf.len() {
        pubs.push(read_pub_info(buf, pos)?);
    }

    Ok(pubs)
}

#[cfg(test)]
mod tests {
    use global::new_uuid;

    use super::*;

    fn sample_pub(channel: &str) -> PubInfo {
        PubInfo {
            channel: channel.to_string(),
            uuid: new_uuid(),
            impl_type: 1,
            port: 4343,
        }
    }

    fn sample_sub(channel: &str) -> SubInfo {
        SubInfo {
            channel: channel.to_string(),
            uuid: new_uuid(),
            impl_type: 1,
        }
    }

    fn round_trip(frame: Frame) {
        let buf = encode(&frame);
        assert_eq!(Decoded::Frame(frame), decode(&buf).unwrap());
    }

    #[test]
    fn all_frames_round_trip() {
        round_trip(Frame::ConnectReq);
        round_trip(Frame::Debug);
        round_trip(Frame::ConnectRep { uuid: new_uuid(), pubs: vec![] });
        round_trip(Frame::ConnectRep {
            uuid: new_uuid(),
            pubs: vec![sample_pub("foo"), sample_pub("bar")],
        });
        round_trip(Frame::NodeInfo {
            uuid: new_uuid(),
            pubs: vec![sample_pub("keepalive")],
        });
        round_trip(Frame::PubAdded { uuid: new_uuid(), publisher: sample_pub("foo") });
        round_trip(Frame::PubRemoved { uuid: new_uuid(), publisher: sample_pub("foo") });
        round_trip(Frame::Subscribe {
            subscriber: sample_sub("f"),
            publisher: sample_pub("foo"),
        });
        round_trip(Frame::Unsubscribe {
            subscriber: sample_sub("f"),
            publisher: sample_pub("foo"),
        });
        round_trip(Frame::Shutdown { uuid: new_uuid() });
    }

    #[test]
    fn empty_channel_round_trips() {
        round_trip(Frame::PubAdded { uuid: new_uuid(), publisher: sample_pub("") });
    }

    #[test]
    fn foreign_version_is_reported_not_failed() {
        let mut buf = encode(&Frame::ConnectReq);
        buf[0] = 0xff;
        buf[1] = 0xfe;

        match decode(&buf).unwrap() {
            Decoded::ForeignVersion(v) => assert_eq!(0xfffe, v),
            other => panic!("expected foreign version, got {:?}", other),
        }
    }

    #[test]
    fn truncated_frames_are_malformed() {
        let buf = encode(&Frame::Subscribe {
            subscriber: sample_sub("f"),
            publisher: sample_pub("foo"),
        });

        for len in 0..buf.len() {
            assert!(decode(&buf[..len]).is_err(), "length {} should not decode", len);
        }
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut buf = encode(&Frame::Shutdown { uuid: new_uuid() });
        buf.push(7);

        assert!(decode(&buf).is_err());
    }

    #[test]
    fn wrong_uuid_length_is_malformed() {
        let mut buf = Vec::new();
        super::write_u16(&mut buf, WIRE_VERSION);
        super::write_u16(&mut buf, super::TYPE_SHUTDOWN);
        super::write_str(&mut buf, "too-short");

        assert!(decode(&buf).is_err());
    }

    #[test]
    fn unknown_type_is_malformed() {
        let mut buf = Vec::new();
        super::write_u16(&mut buf, WIRE_VERSION);
        super::write_u16(&mut buf, 0x4242);

        assert!(decode(&buf).is_err());
    }
}
