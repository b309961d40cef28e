// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The built-in tcp transport.
//!
//! Each message part travels as `[flags:u8][len:u32 BE][bytes]`, flag bit 0
//! meaning more parts follow. Sending queues encoded bytes and drains them as
//! the socket accepts; receiving runs a small resumable state machine so a
//! part split across segments picks up where the last read left off.

use std::collections::VecDeque;
use std::io;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};
use mio::net::{TcpListener, TcpStream};
use mio::Evented;

use global::invalid_data_io_error;
use super::{Connection, Listener, Transport};

/// Port scans start here when no port is configured.
pub const BASE_PORT: u16 = 4242;
const PORT_SCAN_RANGE: u16 = 1000;

const FLAG_MORE: u8 = 0x01;
const PART_HEADER_LEN: usize = 5;

/// Upper bound on a single part, guards against garbage length prefixes.
const MAX_PART_LEN: usize = 64 * 1024 * 1024;

pub struct Tcp;

impl Transport for Tcp {
    fn scheme(&self) -> &'static str {
        "tcp"
    }

    fn connect(&self, addr: &SocketAddr) -> io::Result<Box<Connection>> {
        let stream = TcpStream::connect(addr)?;
        let _ = stream.set_nodelay(true);

        Ok(Box::new(TcpConnection::new(stream)))
    }

    fn bind(&self, preferred: u16) -> io::Result<Box<Listener>> {
        let listener = bind_to_free_port(preferred)?;
        let port = listener.local_addr()?.port();

        Ok(Box::new(TcpAcceptor {
            listener: listener,
            port: port,
        }))
    }
}

fn bind_to_free_port(preferred: u16) -> io::Result<TcpListener> {
    let any = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));

    if preferred != 0 {
        return TcpListener::bind(&SocketAddr::new(any, preferred));
    }

    let mut last_err = None;
    for port in BASE_PORT..BASE_PORT + PORT_SCAN_RANGE {
        match TcpListener::bind(&SocketAddr::new(any, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| invalid_data_io_error("no free port in scan range")))
}

pub struct TcpAcceptor {
    listener: TcpListener,
    port: u16,
}

impl Listener for TcpAcceptor {
    fn as_evented(&self) -> &Evented {
        &self.listener
    }

    fn accept(&mut self) -> io::Result<Option<Box<Connection>>> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                let _ = stream.set_nodelay(true);
                Ok(Some(Box::new(TcpConnection::new(stream)) as Box<Connection>))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

pub struct TcpConnection {
    stream: TcpStream,
    recv: RecvState,
    send: SendQueue,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> TcpConnection {
        TcpConnection {
            stream: stream,
            recv: RecvState::new(),
            send: SendQueue::new(),
        }
    }
}

impl Connection for TcpConnection {
    fn as_evented(&self) -> &Evented {
        &self.stream
    }

    fn send(&mut self, parts: Vec<Vec<u8>>) -> io::Result<()> {
        self.send.push(encode_parts(&parts));
        self.send.pump(&mut self.stream)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send.pump(&mut self.stream)
    }

    fn has_pending_send(&self) -> bool {
        !self.send.is_empty()
    }

    fn recv(&mut self) -> io::Result<Option<Vec<Vec<u8>>>> {
        self.recv.pump(&mut self.stream)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

/// Encode a whole multi-part message into one contiguous buffer.
pub fn encode_parts(parts: &[Vec<u8>]) -> Vec<u8> {
    debug_assert!(!parts.is_empty());

    let total: usize = parts.iter().map(|p| p.len() + PART_HEADER_LEN).sum();
    let mut buf = Vec::with_capacity(total);

    for (index, part) in parts.iter().enumerate() {
        let more = index + 1 < parts.len();
        buf.push(if more { FLAG_MORE } else { 0 });
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, part.len() as u32);
        buf.extend_from_slice(&len);
        buf.extend_from_slice(part);
    }

    buf
}

/// Blocking counterpart of [encode_parts](fn.encode_parts.html), for the
/// subscriber links and test tooling that run on plain std streams.
pub fn write_parts<W: Write>(writer: &mut W, parts: &[Vec<u8>]) -> io::Result<()> {
    writer.write_all(&encode_parts(parts))
}

/// Blocking read of one whole multi-part message.
pub fn read_parts<R: Read>(reader: &mut R) -> io::Result<Vec<Vec<u8>>> {
    let mut parts = Vec::new();

    loop {
        let mut header = [0u8; PART_HEADER_LEN];
        reader.read_exact(&mut header)?;

        let (more, len) = parse_part_header(&header)?;
        let mut part = vec![0u8; len];
        reader.read_exact(&mut part)?;
        parts.push(part);

        if !more {
            return Ok(parts);
        }
    }
}

fn parse_part_header(header: &[u8; PART_HEADER_LEN]) -> io::Result<(bool, usize)> {
    let flags = header[0];
    if flags & !FLAG_MORE != 0 {
        return Err(invalid_data_io_error("unknown part flags"));
    }

    let len = BigEndian::read_u32(&header[1..]) as usize;
    if len > MAX_PART_LEN {
        return Err(invalid_data_io_error("part exceeds maximum length"));
    }

    Ok((flags & FLAG_MORE != 0, len))
}

/// Outbound bytes awaiting socket room. Encoded messages are kept whole so a
/// reconnect never resumes in the middle of one.
struct SendQueue {
    chunks: VecDeque<Vec<u8>>,
    offset: usize,
}

impl SendQueue {
    fn new() -> SendQueue {
        SendQueue {
            chunks: VecDeque::new(),
            offset: 0,
        }
    }

    fn push(&mut self, chunk: Vec<u8>) {
        self.chunks.push_back(chunk);
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn pump<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        while let Some(written) = self.write_front(writer)? {
            self.offset += written;
            if self.offset == self.chunks.front().map_or(0, |c| c.len()) {
                self.chunks.pop_front();
                self.offset = 0;
            }
        }

        Ok(())
    }

    /// `Ok(None)` when the queue is drained or the socket is full.
    fn write_front<W: Write>(&mut self, writer: &mut W) -> io::Result<Option<usize>> {
        let front = match self.chunks.front() {
            Some(front) => front,
            None => return Ok(None),
        };

        match writer.write(&front[self.offset..]) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(Some(0)),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, PartialEq)]
enum RecvStep {
    Header,
    Body { more: bool },
}

/// Resumable multi-part receive.
struct RecvState {
    step: RecvStep,
    header: [u8; PART_HEADER_LEN],
    read: usize,
    body: Vec<u8>,
    parts: Vec<Vec<u8>>,
}

impl RecvState {
    fn new() -> RecvState {
        RecvState {
            step: RecvStep::Header,
            header: [0; PART_HEADER_LEN],
            read: 0,
            body: Vec::new(),
            parts: Vec::new(),
        }
    }

    fn pump<R: Read>(&mut self, reader: &mut R) -> io::Result<Option<Vec<Vec<u8>>>> {
        loop {
            match self.step {
                RecvStep::Header => {
                    match self.fill_header(reader)? {
                        false => return Ok(None),
                        true => {
                            let (more, len) = parse_part_header(&self.header)?;
                            self.step = RecvStep::Body { more: more };
                            self.body = vec![0u8; len];
                            self.read = 0;
                        }
                    }
                }
                RecvStep::Body { more } => {
                    if !self.fill_body(reader)? {
                        return Ok(None);
                    }
                    let part = ::std::mem::replace(&mut self.body, Vec::new());
                    self.parts.push(part);
                    self.step = RecvStep::Header;
                    self.read = 0;

                    if !more {
                        return Ok(Some(::std::mem::replace(&mut self.parts, Vec::new())));
                    }
                }
            }
        }
    }

    fn fill_header<R: Read>(&mut self, reader: &mut R) -> io::Result<bool> {
        while self.read < PART_HEADER_LEN {
            match read_some(reader, &mut self.header[self.read..])? {
                Some(n) => self.read += n,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn fill_body<R: Read>(&mut self, reader: &mut R) -> io::Result<bool> {
        while self.read < self.body.len() {
            let read = self.read;
            match read_some(reader, &mut self.body[read..])? {
                Some(n) => self.read += n,
                None => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// `Ok(None)` on would-block, an error on a closed peer.
fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<usize>> {
    if buf.is_empty() {
        return Ok(Some(0));
    }
    match reader.read(buf) {
        Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")),
        Ok(n) => Ok(Some(n)),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(Some(0)),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::io::{Cursor, Read, Write};

    use super::*;

    #[test]
    fn blocking_round_trip() {
        let parts = vec![b"channel".to_vec(), b"k\0v".to_vec(), vec![0u8; 1024]];
        let mut wire = Vec::new();

        write_parts(&mut wire, &parts).unwrap();
        let back = read_parts(&mut Cursor::new(wire)).unwrap();

        assert_eq!(parts, back);
    }

    #[test]
    fn single_part_round_trip() {
        let parts = vec![Vec::new()];
        let wire = encode_parts(&parts);

        assert_eq!(parts, read_parts(&mut Cursor::new(wire)).unwrap());
    }

    /// Hands out one byte per read, then would-block every other call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        starve: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.starve = !self.starve;
            if self.starve {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "later"));
            }
            if self.pos == self.data.len() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn receive_resumes_across_fragmented_reads() {
        let parts = vec![b"abc".to_vec(), b"defgh".to_vec()];
        let mut reader = Trickle {
            data: encode_parts(&parts),
            pos: 0,
            starve: false,
        };
        let mut state = RecvState::new();

        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds < 1000);
            match state.pump(&mut reader).unwrap() {
                Some(received) => {
                    assert_eq!(parts, received);
                    break;
                }
                None => continue,
            }
        }
    }

    #[test]
    fn closed_peer_is_an_error() {
        let mut state = RecvState::new();
        let mut empty = Cursor::new(Vec::<u8>::new());

        let err = state.pump(&mut empty).unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
    }

    #[test]
    fn garbage_length_is_refused() {
        let mut wire = vec![0u8; 5];
        wire[1] = 0xff;
        wire[2] = 0xff;
        wire[3] = 0xff;
        wire[4] = 0xff;

        assert!(read_parts(&mut Cursor::new(wire)).is_err());
    }

    #[test]
    fn send_queue_drains_as_room_appears() {
        let mut queue = SendQueue::new();
        let mut sink = LimitedWriter {
            accepted: Vec::new(),
            room: 4,
        };

        queue.push(vec![1, 2, 3, 4, 5, 6]);
        queue.pump(&mut sink).unwrap();
        assert!(!queue.is_empty());
        assert_eq!(vec![1, 2, 3, 4], sink.accepted);

        sink.room = 10;
        queue.pump(&mut sink).unwrap();
        assert!(queue.is_empty());
        assert_eq!(vec![1, 2, 3, 4, 5, 6], sink.accepted);
    }

    struct LimitedWriter {
        accepted: Vec<u8>,
        room: usize,
    }

    impl Write for LimitedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            let n = ::std::cmp::min(self.room, buf.len());
            self.accepted.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
