// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Pluggable message transports.
//!
//! The node only requires what the traits below promise: non-blocking send of
//! multi-part messages, incremental receive, and a handle it can hand to the
//! poll. Everything tcp-specific stays inside the `tcp` module; a new
//! transport plugs in through [create_transport](fn.create_transport.html).

pub mod tcp;
pub mod xpub;

use std::io;
use std::net::SocketAddr;

use mio::Evented;

use global::invalid_input_io_error;

/// One established, framed, non-blocking connection.
pub trait Connection: Send {
    /// Handle to register with the poll.
    fn as_evented(&self) -> &Evented;

    /// Queue a multi-part message and flush as far as the socket allows.
    /// A would-block leaves the rest queued, a hard error is returned.
    fn send(&mut self, parts: Vec<Vec<u8>>) -> io::Result<()>;

    /// Push queued bytes after a writability event.
    fn flush(&mut self) -> io::Result<()>;

    fn has_pending_send(&self) -> bool;

    /// Non-blocking receive of one whole multi-part message.
    /// `Ok(None)` means the message is not complete yet.
    fn recv(&mut self) -> io::Result<Option<Vec<Vec<u8>>>>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// A bound socket accepting [Connection](trait.Connection.html)s.
pub trait Listener: Send {
    fn as_evented(&self) -> &Evented;

    /// `Ok(None)` when nobody is waiting.
    fn accept(&mut self) -> io::Result<Option<Box<Connection>>>;

    fn local_port(&self) -> u16;
}

pub trait Transport {
    fn scheme(&self) -> &'static str;

    fn connect(&self, addr: &SocketAddr) -> io::Result<Box<Connection>>;

    /// Bind to `preferred`, or scan upward from the base port when it is 0.
    fn bind(&self, preferred: u16) -> io::Result<Box<Listener>>;
}

pub fn create_transport(scheme: &str) -> io::Result<Box<Transport>> {
    match scheme {
        "tcp" => Ok(Box::new(tcp::Tcp)),
        _ => Err(invalid_input_io_error("no transport registered for scheme")),
    }
}

#[cfg(test)]
mod tests {
    use super::create_transport;

    #[test]
    fn only_known_schemes_resolve() {
        assert!(create_transport("tcp").is_ok());
        assert!(create_transport("rtp").is_err());
        assert!(create_transport("").is_err());
    }
}
