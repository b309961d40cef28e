// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use global::invalid_input_io_error;
use std::io;

/// Anything addressable on the network: a transport scheme, an address and a port.
///
/// Endpoints are what discovery hands to a node and what sessions are keyed by.
/// The textual form round-trips `transport://ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndPoint {
    transport: String,
    ip: IpAddr,
    port: u16,
}

impl EndPoint {
    pub fn new(transport: &str, ip: IpAddr, port: u16) -> io::Result<EndPoint> {
        if port == 0 {
            return Err(invalid_input_io_error("endpoint port must be non-zero"));
        }
        match transport {
            "tcp" | "udp" => Ok(EndPoint {
                transport: transport.to_string(),
                ip: ip,
                port: port,
            }),
            _ => Err(invalid_input_io_error("unknown endpoint transport")),
        }
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}:{}", self.transport, self.ip, self.port)
    }
}

impl FromStr for EndPoint {
    type Err = io::Error;

    fn from_str(s: &str) -> io::Result<EndPoint> {
        let mut parts = s.splitn(2, "://");
        let scheme = parts.next().unwrap_or("");
        let rest = match parts.next() {
            Some(rest) => rest,
            None => return Err(invalid_input_io_error("endpoint misses '://'")),
        };

        // rely on the socket address parser, it knows about [v6]:port
        let addr: SocketAddr = rest.parse()
            .map_err(|_| invalid_input_io_error("endpoint address unparsable"))?;

        EndPoint::new(scheme, addr.ip(), addr.port())
    }
}
