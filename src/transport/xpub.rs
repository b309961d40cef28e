// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Exchange-style publish socket.
//!
//! Remote subscribers connect here. Everything they send upstream is a
//! subscription hint: one part, `0x01 topic` to subscribe, `0x00 topic` to
//! unsubscribe. Published messages go out to every connection holding a topic
//! that prefixes the message channel. A dying connection synthesizes
//! unsubscribe hints for its topics so the node sees a clean unwind.

use std::collections::HashMap;
use std::io;

use mio::Evented;

use global::IdSequence;
use super::{Connection, Listener};

const HINT_UNSUBSCRIBE: u8 = 0x00;
const HINT_SUBSCRIBE: u8 = 0x01;

/// Subscription hint surfaced to the node, topic bytes included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubEvent {
    Subscribe(Vec<u8>),
    Unsubscribe(Vec<u8>),
}

struct XPubConn {
    conn: Box<Connection>,
    topics: Vec<Vec<u8>>,
}

pub struct XPub {
    listener: Box<Listener>,
    conns: HashMap<usize, XPubConn>,
}

impl XPub {
    pub fn new(listener: Box<Listener>) -> XPub {
        XPub {
            listener: listener,
            conns: HashMap::new(),
        }
    }

    pub fn listener_evented(&self) -> &Evented {
        self.listener.as_evented()
    }

    pub fn port(&self) -> u16 {
        self.listener.local_port()
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Accept every waiting subscriber, returning the ids to register.
    pub fn accept(&mut self, ids: &IdSequence) -> io::Result<Vec<usize>> {
        let mut accepted = Vec::new();

        while let Some(conn) = self.listener.accept()? {
            let id = ids.next();
            self.conns.insert(id, XPubConn {
                conn: conn,
                topics: Vec::new(),
            });
            accepted.push(id);
        }

        Ok(accepted)
    }

    pub fn conn_evented(&self, id: usize) -> Option<&Evented> {
        self.conns.get(&id).map(|c| c.conn.as_evented())
    }

    /// Drain subscription hints from one connection. When the connection
    /// died, it is dropped and its topics come back as unsubscribes.
    pub fn handle_readable(&mut self, id: usize) -> Vec<SubEvent> {
        let mut events = Vec::new();
        let mut dead = false;

        if let Some(entry) = self.conns.get_mut(&id) {
            loop {
                match entry.conn.recv() {
                    Ok(Some(parts)) => {
                        if let Some(event) = hint_from_parts(&parts) {
                            apply_hint(&mut entry.topics, &event);
                            events.push(event);
                        } else {
                            debug!("discarding non-hint message on publish socket");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("subscriber connection lost: {}", e);
                        dead = true;
                        break;
                    }
                }
            }
        }

        if dead {
            events.extend(self.drop_conn(id));
        }

        events
    }

    pub fn handle_writable(&mut self, id: usize) -> Vec<SubEvent> {
        let mut dead = false;

        if let Some(entry) = self.conns.get_mut(&id) {
            if let Err(e) = entry.conn.flush() {
                debug!("subscriber connection lost while flushing: {}", e);
                dead = true;
            }
        }

        if dead {
            self.drop_conn(id)
        } else {
            Vec::new()
        }
    }

    /// Forward one data message to every matching subscriber connection.
    /// Returns how many connections took it, plus the unwind events of
    /// connections that died on send.
    pub fn broadcast(&mut self, parts: &[Vec<u8>]) -> (usize, Vec<SubEvent>) {
        let channel: &[u8] = &parts[0];
        let mut sent = 0;
        let mut dead = Vec::new();

        for (&id, entry) in &mut self.conns {
            if !entry.topics.iter().any(|topic| channel.starts_with(topic)) {
                continue;
            }
            match entry.conn.send(parts.to_vec()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!("dropping subscriber connection on send: {}", e);
                    dead.push(id);
                }
            }
        }

        let mut events = Vec::new();
        for id in dead {
            events.extend(self.drop_conn(id));
        }

        (sent, events)
    }

    /// Remove a connection, synthesizing unsubscribes for its topics.
    pub fn drop_conn(&mut self, id: usize) -> Vec<SubEvent> {
        match self.conns.remove(&id) {
            Some(entry) => entry.topics.into_iter().map(SubEvent::Unsubscribe).collect(),
            None => Vec::new(),
        }
    }

    pub fn conn_ids(&self) -> Vec<usize> {
        self.conns.keys().cloned().collect()
    }

    #[cfg(test)]
    fn insert_conn(&mut self, id: usize, conn: Box<Connection>) {
        self.conns.insert(id, XPubConn {
            conn: conn,
            topics: Vec::new(),
        });
    }
}

fn hint_from_parts(parts: &[Vec<u8>]) -> Option<SubEvent> {
    if parts.len() != 1 || parts[0].is_empty() {
        return None;
    }

    let topic = parts[0][1..].to_vec();
    match parts[0][0] {
        HINT_SUBSCRIBE => Some(SubEvent::Subscribe(topic)),
        HINT_UNSUBSCRIBE => Some(SubEvent::Unsubscribe(topic)),
        _ => None,
    }
}

fn apply_hint(topics: &mut Vec<Vec<u8>>, event: &SubEvent) {
    match *event {
        SubEvent::Subscribe(ref topic) => topics.push(topic.clone()),
        SubEvent::Unsubscribe(ref topic) => {
            if let Some(index) = topics.iter().position(|t| t == topic) {
                topics.remove(index);
            }
        }
    }
}

/// Build the hint a subscriber sends upstream.
pub fn subscribe_hint(topic: &[u8]) -> Vec<u8> {
    let mut hint = Vec::with_capacity(topic.len() + 1);
    hint.push(HINT_SUBSCRIBE);
    hint.extend_from_slice(topic);
    hint
}

pub fn unsubscribe_hint(topic: &[u8]) -> Vec<u8> {
    let mut hint = Vec::with_capacity(topic.len() + 1);
    hint.push(HINT_UNSUBSCRIBE);
    hint.extend_from_slice(topic);
    hint
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use mio;

    use global::other_io_error;
    use transport::{create_transport, Connection};

    use super::*;

    /// In-memory stand-in for a subscriber connection.
    struct MemConnection {
        incoming: VecDeque<Vec<Vec<u8>>>,
        sent: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
        dead: bool,
    }

    impl MemConnection {
        fn new(incoming: Vec<Vec<Vec<u8>>>) -> (MemConnection, Arc<Mutex<Vec<Vec<Vec<u8>>>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let conn = MemConnection {
                incoming: incoming.into_iter().collect(),
                sent: sent.clone(),
                dead: false,
            };
            (conn, sent)
        }
    }

    impl mio::Evented for MemConnection {
        fn register(&self, _: &mio::Poll, _: mio::Token, _: mio::Ready, _: mio::PollOpt) -> io::Result<()> {
            unimplemented!();
        }
        fn reregister(&self, _: &mio::Poll, _: mio::Token, _: mio::Ready, _: mio::PollOpt) -> io::Result<()> {
            unimplemented!();
        }
        fn deregister(&self, _: &mio::Poll) -> io::Result<()> {
            unimplemented!();
        }
    }

    impl Connection for MemConnection {
        fn as_evented(&self) -> &mio::Evented {
            self
        }
        fn send(&mut self, parts: Vec<Vec<u8>>) -> io::Result<()> {
            if self.dead {
                return Err(other_io_error("dead"));
            }
            self.sent.lock().unwrap().push(parts);
            Ok(())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn has_pending_send(&self) -> bool {
            false
        }
        fn recv(&mut self) -> io::Result<Option<Vec<Vec<u8>>>> {
            if let Some(parts) = self.incoming.pop_front() {
                return Ok(Some(parts));
            }
            if self.dead {
                Err(other_io_error("dead"))
            } else {
                Ok(None)
            }
        }
        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Err(other_io_error("not a socket"))
        }
    }

    fn fresh_xpub() -> XPub {
        let listener = create_transport("tcp").unwrap().bind(0).unwrap();
        XPub::new(listener)
    }

    #[test]
    fn hints_install_topic_filters() {
        let mut xpub = fresh_xpub();
        let (conn, sent) = MemConnection::new(vec![
            vec![subscribe_hint(b"f")],
            vec![subscribe_hint(b"~some-uuid")],
        ]);
        xpub.insert_conn(7, Box::new(conn));

        let events = xpub.handle_readable(7);
        assert_eq!(vec![
            SubEvent::Subscribe(b"f".to_vec()),
            SubEvent::Subscribe(b"~some-uuid".to_vec()),
        ], events);

        // "foo" matches the "f" prefix, "bar" matches nothing
        let (count, _) = xpub.broadcast(&[b"foo".to_vec(), b"payload".to_vec()]);
        assert_eq!(1, count);
        let (count, _) = xpub.broadcast(&[b"bar".to_vec(), b"payload".to_vec()]);
        assert_eq!(1, sent.lock().unwrap().len());
        assert_eq!(0, count);
    }

    #[test]
    fn unsubscribe_hint_removes_the_filter() {
        let mut xpub = fresh_xpub();
        let (conn, sent) = MemConnection::new(vec![
            vec![subscribe_hint(b"foo")],
            vec![unsubscribe_hint(b"foo")],
        ]);
        xpub.insert_conn(1, Box::new(conn));
        xpub.handle_readable(1);

        let (count, _) = xpub.broadcast(&[b"foo".to_vec(), b"x".to_vec()]);

        assert_eq!(0, count);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn dead_connections_unwind_their_topics() {
        let mut xpub = fresh_xpub();
        let (mut conn, _) = MemConnection::new(vec![vec![subscribe_hint(b"~uuid")]]);
        conn.dead = true;
        xpub.insert_conn(3, Box::new(conn));

        let events = xpub.handle_readable(3);

        assert_eq!(vec![
            SubEvent::Subscribe(b"~uuid".to_vec()),
            SubEvent::Unsubscribe(b"~uuid".to_vec()),
        ], events);
        assert_eq!(0, xpub.conn_count());
    }

    #[test]
    fn non_hint_traffic_is_ignored() {
        let mut xpub = fresh_xpub();
        let (conn, _) = MemConnection::new(vec![
            vec![b"two".to_vec(), b"parts".to_vec()],
            vec![vec![0x17, 0x42]],
            vec![Vec::new()],
        ]);
        xpub.insert_conn(9, Box::new(conn));

        assert!(xpub.handle_readable(9).is_empty());
    }
}
