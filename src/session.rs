// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Per-peer link state.
//!
//! Discovery talks in addresses, the node protocol talks in uuids, and both
//! arrive asynchronously. Sessions therefore live in a handle table indexed
//! twice: by remote address and, once the handshake told us who answered, by
//! remote uuid. Both indexes hold the same [SessionToken](struct.SessionToken.html).

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use endpoint::EndPoint;
use stub::NodeStub;
use transport::Connection;

/// Sessions stuck before the handshake or silent for this long are reaped.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(pub usize);

pub struct Session {
    pub remote_addr: Option<EndPoint>,
    /// Peer address for the data plane, known even when we never dialed
    /// (taken from the accepted control connection).
    pub remote_ip: Option<IpAddr>,
    pub remote_uuid: Option<String>,
    /// Outbound control socket, present on the connected-to half only.
    pub socket: Option<Box<Connection>>,
    /// Poll token id of the outbound socket.
    pub token_id: Option<usize>,
    pub started_at: Instant,
    pub last_seen: Instant,
    /// One reference per discovery endpoint plus one while connected-from.
    pub ref_count: usize,
    /// We opened a session to the peer.
    pub connected_to: bool,
    /// The peer opened a session to us.
    pub connected_from: bool,
    /// Catalog of the peer's publishers and subscribers.
    pub stub: NodeStub,
}

impl Session {
    pub fn outbound(addr: EndPoint, socket: Box<Connection>, token_id: usize) -> Session {
        let now = Instant::now();
        let ip = addr.ip();

        Session {
            remote_addr: Some(addr),
            remote_ip: Some(ip),
            remote_uuid: None,
            socket: Some(socket),
            token_id: Some(token_id),
            started_at: now,
            last_seen: now,
            ref_count: 1,
            connected_to: true,
            connected_from: false,
            stub: NodeStub::default(),
        }
    }

    /// A peer we never dialed opened a session to us.
    pub fn inbound(uuid: &str, ip: Option<IpAddr>) -> Session {
        let now = Instant::now();

        Session {
            remote_addr: None,
            remote_ip: ip,
            remote_uuid: Some(uuid.to_string()),
            socket: None,
            token_id: None,
            started_at: now,
            last_seen: now,
            ref_count: 1,
            connected_to: false,
            connected_from: true,
            stub: NodeStub::new(uuid),
        }
    }

    /// A peer we only know by hearsay: it advertised a publisher before any
    /// handshake. Holds no reference, reaped like any silent peer.
    pub fn first_contact(uuid: &str, ip: Option<IpAddr>) -> Session {
        let mut session = Session::inbound(uuid, ip);
        session.connected_from = false;
        session.ref_count = 0;
        session
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_established(&self) -> bool {
        self.remote_uuid.is_some()
    }

    pub fn handshake_expired(&self, now: Instant) -> bool {
        !self.is_established() && now.duration_since(self.started_at) > SESSION_TIMEOUT
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.is_established() && now.duration_since(self.last_seen) > SESSION_TIMEOUT
    }
}

/// The handle table: one slot per session, two index maps into it.
pub struct SessionTable {
    slots: HashMap<usize, Session>,
    by_addr: HashMap<EndPoint, usize>,
    by_uuid: HashMap<String, usize>,
    next: usize,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable {
            slots: HashMap::new(),
            by_addr: HashMap::new(),
            by_uuid: HashMap::new(),
            next: 0,
        }
    }

    pub fn insert(&mut self, session: Session) -> SessionToken {
        let token = SessionToken(self.next);
        self.next += 1;

        if let Some(ref addr) = session.remote_addr {
            self.by_addr.insert(addr.clone(), token.0);
        }
        if let Some(ref uuid) = session.remote_uuid {
            self.by_uuid.insert(uuid.clone(), token.0);
        }
        self.slots.insert(token.0, session);

        token
    }

    pub fn get(&self, token: SessionToken) -> Option<&Session> {
        self.slots.get(&token.0)
    }

    pub fn get_mut(&mut self, token: SessionToken) -> Option<&mut Session> {
        self.slots.get_mut(&token.0)
    }

    pub fn token_by_addr(&self, addr: &EndPoint) -> Option<SessionToken> {
        self.by_addr.get(addr).map(|&id| SessionToken(id))
    }

    pub fn token_by_uuid(&self, uuid: &str) -> Option<SessionToken> {
        self.by_uuid.get(uuid).map(|&id| SessionToken(id))
    }

    /// Attach the uuid index to an existing slot, once the handshake names the peer.
    pub fn index_uuid(&mut self, token: SessionToken, uuid: &str) {
        if let Some(session) = self.slots.get_mut(&token.0) {
            session.remote_uuid = Some(uuid.to_string());
            session.stub.uuid = uuid.to_string();
            self.by_uuid.insert(uuid.to_string(), token.0);
        }
    }

    pub fn index_addr(&mut self, token: SessionToken, addr: EndPoint) {
        if let Some(session) = self.slots.get_mut(&token.0) {
            session.remote_addr = Some(addr.clone());
            session.stub.address = Some(addr.clone());
            self.by_addr.insert(addr, token.0);
        }
    }

    /// Drop the address index without touching the slot.
    pub fn unindex_addr(&mut self, addr: &EndPoint) {
        if let Some(id) = self.by_addr.remove(addr) {
            if let Some(session) = self.slots.get_mut(&id) {
                session.remote_addr = None;
            }
        }
    }

    /// Drop the uuid index without touching the slot.
    pub fn unindex_uuid(&mut self, uuid: &str) {
        if let Some(id) = self.by_uuid.remove(uuid) {
            if let Some(session) = self.slots.get_mut(&id) {
                session.remote_uuid = None;
            }
        }
    }

    /// Remove a slot and every index pointing at it.
    pub fn remove(&mut self, token: SessionToken) -> Option<Session> {
        let session = self.slots.remove(&token.0);

        if let Some(ref session) = session {
            if let Some(ref addr) = session.remote_addr {
                if self.by_addr.get(addr) == Some(&token.0) {
                    self.by_addr.remove(addr);
                }
            }
            if let Some(ref uuid) = session.remote_uuid {
                if self.by_uuid.get(uuid) == Some(&token.0) {
                    self.by_uuid.remove(uuid);
                }
            }
        }

        session
    }

    pub fn tokens(&self) -> Vec<SessionToken> {
        self.slots.keys().map(|&id| SessionToken(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> ::std::collections::hash_map::Values<usize, Session> {
        self.slots.values()
    }

    /// Both indexes must resolve to live slots, and a slot reachable by uuid
    /// with an address must be the same record the address resolves to.
    #[cfg(test)]
    pub fn check_index_identity(&self) -> bool {
        self.by_uuid.values().chain(self.by_addr.values()).all(|id| self.slots.contains_key(id))
            && self.by_uuid.iter().all(|(_, id)| {
                match self.slots[id].remote_addr {
                    Some(ref addr) => self.by_addr.get(addr) == Some(id),
                    None => true,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use global::new_uuid;

    use super::*;

    fn addr(port: u16) -> ::endpoint::EndPoint {
        format!("tcp://127.0.0.1:{}", port).parse().unwrap()
    }

    fn outbound(port: u16) -> Session {
        use std::time::Instant;

        let now = Instant::now();

        Session {
            remote_addr: Some(addr(port)),
            remote_ip: None,
            remote_uuid: None,
            socket: None,
            token_id: None,
            started_at: now,
            last_seen: now,
            ref_count: 1,
            connected_to: true,
            connected_from: false,
            stub: ::stub::NodeStub::default(),
        }
    }

    #[test]
    fn both_indexes_reach_the_same_record() {
        let mut table = SessionTable::new();
        let uuid = new_uuid();

        let token = table.insert(outbound(5000));
        table.index_uuid(token, &uuid);

        assert_eq!(Some(token), table.token_by_addr(&addr(5000)));
        assert_eq!(Some(token), table.token_by_uuid(&uuid));
        assert!(table.check_index_identity());

        let session = table.get(token).unwrap();
        assert_eq!(Some(uuid.as_str()), session.remote_uuid.as_ref().map(|u| u.as_str()));
    }

    #[test]
    fn remove_clears_every_index() {
        let mut table = SessionTable::new();
        let uuid = new_uuid();
        let token = table.insert(outbound(5001));
        table.index_uuid(token, &uuid);

        assert!(table.remove(token).is_some());
        assert_eq!(None, table.token_by_addr(&addr(5001)));
        assert_eq!(None, table.token_by_uuid(&uuid));
        assert_eq!(0, table.len());
        assert!(table.check_index_identity());
    }

    #[test]
    fn unindex_addr_keeps_the_slot() {
        let mut table = SessionTable::new();
        let uuid = new_uuid();
        let token = table.insert(outbound(5002));
        table.index_uuid(token, &uuid);

        table.unindex_addr(&addr(5002));

        assert_eq!(None, table.token_by_addr(&addr(5002)));
        assert_eq!(Some(token), table.token_by_uuid(&uuid));
        assert!(table.check_index_identity());
    }

    #[test]
    fn inbound_sessions_carry_a_reference() {
        let session = Session::inbound(&new_uuid(), None);

        assert_eq!(1, session.ref_count);
        assert!(session.connected_from);
        assert!(!session.connected_to);
        assert!(session.is_established());
    }

    #[test]
    fn first_contact_sessions_hold_no_reference() {
        let session = Session::first_contact(&new_uuid(), None);

        assert_eq!(0, session.ref_count);
        assert!(!session.connected_from);
        assert!(session.is_established());
    }

    #[test]
    fn timeouts_depend_on_handshake_state() {
        use std::time::Instant;

        let session = outbound(5003);
        let now = Instant::now();

        assert!(!session.handshake_expired(now));
        assert!(!session.is_stale(now));

        let later = now + super::SESSION_TIMEOUT + ::std::time::Duration::from_secs(1);
        assert!(session.handshake_expired(later));
        // staleness only applies once the peer identified itself
        assert!(!session.is_stale(later));
    }
}
