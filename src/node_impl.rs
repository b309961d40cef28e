use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::str;
use std::time::{Duration, Instant};

use mio::{Events, Poll, PollOpt, Ready, Token};
use mio_extras::channel::{channel, Receiver, Sender};
use time;

use config::NodeConfig;
use endpoint::EndPoint;
use event_loop_msg::{NodeCmd, NodeQuery};
use global::{process_uuid, short_uuid, IdSequence, UUID_LEN};
use pubsub::{Publisher, Subscriber};
use reconcile::Reconciler;
use session::{Session, SessionTable, SessionToken};
use stats::StatWindow;
use stub::{PublisherStub, SubscriberStub, IMPL_TCP_PUBSUB};
use transport::xpub::{SubEvent, XPub};
use transport::{create_transport, Connection, Listener};
use wire;
use wire::{Decoded, Frame, PubInfo};

const TOK_NODE_LISTENER: Token = Token(0);
const TOK_PUB_LISTENER: Token = Token(1);
const TOK_CMD: Token = Token(2);
const TOK_INGRESS: Token = Token(3);
const FIRST_DYN_TOKEN: usize = 16;

/// The poll wakes at least this often so housekeeping runs without traffic.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Catalog keep-alive; also what heals lost control frames.
const NODE_INFO_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone)]
enum TokenKind {
    NodeConn,
    PubConn,
    Session(SessionToken),
}

/// One accepted control connection. The uuid shows up with the first
/// enveloped frame and sticks for the lifetime of the connection.
struct NodeConn {
    conn: Box<Connection>,
    uuid: Option<String>,
}

/// The single-threaded backend owning all node state. Everything here runs
/// on the loop thread; the facade reaches in through the command channel only.
pub struct NodeImpl {
    uuid: String,
    config: NodeConfig,
    poll: Poll,
    node_listener: Box<Listener>,
    node_port: u16,
    xpub: XPub,
    pub_port: u16,
    node_conns: HashMap<usize, NodeConn>,
    tokens: HashMap<usize, TokenKind>,
    ids: IdSequence,
    cmd_rx: Receiver<NodeCmd>,
    ingress_tx: Sender<Vec<Vec<u8>>>,
    ingress_rx: Receiver<Vec<Vec<u8>>>,
    sessions: SessionTable,
    pubs: HashMap<String, Publisher>,
    subs: HashMap<String, Subscriber>,
    recon: Reconciler,
    stats: StatWindow,
    last_node_info: Instant,
    running: bool,
    suspended: bool,
    parked_pubs: Vec<Publisher>,
}

impl NodeImpl {
    pub fn new(uuid: String, config: NodeConfig, cmd_rx: Receiver<NodeCmd>) -> io::Result<NodeImpl> {
        let poll = Poll::new()?;
        let transport = create_transport("tcp")?;
        let node_listener = transport.bind(config.node_port)?;
        let pub_listener = transport.bind(config.pub_port)?;
        let (ingress_tx, ingress_rx) = channel();

        poll.register(node_listener.as_evented(), TOK_NODE_LISTENER, Ready::readable(), PollOpt::edge())?;
        poll.register(pub_listener.as_evented(), TOK_PUB_LISTENER, Ready::readable(), PollOpt::edge())?;
        poll.register(&cmd_rx, TOK_CMD, Ready::readable(), PollOpt::edge())?;
        poll.register(&ingress_rx, TOK_INGRESS, Ready::readable(), PollOpt::edge())?;

        let node_port = node_listener.local_port();
        let pub_port = pub_listener.local_port();

        Ok(NodeImpl {
            uuid: uuid,
            config: config,
            poll: poll,
            node_listener: node_listener,
            node_port: node_port,
            xpub: XPub::new(pub_listener),
            pub_port: pub_port,
            node_conns: HashMap::new(),
            tokens: HashMap::new(),
            ids: IdSequence::new(FIRST_DYN_TOKEN),
            cmd_rx: cmd_rx,
            ingress_tx: ingress_tx,
            ingress_rx: ingress_rx,
            sessions: SessionTable::new(),
            pubs: HashMap::new(),
            subs: HashMap::new(),
            recon: Reconciler::new(),
            stats: StatWindow::new(),
            last_node_info: Instant::now(),
            running: true,
            suspended: false,
            parked_pubs: Vec::new(),
        })
    }

    pub fn node_port(&self) -> u16 {
        self.node_port
    }

    pub fn pub_port(&self) -> u16 {
        self.pub_port
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(1024);

        while self.running {
            self.tick();

            if let Err(e) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                error!("[{}] poll failed: {}", short_uuid(&self.uuid), e);
                break;
            }

            let ready: Vec<(Token, Ready)> = events.iter()
                .map(|e| (e.token(), e.readiness()))
                .collect();

            // session sockets first, catalog updates must not starve behind
            // a busy data channel
            for &(token, readiness) in &ready {
                if self.is_session_token(token) {
                    self.dispatch(token, readiness);
                }
            }
            for &(token, readiness) in &ready {
                if !self.is_session_token(token) {
                    self.dispatch(token, readiness);
                }
            }
        }

        debug!("[{}] event loop done", short_uuid(&self.uuid));
    }

    fn is_session_token(&self, token: Token) -> bool {
        match self.tokens.get(&token.0) {
            Some(&TokenKind::Session(_)) => true,
            _ => false,
        }
    }

    fn dispatch(&mut self, token: Token, readiness: Ready) {
        match token {
            TOK_NODE_LISTENER => self.accept_node_conns(),
            TOK_PUB_LISTENER => self.accept_pub_conns(),
            TOK_CMD => self.drain_commands(),
            TOK_INGRESS => self.drain_ingress(),
            Token(id) => {
                match self.tokens.get(&id).cloned() {
                    Some(TokenKind::NodeConn) => self.node_conn_ready(id, readiness),
                    Some(TokenKind::PubConn) => self.pub_conn_ready(id, readiness),
                    Some(TokenKind::Session(tok)) => self.session_ready(tok, readiness),
                    None => {}
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // housekeeping between polls
    // ------------------------------------------------------------------

    fn tick(&mut self) {
        let now = Instant::now();

        self.stats.advance(now);
        self.reap_sessions(now);

        if now.duration_since(self.last_node_info) >= NODE_INFO_INTERVAL {
            self.last_node_info = now;
            if !self.suspended {
                let frame = Frame::NodeInfo {
                    uuid: self.uuid.clone(),
                    pubs: self.local_pub_infos(),
                };
                self.broadcast_frame(&frame);
            }
        }
    }

    fn reap_sessions(&mut self, now: Instant) {
        let mut expired = Vec::new();
        let mut stale = Vec::new();

        for tok in self.sessions.tokens() {
            if let Some(session) = self.sessions.get(tok) {
                if session.handshake_expired(now) {
                    expired.push(tok);
                } else if session.is_stale(now) {
                    stale.push(session.remote_uuid.clone().unwrap_or_default());
                }
            }
        }

        for tok in expired {
            info!("[{}] reaping session that never finished its handshake", short_uuid(&self.uuid));
            self.discard_session(tok);
        }
        for uuid in stale {
            info!("[{}] peer {} went silent", short_uuid(&self.uuid), short_uuid(&uuid));
            self.peer_lost(&uuid);
        }
    }

    // ------------------------------------------------------------------
    // accepting connections
    // ------------------------------------------------------------------

    fn accept_node_conns(&mut self) {
        loop {
            match self.node_listener.accept() {
                Ok(Some(conn)) => {
                    let id = self.ids.next();
                    if self.poll.register(conn.as_evented(), Token(id),
                                          Ready::readable() | Ready::writable(),
                                          PollOpt::edge()).is_err() {
                        warn!("[{}] could not register control connection", short_uuid(&self.uuid));
                        continue;
                    }
                    self.tokens.insert(id, TokenKind::NodeConn);
                    self.node_conns.insert(id, NodeConn { conn: conn, uuid: None });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[{}] control accept failed: {}", short_uuid(&self.uuid), e);
                    break;
                }
            }
        }
    }

    fn accept_pub_conns(&mut self) {
        match self.xpub.accept(&self.ids) {
            Ok(accepted) => {
                for id in accepted {
                    let registered = match self.xpub.conn_evented(id) {
                        Some(evented) => self.poll.register(evented, Token(id),
                                                            Ready::readable() | Ready::writable(),
                                                            PollOpt::edge()).is_ok(),
                        None => false,
                    };
                    if registered {
                        self.tokens.insert(id, TokenKind::PubConn);
                    } else {
                        let _ = self.xpub.drop_conn(id);
                    }
                }
            }
            Err(e) => warn!("[{}] data accept failed: {}", short_uuid(&self.uuid), e),
        }
    }

    // ------------------------------------------------------------------
    // control plane: accepted connections (the node socket)
    // ------------------------------------------------------------------

    fn node_conn_ready(&mut self, id: usize, readiness: Ready) {
        let mut messages = Vec::new();
        let mut dead = false;

        {
            let entry = match self.node_conns.get_mut(&id) {
                Some(entry) => entry,
                None => return,
            };

            if readiness.is_writable() && entry.conn.flush().is_err() {
                dead = true;
            }

            if readiness.is_readable() && !dead {
                loop {
                    match entry.conn.recv() {
                        Ok(Some(parts)) => messages.push(parts),
                        Ok(None) => break,
                        Err(e) => {
                            debug!("[{}] control connection lost: {}", short_uuid(&self.uuid), e);
                            dead = true;
                            break;
                        }
                    }
                }
            }
        }

        for parts in messages {
            self.on_node_message(id, parts);
        }
        if dead {
            self.drop_node_conn(id);
        }
    }

    /// An envelope from the node socket: `[senderUuid, frame]`.
    fn on_node_message(&mut self, id: usize, parts: Vec<Vec<u8>>) {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        self.stats.meta_rcvd(total);

        if parts.len() != 2 || parts[0].len() != UUID_LEN {
            warn!("[{}] discarding malformed envelope", short_uuid(&self.uuid));
            return;
        }

        let sender = match str::from_utf8(&parts[0]) {
            Ok(sender) => sender.to_string(),
            Err(_) => {
                warn!("[{}] envelope sender is not utf-8", short_uuid(&self.uuid));
                return;
            }
        };

        if let Some(entry) = self.node_conns.get_mut(&id) {
            if entry.uuid.is_none() {
                entry.uuid = Some(sender.clone());
            }
        }

        match wire::decode(&parts[1]) {
            Ok(Decoded::Frame(frame)) => {
                debug!("[{}] {} from {}", short_uuid(&self.uuid), frame.name(), short_uuid(&sender));
                self.on_peer_frame(Some(id), &sender, frame);
            }
            Ok(Decoded::ForeignVersion(version)) => {
                info!("[{}] discarding frame with foreign version {}", short_uuid(&self.uuid), version);
            }
            Err(e) => {
                warn!("[{}] discarding malformed frame: {}", short_uuid(&self.uuid), e);
            }
        }
    }

    fn drop_node_conn(&mut self, id: usize) {
        self.tokens.remove(&id);
        let uuid = match self.node_conns.remove(&id) {
            Some(entry) => entry.uuid,
            None => None,
        };

        // the peer half went away with the connection
        if let Some(uuid) = uuid {
            let mut lost = false;
            if let Some(tok) = self.sessions.token_by_uuid(&uuid) {
                if let Some(session) = self.sessions.get_mut(tok) {
                    if session.connected_from {
                        session.connected_from = false;
                        session.ref_count = session.ref_count.saturating_sub(1);
                    }
                    lost = session.ref_count == 0 && session.socket.is_none();
                }
            }
            if lost {
                self.peer_lost(&uuid);
            }
        }
    }

    // ------------------------------------------------------------------
    // control plane: outbound session sockets
    // ------------------------------------------------------------------

    fn session_ready(&mut self, tok: SessionToken, readiness: Ready) {
        let mut messages = Vec::new();
        let mut dead = false;

        {
            let session = match self.sessions.get_mut(tok) {
                Some(session) => session,
                None => return,
            };
            let socket = match session.socket {
                Some(ref mut socket) => socket,
                None => return,
            };

            if readiness.is_writable() && socket.flush().is_err() {
                dead = true;
            }

            if readiness.is_readable() && !dead {
                loop {
                    match socket.recv() {
                        Ok(Some(parts)) => messages.push(parts),
                        Ok(None) => break,
                        Err(e) => {
                            debug!("[{}] session socket lost: {}", short_uuid(&self.uuid), e);
                            dead = true;
                            break;
                        }
                    }
                }
            }
        }

        for parts in messages {
            self.on_session_message(tok, parts);
        }
        if dead {
            self.drop_session_socket(tok);
        }
    }

    /// Replies on a session socket carry no envelope, just the frame.
    fn on_session_message(&mut self, tok: SessionToken, parts: Vec<Vec<u8>>) {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        self.stats.meta_rcvd(total);

        if parts.len() != 1 {
            warn!("[{}] discarding multi-part session reply", short_uuid(&self.uuid));
            return;
        }

        match wire::decode(&parts[0]) {
            Ok(Decoded::Frame(Frame::ConnectRep { uuid, pubs })) => {
                self.on_connect_rep(tok, uuid, pubs);
            }
            Ok(Decoded::Frame(frame)) => {
                let sender = match self.sessions.get_mut(tok) {
                    Some(session) => {
                        session.touch();
                        session.remote_uuid.clone()
                    }
                    None => None,
                };
                match sender {
                    Some(sender) => self.on_peer_frame(None, &sender, frame),
                    None => debug!("[{}] frame before handshake, ignored", short_uuid(&self.uuid)),
                }
            }
            Ok(Decoded::ForeignVersion(version)) => {
                info!("[{}] discarding frame with foreign version {}", short_uuid(&self.uuid), version);
            }
            Err(e) => {
                warn!("[{}] discarding malformed frame: {}", short_uuid(&self.uuid), e);
            }
        }
    }

    /// The peer behind an outbound session identified itself.
    fn on_connect_rep(&mut self, tok: SessionToken, remote_uuid: String, pubs: Vec<PubInfo>) {
        if remote_uuid == self.uuid && !self.config.allow_local {
            info!("[{}] refusing session to myself", short_uuid(&self.uuid));
            self.discard_session(tok);
            return;
        }

        // a different node answering at this address means the one we knew
        // there is gone
        let previous = self.sessions.get(tok).and_then(|s| s.remote_uuid.clone());
        if let Some(previous) = previous {
            if previous != remote_uuid {
                info!("[{}] address now belongs to {}, dropping {}",
                      short_uuid(&self.uuid), short_uuid(&remote_uuid), short_uuid(&previous));
                self.forget_peer_content(tok);
                self.sessions.unindex_uuid(&previous);
            }
        }

        // merge an earlier half-session for the same peer into this record
        if let Some(other) = self.sessions.token_by_uuid(&remote_uuid) {
            if other != tok {
                self.merge_sessions(other, tok);
            }
        }

        self.sessions.index_uuid(tok, &remote_uuid);

        let mut added = Vec::new();
        if let Some(session) = self.sessions.get_mut(tok) {
            session.touch();
            for info in pubs {
                let stub = PublisherStub::from_info(info, &remote_uuid);
                if session.stub.publisher(&stub.uuid).is_none() {
                    session.stub.add_publisher(stub.clone());
                    added.push(stub);
                }
            }
        }

        for stub in added {
            self.match_remote_publisher(&stub);
        }

        // now the peer gets to hear about our side of the catalog
        let infos = self.local_pub_infos();
        for info in infos {
            let frame = Frame::PubAdded { uuid: self.uuid.clone(), publisher: info };
            self.send_to_session(tok, &frame);
        }
    }

    /// Fold the bare record `from` (inbound or hearsay) into `into`.
    fn merge_sessions(&mut self, from: SessionToken, into: SessionToken) {
        let folded = match self.sessions.remove(from) {
            Some(folded) => folded,
            None => return,
        };

        if let Some(id) = folded.token_id {
            self.tokens.remove(&id);
        }

        if let Some(session) = self.sessions.get_mut(into) {
            session.connected_from |= folded.connected_from;
            session.ref_count += folded.ref_count;
            if session.remote_ip.is_none() {
                session.remote_ip = folded.remote_ip;
            }
            for (_, stub) in folded.stub.publishers().clone() {
                session.stub.add_publisher(stub);
            }
            for (_, stub) in folded.stub.subscribers().clone() {
                session.stub.add_subscriber(stub);
            }
        }
    }

    fn drop_session_socket(&mut self, tok: SessionToken) {
        if let Some(session) = self.sessions.get_mut(tok) {
            if let Some(id) = session.token_id.take() {
                self.tokens.remove(&id);
            }
            session.socket = None;
            session.connected_to = false;
        }
    }

    // ------------------------------------------------------------------
    // frames from identified peers
    // ------------------------------------------------------------------

    /// `conn_id` names the accepted connection a reply can go back on; frames
    /// arriving on a session socket have none.
    fn on_peer_frame(&mut self, conn_id: Option<usize>, sender: &str, frame: Frame) {
        // only first contact may introduce an unknown peer
        let known = self.sessions.token_by_uuid(sender).is_some();
        let first_contact = match frame {
            Frame::ConnectReq | Frame::PubAdded { .. } => true,
            _ => false,
        };
        if !known && !first_contact {
            debug!("[{}] ignoring {} from unknown peer {}",
                   short_uuid(&self.uuid), frame.name(), short_uuid(sender));
            return;
        }

        if let Some(tok) = self.sessions.token_by_uuid(sender) {
            if let Some(session) = self.sessions.get_mut(tok) {
                session.touch();
            }
        }

        match frame {
            Frame::ConnectReq => self.on_connect_req(conn_id, sender),
            Frame::PubAdded { publisher, .. } => self.on_pub_added(conn_id, sender, publisher),
            Frame::PubRemoved { publisher, .. } => self.on_pub_removed(sender, &publisher.uuid),
            Frame::Subscribe { subscriber, publisher } => {
                self.on_subscribe(sender, subscriber, publisher);
            }
            Frame::Unsubscribe { subscriber, .. } => {
                self.remove_subscription(&subscriber.uuid);
            }
            Frame::Shutdown { .. } => self.peer_lost(sender),
            Frame::NodeInfo { pubs, .. } => self.on_node_info(conn_id, sender, pubs),
            Frame::Debug => self.on_debug(conn_id),
            Frame::ConnectRep { .. } => {
                debug!("[{}] unexpected CONNECT_REP on node socket", short_uuid(&self.uuid));
            }
        }
    }

    fn on_connect_req(&mut self, conn_id: Option<usize>, sender: &str) {
        if sender == self.uuid && !self.config.allow_local {
            info!("[{}] refusing connect from myself", short_uuid(&self.uuid));
            return;
        }

        let peer_ip = conn_id.and_then(|id| self.conn_peer_ip(id));

        match self.sessions.token_by_uuid(sender) {
            Some(tok) => {
                if let Some(session) = self.sessions.get_mut(tok) {
                    if !session.connected_from {
                        session.connected_from = true;
                        session.ref_count += 1;
                    }
                    if session.remote_ip.is_none() {
                        session.remote_ip = peer_ip;
                    }
                    session.touch();
                }
            }
            None => {
                self.sessions.insert(Session::inbound(sender, peer_ip));
            }
        }

        let reply = Frame::ConnectRep {
            uuid: self.uuid.clone(),
            pubs: self.local_pub_infos(),
        };
        if let Some(id) = conn_id {
            self.send_to_conn(id, &reply);
        }
    }

    fn on_pub_added(&mut self, conn_id: Option<usize>, sender: &str, info: PubInfo) {
        let peer_ip = conn_id.and_then(|id| self.conn_peer_ip(id));

        let tok = match self.sessions.token_by_uuid(sender) {
            Some(tok) => tok,
            None => {
                // hearsay peer, keep its catalog until a proper handshake
                self.sessions.insert(Session::first_contact(sender, peer_ip))
            }
        };

        let stub = PublisherStub::from_info(info, sender);
        let new = match self.sessions.get_mut(tok) {
            Some(session) => {
                if session.remote_ip.is_none() {
                    session.remote_ip = peer_ip;
                }
                session.stub.publisher(&stub.uuid).is_none()
                    && session.stub.add_publisher(stub.clone()).is_none()
            }
            None => false,
        };

        if new {
            info!("[{}] publisher on '{}' appeared at {}",
                  short_uuid(&self.uuid), stub.channel, short_uuid(sender));
            self.match_remote_publisher(&stub);
        }
    }

    fn on_pub_removed(&mut self, sender: &str, pub_uuid: &str) {
        let removed = match self.sessions.token_by_uuid(sender) {
            Some(tok) => match self.sessions.get_mut(tok) {
                Some(session) => session.stub.remove_publisher(pub_uuid),
                None => None,
            },
            None => None,
        };

        if let Some(stub) = removed {
            info!("[{}] publisher on '{}' left {}",
                  short_uuid(&self.uuid), stub.channel, short_uuid(sender));
            for sub in self.subs.values() {
                if sub.matches(&stub.channel) {
                    sub.detach(&stub.uuid, sender);
                }
            }
        }
    }

    /// Control-plane phase of the subscription handshake.
    fn on_subscribe(&mut self, sender: &str, subscriber: wire::SubInfo, publisher: PubInfo) {
        if sender == self.uuid && !self.config.allow_local {
            warn!("[{}] refusing subscription from myself", short_uuid(&self.uuid));
            return;
        }

        if !self.pubs.contains_key(&publisher.uuid) {
            warn!("[{}] subscription to unknown publisher", short_uuid(&self.uuid));
            return;
        }

        let stub = SubscriberStub::from_info(subscriber, sender);
        let needs_data_plane = stub.impl_type == IMPL_TCP_PUBSUB;
        let sub_uuid = stub.uuid.clone();
        let ready = self.recon.on_subscribe(stub, &publisher.uuid, needs_data_plane);

        self.confirm_pairs(&sub_uuid, ready);
    }

    /// Both phases hold for these publishers: fire the greeters and attach
    /// the subscriber stub to its node's catalog.
    fn confirm_pairs(&mut self, sub_uuid: &str, pub_uuids: Vec<String>) {
        if pub_uuids.is_empty() {
            return;
        }

        let (stub, node) = match self.recon.get(sub_uuid) {
            Some(record) => (record.stub.clone(), record.node.clone()),
            None => return,
        };

        for pub_uuid in pub_uuids {
            if let Some(publisher) = self.pubs.get(&pub_uuid) {
                publisher.confirm_subscriber(&stub);
            }
        }

        if let Some(tok) = self.sessions.token_by_uuid(&node) {
            if let Some(session) = self.sessions.get_mut(tok) {
                session.stub.add_subscriber(stub);
            }
        }
    }

    /// UNSUBSCRIBE, or the subscriber's data connection went away.
    fn remove_subscription(&mut self, sub_uuid: &str) {
        let record = match self.recon.on_unsubscribe(sub_uuid) {
            Some(record) => record,
            None => return,
        };

        for pub_uuid in &record.confirmed {
            if let Some(publisher) = self.pubs.get(pub_uuid) {
                publisher.drop_subscriber(sub_uuid);
            }
        }

        if let Some(tok) = self.sessions.token_by_uuid(&record.node) {
            if let Some(session) = self.sessions.get_mut(tok) {
                session.stub.remove_subscriber(sub_uuid);
            }
        }
    }

    fn on_node_info(&mut self, conn_id: Option<usize>, sender: &str, pubs: Vec<PubInfo>) {
        let peer_ip = conn_id.and_then(|id| self.conn_peer_ip(id));
        let tok = match self.sessions.token_by_uuid(sender) {
            Some(tok) => tok,
            None => return,
        };

        let mut added = Vec::new();
        let mut removed = Vec::new();

        if let Some(session) = self.sessions.get_mut(tok) {
            session.touch();
            if session.remote_ip.is_none() {
                session.remote_ip = peer_ip;
            }

            let advertised: HashSet<&String> = pubs.iter().map(|p| &p.uuid).collect();
            let vanished: Vec<String> = session.stub.publishers().keys()
                .filter(|uuid| !advertised.contains(uuid))
                .cloned()
                .collect();
            for uuid in vanished {
                if let Some(stub) = session.stub.remove_publisher(&uuid) {
                    removed.push(stub);
                }
            }

            for info in pubs {
                let stub = PublisherStub::from_info(info, sender);
                if session.stub.publisher(&stub.uuid).is_none() {
                    session.stub.add_publisher(stub.clone());
                    added.push(stub);
                }
            }
        }

        for stub in removed {
            for sub in self.subs.values() {
                if sub.matches(&stub.channel) {
                    sub.detach(&stub.uuid, sender);
                }
            }
        }
        for stub in added {
            self.match_remote_publisher(&stub);
        }
    }

    fn on_debug(&mut self, conn_id: Option<usize>) {
        let lines = self.debug_lines();

        if let Some(id) = conn_id {
            let parts: Vec<Vec<u8>> = lines.into_iter().map(|l| l.into_bytes()).collect();
            let total: usize = parts.iter().map(|p| p.len()).sum();
            let mut sent = false;
            if let Some(entry) = self.node_conns.get_mut(&id) {
                sent = entry.conn.send(parts).is_ok();
            }
            if sent {
                self.stats.meta_sent(total);
            }
        }
    }

    // ------------------------------------------------------------------
    // data plane
    // ------------------------------------------------------------------

    fn drain_ingress(&mut self) {
        while let Ok(parts) = self.ingress_rx.try_recv() {
            if parts.is_empty() {
                continue;
            }
            let channel = String::from_utf8_lossy(&parts[0]).into_owned();
            let bytes: usize = parts.iter().map(|p| p.len()).sum();
            self.stats.data_rcvd(&channel, bytes);

            let (sent, events) = self.xpub.broadcast(&parts);
            for _ in 0..sent {
                self.stats.data_sent(&channel, bytes);
            }
            self.apply_sub_events(events);
        }
    }

    fn pub_conn_ready(&mut self, id: usize, readiness: Ready) {
        let mut events = Vec::new();

        if readiness.is_writable() {
            events.extend(self.xpub.handle_writable(id));
        }
        if readiness.is_readable() {
            events.extend(self.xpub.handle_readable(id));
        }

        if self.xpub.conn_evented(id).is_none() {
            self.tokens.remove(&id);
        }

        self.apply_sub_events(events);
    }

    /// Subscription hints from the data plane. Tilde topics carry subscriber
    /// identities and drive the second confirmation phase.
    fn apply_sub_events(&mut self, events: Vec<SubEvent>) {
        for event in events {
            match event {
                SubEvent::Subscribe(topic) => {
                    if let Some(sub_uuid) = tilde_uuid(&topic) {
                        let ready = self.recon.on_data_plane_subscribe(&sub_uuid);
                        self.confirm_pairs(&sub_uuid, ready);
                    }
                }
                SubEvent::Unsubscribe(topic) => {
                    if let Some(sub_uuid) = tilde_uuid(&topic) {
                        self.remove_subscription(&sub_uuid);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // commands from the facade
    // ------------------------------------------------------------------

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            trace!("[{}] command {}", short_uuid(&self.uuid), cmd.name());
            match cmd {
                NodeCmd::AddPublisher(publisher) => self.add_publisher(publisher),
                NodeCmd::RemovePublisher(publisher) => self.remove_publisher(&publisher),
                NodeCmd::AddSubscriber(subscriber) => self.add_subscriber(subscriber),
                NodeCmd::RemoveSubscriber(subscriber) => self.remove_subscriber(&subscriber),
                NodeCmd::Connect(endpoint) => self.connect(endpoint),
                NodeCmd::Disconnect(endpoint) => self.disconnect(&endpoint),
                NodeCmd::Suspend => self.suspend(),
                NodeCmd::Resume => self.resume(),
                NodeCmd::Shutdown => self.shutdown(),
                NodeCmd::DebugDump(reply) => {
                    let _ = reply.send(self.debug_lines());
                }
                NodeCmd::Query(query) => self.answer_query(query),
            }
        }
    }

    fn add_publisher(&mut self, publisher: Publisher) {
        if self.pubs.contains_key(publisher.uuid()) {
            warn!("[{}] publisher for '{}' already added",
                  short_uuid(&self.uuid), publisher.channel());
            return;
        }

        publisher.attach_node(&self.uuid, self.ingress_tx.clone());

        let frame = Frame::PubAdded {
            uuid: self.uuid.clone(),
            publisher: publisher.to_info(self.pub_port),
        };
        self.broadcast_frame(&frame);

        self.pubs.insert(publisher.uuid().to_string(), publisher);
    }

    fn remove_publisher(&mut self, publisher: &Publisher) {
        let publisher = match self.pubs.remove(publisher.uuid()) {
            Some(publisher) => publisher,
            None => {
                warn!("[{}] publisher for '{}' was never added",
                      short_uuid(&self.uuid), publisher.channel());
                return;
            }
        };

        let frame = Frame::PubRemoved {
            uuid: self.uuid.clone(),
            publisher: publisher.to_info(self.pub_port),
        };
        self.broadcast_frame(&frame);

        for stub in self.recon.prune_publisher(publisher.uuid()) {
            publisher.drop_subscriber(&stub.uuid);
        }

        publisher.detach_node(&self.uuid);
    }

    fn add_subscriber(&mut self, subscriber: Subscriber) {
        if self.subs.contains_key(subscriber.uuid()) {
            warn!("[{}] subscriber for '{}' already added",
                  short_uuid(&self.uuid), subscriber.channel());
            return;
        }

        // snapshot: (session token, node uuid, ip, matching stubs)
        let mut matches = Vec::new();
        for tok in self.sessions.tokens() {
            if let Some(session) = self.sessions.get(tok) {
                let node = match session.remote_uuid {
                    Some(ref node) => node.clone(),
                    None => continue,
                };
                for stub in session.stub.publishers().values() {
                    if subscriber.matches(&stub.channel) {
                        matches.push((tok, node.clone(), session.remote_ip, stub.clone()));
                    }
                }
            }
        }

        for (tok, _, ip, stub) in matches {
            if let Some(ip) = ip {
                subscriber.attach(&stub, ip);
            }
            let frame = Frame::Subscribe {
                subscriber: subscriber.to_info(),
                publisher: stub.to_info(),
            };
            self.send_to_session(tok, &frame);
        }

        self.subs.insert(subscriber.uuid().to_string(), subscriber);
    }

    fn remove_subscriber(&mut self, subscriber: &Subscriber) {
        let subscriber = match self.subs.remove(subscriber.uuid()) {
            Some(subscriber) => subscriber,
            None => {
                warn!("[{}] subscriber for '{}' was never added",
                      short_uuid(&self.uuid), subscriber.channel());
                return;
            }
        };

        let mut goodbyes = Vec::new();
        for tok in self.sessions.tokens() {
            if let Some(session) = self.sessions.get(tok) {
                for stub in session.stub.publishers().values() {
                    if subscriber.matches(&stub.channel) {
                        goodbyes.push((tok, stub.to_info()));
                    }
                }
            }
        }

        for (tok, info) in goodbyes {
            let frame = Frame::Unsubscribe {
                subscriber: subscriber.to_info(),
                publisher: info,
            };
            self.send_to_session(tok, &frame);
        }

        subscriber.detach_all();
    }

    fn connect(&mut self, endpoint: EndPoint) {
        if self.suspended {
            debug!("[{}] suspended, endpoint {} ignored", short_uuid(&self.uuid), endpoint);
            return;
        }

        if let Some(tok) = self.sessions.token_by_addr(&endpoint) {
            if let Some(session) = self.sessions.get_mut(tok) {
                session.ref_count += 1;
            }
            return;
        }

        let transport = match create_transport(endpoint.transport()) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("[{}] cannot reach {}: {}", short_uuid(&self.uuid), endpoint, e);
                return;
            }
        };

        let mut conn = match transport.connect(&endpoint.socket_addr()) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[{}] connect to {} failed: {}", short_uuid(&self.uuid), endpoint, e);
                return;
            }
        };

        let envelope = vec![self.uuid.clone().into_bytes(), wire::encode(&Frame::ConnectReq)];
        let bytes: usize = envelope.iter().map(|p| p.len()).sum();
        if let Err(e) = conn.send(envelope) {
            warn!("[{}] handshake to {} failed: {}", short_uuid(&self.uuid), endpoint, e);
            return;
        }
        self.stats.meta_sent(bytes);

        let id = self.ids.next();
        if self.poll.register(conn.as_evented(), Token(id),
                              Ready::readable() | Ready::writable(),
                              PollOpt::edge()).is_err() {
            warn!("[{}] could not register session socket", short_uuid(&self.uuid));
            return;
        }

        let tok = self.sessions.insert(Session::outbound(endpoint, conn, id));
        self.tokens.insert(id, TokenKind::Session(tok));
    }

    fn disconnect(&mut self, endpoint: &EndPoint) {
        let tok = match self.sessions.token_by_addr(endpoint) {
            Some(tok) => tok,
            None => {
                debug!("[{}] endpoint {} was never added", short_uuid(&self.uuid), endpoint);
                return;
            }
        };

        let (teardown, forget, uuid) = match self.sessions.get_mut(tok) {
            Some(session) => {
                if session.ref_count > 0 {
                    session.ref_count -= 1;
                } else {
                    warn!("[{}] endpoint released more often than added", short_uuid(&self.uuid));
                }
                let inbound_refs = if session.connected_from { 1 } else { 0 };
                let teardown = session.ref_count <= inbound_refs;
                (teardown, session.ref_count == 0, session.remote_uuid.clone())
            }
            None => return,
        };

        if !teardown {
            return;
        }

        if forget {
            match uuid {
                Some(ref uuid) => self.peer_lost(uuid),
                None => self.discard_session(tok),
            }
        } else {
            // the peer still talks to us, only our outbound half goes away
            self.drop_session_socket(tok);
            if let Some(session) = self.sessions.get_mut(tok) {
                session.connected_to = false;
            }
            self.sessions.unindex_addr(endpoint);
        }
    }

    fn suspend(&mut self) {
        if self.suspended {
            return;
        }
        info!("[{}] suspending", short_uuid(&self.uuid));

        let parked: Vec<Publisher> = self.pubs.values().cloned().collect();
        for publisher in &parked {
            self.remove_publisher(publisher);
        }
        self.parked_pubs = parked;

        let goodbye = Frame::Shutdown { uuid: self.uuid.clone() };
        self.broadcast_frame(&goodbye);

        let uuids: Vec<String> = self.sessions.iter()
            .filter_map(|s| s.remote_uuid.clone())
            .collect();
        for uuid in uuids {
            self.peer_lost(&uuid);
        }
        for tok in self.sessions.tokens() {
            self.discard_session(tok);
        }

        let conn_ids: Vec<usize> = self.node_conns.keys().cloned().collect();
        for id in conn_ids {
            self.tokens.remove(&id);
            self.node_conns.remove(&id);
        }
        for id in self.xpub.conn_ids() {
            self.tokens.remove(&id);
            let _ = self.xpub.drop_conn(id);
        }

        self.suspended = true;
    }

    fn resume(&mut self) {
        if !self.suspended {
            return;
        }
        info!("[{}] resuming", short_uuid(&self.uuid));

        self.suspended = false;
        let parked = ::std::mem::replace(&mut self.parked_pubs, Vec::new());
        for publisher in parked {
            self.add_publisher(publisher);
        }
        // discovery re-injects the peers
    }

    fn shutdown(&mut self) {
        info!("[{}] shutting down", short_uuid(&self.uuid));

        let goodbye = Frame::Shutdown { uuid: self.uuid.clone() };
        self.broadcast_frame(&goodbye);

        for publisher in self.pubs.values() {
            publisher.detach_node(&self.uuid);
        }
        for subscriber in self.subs.values() {
            subscriber.detach_all();
        }

        self.running = false;
    }

    fn answer_query(&mut self, query: NodeQuery) {
        match query {
            NodeQuery::ConnectedTo(uuid, reply) => {
                let connected = self.sessions.token_by_uuid(&uuid)
                    .and_then(|tok| self.sessions.get(tok))
                    .map_or(false, |s| s.connected_to);
                let _ = reply.send(connected);
            }
            NodeQuery::ConnectedFrom(uuid, reply) => {
                let connected = self.sessions.token_by_uuid(&uuid)
                    .and_then(|tok| self.sessions.get(tok))
                    .map_or(false, |s| s.connected_from);
                let _ = reply.send(connected);
            }
            NodeQuery::SessionCount(reply) => {
                let _ = reply.send(self.sessions.len());
            }
            NodeQuery::SocketCount(reply) => {
                let session_sockets = self.sessions.iter().filter(|s| s.socket.is_some()).count();
                let count = session_sockets + self.node_conns.len() + self.xpub.conn_count();
                let _ = reply.send(count);
            }
        }
    }

    // ------------------------------------------------------------------
    // plumbing
    // ------------------------------------------------------------------

    fn local_pub_infos(&self) -> Vec<PubInfo> {
        self.pubs.values().map(|p| p.to_info(self.pub_port)).collect()
    }

    fn conn_peer_ip(&self, id: usize) -> Option<IpAddr> {
        self.node_conns.get(&id)
            .and_then(|entry| entry.conn.peer_addr().ok())
            .map(|addr| addr.ip())
    }

    /// A remote publisher is news: wire it to every matching local subscriber
    /// and tell its node we want in.
    fn match_remote_publisher(&mut self, stub: &PublisherStub) {
        let (tok, ip, has_socket) = match self.sessions.token_by_uuid(&stub.node) {
            Some(tok) => match self.sessions.get(tok) {
                Some(session) => (tok, session.remote_ip, session.socket.is_some()),
                None => return,
            },
            None => return,
        };

        let mut frames = Vec::new();
        for subscriber in self.subs.values() {
            if !subscriber.matches(&stub.channel) {
                continue;
            }
            if let Some(ip) = ip {
                subscriber.attach(stub, ip);
            }
            if has_socket {
                frames.push(Frame::Subscribe {
                    subscriber: subscriber.to_info(),
                    publisher: stub.to_info(),
                });
            }
        }

        for frame in frames {
            self.send_to_session(tok, &frame);
        }
    }

    /// Local subscribers lose every publisher of this peer, its subscriptions
    /// to our publishers end in farewells, and both session keys vanish.
    fn peer_lost(&mut self, uuid: &str) {
        let tok = match self.sessions.token_by_uuid(uuid) {
            Some(tok) => tok,
            None => return,
        };

        self.forget_peer_content(tok);
        self.discard_session(tok);

        // accepted connections of that peer die with it
        let ids: Vec<usize> = self.node_conns.iter()
            .filter(|&(_, entry)| entry.uuid.as_ref().map_or(false, |u| u == uuid))
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            self.tokens.remove(&id);
            self.node_conns.remove(&id);
        }
    }

    /// Unwind what we learned from the peer without touching the session slot.
    fn forget_peer_content(&mut self, tok: SessionToken) {
        let (uuid, stubs) = match self.sessions.get_mut(tok) {
            Some(session) => {
                let uuid = match session.remote_uuid {
                    Some(ref uuid) => uuid.clone(),
                    None => return,
                };
                let stubs: Vec<PublisherStub> = session.stub.publishers().values().cloned().collect();
                session.stub = ::stub::NodeStub::new(&uuid);
                (uuid, stubs)
            }
            None => return,
        };

        for stub in stubs {
            for subscriber in self.subs.values() {
                if subscriber.matches(&stub.channel) {
                    subscriber.detach(&stub.uuid, &uuid);
                }
            }
        }
        for subscriber in self.subs.values() {
            subscriber.detach_node(&uuid);
        }

        for record in self.recon.remove_node(&uuid) {
            for pub_uuid in &record.confirmed {
                if let Some(publisher) = self.pubs.get(pub_uuid) {
                    publisher.drop_subscriber(&record.stub.uuid);
                }
            }
        }
    }

    /// Drop the slot and its socket without any peer-loss notifications.
    fn discard_session(&mut self, tok: SessionToken) {
        if let Some(session) = self.sessions.remove(tok) {
            if let Some(id) = session.token_id {
                self.tokens.remove(&id);
            }
        }
    }

    /// Control frame to every established peer, whichever half is up:
    /// the outbound session socket, or the connection the peer opened to us.
    fn broadcast_frame(&mut self, frame: &Frame) {
        let payload = wire::encode(frame);

        let mut reached: HashSet<String> = HashSet::new();
        for tok in self.sessions.tokens() {
            let mut sent = 0;
            if let Some(session) = self.sessions.get_mut(tok) {
                if let Some(ref mut socket) = session.socket {
                    let envelope = vec![self.uuid.clone().into_bytes(), payload.clone()];
                    let bytes: usize = envelope.iter().map(|p| p.len()).sum();
                    match socket.send(envelope) {
                        Ok(()) => sent = bytes,
                        Err(e) => debug!("[{}] send failed, frame dropped: {}",
                                         short_uuid(&self.uuid), e),
                    }
                    if let Some(ref uuid) = session.remote_uuid {
                        reached.insert(uuid.clone());
                    }
                }
            }
            if sent > 0 {
                self.stats.meta_sent(sent);
            }
        }

        let conn_ids: Vec<usize> = self.node_conns.iter()
            .filter(|&(_, entry)| {
                entry.uuid.as_ref().map_or(false, |uuid| !reached.contains(uuid))
            })
            .map(|(&id, _)| id)
            .collect();
        for id in conn_ids {
            self.send_to_conn(id, frame);
        }
    }

    fn send_to_session(&mut self, tok: SessionToken, frame: &Frame) {
        let envelope = vec![self.uuid.clone().into_bytes(), wire::encode(frame)];
        let bytes: usize = envelope.iter().map(|p| p.len()).sum();
        let mut sent = false;

        if let Some(session) = self.sessions.get_mut(tok) {
            if let Some(ref mut socket) = session.socket {
                match socket.send(envelope) {
                    Ok(()) => sent = true,
                    Err(e) => debug!("[{}] send failed, frame dropped: {}",
                                     short_uuid(&self.uuid), e),
                }
            }
        }

        if sent {
            self.stats.meta_sent(bytes);
        }
    }

    /// Reply on an accepted connection, no envelope.
    fn send_to_conn(&mut self, id: usize, frame: &Frame) {
        let payload = wire::encode(frame);
        let bytes = payload.len();
        let mut sent = false;

        if let Some(entry) = self.node_conns.get_mut(&id) {
            match entry.conn.send(vec![payload]) {
                Ok(()) => sent = true,
                Err(e) => debug!("[{}] reply failed, frame dropped: {}",
                                 short_uuid(&self.uuid), e),
            }
        }

        if sent {
            self.stats.meta_sent(bytes);
        }
    }

    // ------------------------------------------------------------------
    // diagnostics
    // ------------------------------------------------------------------

    fn debug_lines(&mut self) -> Vec<String> {
        let now = Instant::now();
        let rates = self.stats.rates(now);
        let mut lines = Vec::new();

        lines.push(format!("node: {}", self.uuid));
        lines.push(format!("os: {}", ::std::env::consts::OS));
        lines.push(format!("process: {}", process_uuid()));
        lines.push(format!("now: {}", time::get_time().sec));
        lines.push(format!("meta sent: {:.1} msg/s {:.1} B/s", rates.meta_msgs_sent, rates.meta_bytes_sent));
        lines.push(format!("meta rcvd: {:.1} msg/s {:.1} B/s", rates.meta_msgs_rcvd, rates.meta_bytes_rcvd));
        for (channel, msgs) in &rates.chan_msgs {
            let bytes = rates.chan_bytes.get(channel).cloned().unwrap_or(0.0);
            lines.push(format!("channel {}: {:.1} msg/s {:.1} B/s", channel, msgs, bytes));
        }

        for publisher in self.pubs.values() {
            lines.push(format!("publisher {} channel {}", publisher.uuid(), publisher.channel()));
            for stub in publisher.confirmed_stubs() {
                lines.push(format!("  subscriber {} node {}", stub.uuid, short_uuid(&stub.node)));
            }
        }

        for subscriber in self.subs.values() {
            lines.push(format!("subscriber {} channel {}", subscriber.uuid(), subscriber.channel()));
            for session in self.sessions.iter() {
                for stub in session.stub.publishers().values() {
                    if subscriber.matches(&stub.channel) {
                        lines.push(format!("  matched publisher {} channel {} node {}",
                                           stub.uuid, stub.channel, short_uuid(&stub.node)));
                    }
                }
            }
        }

        for session in self.sessions.iter() {
            let uuid = session.remote_uuid.clone().unwrap_or_else(|| "?".to_string());
            let addr = session.remote_addr.as_ref()
                .map(|a| format!("{}", a))
                .unwrap_or_else(|| "?".to_string());
            lines.push(format!(
                "session {} at {} to={} from={} refs={} pubs={} subs={}",
                short_uuid(&uuid), addr, session.connected_to, session.connected_from,
                session.ref_count, session.stub.publishers().len(), session.stub.subscribers().len()));
            for stub in session.stub.publishers().values() {
                lines.push(format!("  remote publisher {} channel {} port {}",
                                   stub.uuid, stub.channel, stub.port));
            }
        }

        lines
    }
}

/// Subscriber uuid inside a `~uuid` data-plane topic, when it has the shape.
fn tilde_uuid(topic: &[u8]) -> Option<String> {
    if topic.len() != UUID_LEN + 1 || topic[0] != b'~' {
        return None;
    }
    str::from_utf8(&topic[1..]).ok().map(|s| s.to_string())
}
