// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use mio_extras::channel::Sender;

use config::NodeConfig;
use endpoint::EndPoint;
use event_loop_msg::{NodeCmd, NodeQuery};
use global::{new_uuid, short_uuid};
use node_impl::NodeImpl;
use pubsub::{Publisher, Subscriber};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// A pub/sub endpoint on the mesh.
///
/// The node owns a dedicated event-loop thread; every method here only
/// enqueues a command for it and returns. Network trouble never surfaces
/// through this API, only socket creation at construction time can fail.
pub struct Node {
    uuid: String,
    node_port: u16,
    pub_port: u16,
    cmd_tx: Sender<NodeCmd>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Node {
    pub fn new() -> io::Result<Node> {
        Node::with_config(NodeConfig::default())
    }

    pub fn with_config(config: NodeConfig) -> io::Result<Node> {
        let uuid = new_uuid();
        let (cmd_tx, cmd_rx) = ::mio_extras::channel::channel();
        let backend = NodeImpl::new(uuid.clone(), config, cmd_rx)?;
        let node_port = backend.node_port();
        let pub_port = backend.pub_port();

        let thread = thread::Builder::new()
            .name(format!("meshbus-node-{}", short_uuid(&uuid)))
            .spawn(move || backend.run())?;

        info!("node {} listening on port {}", short_uuid(&uuid), node_port);

        Ok(Node {
            uuid: uuid,
            node_port: node_port,
            pub_port: pub_port,
            cmd_tx: cmd_tx,
            thread: Some(thread),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Control-plane port peers dial.
    pub fn node_port(&self) -> u16 {
        self.node_port
    }

    /// Data-plane port subscribers dial.
    pub fn pub_port(&self) -> u16 {
        self.pub_port
    }

    /// The loopback endpoint of this node, handy when tests play discovery.
    pub fn endpoint(&self) -> EndPoint {
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        EndPoint::new("tcp", ip, self.node_port).expect("node port is always valid")
    }

    pub fn add_publisher(&self, publisher: &Publisher) {
        self.send_cmd(NodeCmd::AddPublisher(publisher.clone()));
    }

    pub fn remove_publisher(&self, publisher: &Publisher) {
        self.send_cmd(NodeCmd::RemovePublisher(publisher.clone()));
    }

    pub fn add_subscriber(&self, subscriber: &Subscriber) {
        self.send_cmd(NodeCmd::AddSubscriber(subscriber.clone()));
    }

    pub fn remove_subscriber(&self, subscriber: &Subscriber) {
        self.send_cmd(NodeCmd::RemoveSubscriber(subscriber.clone()));
    }

    /// Open (or reference) a session towards a peer endpoint.
    pub fn add_endpoint(&self, endpoint: EndPoint) {
        self.send_cmd(NodeCmd::Connect(endpoint));
    }

    /// Drop one reference to the peer endpoint, closing the session with the last.
    pub fn remove_endpoint(&self, endpoint: EndPoint) {
        self.send_cmd(NodeCmd::Disconnect(endpoint));
    }

    /// Discovery contract: a peer appeared. Safe to call from any thread.
    pub fn added(&self, endpoint: EndPoint) {
        self.add_endpoint(endpoint);
    }

    /// Discovery contract: a peer vanished.
    pub fn removed(&self, endpoint: EndPoint) {
        self.remove_endpoint(endpoint);
    }

    /// Discovery contract: a peer changed. Nothing to do, sessions re-key on
    /// their own when the handshake names a different node.
    pub fn changed(&self, endpoint: EndPoint) {
        debug!("endpoint {} changed", endpoint);
    }

    /// Detach publishers and sessions but keep them parked for [resume](#method.resume).
    pub fn suspend(&self) {
        self.send_cmd(NodeCmd::Suspend);
    }

    pub fn resume(&self) {
        self.send_cmd(NodeCmd::Resume);
    }

    /// Did this node open a session to `uuid`?
    pub fn connected_to(&self, uuid: &str) -> bool {
        let (tx, rx) = mpsc::channel();
        self.send_cmd(NodeCmd::Query(NodeQuery::ConnectedTo(uuid.to_string(), tx)));
        rx.recv_timeout(QUERY_TIMEOUT).unwrap_or(false)
    }

    /// Did `uuid` open a session to this node?
    pub fn connected_from(&self, uuid: &str) -> bool {
        let (tx, rx) = mpsc::channel();
        self.send_cmd(NodeCmd::Query(NodeQuery::ConnectedFrom(uuid.to_string(), tx)));
        rx.recv_timeout(QUERY_TIMEOUT).unwrap_or(false)
    }

    pub fn session_count(&self) -> usize {
        let (tx, rx) = mpsc::channel();
        self.send_cmd(NodeCmd::Query(NodeQuery::SessionCount(tx)));
        rx.recv_timeout(QUERY_TIMEOUT).unwrap_or(0)
    }

    /// Sockets currently owned by the loop, sessions and accepted connections
    /// included. Meant for leak accounting in tests and diagnostics.
    pub fn socket_count(&self) -> usize {
        let (tx, rx) = mpsc::channel();
        self.send_cmd(NodeCmd::Query(NodeQuery::SocketCount(tx)));
        rx.recv_timeout(QUERY_TIMEOUT).unwrap_or(0)
    }

    /// The same key/value report a wire DEBUG request produces.
    pub fn debug_dump(&self) -> Vec<String> {
        let (tx, rx) = mpsc::channel();
        self.send_cmd(NodeCmd::DebugDump(tx));
        rx.recv_timeout(QUERY_TIMEOUT).unwrap_or_else(|_| Vec::new())
    }

    /// Tell every peer goodbye, close all sockets and stop the loop thread.
    /// Returns once the thread is gone; safe to call twice.
    pub fn shutdown(&mut self) {
        self.send_cmd(NodeCmd::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn send_cmd(&self, cmd: NodeCmd) {
        let name = cmd.name();
        if self.cmd_tx.send(cmd).is_err() {
            warn!("node {} loop is gone, {} dropped", short_uuid(&self.uuid), name);
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}
