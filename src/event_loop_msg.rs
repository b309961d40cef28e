// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::sync::mpsc;

use endpoint::EndPoint;
use pubsub::{Publisher, Subscriber};

/// Work the public API enqueues for the event loop.
///
/// The command channel is registered with the poll like any other socket, so
/// every state transition runs on the loop thread and the API never touches
/// catalogs directly.
pub enum NodeCmd {
    AddPublisher(Publisher),
    RemovePublisher(Publisher),
    AddSubscriber(Subscriber),
    RemoveSubscriber(Subscriber),
    /// Discovery saw a peer at this endpoint.
    Connect(EndPoint),
    /// Discovery lost the peer at this endpoint.
    Disconnect(EndPoint),
    Suspend,
    Resume,
    Shutdown,
    /// Human-readable state dump, same content as the wire DEBUG reply.
    DebugDump(mpsc::Sender<Vec<String>>),
    Query(NodeQuery),
}

impl NodeCmd {
    pub fn name(&self) -> &'static str {
        match *self {
            NodeCmd::AddPublisher(_) => "AddPublisher",
            NodeCmd::RemovePublisher(_) => "RemovePublisher",
            NodeCmd::AddSubscriber(_) => "AddSubscriber",
            NodeCmd::RemoveSubscriber(_) => "RemoveSubscriber",
            NodeCmd::Connect(_) => "Connect",
            NodeCmd::Disconnect(_) => "Disconnect",
            NodeCmd::Suspend => "Suspend",
            NodeCmd::Resume => "Resume",
            NodeCmd::Shutdown => "Shutdown",
            NodeCmd::DebugDump(_) => "DebugDump",
            NodeCmd::Query(_) => "Query",
        }
    }
}

/// Read-only snapshots answered over a reply channel, the narrow window the
/// API is allowed to peek through.
pub enum NodeQuery {
    ConnectedTo(String, mpsc::Sender<bool>),
    ConnectedFrom(String, mpsc::Sender<bool>),
    SessionCount(mpsc::Sender<usize>),
    /// Open sockets owned by the loop, for leak accounting.
    SocketCount(mpsc::Sender<usize>),
}

impl NodeQuery {
    pub fn name(&self) -> &'static str {
        match *self {
            NodeQuery::ConnectedTo(..) => "ConnectedTo",
            NodeQuery::ConnectedFrom(..) => "ConnectedFrom",
            NodeQuery::SessionCount(..) => "SessionCount",
            NodeQuery::SocketCount(..) => "SocketCount",
        }
    }
}
