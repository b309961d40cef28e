// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::collections::HashMap;

use endpoint::EndPoint;
use wire::{PubInfo, SubInfo};

/// Data-plane implementation tag of the built-in tcp exchange transport.
/// Other tags are forwarded opaquely for foreign transports plugged in at the seam.
pub const IMPL_TCP_PUBSUB: u16 = 1;

/// Read-only descriptor of a publisher some node advertised.
///
/// Stubs are small value records addressed by uuid; whoever needs one keeps a
/// clone, whoever needs the current fields looks it up in the owning catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherStub {
    pub channel: String,
    pub uuid: String,
    pub impl_type: u16,
    pub port: u16,
    /// uuid of the node hosting this publisher.
    pub node: String,
}

impl PublisherStub {
    pub fn from_info(info: PubInfo, node: &str) -> PublisherStub {
        PublisherStub {
            channel: info.channel,
            uuid: info.uuid,
            impl_type: info.impl_type,
            port: info.port,
            node: node.to_string(),
        }
    }

    pub fn to_info(&self) -> PubInfo {
        PubInfo {
            channel: self.channel.clone(),
            uuid: self.uuid.clone(),
            impl_type: self.impl_type,
            port: self.port,
        }
    }
}

/// Read-only descriptor of a subscriber some node advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStub {
    pub channel: String,
    pub uuid: String,
    pub impl_type: u16,
    pub node: String,
}

impl SubscriberStub {
    pub fn from_info(info: SubInfo, node: &str) -> SubscriberStub {
        SubscriberStub {
            channel: info.channel,
            uuid: info.uuid,
            impl_type: info.impl_type,
            node: node.to_string(),
        }
    }

    pub fn to_info(&self) -> SubInfo {
        SubInfo {
            channel: self.channel.clone(),
            uuid: self.uuid.clone(),
            impl_type: self.impl_type,
        }
    }
}

/// Everything we know about a remote node: its identity, where we reached it,
/// and the publishers and subscribers it told us about.
#[derive(Debug, Clone, Default)]
pub struct NodeStub {
    pub uuid: String,
    pub address: Option<EndPoint>,
    publishers: HashMap<String, PublisherStub>,
    subscribers: HashMap<String, SubscriberStub>,
}

impl NodeStub {
    pub fn new(uuid: &str) -> NodeStub {
        NodeStub {
            uuid: uuid.to_string(),
            address: None,
            publishers: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }

    /// Record a publisher, returning the stub it replaced if the uuid was known.
    pub fn add_publisher(&mut self, stub: PublisherStub) -> Option<PublisherStub> {
        self.publishers.insert(stub.uuid.clone(), stub)
    }

    pub fn remove_publisher(&mut self, uuid: &str) -> Option<PublisherStub> {
        self.publishers.remove(uuid)
    }

    pub fn publisher(&self, uuid: &str) -> Option<&PublisherStub> {
        self.publishers.get(uuid)
    }

    pub fn publishers(&self) -> &HashMap<String, PublisherStub> {
        &self.publishers
    }

    pub fn add_subscriber(&mut self, stub: SubscriberStub) -> Option<SubscriberStub> {
        self.subscribers.insert(stub.uuid.clone(), stub)
    }

    pub fn remove_subscriber(&mut self, uuid: &str) -> Option<SubscriberStub> {
        self.subscribers.remove(uuid)
    }

    pub fn subscribers(&self) -> &HashMap<String, SubscriberStub> {
        &self.subscribers
    }
}
