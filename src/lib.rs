// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Zero-configuration publish/subscribe over a local network.
//!
//! Each process hosts one or more [Node](struct.Node.html)s. A node learns about its peers
//! through discovery callbacks (mDNS or anything else able to produce endpoints), opens a
//! control session to each of them, and exchanges its catalog of publishers. Channel traffic
//! then flows directly from the publishing node's data socket to every remote subscriber
//! whose channel matches.
//!
//! ```no_run
//! use meshbus::*;
//!
//! struct Printer;
//! impl Receiver for Printer {
//!     fn receive(&mut self, msg: Message) {
//!         println!("got {} bytes on {}", msg.data().len(), msg.channel());
//!     }
//! }
//!
//! let mut alice = Node::new().unwrap();
//! let mut bob = Node::new().unwrap();
//!
//! let publisher = Publisher::new("weather");
//! alice.add_publisher(&publisher);
//!
//! let subscriber = Subscriber::new("weather", Box::new(Printer));
//! bob.add_subscriber(&subscriber);
//!
//! // discovery would normally do this
//! bob.added(alice.endpoint());
//! alice.added(bob.endpoint());
//!
//! publisher.wait_for_subscribers(1);
//! publisher.send(Message::with_data(b"sunny".to_vec()));
//! ```

#[macro_use]
extern crate log;
extern crate byteorder;
extern crate env_logger;
extern crate mio;
extern crate mio_extras;
extern crate time;
extern crate uuid;

mod config;
mod endpoint;
mod event_loop_msg;
mod global;
mod logging;
mod message;
mod node;
mod node_impl;
mod pubsub;
mod reconcile;
mod session;
mod stats;
mod stub;
mod transport;
mod wire;

pub use config::NodeConfig;
pub use endpoint::EndPoint;
pub use logging::init_logging;
pub use message::Message;
pub use node::Node;
pub use pubsub::{Greeter, Publisher, Receiver, Subscriber};
pub use stub::{NodeStub, PublisherStub, SubscriberStub, IMPL_TCP_PUBSUB};
