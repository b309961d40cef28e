// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Publisher and subscriber handles.
//!
//! Both are thin clones around shared state: the caller keeps one, every node
//! they are added to keeps another. Publishing pushes the message onto the
//! ingress channel of each attached node; subscribing runs one link thread
//! per remote node that hosts a matching publisher.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mio_extras::channel::Sender;

use global::{new_uuid, short_uuid};
use message::Message;
use stub::{PublisherStub, SubscriberStub, IMPL_TCP_PUBSUB};
use transport::tcp::{read_parts, write_parts};
use transport::xpub::subscribe_hint;
use wire::{PubInfo, SubInfo, MAX_CHANNEL_LEN};

/// Callbacks a publisher runs when a remote subscriber is confirmed or lost.
/// Invoked on the node's event-loop thread, so keep them short.
pub trait Greeter: Send {
    fn welcome(&mut self, subscriber: &SubscriberStub);
    fn farewell(&mut self, subscriber: &SubscriberStub);
}

/// Sink for received messages. Invoked on the subscriber's link threads.
pub trait Receiver: Send {
    fn receive(&mut self, msg: Message);
}

struct PubInner {
    uuid: String,
    channel: String,
    greeter: Mutex<Option<Box<Greeter>>>,
    confirmed: Mutex<HashMap<String, SubscriberStub>>,
    cond: Condvar,
    /// node uuid to that node's data ingress.
    links: Mutex<HashMap<String, Sender<Vec<Vec<u8>>>>>,
}

/// Local originator of channel traffic.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PubInner>,
}

impl Publisher {
    pub fn new(channel: &str) -> Publisher {
        assert!(channel.len() <= MAX_CHANNEL_LEN, "channel name too long");
        assert!(!channel.starts_with('~'), "tilde channels are reserved");

        Publisher {
            inner: Arc::new(PubInner {
                uuid: new_uuid(),
                channel: channel.to_string(),
                greeter: Mutex::new(None),
                confirmed: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_greeter(channel: &str, greeter: Box<Greeter>) -> Publisher {
        let publisher = Publisher::new(channel);
        publisher.set_greeter(greeter);
        publisher
    }

    pub fn set_greeter(&self, greeter: Box<Greeter>) {
        *self.inner.greeter.lock().unwrap() = Some(greeter);
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Hand the message to every attached node for forwarding.
    /// Fire and forget: an unattached publisher drops it silently.
    pub fn send(&self, msg: Message) {
        let links = self.inner.links.lock().unwrap();

        if links.is_empty() {
            debug!("publisher {} has no node, message dropped", short_uuid(&self.inner.uuid));
            return;
        }

        let parts = msg.into_parts(&self.inner.channel);
        for tx in links.values() {
            if tx.send(parts.clone()).is_err() {
                debug!("node of publisher {} is gone", short_uuid(&self.inner.uuid));
            }
        }
    }

    /// Current number of confirmed subscribers, without waiting.
    pub fn subscriber_count(&self) -> usize {
        self.inner.confirmed.lock().unwrap().len()
    }

    /// Block until at least `count` subscribers are confirmed.
    /// `count` 0 returns at once with the current tally.
    pub fn wait_for_subscribers(&self, count: usize) -> usize {
        let mut confirmed = self.inner.confirmed.lock().unwrap();

        while confirmed.len() < count {
            confirmed = self.inner.cond.wait(confirmed).unwrap();
        }

        confirmed.len()
    }

    /// Like [wait_for_subscribers](#method.wait_for_subscribers) but gives up
    /// after `timeout`, returning whatever tally is reached by then.
    pub fn wait_for_subscribers_timeout(&self, count: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut confirmed = self.inner.confirmed.lock().unwrap();

        loop {
            if confirmed.len() >= count {
                return confirmed.len();
            }
            let now = Instant::now();
            if now >= deadline {
                return confirmed.len();
            }
            let (guard, _) = self.inner.cond.wait_timeout(confirmed, deadline - now).unwrap();
            confirmed = guard;
        }
    }

    #[doc(hidden)]
    pub fn to_info(&self, port: u16) -> PubInfo {
        PubInfo {
            channel: self.inner.channel.clone(),
            uuid: self.inner.uuid.clone(),
            impl_type: IMPL_TCP_PUBSUB,
            port: port,
        }
    }

    #[doc(hidden)]
    pub fn attach_node(&self, node_uuid: &str, ingress: Sender<Vec<Vec<u8>>>) {
        self.inner.links.lock().unwrap().insert(node_uuid.to_string(), ingress);
    }

    #[doc(hidden)]
    pub fn detach_node(&self, node_uuid: &str) {
        self.inner.links.lock().unwrap().remove(node_uuid);
    }

    /// Record a confirmed subscriber; runs the greeter exactly once per uuid.
    #[doc(hidden)]
    pub fn confirm_subscriber(&self, stub: &SubscriberStub) -> bool {
        let inserted = {
            let mut confirmed = self.inner.confirmed.lock().unwrap();
            let inserted = confirmed.insert(stub.uuid.clone(), stub.clone()).is_none();
            self.inner.cond.notify_all();
            inserted
        };

        if inserted {
            if let Some(greeter) = self.inner.greeter.lock().unwrap().as_mut() {
                greeter.welcome(stub);
            }
        }

        inserted
    }

    /// Forget a subscriber; runs the farewell when it was confirmed.
    #[doc(hidden)]
    pub fn drop_subscriber(&self, sub_uuid: &str) -> bool {
        let removed = {
            let mut confirmed = self.inner.confirmed.lock().unwrap();
            let removed = confirmed.remove(sub_uuid);
            self.inner.cond.notify_all();
            removed
        };

        match removed {
            Some(stub) => {
                if let Some(greeter) = self.inner.greeter.lock().unwrap().as_mut() {
                    greeter.farewell(&stub);
                }
                true
            }
            None => false,
        }
    }

    #[doc(hidden)]
    pub fn confirmed_stubs(&self) -> Vec<SubscriberStub> {
        self.inner.confirmed.lock().unwrap().values().cloned().collect()
    }
}

struct LinkStop {
    stopped: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
}

impl LinkStop {
    fn new() -> LinkStop {
        LinkStop {
            stopped: AtomicBool::new(false),
            stream: Mutex::new(None),
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(stream) = self.stream.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// One data connection to a remote node, shared by every publisher of that
/// node this subscriber matched.
struct SubLink {
    pubs: HashSet<String>,
    stop: Arc<LinkStop>,
}

struct SubInner {
    uuid: String,
    channel: String,
    matcher: Option<Box<Fn(&str) -> bool + Send + Sync>>,
    receiver: Arc<Mutex<Box<Receiver>>>,
    links: Mutex<HashMap<String, SubLink>>,
}

/// Local consumer of channel traffic.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubInner>,
}

impl Subscriber {
    pub fn new(channel: &str, receiver: Box<Receiver>) -> Subscriber {
        assert!(channel.len() <= MAX_CHANNEL_LEN, "channel name too long");
        assert!(!channel.starts_with('~'), "tilde channels are reserved");

        Subscriber {
            inner: Arc::new(SubInner {
                uuid: new_uuid(),
                channel: channel.to_string(),
                matcher: None,
                receiver: Arc::new(Mutex::new(receiver)),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A subscriber with a custom match predicate instead of the default
    /// prefix match. The channel string still names the data-plane topic.
    pub fn with_matcher(
        channel: &str,
        receiver: Box<Receiver>,
        matcher: Box<Fn(&str) -> bool + Send + Sync>) -> Subscriber {

        let mut subscriber = Subscriber::new(channel, receiver);
        {
            let inner = Arc::get_mut(&mut subscriber.inner).unwrap();
            inner.matcher = Some(matcher);
        }
        subscriber
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Does a publisher on `channel` interest this subscriber?
    pub fn matches(&self, channel: &str) -> bool {
        match self.inner.matcher {
            Some(ref matcher) => matcher(channel),
            None => channel.starts_with(&self.inner.channel),
        }
    }

    #[doc(hidden)]
    pub fn to_info(&self) -> SubInfo {
        SubInfo {
            channel: self.inner.channel.clone(),
            uuid: self.inner.uuid.clone(),
            impl_type: IMPL_TCP_PUBSUB,
        }
    }

    /// A matching publisher appeared; make sure a link to its node runs.
    #[doc(hidden)]
    pub fn attach(&self, publisher: &PublisherStub, ip: IpAddr) {
        let mut links = self.inner.links.lock().unwrap();

        if let Some(link) = links.get_mut(&publisher.node) {
            link.pubs.insert(publisher.uuid.clone());
            return;
        }

        let stop = Arc::new(LinkStop::new());
        let addr = SocketAddr::new(ip, publisher.port);
        let topics = vec![
            self.inner.channel.clone().into_bytes(),
            tilde_topic(&self.inner.uuid),
        ];
        let receiver = self.inner.receiver.clone();
        let thread_stop = stop.clone();
        let label = format!("{}@{}", short_uuid(&self.inner.uuid), short_uuid(&publisher.node));

        let spawned = thread::Builder::new()
            .name(format!("meshbus-link-{}", label))
            .spawn(move || run_link(addr, topics, receiver, thread_stop, label));

        match spawned {
            Ok(_) => {
                let mut pubs = HashSet::new();
                pubs.insert(publisher.uuid.clone());
                links.insert(publisher.node.clone(), SubLink {
                    pubs: pubs,
                    stop: stop,
                });
            }
            Err(e) => warn!("could not spawn subscriber link: {}", e),
        }
    }

    /// A publisher went away; tear the link down when it was the last one.
    #[doc(hidden)]
    pub fn detach(&self, pub_uuid: &str, node_uuid: &str) {
        let mut links = self.inner.links.lock().unwrap();
        let empty = match links.get_mut(node_uuid) {
            Some(link) => {
                link.pubs.remove(pub_uuid);
                link.pubs.is_empty()
            }
            None => false,
        };

        if empty {
            if let Some(link) = links.remove(node_uuid) {
                link.stop.stop();
            }
        }
    }

    #[doc(hidden)]
    pub fn detach_node(&self, node_uuid: &str) {
        if let Some(link) = self.inner.links.lock().unwrap().remove(node_uuid) {
            link.stop.stop();
        }
    }

    #[doc(hidden)]
    pub fn detach_all(&self) {
        for (_, link) in self.inner.links.lock().unwrap().drain() {
            link.stop.stop();
        }
    }

    #[doc(hidden)]
    pub fn linked_nodes(&self) -> Vec<String> {
        self.inner.links.lock().unwrap().keys().cloned().collect()
    }
}

/// The topic a subscriber announces besides its channel. The tilde sorts
/// after any printable channel name, which keeps the channel subscription
/// first in ordered topic lists, and the publisher side recognizes the shape
/// as a subscriber identity.
pub fn tilde_topic(uuid: &str) -> Vec<u8> {
    let mut topic = Vec::with_capacity(uuid.len() + 1);
    topic.push(b'~');
    topic.extend_from_slice(uuid.as_bytes());
    topic
}

const LINK_CONNECT_ATTEMPTS: u32 = 5;
const LINK_CONNECT_BACKOFF_MS: u64 = 100;

fn run_link(
    addr: SocketAddr,
    topics: Vec<Vec<u8>>,
    receiver: Arc<Mutex<Box<Receiver>>>,
    stop: Arc<LinkStop>,
    label: String) {

    let mut stream = match connect_with_retry(&addr, &stop) {
        Some(stream) => stream,
        None => return,
    };

    {
        let mut slot = stop.stream.lock().unwrap();
        if stop.is_stopped() {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        match stream.try_clone() {
            Ok(clone) => *slot = Some(clone),
            Err(e) => debug!("link {} cannot clone stream: {}", label, e),
        }
    }

    for topic in &topics {
        if write_parts(&mut stream, &[subscribe_hint(topic)]).is_err() {
            debug!("link {} died during subscription", label);
            return;
        }
    }

    loop {
        match read_parts(&mut stream) {
            Ok(parts) => match Message::from_parts(parts) {
                Ok(msg) => receiver.lock().unwrap().receive(msg),
                Err(e) => debug!("link {} dropped an unparsable message: {}", label, e),
            },
            Err(e) => {
                if !stop.is_stopped() {
                    debug!("link {} closed: {}", label, e);
                }
                return;
            }
        }
    }
}

fn connect_with_retry(addr: &SocketAddr, stop: &LinkStop) -> Option<TcpStream> {
    for attempt in 0..LINK_CONNECT_ATTEMPTS {
        if stop.is_stopped() {
            return None;
        }
        match TcpStream::connect(addr) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Some(stream);
            }
            Err(e) => {
                debug!("data connect to {} failed (attempt {}): {}", addr, attempt + 1, e);
                thread::sleep(Duration::from_millis(LINK_CONNECT_BACKOFF_MS));
            }
        }
    }

    warn!("giving up on data connection to {}", addr);
    None
}
