// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

#[macro_use]
extern crate log;
extern crate env_logger;
extern crate md5;
extern crate meshbus;
extern crate rand;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time;

use rand::Rng;

use meshbus::*;

fn wait_until<F: Fn() -> bool>(timeout: time::Duration, condition: F) -> bool {
    let deadline = time::Instant::now() + timeout;

    while time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(time::Duration::from_millis(20));
    }

    condition()
}

fn link(a: &Node, b: &Node) {
    a.added(b.endpoint());
    b.added(a.endpoint());
}

struct TestGreeter {
    welcomes: Arc<AtomicUsize>,
    farewells: Arc<AtomicUsize>,
}

impl Greeter for TestGreeter {
    fn welcome(&mut self, _: &SubscriberStub) {
        self.welcomes.fetch_add(1, Ordering::SeqCst);
    }

    fn farewell(&mut self, _: &SubscriberStub) {
        self.farewells.fetch_add(1, Ordering::SeqCst);
    }
}

fn counting_publisher(channel: &str) -> (Publisher, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let welcomes = Arc::new(AtomicUsize::new(0));
    let farewells = Arc::new(AtomicUsize::new(0));
    let publisher = Publisher::with_greeter(channel, Box::new(TestGreeter {
        welcomes: welcomes.clone(),
        farewells: farewells.clone(),
    }));

    (publisher, welcomes, farewells)
}

struct NullReceiver;

impl Receiver for NullReceiver {
    fn receive(&mut self, _: Message) {}
}

struct SeqReceiver {
    seqs: Arc<Mutex<Vec<u64>>>,
    bytes: Arc<AtomicUsize>,
    md5_errors: Arc<AtomicUsize>,
}

impl Receiver for SeqReceiver {
    fn receive(&mut self, msg: Message) {
        if let Some(expected) = msg.get_meta("md5") {
            let actual = format!("{:x}", md5::compute(msg.data()));
            if expected != actual {
                self.md5_errors.fetch_add(1, Ordering::SeqCst);
            }
        }
        if let Some(seq) = msg.get_meta("seq").and_then(|s| s.parse().ok()) {
            self.seqs.lock().unwrap().push(seq);
        }
        self.bytes.fetch_add(msg.data().len(), Ordering::SeqCst);
    }
}

fn seq_receiver() -> (Box<SeqReceiver>, Arc<Mutex<Vec<u64>>>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let seqs = Arc::new(Mutex::new(Vec::new()));
    let bytes = Arc::new(AtomicUsize::new(0));
    let md5_errors = Arc::new(AtomicUsize::new(0));
    let receiver = Box::new(SeqReceiver {
        seqs: seqs.clone(),
        bytes: bytes.clone(),
        md5_errors: md5_errors.clone(),
    });

    (receiver, seqs, bytes, md5_errors)
}

#[test]
fn test_greeter() {
    let _ = env_logger::init();
    let node1 = Node::new().unwrap();
    let node2 = Node::new().unwrap();
    let (pub1, welcomes, farewells) = counting_publisher("foobar");

    node1.add_publisher(&pub1);
    link(&node1, &node2);

    let sub1 = Subscriber::new("f", Box::new(NullReceiver));
    node2.add_subscriber(&sub1);

    assert_eq!(1, pub1.wait_for_subscribers_timeout(1, time::Duration::from_secs(10)));
    assert_eq!(1, welcomes.load(Ordering::SeqCst));
    assert_eq!(0, farewells.load(Ordering::SeqCst));

    node2.remove_subscriber(&sub1);

    assert!(wait_until(time::Duration::from_secs(10), || pub1.subscriber_count() == 0));
    assert_eq!(1, welcomes.load(Ordering::SeqCst));
    assert_eq!(1, farewells.load(Ordering::SeqCst));
}

#[test]
fn test_message_transmission() {
    let _ = env_logger::init();
    let pub_node = Node::new().unwrap();
    let sub_node = Node::new().unwrap();
    let publisher = Publisher::new("foo");
    let (receiver, seqs, _, md5_errors) = seq_receiver();
    let subscriber = Subscriber::new("foo", receiver);

    pub_node.add_publisher(&publisher);
    sub_node.add_subscriber(&subscriber);
    link(&pub_node, &sub_node);

    assert!(publisher.wait_for_subscribers_timeout(1, time::Duration::from_secs(10)) >= 1);

    let iterations = 1000;
    for seq in 0..iterations {
        let mut msg = Message::with_data(format!("payload {}", seq).into_bytes());
        msg.put_meta("seq", &seq.to_string());
        msg.put_meta("md5", &format!("{:x}", md5::compute(msg.data())));
        publisher.send(msg);
    }

    assert!(wait_until(time::Duration::from_secs(30), || seqs.lock().unwrap().len() == iterations),
            "received {} of {}", seqs.lock().unwrap().len(), iterations);

    let received = seqs.lock().unwrap();
    let expected: Vec<u64> = (0..iterations as u64).collect();
    assert_eq!(expected, *received);
    assert_eq!(0, md5_errors.load(Ordering::SeqCst));
}

#[test]
fn test_large_payloads() {
    let _ = env_logger::init();
    let pub_node = Node::new().unwrap();
    let sub_node = Node::new().unwrap();
    let publisher = Publisher::new("bulk");
    let (receiver, seqs, bytes, md5_errors) = seq_receiver();
    let subscriber = Subscriber::new("bulk", receiver);

    pub_node.add_publisher(&publisher);
    sub_node.add_subscriber(&subscriber);
    link(&pub_node, &sub_node);

    assert!(publisher.wait_for_subscribers_timeout(1, time::Duration::from_secs(10)) >= 1);

    let payload_size = 1024 * 1024;
    let payload = vec![40u8; payload_size];
    let digest = format!("{:x}", md5::compute(&payload));
    let iterations: usize = 1000;

    for seq in 0..iterations {
        let mut msg = Message::with_data(payload.clone());
        msg.put_meta("seq", &seq.to_string());
        msg.put_meta("md5", &digest);
        publisher.send(msg);

        // keep the in-flight window bounded
        let floor = seq.saturating_sub(50);
        wait_until(time::Duration::from_secs(60), || seqs.lock().unwrap().len() >= floor);
    }

    assert!(wait_until(time::Duration::from_secs(120), || seqs.lock().unwrap().len() == iterations),
            "received {} of {}", seqs.lock().unwrap().len(), iterations);
    assert_eq!(iterations * payload_size, bytes.load(Ordering::SeqCst));
    assert_eq!(0, md5_errors.load(Ordering::SeqCst));
}

#[test]
fn test_subscriber_churn() {
    let _ = env_logger::init();
    let pub_node = Node::new().unwrap();
    let (publisher, welcomes, farewells) = counting_publisher("foo");
    pub_node.add_publisher(&publisher);

    let mut sub_nodes = Vec::new();
    for _ in 0..5 {
        let node = Node::new().unwrap();
        link(&pub_node, &node);
        sub_nodes.push(node);
    }

    let mut rng = rand::thread_rng();
    for round in 0..3 {
        info!("churn round {}", round);

        let mut subscribers = Vec::new();
        for node in &sub_nodes {
            let subscriber = Subscriber::new("f", Box::new(NullReceiver));
            node.add_subscriber(&subscriber);
            subscribers.push(subscriber);
            thread::sleep(time::Duration::from_millis(rng.gen_range(0, 20)));
        }

        assert!(wait_until(time::Duration::from_secs(20),
                           || publisher.subscriber_count() == sub_nodes.len()),
                "round {}: only {} subscribers", round, publisher.subscriber_count());
        assert_eq!(publisher.subscriber_count(),
                   welcomes.load(Ordering::SeqCst) - farewells.load(Ordering::SeqCst));

        for (node, subscriber) in sub_nodes.iter().zip(&subscribers) {
            node.remove_subscriber(subscriber);
        }

        assert!(wait_until(time::Duration::from_secs(20), || publisher.subscriber_count() == 0));
        assert_eq!(welcomes.load(Ordering::SeqCst), farewells.load(Ordering::SeqCst));
    }

    assert_eq!(15, welcomes.load(Ordering::SeqCst));
}

#[test]
fn test_node_loss() {
    let _ = env_logger::init();
    let mut node_a = Node::new().unwrap();
    let node_b = Node::new().unwrap();
    let uuid_a = node_a.uuid().to_string();
    let (publisher, _, _) = counting_publisher("foo");
    let subscriber = Subscriber::new("foo", Box::new(NullReceiver));

    node_a.add_publisher(&publisher);
    node_b.add_subscriber(&subscriber);
    link(&node_a, &node_b);

    assert_eq!(1, publisher.wait_for_subscribers_timeout(1, time::Duration::from_secs(10)));
    assert!(wait_until(time::Duration::from_secs(10), || node_b.connected_to(&uuid_a)));

    node_a.shutdown();

    // both session keys of the lost node are gone
    assert!(wait_until(time::Duration::from_secs(10), || node_b.session_count() == 0));
    assert!(!node_b.connected_to(&uuid_a));
    assert!(!node_b.connected_from(&uuid_a));
}

#[test]
fn test_discovery_flap() {
    let _ = env_logger::init();
    let node_a = Node::new().unwrap();
    let node_b = Node::new().unwrap();

    for _ in 0..10 {
        node_b.added(node_a.endpoint());
        node_b.removed(node_a.endpoint());
    }

    assert!(wait_until(time::Duration::from_secs(10), || node_b.session_count() == 0),
            "{} sessions left", node_b.session_count());
    assert!(wait_until(time::Duration::from_secs(10), || node_b.socket_count() == 0),
            "{} sockets left", node_b.socket_count());
    assert!(wait_until(time::Duration::from_secs(30), || node_a.socket_count() == 0),
            "{} sockets left on the accepting side", node_a.socket_count());

    // flapping must not poison a later honest connect
    node_b.added(node_a.endpoint());
    assert!(wait_until(time::Duration::from_secs(10), || node_b.connected_to(node_a.uuid())));
}

#[test]
fn test_duplicate_publisher_add_is_a_no_op() {
    let _ = env_logger::init();
    let node1 = Node::new().unwrap();
    let node2 = Node::new().unwrap();
    let (publisher, welcomes, _) = counting_publisher("foo");

    node1.add_publisher(&publisher);
    node1.add_publisher(&publisher);
    link(&node1, &node2);

    let subscriber = Subscriber::new("foo", Box::new(NullReceiver));
    node2.add_subscriber(&subscriber);

    assert_eq!(1, publisher.wait_for_subscribers_timeout(1, time::Duration::from_secs(10)));
    assert_eq!(1, welcomes.load(Ordering::SeqCst));

    let dump = node1.debug_dump();
    let pub_lines = dump.iter().filter(|l| l.starts_with("publisher ")).count();
    assert_eq!(1, pub_lines);
}

#[test]
fn test_wait_for_subscribers_timeout_reports_the_tally() {
    let _ = env_logger::init();
    let node = Node::new().unwrap();
    let publisher = Publisher::new("lonely");

    node.add_publisher(&publisher);

    let started = time::Instant::now();
    let count = publisher.wait_for_subscribers_timeout(1, time::Duration::from_millis(200));

    assert_eq!(0, count);
    assert!(started.elapsed() >= time::Duration::from_millis(200));
    assert_eq!(0, publisher.wait_for_subscribers(0));
}

#[test]
fn test_allow_local_self_subscription() {
    let _ = env_logger::init();
    let mut config = NodeConfig::default();
    config.allow_local = true;
    let node = Node::with_config(config).unwrap();
    let (publisher, welcomes, _) = counting_publisher("loop");
    let (receiver, seqs, _, _) = seq_receiver();
    let subscriber = Subscriber::new("loop", receiver);

    node.add_publisher(&publisher);
    node.add_subscriber(&subscriber);
    node.added(node.endpoint());

    assert_eq!(1, publisher.wait_for_subscribers_timeout(1, time::Duration::from_secs(10)));
    assert_eq!(1, welcomes.load(Ordering::SeqCst));

    let mut msg = Message::with_data(b"to myself".to_vec());
    msg.put_meta("seq", "0");
    publisher.send(msg);

    assert!(wait_until(time::Duration::from_secs(10), || seqs.lock().unwrap().len() == 1));
}

#[test]
fn test_self_connect_is_refused_by_default() {
    let _ = env_logger::init();
    let node = Node::new().unwrap();
    let publisher = Publisher::new("loop");
    let subscriber = Subscriber::new("loop", Box::new(NullReceiver));

    node.add_publisher(&publisher);
    node.add_subscriber(&subscriber);
    node.added(node.endpoint());

    let count = publisher.wait_for_subscribers_timeout(1, time::Duration::from_secs(2));
    assert_eq!(0, count);
}

#[test]
fn test_suspend_resume() {
    let _ = env_logger::init();
    let node_a = Node::new().unwrap();
    let node_b = Node::new().unwrap();
    let (publisher, welcomes, farewells) = counting_publisher("foo");
    let subscriber = Subscriber::new("foo", Box::new(NullReceiver));

    node_a.add_publisher(&publisher);
    node_b.add_subscriber(&subscriber);
    link(&node_a, &node_b);

    assert_eq!(1, publisher.wait_for_subscribers_timeout(1, time::Duration::from_secs(10)));

    node_a.suspend();

    assert!(wait_until(time::Duration::from_secs(10), || publisher.subscriber_count() == 0));
    assert_eq!(1, farewells.load(Ordering::SeqCst));
    assert!(wait_until(time::Duration::from_secs(10), || node_b.session_count() == 0));

    node_a.resume();
    link(&node_a, &node_b);

    assert_eq!(1, publisher.wait_for_subscribers_timeout(1, time::Duration::from_secs(10)));
    assert_eq!(2, welcomes.load(Ordering::SeqCst));
}

#[test]
fn test_debug_dump_reports_the_catalog() {
    let _ = env_logger::init();
    let node = Node::new().unwrap();
    let publisher = Publisher::new("telemetry");

    node.add_publisher(&publisher);

    assert!(wait_until(time::Duration::from_secs(5), || {
        node.debug_dump().iter().any(|l| l.contains("channel telemetry"))
    }));

    let dump = node.debug_dump();
    assert!(dump.iter().any(|l| l.starts_with("node: ")));
    assert!(dump.iter().any(|l| l.starts_with("os: ")));
    assert!(dump.iter().any(|l| l.starts_with("meta sent: ")));
}
