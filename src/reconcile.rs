// Copyright 2017 The meshbus developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Subscription confirmation bookkeeping.
//!
//! A remote subscription is only real once two independent sources agree:
//! the control plane delivered a SUBSCRIBE frame, and the data-plane socket
//! saw the subscriber's tilde-topic subscription. Either may arrive first.
//! This module tracks the pending/confirmed split per subscriber; the event
//! loop turns its verdicts into greeter callbacks and catalog updates.

use std::collections::{BTreeSet, HashMap, HashSet};

use stub::SubscriberStub;

/// Per remote subscriber: which local publishers it asked for, split into the
/// ones still awaiting the data-plane acknowledgement and the confirmed ones.
pub struct Subscription {
    pub stub: SubscriberStub,
    /// uuid of the node hosting the subscriber.
    pub node: String,
    pub pending: BTreeSet<String>,
    pub confirmed: BTreeSet<String>,
    pub data_plane_confirmed: bool,
    /// Subscribers on a foreign data plane confirm on the control phase alone.
    needs_data_plane: bool,
}

impl Subscription {
    fn is_acknowledged(&self) -> bool {
        self.data_plane_confirmed || !self.needs_data_plane
    }

    /// Move everything pending into confirmed, returning what moved.
    fn drain_pending(&mut self) -> Vec<String> {
        let moved: Vec<String> = self.pending.iter().cloned().collect();

        for uuid in &moved {
            self.confirmed.insert(uuid.clone());
        }
        self.pending.clear();

        moved
    }
}

pub struct Reconciler {
    subscriptions: HashMap<String, Subscription>,
    /// Data-plane acks that beat their SUBSCRIBE frame here. Consumed when
    /// the control plane catches up.
    orphan_acks: HashSet<String>,
}

impl Reconciler {
    pub fn new() -> Reconciler {
        Reconciler {
            subscriptions: HashMap::new(),
            orphan_acks: HashSet::new(),
        }
    }

    /// Control-plane phase: a SUBSCRIBE frame paired `stub` with one of our
    /// publishers. Returns the publisher uuids whose subscription became
    /// confirmed by this frame, in subscription order.
    pub fn on_subscribe(
        &mut self,
        stub: SubscriberStub,
        pub_uuid: &str,
        needs_data_plane: bool) -> Vec<String> {

        let node = stub.node.clone();
        let already_acked = self.orphan_acks.remove(&stub.uuid);
        let subscription = self.subscriptions
            .entry(stub.uuid.clone())
            .or_insert_with(|| Subscription {
                stub: stub,
                node: node,
                pending: BTreeSet::new(),
                confirmed: BTreeSet::new(),
                data_plane_confirmed: already_acked,
                needs_data_plane: needs_data_plane,
            });

        if subscription.confirmed.contains(pub_uuid) {
            // re-announced subscription, nothing to do
            return Vec::new();
        }

        subscription.pending.insert(pub_uuid.to_string());

        if subscription.is_acknowledged() {
            subscription.drain_pending()
        } else {
            Vec::new()
        }
    }

    /// Data-plane phase: the egress socket saw a subscription for `~uuid`.
    /// Returns the publisher uuids confirmed by it. An ack with no record yet
    /// is kept, the races between the two planes go both ways.
    pub fn on_data_plane_subscribe(&mut self, sub_uuid: &str) -> Vec<String> {
        match self.subscriptions.get_mut(sub_uuid) {
            Some(subscription) => {
                subscription.data_plane_confirmed = true;
                subscription.drain_pending()
            }
            None => {
                self.orphan_acks.insert(sub_uuid.to_string());
                Vec::new()
            }
        }
    }

    /// The subscription is gone, by UNSUBSCRIBE frame or because the
    /// data-plane connection vanished. The caller owes a farewell for every
    /// confirmed entry of the returned record.
    pub fn on_unsubscribe(&mut self, sub_uuid: &str) -> Option<Subscription> {
        self.orphan_acks.remove(sub_uuid);
        self.subscriptions.remove(sub_uuid)
    }

    /// Drop every subscription owned by a lost node.
    pub fn remove_node(&mut self, node_uuid: &str) -> Vec<Subscription> {
        let uuids: Vec<String> = self.subscriptions.iter()
            .filter(|&(_, s)| s.node == node_uuid)
            .map(|(uuid, _)| uuid.clone())
            .collect();

        uuids.iter().filter_map(|uuid| self.subscriptions.remove(uuid)).collect()
    }

    /// A local publisher went away; detach it everywhere. Returns the
    /// subscriber stubs that had it confirmed, for their farewells.
    pub fn prune_publisher(&mut self, pub_uuid: &str) -> Vec<SubscriberStub> {
        let mut farewells = Vec::new();

        for subscription in self.subscriptions.values_mut() {
            subscription.pending.remove(pub_uuid);
            if subscription.confirmed.remove(pub_uuid) {
                farewells.push(subscription.stub.clone());
            }
        }

        farewells
    }

    pub fn get(&self, sub_uuid: &str) -> Option<&Subscription> {
        self.subscriptions.get(sub_uuid)
    }

    pub fn iter(&self) -> ::std::collections::hash_map::Values<String, Subscription> {
        self.subscriptions.values()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use global::new_uuid;
    use stub::{SubscriberStub, IMPL_TCP_PUBSUB};

    use super::Reconciler;

    fn sub_stub(node: &str) -> SubscriberStub {
        SubscriberStub {
            channel: "foo".to_string(),
            uuid: new_uuid(),
            impl_type: IMPL_TCP_PUBSUB,
            node: node.to_string(),
        }
    }

    #[test]
    fn confirmation_needs_both_phases() {
        let mut recon = Reconciler::new();
        let node = new_uuid();
        let stub = sub_stub(&node);
        let pub_a = new_uuid();
        let pub_b = new_uuid();

        assert!(recon.on_subscribe(stub.clone(), &pub_a, true).is_empty());
        {
            let record = recon.get(&stub.uuid).unwrap();
            assert!(record.pending.contains(&pub_a));
            assert!(record.confirmed.is_empty());
        }

        let confirmed = recon.on_data_plane_subscribe(&stub.uuid);
        assert_eq!(vec![pub_a.clone()], confirmed);

        // once acknowledged, later control frames confirm immediately
        assert_eq!(vec![pub_b.clone()], recon.on_subscribe(stub.clone(), &pub_b, true));

        let record = recon.get(&stub.uuid).unwrap();
        assert!(record.pending.is_empty());
        assert!(record.confirmed.contains(&pub_a));
        assert!(record.confirmed.contains(&pub_b));
    }

    #[test]
    fn data_plane_first_then_control() {
        let mut recon = Reconciler::new();
        let stub = sub_stub(&new_uuid());
        let pub_a = new_uuid();

        // hint for a subscriber we have not heard of on the control plane yet
        assert!(recon.on_data_plane_subscribe(&stub.uuid).is_empty());

        // the control frame arrives later and completes the pair right away
        assert_eq!(vec![pub_a.clone()], recon.on_subscribe(stub.clone(), &pub_a, true));
    }

    #[test]
    fn foreign_data_plane_confirms_on_control_alone() {
        let mut recon = Reconciler::new();
        let stub = sub_stub(&new_uuid());
        let pub_a = new_uuid();

        assert_eq!(vec![pub_a.clone()], recon.on_subscribe(stub, &pub_a, false));
    }

    #[test]
    fn reconfirmation_is_idempotent() {
        let mut recon = Reconciler::new();
        let stub = sub_stub(&new_uuid());
        let pub_a = new_uuid();

        assert_eq!(1, recon.on_subscribe(stub.clone(), &pub_a, false).len());
        assert!(recon.on_subscribe(stub.clone(), &pub_a, false).is_empty());

        let record = recon.get(&stub.uuid).unwrap();
        assert!(record.pending.is_disjoint(&record.confirmed));
        assert_eq!(1, record.confirmed.len());
    }

    #[test]
    fn unsubscribe_returns_the_confirmed_set() {
        let mut recon = Reconciler::new();
        let stub = sub_stub(&new_uuid());
        let pub_a = new_uuid();

        recon.on_subscribe(stub.clone(), &pub_a, false);
        let record = recon.on_unsubscribe(&stub.uuid).unwrap();

        assert!(record.confirmed.contains(&pub_a));
        assert_eq!(0, recon.len());
        assert!(recon.on_unsubscribe(&stub.uuid).is_none());
    }

    #[test]
    fn node_loss_takes_only_its_subscriptions() {
        let mut recon = Reconciler::new();
        let node_a = new_uuid();
        let node_b = new_uuid();
        let stub_a = sub_stub(&node_a);
        let stub_b = sub_stub(&node_b);
        let pub_a = new_uuid();

        recon.on_subscribe(stub_a, &pub_a, false);
        recon.on_subscribe(stub_b.clone(), &pub_a, false);

        let dropped = recon.remove_node(&node_a);

        assert_eq!(1, dropped.len());
        assert_eq!(1, recon.len());
        assert!(recon.get(&stub_b.uuid).is_some());
    }

    #[test]
    fn pruned_publishers_report_their_confirmed_subscribers() {
        let mut recon = Reconciler::new();
        let stub = sub_stub(&new_uuid());
        let waiting = sub_stub(&new_uuid());
        let pub_a = new_uuid();

        recon.on_subscribe(stub.clone(), &pub_a, false);
        recon.on_subscribe(waiting.clone(), &pub_a, true);

        let farewells = recon.prune_publisher(&pub_a);

        assert_eq!(1, farewells.len());
        assert_eq!(stub.uuid, farewells[0].uuid);
        assert!(recon.get(&waiting.uuid).unwrap().pending.is_empty());
    }
}
