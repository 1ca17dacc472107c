// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Outbound publisher (component F): fans an inbound PUBLISH out to every
//! matching subscriber, applying the minimum-QoS rule and the overlap-dedup
//! rule from §4.B.

use std::collections::HashMap;

use codec::v3::PublishPacket;
use codec::QoS;

use crate::session::SessionStore;
use crate::subscription::SubscriptionTable;
use crate::types::ClientId;

/// One fan-out target after dedup: deliver `publish` to `client_id` at
/// `effective_qos`, either straight into a live connection's inflight
/// queue or onto its offline queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub client_id: ClientId,
    pub effective_qos: QoS,
    pub publish: PublishPacket,
}

/// What [`Publisher::publish`] wants the caller (the dispatcher, which
/// owns the per-connection inflight queues) to do with each target.
#[derive(Debug, Clone)]
pub enum Fanout {
    /// Hand this PUBLISH to the named client's live connection, as a
    /// fresh `ToPublish` context (packet id not yet allocated — that is
    /// the inflight queue's job on enqueue).
    ToConnection(Delivery),
    /// The client has no live connection and `cleanSession=false`;
    /// the PUBLISH was appended to its offline queue by this call.
    Queued(ClientId),
}

/// Given a PUBLISH, queries the subscription table and session store and
/// produces the deduplicated fan-out list (component F).
#[derive(Debug)]
pub struct Publisher<'a> {
    subscriptions: &'a SubscriptionTable,
    sessions: &'a SessionStore,
}

impl<'a> Publisher<'a> {
    #[must_use]
    pub const fn new(subscriptions: &'a SubscriptionTable, sessions: &'a SessionStore) -> Self {
        Self {
            subscriptions,
            sessions,
        }
    }

    /// Fan out `publish` (as received from its originating client at
    /// `publish_qos`) to every matching subscriber.
    ///
    /// Dedups by `clientId`, keeping the maximum granted QoS across that
    /// client's matching filters (the overlap rule, §4.B /
    /// testable-properties §8): a client subscribed to both `a/#` and
    /// `a/b/c` receives exactly one copy, at
    /// `effectiveQoS = min(publishQoS, maxGrantedQoS)`.
    ///
    /// The subscription-table read happens entirely inside this call and
    /// is copied into the returned `Vec` before returning — no lock is
    /// held across the caller's subsequent network writes (§4.B
    /// concurrency rule).
    #[must_use]
    pub fn publish(&self, topic: &str, publish_qos: QoS, publish: &PublishPacket) -> Vec<Fanout> {
        let matches = self.subscriptions.find_subscribers(topic);

        // group by clientId, keep max grantedQos — the explicit projection
        // the redesign uses instead of a shared mutable comparer (§9).
        let mut best: HashMap<ClientId, QoS> = HashMap::new();
        for sub in &matches {
            best.entry(sub.client_id().clone())
                .and_modify(|qos| *qos = (*qos).max(sub.granted_qos()))
                .or_insert_with(|| sub.granted_qos());
        }

        let mut out = Vec::with_capacity(best.len());
        for (client_id, granted_qos) in best {
            let effective_qos = publish_qos.min(granted_qos);

            let mut targeted = publish.clone();
            targeted.set_qos(effective_qos);
            let _ = targeted.set_dup(false);
            let _ = targeted.set_retain(false);

            if self.sessions.is_live(&client_id) {
                out.push(Fanout::ToConnection(Delivery {
                    client_id,
                    effective_qos,
                    publish: targeted,
                }));
            } else if effective_qos != QoS::AtMostOnce {
                self.sessions.enqueue_offline(&client_id, targeted);
                out.push(Fanout::Queued(client_id));
            }
            // effectiveQoS 0 to an offline client is simply dropped: §4.F
            // only queues QoS >= 1, and there is no connection to deliver
            // QoS 0 to immediately.
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnId;
    use std::time::Instant;

    fn cid(s: &str) -> ClientId {
        ClientId::from(s)
    }

    fn publish(topic: &str, qos: QoS) -> PublishPacket {
        PublishPacket::new(topic, qos, b"x").unwrap()
    }

    #[test]
    fn overlap_dedup_sends_exactly_one_copy_at_max_qos() {
        let subs = SubscriptionTable::new();
        let sessions = SessionStore::new();
        sessions.open(cid("a"), true, ConnId::new(1), Instant::now());

        subs.subscribe(cid("a"), "a/#", QoS::AtMostOnce, Some(ConnId::new(1)), QoS::ExactOnce)
            .unwrap();
        subs.subscribe(cid("a"), "a/b/c", QoS::ExactOnce, Some(ConnId::new(1)), QoS::ExactOnce)
            .unwrap();

        let publisher = Publisher::new(&subs, &sessions);
        let out = publisher.publish("a/b/c", QoS::ExactOnce, &publish("a/b/c", QoS::ExactOnce));
        assert_eq!(out.len(), 1);
        match &out[0] {
            Fanout::ToConnection(delivery) => assert_eq!(delivery.effective_qos, QoS::ExactOnce),
            Fanout::Queued(_) => panic!("expected a live delivery"),
        }
    }

    #[test]
    fn effective_qos_is_minimum_of_publish_and_granted() {
        let subs = SubscriptionTable::new();
        let sessions = SessionStore::new();
        sessions.open(cid("a"), true, ConnId::new(1), Instant::now());
        subs.subscribe(cid("a"), "x", QoS::AtLeastOnce, Some(ConnId::new(1)), QoS::ExactOnce)
            .unwrap();

        let publisher = Publisher::new(&subs, &sessions);
        let out = publisher.publish("x", QoS::ExactOnce, &publish("x", QoS::ExactOnce));
        match &out[0] {
            Fanout::ToConnection(delivery) => assert_eq!(delivery.effective_qos, QoS::AtLeastOnce),
            Fanout::Queued(_) => panic!("expected a live delivery"),
        }
    }

    #[test]
    fn offline_client_with_qos_ge_1_is_queued_not_dropped() {
        let subs = SubscriptionTable::new();
        let sessions = SessionStore::new();
        sessions.open(cid("a"), false, ConnId::new(1), Instant::now());
        sessions.close(&cid("a"), true);
        subs.subscribe(cid("a"), "x", QoS::AtLeastOnce, None, QoS::ExactOnce).unwrap();

        let publisher = Publisher::new(&subs, &sessions);
        let out = publisher.publish("x", QoS::AtLeastOnce, &publish("x", QoS::AtLeastOnce));
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Fanout::Queued(_)));
        assert_eq!(sessions.drain_offline_queue(&cid("a")).len(), 1);
    }

    #[test]
    fn offline_client_with_qos0_is_silently_dropped() {
        let subs = SubscriptionTable::new();
        let sessions = SessionStore::new();
        sessions.open(cid("a"), false, ConnId::new(1), Instant::now());
        sessions.close(&cid("a"), true);
        subs.subscribe(cid("a"), "x", QoS::AtMostOnce, None, QoS::ExactOnce).unwrap();

        let publisher = Publisher::new(&subs, &sessions);
        let out = publisher.publish("x", QoS::AtMostOnce, &publish("x", QoS::AtMostOnce));
        assert!(out.is_empty());
    }

    #[test]
    fn no_matching_subscription_yields_no_fanout() {
        let subs = SubscriptionTable::new();
        let sessions = SessionStore::new();
        let publisher = Publisher::new(&subs, &sessions);
        let out = publisher.publish("nobody/home", QoS::AtMostOnce, &publish("nobody/home", QoS::AtMostOnce));
        assert!(out.is_empty());
    }
}
