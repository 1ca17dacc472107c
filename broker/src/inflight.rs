// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Per-connection inflight queue and QoS state machine.
//!
//! Each connection owns exactly one [`InflightQueue`]. It is a FIFO of
//! [`MsgContext`] records, one per in-progress PUBLISH handshake in either
//! direction, driven forward by [`InflightQueue::drive`] whenever the owning
//! connection wakes (new enqueue, inbound ack, or the earliest retransmit
//! deadline). The queue is a plain `VecDeque` scanned linearly: connections
//! carry at most a few dozen concurrent QoS 1/2 exchanges in practice, so
//! this stays well inside the O(levels)-per-publish budget the subscription
//! table needs and avoids a second index to keep in sync with the deque.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use codec::v3::{PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket};
use codec::{PacketId, QoS};

use crate::config::BrokerConfig;
use crate::error::{Error, ErrorKind};

/// Direction of a message context, matching the data model's `msgKey = (packetId, flow)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Broker is sending a PUBLISH to this connection and waiting on its ack.
    ToPublish,

    /// Broker received a PUBLISH from this connection and is acking it.
    ToAcknowledge,
}

/// State of one in-flight PUBLISH handshake. `SendSubscribe`/`SendSuback`/
/// `SendUnsubscribe`/`SendUnsuback` are not carried by [`MsgContext`] — the
/// dispatcher applies SUBSCRIBE/UNSUBSCRIBE edits synchronously and logs
/// through these same state names, since neither packet has a retry/wait
/// handshake in MQTT 3.1.1 — but they remain part of this vocabulary so the
/// two call sites agree on what a "state transition" is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    QueuedQos0,
    QueuedQos1,
    QueuedQos2,
    WaitForPuback,
    WaitForPubrec,
    WaitForPubrel,
    WaitForPubcomp,
    SendSubscribe,
    SendSuback,
    SendUnsubscribe,
    SendUnsuback,
    SendPubrec,
    SendPubrel,
    SendPubcomp,
    SendPuback,
    Finished,
}

/// One in-progress PUBLISH exchange.
#[derive(Debug, Clone)]
pub struct MsgContext {
    /// Absent for QoS 0, present (and unique per `(id, flow)` among active
    /// contexts) for QoS 1/2 — invariant 2 of §3.
    packet_id: Option<PacketId>,
    flow: Flow,
    publish: PublishPacket,
    state: MsgState,
    attempt: u32,
    deadline: Option<Instant>,
}

impl MsgContext {
    #[must_use]
    pub const fn packet_id(&self) -> Option<PacketId> {
        self.packet_id
    }

    #[must_use]
    pub const fn flow(&self) -> Flow {
        self.flow
    }

    #[must_use]
    pub const fn state(&self) -> MsgState {
        self.state
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn publish(&self) -> &PublishPacket {
        &self.publish
    }
}

/// What the inflight queue wants done as a result of driving it forward.
/// The dispatcher turns these into transport writes or publisher calls; the
/// queue itself never touches the network.
#[derive(Debug, Clone)]
pub enum Outgoing {
    /// Send this PUBLISH (possibly a DUP retransmission — check `packet.dup()`).
    Publish(PublishPacket),
    Puback(PublishAckPacket),
    Pubrec(PublishReceivedPacket),
    Pubrel(PublishReleasePacket),
    Pubcomp(PublishCompletePacket),
    /// Hand this inbound PUBLISH to the outbound publisher (F) for fan-out.
    /// Emitted exactly once per *logical* inbound PUBLISH, even across
    /// PUBLISH retransmissions (duplicate-handling rule 1).
    Deliver(PublishPacket),
    /// A QoS 1/2 outbound PUBLISH exhausted `max_retry`; the context was
    /// dropped. Not fatal to the connection (§7).
    RetryExhausted { packet_id: PacketId },
}

/// Packet identifiers allocated from a rotating counter, skipping ids
/// currently in use in this direction (§4.D).
#[derive(Debug)]
struct PacketIdAllocator {
    next: u16,
    live: std::collections::HashSet<u16>,
    cap: u32,
}

impl PacketIdAllocator {
    fn new(cap: u32) -> Self {
        Self {
            next: 1,
            live: std::collections::HashSet::new(),
            cap,
        }
    }

    fn alloc(&mut self) -> Result<PacketId, Error> {
        if self.live.len() as u32 >= self.cap {
            return Err(Error::new(
                ErrorKind::IdExhausted,
                format!("no free packet id left, cap {}", self.cap),
            ));
        }
        loop {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if self.next == 0 {
                // Packet id 0 is reserved for QoS 0 PUBLISH; ids start at 1 [MQTT-2.3.1-1].
                self.next = 1;
            }
            if self.live.insert(candidate) {
                return Ok(PacketId::new(candidate));
            }
        }
    }

    fn release(&mut self, id: PacketId) {
        self.live.remove(&id.value());
    }
}

/// Per-connection ordered queue of message contexts driving QoS 1/2
/// handshakes with retransmission (component D).
#[derive(Debug)]
pub struct InflightQueue {
    retry_interval: Duration,
    max_retry: u32,
    outbound_ids: PacketIdAllocator,
    contexts: VecDeque<MsgContext>,
}

impl InflightQueue {
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            retry_interval: Duration::from_secs(config.retry_interval_secs()),
            max_retry: config.max_retry(),
            outbound_ids: PacketIdAllocator::new(config.max_inflight_ids()),
            contexts: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Enqueue a broker-originated PUBLISH bound for this connection
    /// (flow = `ToPublish`). Allocates a fresh packet id for QoS 1/2.
    ///
    /// # Errors
    /// Returns [`ErrorKind::IdExhausted`] if this direction has no free id.
    pub fn enqueue_outbound_publish(&mut self, mut publish: PublishPacket) -> Result<(), Error> {
        let (packet_id, state) = match publish.qos() {
            QoS::AtMostOnce => (None, MsgState::QueuedQos0),
            QoS::AtLeastOnce => {
                let id = self.outbound_ids.alloc()?;
                publish.set_packet_id(id);
                (Some(id), MsgState::QueuedQos1)
            }
            QoS::ExactOnce => {
                let id = self.outbound_ids.alloc()?;
                publish.set_packet_id(id);
                (Some(id), MsgState::QueuedQos2)
            }
        };
        self.contexts.push_back(MsgContext {
            packet_id,
            flow: Flow::ToPublish,
            publish,
            state,
            attempt: 0,
            deadline: None,
        });
        Ok(())
    }

    /// Rehydrate a previously persisted context verbatim, preserving its
    /// packet id and state so retransmission resumes where it left off
    /// (§4.C session resumption).
    pub fn rehydrate(&mut self, ctx: MsgContext) {
        if let Some(id) = ctx.packet_id {
            if ctx.flow == Flow::ToPublish {
                self.outbound_ids.live.insert(id.value());
            }
        }
        self.contexts.push_back(ctx);
    }

    /// Enqueue an inbound PUBLISH from this connection (flow =
    /// `ToAcknowledge`). Implements duplicate-handling rule 1: a QoS 2
    /// PUBLISH retransmitted by the publisher because its PUBREC was lost
    /// must not be delivered twice; the existing context is reset to
    /// `SendPubrec` — which re-emits only the PUBREC — instead of routing
    /// back through `QueuedQos2`, which would deliver a second time.
    pub fn enqueue_inbound_publish(&mut self, publish: PublishPacket) {
        let packet_id = match publish.qos() {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce | QoS::ExactOnce => Some(publish.packet_id()),
        };

        if let Some(id) = packet_id {
            if let Some(existing) = self
                .contexts
                .iter_mut()
                .find(|c| c.packet_id == Some(id) && c.flow == Flow::ToAcknowledge)
            {
                log::debug!(
                    "inflight: duplicate inbound PUBLISH {}, resetting to re-ack without redelivery",
                    id
                );
                existing.state = MsgState::SendPubrec;
                existing.attempt += 1;
                return;
            }
        }

        let state = match publish.qos() {
            QoS::AtMostOnce => MsgState::QueuedQos0,
            QoS::AtLeastOnce => MsgState::QueuedQos1,
            QoS::ExactOnce => MsgState::QueuedQos2,
        };
        self.contexts.push_back(MsgContext {
            packet_id,
            flow: Flow::ToAcknowledge,
            publish,
            state,
            attempt: 0,
            deadline: None,
        });
    }

    /// PUBACK received for an outbound QoS 1 PUBLISH.
    pub fn on_puback(&mut self, id: PacketId) {
        if let Some(ctx) = self.find_mut(Some(id), Flow::ToPublish) {
            if ctx.state == MsgState::WaitForPuback {
                ctx.state = MsgState::Finished;
            }
        }
    }

    /// PUBREC received for an outbound QoS 2 PUBLISH. If the context is
    /// absent the original PUBLISH already exhausted its retries and was
    /// abandoned; the PUBREC is silently dropped (duplicate-handling rule
    /// 4).
    pub fn on_pubrec(&mut self, id: PacketId) {
        if let Some(ctx) = self.find_mut(Some(id), Flow::ToPublish) {
            if ctx.state == MsgState::WaitForPubrec {
                ctx.state = MsgState::SendPubrel;
                ctx.attempt = 0;
                ctx.deadline = None;
            }
        }
    }

    /// PUBCOMP received for an outbound QoS 2 PUBLISH. Silently dropped if
    /// the context is absent (duplicate-handling rule 3).
    pub fn on_pubcomp(&mut self, id: PacketId) {
        if let Some(ctx) = self.find_mut(Some(id), Flow::ToPublish) {
            if ctx.state == MsgState::WaitForPubcomp {
                ctx.state = MsgState::Finished;
            }
        }
    }

    /// PUBREL received for an inbound QoS 2 PUBLISH. Returns `true` if a
    /// matching context was found and advanced; `false` means the original
    /// was already completed and the caller must still emit a bare PUBCOMP
    /// without redelivering (duplicate-handling rule 2).
    pub fn on_pubrel(&mut self, id: PacketId) -> bool {
        if let Some(ctx) = self.find_mut(Some(id), Flow::ToAcknowledge) {
            if ctx.state == MsgState::WaitForPubrel {
                ctx.state = MsgState::SendPubcomp;
                return true;
            }
        }
        false
    }

    fn find_mut(&mut self, id: Option<PacketId>, flow: Flow) -> Option<&mut MsgContext> {
        self.contexts
            .iter_mut()
            .find(|c| c.packet_id == id && c.flow == flow)
    }

    /// Drain every remaining context, handing ownership to the caller.
    /// Used when a `cleanSession=false` connection disconnects: the
    /// dispatcher persists each context into the session store so
    /// retransmission can resume, with original packet ids and states
    /// intact, on reconnect (§4.C).
    pub fn drain_all(&mut self) -> Vec<MsgContext> {
        self.contexts.drain(..).collect()
    }

    /// Earliest pending retransmit deadline across all waiting contexts;
    /// the dispatcher resets its sleep to this instant (§4.D).
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.contexts.iter().filter_map(|c| c.deadline).min()
    }

    /// Walk the queue once, advancing every context whose preconditions
    /// are met, and drop everything that reached `Finished`.
    pub fn drive(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();

        for ctx in &mut self.contexts {
            match (ctx.flow, ctx.state) {
                (Flow::ToPublish, MsgState::QueuedQos0) => {
                    out.push(Outgoing::Publish(ctx.publish.clone()));
                    ctx.state = MsgState::Finished;
                }
                (Flow::ToPublish, MsgState::QueuedQos1) => {
                    out.push(Outgoing::Publish(ctx.publish.clone()));
                    ctx.state = MsgState::WaitForPuback;
                    ctx.deadline = Some(now + self.retry_interval);
                }
                (Flow::ToPublish, MsgState::QueuedQos2) => {
                    out.push(Outgoing::Publish(ctx.publish.clone()));
                    ctx.state = MsgState::WaitForPubrec;
                    ctx.deadline = Some(now + self.retry_interval);
                }
                (Flow::ToPublish, MsgState::SendPubrel) => {
                    let Some(id) = ctx.packet_id else { continue };
                    out.push(Outgoing::Pubrel(PublishReleasePacket::new(id)));
                    ctx.state = MsgState::WaitForPubcomp;
                    ctx.deadline = Some(now + self.retry_interval);
                }
                (Flow::ToPublish, MsgState::WaitForPuback | MsgState::WaitForPubrec | MsgState::WaitForPubcomp) => {
                    let Some(deadline) = ctx.deadline else { continue };
                    if now < deadline {
                        continue;
                    }
                    let Some(id) = ctx.packet_id else { continue };
                    if ctx.attempt >= self.max_retry {
                        log::warn!("inflight: retry exhausted for outbound PUBLISH {id}");
                        out.push(Outgoing::RetryExhausted { packet_id: id });
                        ctx.state = MsgState::Finished;
                        continue;
                    }
                    ctx.attempt += 1;
                    ctx.deadline = Some(now + self.retry_interval);
                    if ctx.state == MsgState::WaitForPubcomp {
                        out.push(Outgoing::Pubrel(PublishReleasePacket::new(id)));
                    } else {
                        let mut resend = ctx.publish.clone();
                        let _ = resend.set_dup(true);
                        out.push(Outgoing::Publish(resend));
                    }
                }
                (Flow::ToAcknowledge, MsgState::QueuedQos0) => {
                    out.push(Outgoing::Deliver(ctx.publish.clone()));
                    ctx.state = MsgState::Finished;
                }
                (Flow::ToAcknowledge, MsgState::QueuedQos1) => {
                    let Some(id) = ctx.packet_id else { continue };
                    out.push(Outgoing::Deliver(ctx.publish.clone()));
                    out.push(Outgoing::Puback(PublishAckPacket::new(id)));
                    ctx.state = MsgState::Finished;
                }
                (Flow::ToAcknowledge, MsgState::QueuedQos2) => {
                    let Some(id) = ctx.packet_id else { continue };
                    out.push(Outgoing::Deliver(ctx.publish.clone()));
                    out.push(Outgoing::Pubrec(PublishReceivedPacket::new(id)));
                    ctx.state = MsgState::WaitForPubrel;
                }
                (Flow::ToAcknowledge, MsgState::SendPubrec) => {
                    // Duplicate-handling rule 1: the original PUBLISH was
                    // already delivered; only the PUBREC is re-sent.
                    let Some(id) = ctx.packet_id else { continue };
                    out.push(Outgoing::Pubrec(PublishReceivedPacket::new(id)));
                    ctx.state = MsgState::WaitForPubrel;
                }
                (Flow::ToAcknowledge, MsgState::SendPubcomp) => {
                    let Some(id) = ctx.packet_id else { continue };
                    out.push(Outgoing::Pubcomp(PublishCompletePacket::new(id)));
                    ctx.state = MsgState::Finished;
                }
                _ => {}
            }
        }

        self.contexts.retain(|ctx| {
            let finished = ctx.state == MsgState::Finished;
            if finished {
                if let (Some(id), Flow::ToPublish) = (ctx.packet_id, ctx.flow) {
                    self.outbound_ids.release(id);
                }
            }
            !finished
        });

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::v3::PublishPacket;

    fn cfg() -> BrokerConfig {
        BrokerConfig::default()
    }

    fn publish(topic: &str, qos: QoS, payload: &[u8]) -> PublishPacket {
        let mut p = PublishPacket::new(topic, qos, payload).unwrap();
        p.set_qos(qos);
        p
    }

    #[test]
    fn qos0_outbound_sends_and_finishes_immediately() {
        let mut q = InflightQueue::new(&cfg());
        q.enqueue_outbound_publish(publish("a", QoS::AtMostOnce, b"x")).unwrap();
        let now = Instant::now();
        let out = q.drive(now);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Outgoing::Publish(_)));
        assert!(q.is_empty());
    }

    #[test]
    fn qos1_outbound_waits_then_retransmits_with_dup() {
        let mut q = InflightQueue::new(&cfg());
        q.enqueue_outbound_publish(publish("a", QoS::AtLeastOnce, b"x")).unwrap();
        let t0 = Instant::now();
        let out = q.drive(t0);
        assert_eq!(out.len(), 1);
        let id = match &out[0] {
            Outgoing::Publish(p) => p.packet_id(),
            _ => panic!("expected publish"),
        };

        // not yet due
        assert!(q.drive(t0).is_empty());

        let after_timeout = t0 + Duration::from_secs(11);
        let out = q.drive(after_timeout);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outgoing::Publish(p) => {
                assert!(p.dup());
                assert_eq!(p.packet_id(), id);
            }
            _ => panic!("expected dup publish"),
        }

        q.on_puback(id);
        let out = q.drive(after_timeout);
        assert!(out.is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn qos1_outbound_gives_up_after_max_retry() {
        let mut q = InflightQueue::new(&cfg());
        q.enqueue_outbound_publish(publish("a", QoS::AtLeastOnce, b"x")).unwrap();
        let mut now = Instant::now();
        q.drive(now); // initial send
        for _ in 0..cfg().max_retry() {
            now += Duration::from_secs(11);
            let out = q.drive(now);
            assert!(out.iter().any(|o| matches!(o, Outgoing::Publish(_))));
        }
        now += Duration::from_secs(11);
        let out = q.drive(now);
        assert!(out.iter().any(|o| matches!(o, Outgoing::RetryExhausted { .. })));
        assert!(q.is_empty());
    }

    #[test]
    fn qos2_inbound_duplicate_does_not_redeliver() {
        let mut q = InflightQueue::new(&cfg());
        let mut p = publish("a", QoS::ExactOnce, b"x");
        p.set_packet_id(PacketId::new(17));
        q.enqueue_inbound_publish(p.clone());
        let out = q.drive(Instant::now());
        assert!(out.iter().any(|o| matches!(o, Outgoing::Deliver(_))));
        assert!(out.iter().any(|o| matches!(o, Outgoing::Pubrec(pr) if pr.packet_id() == PacketId::new(17))));

        // publisher retransmits PUBLISH because its PUBREC was lost
        q.enqueue_inbound_publish(p);
        let out = q.drive(Instant::now());
        assert!(!out.iter().any(|o| matches!(o, Outgoing::Deliver(_))));
        assert!(out.iter().any(|o| matches!(o, Outgoing::Pubrec(pr) if pr.packet_id() == PacketId::new(17))));
    }

    #[test]
    fn qos2_inbound_completes_on_pubrel() {
        let mut q = InflightQueue::new(&cfg());
        let mut p = publish("a", QoS::ExactOnce, b"x");
        p.set_packet_id(PacketId::new(9));
        q.enqueue_inbound_publish(p);
        q.drive(Instant::now());
        assert!(q.on_pubrel(PacketId::new(9)));
        let out = q.drive(Instant::now());
        assert!(out.iter().any(|o| matches!(o, Outgoing::Pubcomp(pc) if pc.packet_id() == PacketId::new(9))));
        assert!(q.is_empty());
    }

    #[test]
    fn stray_pubrel_without_context_is_not_found() {
        let mut q = InflightQueue::new(&cfg());
        assert!(!q.on_pubrel(PacketId::new(123)));
    }

    #[test]
    fn stray_pubcomp_and_pubrec_are_ignored() {
        let mut q = InflightQueue::new(&cfg());
        // Neither call should panic; both are no-ops absent a context.
        q.on_pubcomp(PacketId::new(5));
        q.on_pubrec(PacketId::new(5));
        assert!(q.is_empty());
    }

    #[test]
    fn packet_id_allocator_skips_live_ids() {
        let mut q = InflightQueue::new(&cfg());
        q.enqueue_outbound_publish(publish("a", QoS::AtLeastOnce, b"1")).unwrap();
        q.enqueue_outbound_publish(publish("a", QoS::AtLeastOnce, b"2")).unwrap();
        let ids: Vec<_> = q.contexts.iter().filter_map(MsgContext::packet_id).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }
}
