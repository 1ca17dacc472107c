// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Per-client persistent session store (component C).
//!
//! Keyed by [`ClientId`] with per-key locking: each session lives behind
//! its own `Mutex`, so a reconnect on client A never blocks a publish
//! touching client B's offline queue. Session ownership itself (which
//! connection, if any, is live) moves atomically under the outer table
//! lock in [`SessionStore::open`] / [`SessionStore::close`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use codec::v3::PublishPacket;

use crate::config::SessionConfig;
use crate::error::Error;
use crate::inflight::MsgContext;
use crate::types::{ClientId, ConnId};

/// Per-client persistent session: `{clientId, cleanSession, subscriptions,
/// inflight, offlineQueue, willMessage?, lastCommTime}` (§3). The
/// `subscriptions` set itself lives in [`crate::subscription::SubscriptionTable`]
/// keyed by the same `ClientId`; this struct owns everything else.
#[derive(Debug)]
pub struct Session {
    client_id: ClientId,
    clean_session: bool,
    conn_id: Option<ConnId>,
    /// Rehydrated into a fresh [`crate::inflight::InflightQueue`] on reconnect,
    /// preserving packet ids and states (§4.C).
    inflight: Vec<MsgContext>,
    /// Queued PUBLISH for granted-QoS-1/2 subscriptions while the client is
    /// offline; drained in FIFO order before any newly published traffic
    /// reaches the freshly bound connection (§4.F, §9 open question b).
    offline_queue: VecDeque<PublishPacket>,
    will: Option<PublishPacket>,
    last_comm_time: Instant,
}

impl Session {
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[must_use]
    pub const fn conn_id(&self) -> Option<ConnId> {
        self.conn_id
    }

    #[must_use]
    pub const fn last_comm_time(&self) -> Instant {
        self.last_comm_time
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_comm_time = now;
    }

    pub fn set_will(&mut self, will: Option<PublishPacket>) {
        self.will = will;
    }

    #[must_use]
    pub fn take_will(&mut self) -> Option<PublishPacket> {
        self.will.take()
    }

    /// Queue a PUBLISH for later delivery (effectiveQoS must be >= 1,
    /// enforced by the caller — §4.F).
    pub fn enqueue_offline(&mut self, publish: PublishPacket) {
        self.offline_queue.push_back(publish);
    }

    #[must_use]
    pub fn offline_queue_len(&self) -> usize {
        self.offline_queue.len()
    }
}

/// Per-client locking granularity for the session store: one `Mutex` per
/// session rather than one lock over the whole table, so reconnecting
/// client A never contends with a publish fanning out to client B.
struct Entry {
    session: Mutex<Session>,
}

/// Per-client persistent session store (component C).
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<ClientId, Entry>>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `client_id`. Returns `sessionPresent` per
    /// MQTT-3.2.2-2/3: `true` only when `clean_session=false` and a prior
    /// non-clean session already existed.
    ///
    /// Invariant 3 (§3): reconnecting with the same client id displaces
    /// the prior connection. The caller is responsible for telling the
    /// old connection's dispatcher to terminate; this method only updates
    /// bookkeeping and returns the previously-bound `ConnId`, if any, so
    /// the caller can do so.
    pub fn open(
        &self,
        client_id: ClientId,
        clean_session: bool,
        conn_id: ConnId,
        now: Instant,
    ) -> (SessionPresent, Option<ConnId>) {
        let mut sessions = self.sessions.write().expect("session store lock poisoned");

        if let Some(entry) = sessions.get(&client_id) {
            let mut session = entry.session.lock().expect("session lock poisoned");
            let displaced = session.conn_id;
            if clean_session || session.clean_session {
                session.inflight.clear();
                session.offline_queue.clear();
                session.will = None;
                session.clean_session = clean_session;
                session.conn_id = Some(conn_id);
                session.touch(now);
                return (SessionPresent(false), displaced);
            }
            session.conn_id = Some(conn_id);
            session.touch(now);
            return (SessionPresent(true), displaced);
        }

        sessions.insert(
            client_id.clone(),
            Entry {
                session: Mutex::new(Session {
                    client_id,
                    clean_session,
                    conn_id: Some(conn_id),
                    inflight: Vec::new(),
                    offline_queue: VecDeque::new(),
                    will: None,
                    last_comm_time: now,
                }),
            },
        );
        (SessionPresent(false), None)
    }

    /// Close the session bound to `client_id`. `clean_disconnect` selects
    /// between a client-requested DISCONNECT (never publishes the will)
    /// and an abnormal termination (publishes the will if one is set and
    /// the session is non-clean, §5 cancellation / §9 open question b).
    ///
    /// Returns the will message to publish, if any, and destroys the
    /// session outright when `clean_session=true`.
    pub fn close(&self, client_id: &ClientId, clean_disconnect: bool) -> Option<PublishPacket> {
        let mut sessions = self.sessions.write().expect("session store lock poisoned");
        let Some(entry) = sessions.get(client_id) else {
            return None;
        };

        let (destroy, will) = {
            let mut session = entry.session.lock().expect("session lock poisoned");
            session.conn_id = None;
            let will = if clean_disconnect {
                session.will.take();
                None
            } else {
                session.take_will()
            };
            (session.clean_session, will)
        };

        if destroy {
            sessions.remove(client_id);
        }
        will
    }

    /// Rehydrate a message context into the persisted session's inflight
    /// list (survives until the connection's [`crate::inflight::InflightQueue`]
    /// pulls it back out on reconnect).
    ///
    /// # Errors
    /// Returns [`ErrorKind::SessionNotFound`] if no session exists for
    /// `client_id`.
    pub fn persist_inflight(&self, client_id: &ClientId, ctx: MsgContext) -> Result<(), Error> {
        let sessions = self.sessions.read().expect("session store lock poisoned");
        let entry = sessions
            .get(client_id)
            .ok_or_else(|| Error::session_not_found(client_id.as_str()))?;
        entry
            .session
            .lock()
            .expect("session lock poisoned")
            .inflight
            .push(ctx);
        Ok(())
    }

    /// Drain and return every persisted inflight context for `client_id`,
    /// so the dispatcher can rehydrate them into a fresh
    /// [`crate::inflight::InflightQueue`] on reconnect.
    #[must_use]
    pub fn take_inflight(&self, client_id: &ClientId) -> Vec<MsgContext> {
        let sessions = self.sessions.read().expect("session store lock poisoned");
        sessions.get(client_id).map_or_else(Vec::new, |entry| {
            std::mem::take(&mut entry.session.lock().expect("session lock poisoned").inflight)
        })
    }

    /// Queue a PUBLISH for later delivery while the client is offline.
    /// No-op (logged) if the client has no persisted session.
    pub fn enqueue_offline(&self, client_id: &ClientId, publish: PublishPacket) {
        let sessions = self.sessions.read().expect("session store lock poisoned");
        match sessions.get(client_id) {
            Some(entry) => entry
                .session
                .lock()
                .expect("session lock poisoned")
                .enqueue_offline(publish),
            None => log::warn!("session: no session for {client_id}, dropping offline publish"),
        }
    }

    /// Drain the offline queue for `client_id` in FIFO order.
    #[must_use]
    pub fn drain_offline_queue(&self, client_id: &ClientId) -> Vec<PublishPacket> {
        let sessions = self.sessions.read().expect("session store lock poisoned");
        sessions.get(client_id).map_or_else(Vec::new, |entry| {
            entry
                .session
                .lock()
                .expect("session lock poisoned")
                .offline_queue
                .drain(..)
                .collect()
        })
    }

    #[must_use]
    pub fn is_live(&self, client_id: &ClientId) -> bool {
        let sessions = self.sessions.read().expect("session store lock poisoned");
        sessions
            .get(client_id)
            .is_some_and(|entry| entry.session.lock().expect("session lock poisoned").conn_id.is_some())
    }

    pub fn touch(&self, client_id: &ClientId, now: Instant) {
        let sessions = self.sessions.read().expect("session store lock poisoned");
        if let Some(entry) = sessions.get(client_id) {
            entry.session.lock().expect("session lock poisoned").touch(now);
        }
    }

    pub fn set_will(&self, client_id: &ClientId, will: Option<PublishPacket>) {
        let sessions = self.sessions.read().expect("session store lock poisoned");
        if let Some(entry) = sessions.get(client_id) {
            entry.session.lock().expect("session lock poisoned").set_will(will);
        }
    }
}

/// Whether the reopened session already existed server-side (CONNACK's
/// `sessionPresent` flag, §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPresent(pub bool);

/// Derive a session's keep-alive deadline check from [`SessionConfig`]
/// (§4.E): disconnect if `now - lastCommTime > 1.5 * keepalive`.
#[must_use]
pub fn keep_alive_expired(session_cfg: &SessionConfig, multiplier: f64, last_comm_time: Instant, now: Instant) -> bool {
    if session_cfg.keep_alive() == 0 {
        return false;
    }
    let deadline = f64::from(session_cfg.keep_alive()) * multiplier;
    now.duration_since(last_comm_time).as_secs_f64() > deadline
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(s: &str) -> ClientId {
        ClientId::from(s)
    }

    #[test]
    fn clean_session_never_reports_present() {
        let store = SessionStore::new();
        let now = Instant::now();
        let (present, displaced) = store.open(cid("a"), true, ConnId::new(1), now);
        assert!(!present.0);
        assert!(displaced.is_none());
    }

    #[test]
    fn non_clean_reconnect_reports_present_and_keeps_offline_queue() {
        let store = SessionStore::new();
        let now = Instant::now();
        store.open(cid("a"), false, ConnId::new(1), now);
        store.enqueue_offline(&cid("a"), PublishPacket::new("x", codec::QoS::AtLeastOnce, b"p").unwrap());
        store.close(&cid("a"), true);

        let (present, _) = store.open(cid("a"), false, ConnId::new(2), now);
        assert!(present.0);
        let drained = store.drain_offline_queue(&cid("a"));
        assert_eq!(drained.len(), 1);
    }

    #[test]
    fn clean_disconnect_destroys_clean_session() {
        let store = SessionStore::new();
        let now = Instant::now();
        store.open(cid("a"), true, ConnId::new(1), now);
        store.close(&cid("a"), true);
        assert!(!store.is_live(&cid("a")));
        let (present, _) = store.open(cid("a"), false, ConnId::new(2), now);
        assert!(!present.0, "destroyed session cannot report present");
    }

    #[test]
    fn abnormal_disconnect_on_persistent_session_returns_will() {
        let store = SessionStore::new();
        let now = Instant::now();
        store.open(cid("a"), false, ConnId::new(1), now);
        store.set_will(&cid("a"), Some(PublishPacket::new("lwt", codec::QoS::AtMostOnce, b"bye").unwrap()));
        let will = store.close(&cid("a"), false);
        assert!(will.is_some());
    }

    #[test]
    fn clean_disconnect_never_publishes_will() {
        let store = SessionStore::new();
        let now = Instant::now();
        store.open(cid("a"), false, ConnId::new(1), now);
        store.set_will(&cid("a"), Some(PublishPacket::new("lwt", codec::QoS::AtMostOnce, b"bye").unwrap()));
        let will = store.close(&cid("a"), true);
        assert!(will.is_none());
    }

    #[test]
    fn reconnect_reports_displaced_connection() {
        let store = SessionStore::new();
        let now = Instant::now();
        store.open(cid("a"), false, ConnId::new(1), now);
        let (_, displaced) = store.open(cid("a"), false, ConnId::new(2), now);
        assert_eq!(displaced, Some(ConnId::new(1)));
    }

    #[test]
    fn keep_alive_zero_never_expires() {
        let cfg = SessionConfig::new(0, true);
        assert!(!keep_alive_expired(&cfg, 1.5, Instant::now(), Instant::now()));
    }
}
