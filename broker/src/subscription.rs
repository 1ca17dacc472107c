// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Subscription table: filter → subscriber mapping (component B).
//!
//! Filters are split into levels once, at subscribe time, rather than kept
//! as raw strings and re-split on every publish — matching a topic against
//! the whole table stays O(levels) per candidate row instead of repeatedly
//! calling into a regex engine, which is the fragility the teacher's
//! C# original ran into around `$`-prefixed topics.

use std::collections::HashMap;
use std::sync::RwLock;

use codec::QoS;

use crate::types::{ClientId, ConnId};

/// One level of a precompiled topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FilterLevel {
    Literal(String),
    Plus,
    Hash,
}

/// A topic filter split into levels, compiled once at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CompiledFilter {
    levels: Vec<FilterLevel>,
}

impl CompiledFilter {
    /// # Errors
    ///
    /// Returns an error if `filter` is empty, uses `+`/`#` as anything but
    /// a whole level, or places `#` anywhere but last.
    fn compile(filter: &str) -> Result<Self, String> {
        if filter.is_empty() {
            return Err("empty topic filter".to_owned());
        }
        let raw_levels: Vec<&str> = filter.split('/').collect();
        let mut levels = Vec::with_capacity(raw_levels.len());
        for (i, level) in raw_levels.iter().enumerate() {
            let compiled = match *level {
                "+" => FilterLevel::Plus,
                "#" => {
                    if i != raw_levels.len() - 1 {
                        return Err(format!("'#' must be the last level in {filter:?}"));
                    }
                    FilterLevel::Hash
                }
                other if other.contains('+') || other.contains('#') => {
                    return Err(format!("'+'/'#' must occupy a whole level in {filter:?}"));
                }
                other => FilterLevel::Literal(other.to_owned()),
            };
            levels.push(compiled);
        }
        Ok(Self { levels })
    }

    /// §4.A matching algorithm: walk both split strings in lockstep.
    fn matches(&self, topic: &str) -> bool {
        let topic_is_system = topic.starts_with('$');
        if topic_is_system {
            match self.levels.first() {
                Some(FilterLevel::Plus | FilterLevel::Hash) => return false,
                _ => {}
            }
        }

        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            match level {
                FilterLevel::Hash => return true,
                FilterLevel::Plus => match topic_levels.next() {
                    Some(actual) if !actual.is_empty() => {}
                    _ => return false,
                },
                FilterLevel::Literal(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }
        topic_levels.next().is_none()
    }

    /// Non-wildcard prefix length, used to break ties in [`SubscriptionTable::get_subscription`].
    fn literal_prefix_len(&self) -> usize {
        self.levels
            .iter()
            .take_while(|l| matches!(l, FilterLevel::Literal(_)))
            .count()
    }
}

/// One subscription row: `{clientId, filter, grantedQos, connectionRef}` (§3).
#[derive(Debug, Clone)]
pub struct Subscription {
    client_id: ClientId,
    filter: String,
    granted_qos: QoS,
    conn_id: Option<ConnId>,
    /// Monotonic insertion order, used to break ties in `get_subscription`
    /// when two filters share the same granted QoS and literal-prefix length.
    seq: u64,
}

impl Subscription {
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    #[must_use]
    pub const fn granted_qos(&self) -> QoS {
        self.granted_qos
    }

    #[must_use]
    pub const fn conn_id(&self) -> Option<ConnId> {
        self.conn_id
    }
}

struct Row {
    compiled: CompiledFilter,
    sub: Subscription,
}

/// Mapping from filter to subscriber set, serialized under a single
/// reader/writer lock (§5): `find_subscribers` takes a shared lock,
/// mutating operations take an exclusive one, and the lock is never held
/// across I/O — callers copy the result into a local `Vec` first.
#[derive(Default)]
pub struct SubscriptionTable {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    // clientId -> filter string -> row. Invariant 1 of §3: at most one row
    // per (clientId, filter).
    by_client: HashMap<ClientId, HashMap<String, Row>>,
    next_seq: u64,
}

impl std::fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionTable").finish_non_exhaustive()
    }
}

impl SubscriptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the subscription row; `requested_qos` is capped at
    /// `max_qos`. Returns the granted QoS for SUBACK assembly.
    ///
    /// # Errors
    /// Returns an error if `filter` is not a well-formed topic filter.
    pub fn subscribe(
        &self,
        client_id: ClientId,
        filter: &str,
        requested_qos: QoS,
        conn_id: Option<ConnId>,
        max_qos: QoS,
    ) -> Result<QoS, String> {
        let compiled = CompiledFilter::compile(filter)?;
        let granted_qos = requested_qos.min(max_qos);

        let mut inner = self.inner.write().expect("subscription table lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let client_rows = inner.by_client.entry(client_id.clone()).or_default();
        client_rows.insert(
            filter.to_owned(),
            Row {
                compiled,
                sub: Subscription {
                    client_id,
                    filter: filter.to_owned(),
                    granted_qos,
                    conn_id,
                    seq,
                },
            },
        );
        Ok(granted_qos)
    }

    /// Remove the row if present; idempotent.
    pub fn unsubscribe(&self, client_id: &ClientId, filter: &str) {
        let mut inner = self.inner.write().expect("subscription table lock poisoned");
        if let Some(rows) = inner.by_client.get_mut(client_id) {
            rows.remove(filter);
            if rows.is_empty() {
                inner.by_client.remove(client_id);
            }
        }
    }

    /// Remove every row for `client_id` (invariant 5 cleanup on session
    /// destruction).
    pub fn unsubscribe_all(&self, client_id: &ClientId) {
        let mut inner = self.inner.write().expect("subscription table lock poisoned");
        inner.by_client.remove(client_id);
    }

    /// Unbind the connection reference for every row belonging to
    /// `client_id`, keeping the rows themselves (used when a
    /// `cleanSession=false` connection disconnects without destroying its
    /// session — §5 cancellation).
    pub fn unbind_connection(&self, client_id: &ClientId) {
        let mut inner = self.inner.write().expect("subscription table lock poisoned");
        if let Some(rows) = inner.by_client.get_mut(client_id) {
            for row in rows.values_mut() {
                row.sub.conn_id = None;
            }
        }
    }

    /// Every subscription whose filter matches `topic`, one row per
    /// matching filter (overlap dedup happens in the publisher, §4.B).
    #[must_use]
    pub fn find_subscribers(&self, topic: &str) -> Vec<Subscription> {
        let inner = self.inner.read().expect("subscription table lock poisoned");
        let mut out = Vec::new();
        for rows in inner.by_client.values() {
            for row in rows.values() {
                if row.compiled.matches(topic) {
                    out.push(row.sub.clone());
                }
            }
        }
        out
    }

    /// Highest-granted-QoS row for `client_id` whose filter matches
    /// `topic`; ties broken by longest non-wildcard prefix, then
    /// insertion order.
    #[must_use]
    pub fn get_subscription(&self, topic: &str, client_id: &ClientId) -> Option<Subscription> {
        let inner = self.inner.read().expect("subscription table lock poisoned");
        let rows = inner.by_client.get(client_id)?;
        rows.values()
            .filter(|row| row.compiled.matches(topic))
            .max_by_key(|row| (row.sub.granted_qos, row.compiled.literal_prefix_len(), row.sub.seq))
            .map(|row| row.sub.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(s: &str) -> ClientId {
        ClientId::from(s)
    }

    #[test]
    fn hash_matches_parent_and_descendants() {
        let f = CompiledFilter::compile("foo/#").unwrap();
        assert!(f.matches("foo"));
        assert!(f.matches("foo/bar"));
        assert!(f.matches("foo/bar/baz"));
        assert!(!f.matches("food"));
    }

    #[test]
    fn bare_hash_matches_anything_but_dollar() {
        let f = CompiledFilter::compile("#").unwrap();
        assert!(f.matches("a/b/c"));
        assert!(!f.matches("$SYS/broker/uptime"));
    }

    #[test]
    fn plus_does_not_match_empty_level() {
        let f = CompiledFilter::compile("sport/+/player1").unwrap();
        assert!(f.matches("sport/tennis/player1"));
        assert!(!f.matches("sport//player1"));
        assert!(!f.matches("sport/tennis/bowling/player1"));
    }

    #[test]
    fn dollar_topics_need_literal_first_level() {
        let f = CompiledFilter::compile("$SYS/#").unwrap();
        assert!(f.matches("$SYS/broker/uptime"));
        let f = CompiledFilter::compile("+/uptime").unwrap();
        assert!(!f.matches("$SYS/uptime"));
    }

    #[test]
    fn rejects_hash_not_last_and_partial_wildcards() {
        assert!(CompiledFilter::compile("a/#/b").is_err());
        assert!(CompiledFilter::compile("a+").is_err());
        assert!(CompiledFilter::compile("").is_err());
    }

    #[test]
    fn subscribe_caps_qos_at_broker_maximum() {
        let table = SubscriptionTable::new();
        let granted = table
            .subscribe(cid("a"), "x/y", QoS::ExactOnce, None, QoS::AtLeastOnce)
            .unwrap();
        assert_eq!(granted, QoS::AtLeastOnce);
    }

    #[test]
    fn resubscribe_replaces_granted_qos_not_adds_a_row() {
        let table = SubscriptionTable::new();
        table.subscribe(cid("a"), "x", QoS::AtMostOnce, None, QoS::ExactOnce).unwrap();
        table.subscribe(cid("a"), "x", QoS::ExactOnce, None, QoS::ExactOnce).unwrap();
        let subs = table.find_subscribers("x");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].granted_qos(), QoS::ExactOnce);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let table = SubscriptionTable::new();
        table.subscribe(cid("a"), "x", QoS::AtLeastOnce, None, QoS::ExactOnce).unwrap();
        table.unsubscribe(&cid("a"), "x");
        table.unsubscribe(&cid("a"), "x");
        assert!(table.find_subscribers("x").is_empty());
    }

    #[test]
    fn overlap_dedup_keeps_max_qos_row_per_client() {
        let table = SubscriptionTable::new();
        table.subscribe(cid("a"), "a/#", QoS::AtMostOnce, None, QoS::ExactOnce).unwrap();
        table.subscribe(cid("a"), "a/b/c", QoS::ExactOnce, None, QoS::ExactOnce).unwrap();
        let subs = table.find_subscribers("a/b/c");
        assert_eq!(subs.len(), 2, "find_subscribers returns every matching row");

        let best = table.get_subscription("a/b/c", &cid("a")).unwrap();
        assert_eq!(best.granted_qos(), QoS::ExactOnce);
        assert_eq!(best.filter(), "a/b/c");
    }

    #[test]
    fn unbind_connection_keeps_row_but_clears_conn_id() {
        let table = SubscriptionTable::new();
        table
            .subscribe(cid("a"), "x", QoS::AtLeastOnce, Some(ConnId::new(1)), QoS::ExactOnce)
            .unwrap();
        table.unbind_connection(&cid("a"));
        let sub = table.get_subscription("x", &cid("a")).unwrap();
        assert!(sub.conn_id().is_none());
    }
}
