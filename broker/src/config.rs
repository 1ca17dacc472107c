// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Tunables named in the concurrency/resource model: retransmit timeout,
//! retry budget, packet-id cap, broker maximum QoS, keep-alive multiplier.
//!
//! These structs do not read files themselves; the host broker loads them
//! from TOML (or wherever) and passes the parsed value in, the way the
//! teacher's `session::SessionConfig` is built by its caller.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Broker-wide tunables consumed by the subscription table, inflight queue
/// and dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Highest QoS the broker will grant a subscription, regardless of what
    /// the client requested.
    max_qos: u8,

    /// Retransmit timeout for QoS 1/2 waits, in seconds. Default 10s (§5).
    retry_interval_secs: u64,

    /// Max retransmissions of a QoS 1/2 PUBLISH before the context is
    /// abandoned with `RetryExhausted`. Default 3 (§5).
    max_retry: u32,

    /// Upper bound on live outbound packet ids per connection. Default
    /// 65535 (§4.D).
    max_inflight_ids: u32,

    /// Multiplier applied to the CONNECT keep-alive to compute the
    /// disconnect deadline. Fixed at 1.5 by the MQTT spec (§4.E) but kept
    /// configurable for testing.
    keep_alive_multiplier: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retry_interval_secs: 10,
            max_retry: 3,
            max_inflight_ids: 65535,
            keep_alive_multiplier: 1.5,
        }
    }
}

impl BrokerConfig {
    /// Builds a config, rejecting tunables that would make the state
    /// machine meaningless (e.g. a zero retry budget can never retransmit).
    ///
    /// # Errors
    /// Returns [`ErrorKind::ConfigError`] if any tunable is out of range.
    pub fn new(
        max_qos: u8,
        retry_interval_secs: u64,
        max_retry: u32,
        max_inflight_ids: u32,
        keep_alive_multiplier: f64,
    ) -> Result<Self, Error> {
        if max_qos > 2 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                format!("max_qos must be 0, 1 or 2, got {max_qos}"),
            ));
        }
        if retry_interval_secs == 0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "retry_interval_secs must be non-zero",
            ));
        }
        if max_retry == 0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "max_retry must be non-zero: a zero retry budget can never retransmit",
            ));
        }
        if max_inflight_ids == 0 || max_inflight_ids > u32::from(u16::MAX) {
            return Err(Error::new(
                ErrorKind::ConfigError,
                format!("max_inflight_ids must be in 1..=65535, got {max_inflight_ids}"),
            ));
        }
        if keep_alive_multiplier <= 0.0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "keep_alive_multiplier must be positive",
            ));
        }
        Ok(Self {
            max_qos,
            retry_interval_secs,
            max_retry,
            max_inflight_ids,
            keep_alive_multiplier,
        })
    }

    #[must_use]
    pub const fn max_qos(&self) -> u8 {
        self.max_qos
    }

    #[must_use]
    pub const fn retry_interval_secs(&self) -> u64 {
        self.retry_interval_secs
    }

    #[must_use]
    pub const fn max_retry(&self) -> u32 {
        self.max_retry
    }

    #[must_use]
    pub const fn max_inflight_ids(&self) -> u32 {
        self.max_inflight_ids
    }

    #[must_use]
    pub const fn keep_alive_multiplier(&self) -> f64 {
        self.keep_alive_multiplier
    }
}

/// Per-session tunables not shared across the broker (session-scoped so a
/// future admission-control layer could vary them per client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep-alive interval requested by CONNECT, in seconds; 0 disables it.
    keep_alive: u16,

    /// Allow a client to connect with an empty client id (broker assigns
    /// one and forces `clean_session = true`, per MQTT-3.1.3-8).
    allow_empty_client_id: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive: 60,
            allow_empty_client_id: true,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn new(keep_alive: u16, allow_empty_client_id: bool) -> Self {
        Self {
            keep_alive,
            allow_empty_client_id,
        }
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    #[must_use]
    pub const fn allow_empty_client_id(&self) -> bool {
        self.allow_empty_client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.max_qos(), 2);
        assert_eq!(cfg.max_retry(), 3);
    }

    #[test]
    fn rejects_qos_above_two() {
        assert!(BrokerConfig::new(3, 10, 3, 65535, 1.5).is_err());
    }

    #[test]
    fn rejects_zero_retry_interval() {
        assert!(BrokerConfig::new(2, 0, 3, 65535, 1.5).is_err());
    }

    #[test]
    fn rejects_zero_max_retry() {
        assert!(BrokerConfig::new(2, 10, 0, 65535, 1.5).is_err());
    }
}
