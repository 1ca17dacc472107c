// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Identifiers shared across the dispatcher, subscription table and session
//! store.

use std::fmt;

/// Client identifier as carried in the CONNECT packet.
///
/// Newtype rather than a bare `String` so subscription rows, session keys
/// and command payloads cannot be confused with topic or filter strings at
/// the type level.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(String);

impl ClientId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque handle identifying a live network connection.
///
/// Subscription rows hold a `ConnId` rather than a reference to the
/// connection itself; the dispatcher's [`crate::dispatcher::ConnectionRegistry`]
/// resolves it back to a live sender. This avoids a cyclic reference between
/// subscription rows and connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_display_roundtrips() {
        let id = ClientId::from("device-1");
        assert_eq!(id.as_str(), "device-1");
        assert_eq!(format!("{id}"), "device-1");
    }
}
