// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};

use tokio::sync::mpsc;

use crate::commands::DispatcherToDispatcherCmd;

/// Represent the types of errors the core can raise.
///
/// Every kind maps onto a clause in the error handling design: most are
/// fatal to the connection that raised them, `IdExhausted` only
/// backpressures the enqueue that tripped it, and `RetryExhausted` never
/// kills a connection at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed packet, server-only packet received from a client, or an
    /// invalid topic filter. Fatal to the connection.
    ProtocolViolation,

    /// The packet-id allocator has no free id left in its direction.
    /// Backpressures the enqueue; does not kill the connection.
    IdExhausted,

    /// The transport reported a send/receive failure. Fatal to the
    /// connection.
    TransportError,

    /// A QoS 1/2 context exhausted its retransmissions. Logged, not fatal.
    RetryExhausted,

    /// A reconnect with the same client id displaced a live connection.
    SessionConflict,

    /// Internal actor-wiring failure: an mpsc channel had no receiver left.
    ChannelError,

    /// An invalid tunable was supplied to [`crate::config::BrokerConfig`].
    ConfigError,

    /// Operation referred to a session that does not exist.
    SessionNotFound,
}

#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn session_not_found(client_id: &str) -> Self {
        Self::new(
            ErrorKind::SessionNotFound,
            format!("no session for client id {client_id}"),
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::new(ErrorKind::ProtocolViolation, format!("encode error: {err:?}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::new(ErrorKind::ProtocolViolation, format!("decode error: {err:?}"))
    }
}

macro_rules! convert_send_error {
    ($cmd_type:ty) => {
        impl From<mpsc::error::SendError<$cmd_type>> for Error {
            fn from(err: mpsc::error::SendError<$cmd_type>) -> Self {
                Self::new(ErrorKind::ChannelError, format!("channel closed: {err}"))
            }
        }
    };
}

convert_send_error!(DispatcherToDispatcherCmd);
