// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Core broker engine: subscription routing and per-connection QoS state
//! machines. Byte-level framing, TCP/TLS/WebSocket acceptors and CLI
//! bootstrap live outside this crate; see [`dispatcher::Transport`] and
//! [`dispatcher::ConnectionRegistry`] for the seams those collaborators
//! plug into.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod inflight;
pub mod publisher;
pub mod session;
pub mod subscription;
pub mod types;

pub use commands::DispatcherToDispatcherCmd;
pub use config::{BrokerConfig, SessionConfig};
pub use dispatcher::{ConnectionRegistry, Dispatcher, Transport};
pub use error::{Error, ErrorKind};
pub use inflight::{Flow, InflightQueue, MsgContext, MsgState};
pub use publisher::Publisher;
pub use session::{Session, SessionStore};
pub use subscription::{Subscription, SubscriptionTable};
pub use types::ClientId;
