// src/connection/session.rs

//! Per-connection session state: the idempotency channel binding.

use crate::core::idempotency::{Channel, ChannelTable};
use std::sync::Arc;

/// How this connection relates to an idempotency channel, if at all.
///
/// The connection that set a channel up is its *holder*; its disconnect
/// invalidates the channel. Connections that joined with the channel's
/// `(id, key)` are *users* and can come and go freely.
#[derive(Debug, Clone, Default)]
pub enum ChannelRole {
    #[default]
    None,
    Holder(Arc<Channel>),
    User(Arc<Channel>),
}

/// The mutable state of one client connection.
#[derive(Debug, Default)]
pub struct SessionState {
    pub channel: ChannelRole,
}

impl SessionState {
    /// The bound channel for mutating requests, regardless of role.
    pub fn user_channel(&self) -> Option<&Arc<Channel>> {
        match &self.channel {
            ChannelRole::User(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn holder_channel(&self) -> Option<&Arc<Channel>> {
        match &self.channel {
            ChannelRole::Holder(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn has_channel(&self) -> bool {
        !matches!(self.channel, ChannelRole::None)
    }

    /// Releases the binding on disconnect. A holder disconnect invalidates
    /// the channel (users rebind later with the key); a user disconnect
    /// leaves it untouched.
    pub fn finish(&mut self, table: &ChannelTable) {
        if let ChannelRole::Holder(channel) = &self.channel {
            table.invalidate(channel.id);
        }
        self.channel = ChannelRole::None;
    }
}
