use std::sync::RwLock;

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Default)]
struct Joined {
    channel: Option<String>,
    /// Bumped on every clear, i.e. once per connection.
    epoch: u64,
}

/// The channel joined on the current connection, if any.
#[derive(Debug, Default)]
pub struct ChannelSession {
    joined: RwLock<Joined>,
}

impl ChannelSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<String> {
        self.joined
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .channel
            .clone()
    }

    pub fn epoch(&self) -> u64 {
        self.joined
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .epoch
    }

    pub fn set(&self, channel: impl Into<String>) {
        let channel = channel.into();
        tracing::info!(channel = %channel, "joined channel");
        self.joined
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .channel = Some(channel);
    }

    /// Record `channel` only if no clear happened since `epoch` was read.
    pub fn set_if_epoch(&self, epoch: u64, channel: impl Into<String>) -> bool {
        let channel = channel.into();
        let mut joined = self
            .joined
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if joined.epoch != epoch {
            tracing::warn!(channel = %channel, "connection changed during join, not recording channel");
            return false;
        }
        tracing::info!(channel = %channel, "joined channel");
        joined.channel = Some(channel);
        true
    }

    pub fn clear(&self) {
        let previous = {
            let mut joined = self
                .joined
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            joined.epoch += 1;
            joined.channel.take()
        };
        if let Some(channel) = previous {
            tracing::debug!(channel = %channel, "channel cleared");
        }
    }

    pub fn require(&self) -> BridgeResult<String> {
        self.current().ok_or(BridgeError::NoChannel)
    }
}
