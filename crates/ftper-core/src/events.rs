// SPDX-License-Identifier: AGPL-3.0
// Ftper Core - Notification channels
//
// Three independent fire-and-forget channels. A message published while
// nobody listens is dropped.

use std::fmt;
use tokio::sync::broadcast;

/// Buffer per channel; slow receivers skip what falls out of it
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Error,
    Success,
    Info,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Error => "error",
            Channel::Success => "success",
            Channel::Info => "info",
        })
    }
}

/// Fan-out bus carrying user-displayable messages
pub struct EventBus {
    error: broadcast::Sender<String>,
    success: broadcast::Sender<String>,
    info: broadcast::Sender<String>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            error: broadcast::channel(capacity).0,
            success: broadcast::channel(capacity).0,
            info: broadcast::channel(capacity).0,
        }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<String> {
        match channel {
            Channel::Error => &self.error,
            Channel::Success => &self.success,
            Channel::Info => &self.info,
        }
    }

    pub fn publish(&self, channel: Channel, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("[{}] {}", channel, message);
        // zero receivers is not an error
        let _ = self.sender(channel).send(message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(Channel::Error, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.publish(Channel::Success, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(Channel::Info, message);
    }

    /// Receive messages published from now on
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.sender(channel).receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
