mod client;
mod memory;
mod subscriber;

use std::{borrow::Cow, collections::BTreeMap};

use anyhow::Result;
use async_trait::async_trait;
pub use client::{PubSubClient, PubSubError, PubSubSubscription};
pub use memory::InMemoryChannel;
pub use subscriber::{LEASE_SECONDS, Subscriber, SubscriptionHandle};

/// A message as delivered by the channel, with its payload already decoded.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Message {
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
    pub publish_time: Option<String>,
}

impl Message {
    /// Payload for log output; invalid UTF-8 is replaced.
    pub fn data_lossy(&self) -> Cow<'_, str> { String::from_utf8_lossy(&self.data) }
}

/// A pulled message together with the token used to acknowledge it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: Message,
}

/// At-least-once, unordered delivery of messages from one subscription.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for at most `max` messages. An empty result is not an error.
    async fn pull(&self, max: usize) -> Result<Vec<ReceivedMessage>>;

    /// Marks messages as processed so the channel does not redeliver them.
    async fn acknowledge(&self, ack_ids: &[String]) -> Result<()>;

    /// Holds off redelivery of messages still being handled for `seconds` from now.
    async fn modify_ack_deadline(&self, ack_ids: &[String], seconds: u32) -> Result<()>;
}

/// Receives every delivered message. Invoked concurrently for distinct messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process_message(&self, message: &Message) -> Result<()>;
}

/// Side channel for handler failures, which never reach the subscription loop.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &anyhow::Error, message: &Message);
}

/// Reports handler failures as error-level log events carrying the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &anyhow::Error, message: &Message) {
        tracing::error!(
            message_id = %message.id,
            payload = %message.data_lossy(),
            "Failed to process message: {error:#}"
        );
    }
}
