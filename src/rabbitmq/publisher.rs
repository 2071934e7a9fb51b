use async_trait::async_trait;

use super::errors::Result;

/// What happened to a message handed to `publish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the broker.
    Published,
    /// Broker unavailable; appended to the backup file instead.
    BackedUp,
}

/// AMQP `delivery_mode` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

impl DeliveryMode {
    pub fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Anything that can take a raw message payload for the queue.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<PublishOutcome>;
}
