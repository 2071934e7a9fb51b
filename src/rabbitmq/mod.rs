// src/rabbitmq/mod.rs
// Broker side of the adapter: connection lifecycle, the queue client and its errors.

pub mod client;
pub mod connection;
pub mod errors;
pub mod publisher;

pub use client::QueueClient;
pub use connection::ConnectionManager;
pub use errors::{RabbitMQError, Result};
pub use publisher::{DeliveryMode, MessagePublisher, PublishOutcome};
