//! Queue adapter over `lapin` that keeps messages in a local backup file
//! while the broker is unreachable and replays them once it is back.

pub mod backup;
pub mod config;
pub mod env;
pub mod rabbitmq;

pub use backup::BackupFile;
pub use config::Settings;
pub use rabbitmq::{
    ConnectionManager, DeliveryMode, MessagePublisher, PublishOutcome, QueueClient, RabbitMQError,
    Result,
};
