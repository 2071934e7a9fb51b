// src/rabbitmq/client.rs

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueuePurgeOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel,
};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::publisher::{DeliveryMode, MessagePublisher, PublishOutcome};
use crate::backup::BackupFile;
use crate::config::Settings;

/// One queue on one broker connection, with an optional local backup file
/// taking messages while the broker is unreachable.
pub struct QueueClient {
    queue: String,
    confirm_publishes: bool,
    prefetch_count: u16,
    connection_manager: ConnectionManager,
    channel: Option<Channel>,
    backup: Option<BackupFile>,
}

impl QueueClient {
    /// Connects, opens a channel and declares the queue.
    ///
    /// A failure is only returned when no backup file is configured;
    /// otherwise the client starts disconnected and publishes go to the file.
    pub async fn init(settings: Settings) -> Result<Self> {
        let backup = settings.backup.file.clone().map(BackupFile::new);
        let mut client = QueueClient {
            queue: settings.queue.name.clone(),
            confirm_publishes: settings.queue.confirm_publishes,
            prefetch_count: settings.queue.prefetch_count,
            connection_manager: ConnectionManager::new(settings),
            channel: None,
            backup,
        };

        match client.connection_manager.open_channel().await {
            Ok(channel) => client.channel = Some(channel),
            Err(e) => match &client.backup {
                Some(backup) => warn!(
                    queue = %client.queue,
                    backup = %backup.path().display(),
                    "Broker unavailable, publishing to backup file: {}", e
                ),
                None => return Err(e),
            },
        }

        Ok(client)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn backup_file(&self) -> Option<&BackupFile> {
        self.backup.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.channel
            .as_ref()
            .map_or(false, |channel| channel.status().connected())
    }

    /// Access the inner `lapin::Channel` (advanced use).
    pub fn get_inner(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    fn channel(&self) -> Result<&Channel> {
        self.channel.as_ref().ok_or(RabbitMQError::NotConnected)
    }

    /// Publishes a persistent message.
    pub async fn publish(&self, payload: &[u8]) -> Result<PublishOutcome> {
        self.publish_with_mode(payload, DeliveryMode::Persistent).await
    }

    pub async fn publish_with_mode(
        &self,
        payload: &[u8],
        mode: DeliveryMode,
    ) -> Result<PublishOutcome> {
        let Some(channel) = &self.channel else {
            return self.fall_back(payload, RabbitMQError::NotConnected).await;
        };

        match self.send(channel, payload, mode).await {
            Ok(()) => {
                debug!(queue = %self.queue, bytes = payload.len(), "Published message");
                Ok(PublishOutcome::Published)
            }
            Err(e) => self.fall_back(payload, e).await,
        }
    }

    async fn send(&self, channel: &Channel, payload: &[u8], mode: DeliveryMode) -> Result<()> {
        let properties = BasicProperties::default().with_delivery_mode(mode.as_amqp());

        let confirm = channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if self.confirm_publishes {
            let confirmation = confirm
                .await
                .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
            check_confirmation(confirmation)?;
        }

        Ok(())
    }

    async fn fall_back(&self, payload: &[u8], cause: RabbitMQError) -> Result<PublishOutcome> {
        let Some(backup) = &self.backup else {
            return Err(cause);
        };

        if !matches!(cause, RabbitMQError::NotConnected) {
            warn!(queue = %self.queue, "Publish failed, writing to backup file: {}", cause);
        }
        backup.append(payload).await?;
        Ok(PublishOutcome::BackedUp)
    }

    /// Runs `handler` for each delivery until the consumer is cancelled or,
    /// when `idle_timeout` is set, no delivery arrives within it.
    ///
    /// `Ok` from the handler acknowledges the delivery, `Err` requeues it.
    /// Returns the number of deliveries handled.
    pub async fn consume<F, E>(&self, mut handler: F, idle_timeout: Option<Duration>) -> Result<usize>
    where
        F: FnMut(&Delivery) -> std::result::Result<(), E>,
        E: std::fmt::Display,
    {
        let channel = self.channel()?;

        channel
            .basic_qos(self.prefetch_count.max(1), BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;

        let consumer_tag = format!("consumer-{}", &Uuid::new_v4().to_string()[..8]);
        let mut consumer = channel
            .basic_consume(
                &self.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        info!(queue = %self.queue, consumer = %consumer_tag, "Started consuming");

        let mut handled = 0;
        loop {
            let next = match idle_timeout {
                Some(limit) => match timeout(limit, consumer.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        info!(queue = %self.queue, handled, "No message within {:?}, stopping", limit);
                        break;
                    }
                },
                None => consumer.next().await,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!("Error receiving message: {}", e);
                    if !channel.status().connected() {
                        return Err(RabbitMQError::ConsumeError(e.to_string()));
                    }
                    continue;
                }
                None => {
                    info!(queue = %self.queue, handled, "Consumer cancelled");
                    break;
                }
            };

            match handler(&delivery) {
                Ok(()) => Self::remove_from_queue(&delivery).await?,
                Err(e) => {
                    error!("Error processing message: {}", e);
                    Self::release(&delivery).await?;
                }
            }
            handled += 1;
        }

        Ok(handled)
    }

    /// Acknowledges a delivery so the broker drops it from the queue.
    pub async fn remove_from_queue(delivery: &Delivery) -> Result<()> {
        delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    /// Hands a delivery back to the queue for redelivery.
    pub async fn release(delivery: &Delivery) -> Result<()> {
        delivery
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    /// Drops every ready message in the queue, returning how many there were.
    pub async fn purge(&self) -> Result<u32> {
        let purged = self
            .channel()?
            .queue_purge(&self.queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to purge queue: {}", e)))?;

        info!(queue = %self.queue, purged, "Queue purged");
        Ok(purged)
    }

    /// Replays the backup file into the queue. Returns 0 when disconnected
    /// or when no backup file is configured.
    pub async fn restore_from_backup(&self) -> Result<usize> {
        if !self.is_connected() {
            return Ok(0);
        }
        let Some(backup) = &self.backup else {
            return Ok(0);
        };
        backup.replay(self).await
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                channel
                    .close(200, "Closing client")
                    .await
                    .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
            }
        }
        self.connection_manager.close().await
    }
}

fn check_confirmation(confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Nack(_) => Err(RabbitMQError::PublishError(
            "Broker rejected the message".to_string(),
        )),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

#[async_trait]
impl MessagePublisher for QueueClient {
    async fn publish(&self, payload: &[u8]) -> Result<PublishOutcome> {
        QueueClient::publish(self, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_settings() -> Settings {
        let mut settings = Settings::for_queue("jobs");
        settings.connection.host = "127.0.0.1".to_string();
        settings.connection.port = 1;
        settings.connection.connection_timeout_ms = 2000;
        settings
    }

    #[test]
    fn test_nack_confirmation_is_a_publish_failure() {
        let err = check_confirmation(Confirmation::Nack(None)).unwrap_err();
        assert!(matches!(err, RabbitMQError::PublishError(_)));
        assert!(err.is_broker_failure());

        assert!(check_confirmation(Confirmation::Ack(None)).is_ok());
        assert!(check_confirmation(Confirmation::NotRequested).is_ok());
    }

    #[tokio::test]
    async fn test_init_fails_without_backup_file() {
        let result = QueueClient::init(unreachable_settings()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publish_goes_to_backup_file_when_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.backup");
        let client = QueueClient::init(unreachable_settings().with_backup_file(&path))
            .await
            .unwrap();

        assert!(!client.is_connected());
        assert_eq!(client.publish(b"job-1").await.unwrap(), PublishOutcome::BackedUp);
        assert_eq!(
            client
                .publish_with_mode(b"job-2", DeliveryMode::Transient)
                .await
                .unwrap(),
            PublishOutcome::BackedUp
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "job-1\njob-2\n");
    }

    #[tokio::test]
    async fn test_restore_is_noop_while_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.backup");
        let client = QueueClient::init(unreachable_settings().with_backup_file(&path))
            .await
            .unwrap();
        client.publish(b"job-1").await.unwrap();

        assert_eq!(client.restore_from_backup().await.unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "job-1\n");
    }

    #[tokio::test]
    async fn test_channel_operations_need_a_connection() {
        let dir = tempfile::tempdir().unwrap();
        let client = QueueClient::init(
            unreachable_settings().with_backup_file(dir.path().join("jobs.backup")),
        )
        .await
        .unwrap();

        assert!(matches!(client.purge().await, Err(RabbitMQError::NotConnected)));
        let consumed = client
            .consume(|_| Ok::<(), String>(()), Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(consumed, Err(RabbitMQError::NotConnected)));
    }

    #[tokio::test]
    async fn test_backup_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-dir").join("jobs.backup");
        let client = QueueClient::init(unreachable_settings().with_backup_file(&path))
            .await
            .unwrap();

        let err = client.publish(b"job-1").await.unwrap_err();
        assert!(matches!(err, RabbitMQError::BackupError { .. }));
    }
}
