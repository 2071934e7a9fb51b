use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

use super::errors::{RabbitMQError, Result};
use crate::config::Settings;

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

pub struct ConnectionManager {
    settings: Settings,
    connection: Option<Connection>,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    reconnect_delay_ms: u64,
}

impl ConnectionManager {
    pub fn new(settings: Settings) -> Self {
        ConnectionManager {
            max_reconnect_attempts: settings.connection.connect_attempts.max(1),
            reconnect_delay_ms: settings.connection.reconnect_delay_ms,
            settings,
            connection: None,
            reconnect_attempts: 0,
        }
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.reconnect_delay_ms = initial_delay_ms;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map_or(false, |conn| conn.status().connected())
    }

    /// Returns the live connection, connecting first if needed.
    pub async fn connect(&mut self) -> Result<&Connection> {
        if !self.is_connected() {
            let conn = self.establish_connection().await?;
            self.connection = Some(conn);
        }
        self.connection
            .as_ref()
            .ok_or_else(|| RabbitMQError::ConnectionError("No active connection".to_string()))
    }

    async fn establish_connection(&mut self) -> Result<Connection> {
        self.reconnect_attempts = 0;
        let mut delay = self.reconnect_delay_ms;
        let uri = self.settings.amqp_uri();
        let connect_timeout = self.settings.connect_timeout();

        loop {
            info!("Attempting to connect to RabbitMQ at {}", self.settings.redacted_uri());

            let attempt = timeout(
                connect_timeout,
                Connection::connect(&uri, ConnectionProperties::default()),
            )
            .await;

            let err = match attempt {
                Ok(Ok(conn)) => {
                    info!("Successfully connected to RabbitMQ");
                    return Ok(conn);
                }
                Ok(Err(e)) => RabbitMQError::ConnectionError(e.to_string()),
                Err(elapsed) => RabbitMQError::from(elapsed),
            };

            self.reconnect_attempts += 1;
            error!(
                "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                self.reconnect_attempts, self.max_reconnect_attempts, err
            );

            if self.reconnect_attempts >= self.max_reconnect_attempts {
                return Err(err);
            }

            let sleep_time = backoff_with_jitter(delay, rand::random::<f64>());
            info!("Waiting {}ms before next reconnect attempt", sleep_time);
            sleep(Duration::from_millis(sleep_time)).await;

            delay = next_delay(delay);
        }
    }

    /// Opens a channel configured for the queue and declares the queue
    /// durable, non-exclusive, without auto-delete.
    pub async fn open_channel(&mut self) -> Result<Channel> {
        let prefetch = self.settings.queue.prefetch_count;
        let confirm = self.settings.queue.confirm_publishes;
        let queue = self.settings.queue.name.clone();

        let connection = self.connect().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;

        if prefetch > 0 {
            debug!("Setting channel QoS to {}", prefetch);
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;
        }

        if confirm {
            debug!(channel_id = channel.id(), "Enabling confirm mode");
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
                })?;
        }

        let declared = channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to declare queue: {}", e)))?;

        info!(
            queue = %queue,
            messages = declared.message_count(),
            consumers = declared.consumer_count(),
            "Queue declared"
        );

        Ok(channel)
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.connection.take() {
            info!("Closing RabbitMQ connection gracefully");
            conn.close(200, "Closing connection")
                .await
                .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))?;
        }
        Ok(())
    }
}

// +/-15% of `delay`, `unit` drawn from [0, 1)
fn backoff_with_jitter(delay: u64, unit: f64) -> u64 {
    let jitter = (unit * 0.3 - 0.15) * delay as f64;
    (delay as f64 + jitter).max(0.0) as u64
}

fn next_delay(delay: u64) -> u64 {
    std::cmp::min(delay.saturating_mul(2), MAX_RECONNECT_DELAY_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_within_jitter_band() {
        assert_eq!(backoff_with_jitter(1000, 0.5), 1000);
        assert_eq!(backoff_with_jitter(1000, 0.0), 850);
        assert!(backoff_with_jitter(1000, 0.999) <= 1150);
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        assert_eq!(next_delay(1000), 2000);
        assert_eq!(next_delay(20_000), MAX_RECONNECT_DELAY_MS);
        assert_eq!(next_delay(u64::MAX), MAX_RECONNECT_DELAY_MS);
    }

    #[test]
    fn test_reconnect_policy_needs_at_least_one_attempt() {
        let manager = ConnectionManager::new(Settings::for_queue("jobs")).with_reconnect_policy(0, 10);
        assert_eq!(manager.max_reconnect_attempts, 1);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_broker_gives_up_after_policy() {
        let mut settings = Settings::for_queue("jobs");
        settings.connection.host = "127.0.0.1".to_string();
        settings.connection.port = 1;
        settings.connection.connection_timeout_ms = 2000;

        let mut manager = ConnectionManager::new(settings).with_reconnect_policy(2, 10);
        let result = manager.connect().await;

        assert!(result.is_err());
        assert_eq!(manager.reconnect_attempts, 2);
        assert!(!manager.is_connected());
    }
}
