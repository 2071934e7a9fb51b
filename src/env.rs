use crate::config::{
    default_connect_attempts, default_credential, default_heartbeat, default_host, default_port,
    default_prefetch, default_reconnect_delay, default_timeout, default_vhost, BackupConfig,
    ConnectionConfig, QueueConfig, Settings,
};
use crate::rabbitmq::{RabbitMQError, Result};
use dotenv::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

impl Settings {
    /// Reads settings from `RABBITMQ_*` environment variables, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue = lookup("RABBITMQ_QUEUE")
            .filter(|q| !q.is_empty())
            .ok_or_else(|| RabbitMQError::ConfigError("RABBITMQ_QUEUE is not set".to_string()))?;

        let settings = Settings {
            connection: ConnectionConfig {
                host: lookup("RABBITMQ_HOST").unwrap_or_else(default_host),
                port: parse_or(&lookup, "RABBITMQ_PORT", default_port)?,
                username: lookup("RABBITMQ_USERNAME").unwrap_or_else(default_credential),
                password: lookup("RABBITMQ_PASSWORD").unwrap_or_else(default_credential),
                vhost: lookup("RABBITMQ_VHOST").unwrap_or_else(default_vhost),
                connection_timeout_ms: parse_or(&lookup, "RABBITMQ_CONNECT_TIMEOUT_MS", default_timeout)?,
                heartbeat_seconds: parse_or(&lookup, "RABBITMQ_HEARTBEAT_SECONDS", default_heartbeat)?,
                connect_attempts: parse_or(&lookup, "RABBITMQ_CONNECT_ATTEMPTS", default_connect_attempts)?,
                reconnect_delay_ms: parse_or(&lookup, "RABBITMQ_RECONNECT_DELAY_MS", default_reconnect_delay)?,
            },
            queue: QueueConfig {
                name: queue,
                prefetch_count: parse_or(&lookup, "RABBITMQ_PREFETCH_COUNT", default_prefetch)?,
                confirm_publishes: parse_or(&lookup, "RABBITMQ_CONFIRM_PUBLISHES", || false)?,
            },
            backup: BackupConfig {
                file: lookup("RABBITMQ_BACKUP_FILE")
                    .filter(|f| !f.is_empty())
                    .map(PathBuf::from),
            },
        };

        settings
            .validate()
            .map_err(|e| RabbitMQError::ConfigError(e.to_string()))?;
        Ok(settings)
    }
}

fn parse_or<F, T, D>(lookup: &F, key: &str, default: D) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
    D: FnOnce() -> T,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse()
            .map_err(|e| RabbitMQError::ConfigError(format!("{} has invalid value '{}': {}", key, val, e))),
        None => Ok(default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_load() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("RABBITMQ_HOST", "rabbit.internal"),
            ("RABBITMQ_PORT", "5673"),
            ("RABBITMQ_USERNAME", "user_rust"),
            ("RABBITMQ_PASSWORD", "secret"),
            ("RABBITMQ_VHOST", "vhost_rust"),
            ("RABBITMQ_QUEUE", "order_created"),
            ("RABBITMQ_BACKUP_FILE", "/var/spool/orders.backup"),
            ("RABBITMQ_PREFETCH_COUNT", "20"),
            ("RABBITMQ_CONNECT_TIMEOUT_MS", "15000"),
            ("RABBITMQ_CONFIRM_PUBLISHES", "true"),
        ]))
        .unwrap();

        assert_eq!(settings.connection.host, "rabbit.internal");
        assert_eq!(settings.connection.port, 5673);
        assert_eq!(settings.connection.vhost, "vhost_rust");
        assert_eq!(settings.queue.name, "order_created");
        assert_eq!(settings.queue.prefetch_count, 20);
        assert!(settings.queue.confirm_publishes);
        assert_eq!(settings.connection.connection_timeout_ms, 15000);
        assert_eq!(
            settings.backup.file,
            Some(PathBuf::from("/var/spool/orders.backup"))
        );
    }

    #[test]
    fn test_config_defaults() {
        let settings = Settings::from_lookup(lookup_from(&[("RABBITMQ_QUEUE", "jobs")])).unwrap();

        assert_eq!(settings, Settings::for_queue("jobs"));
    }

    #[test]
    fn test_credentials_default_like_the_config_file() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("RABBITMQ_QUEUE", "jobs"),
            ("RABBITMQ_USERNAME", "svc"),
        ]))
        .unwrap();
        assert_eq!(settings.connection.username, "svc");
        assert_eq!(settings.connection.password, default_credential());
    }

    #[test]
    fn test_missing_queue_is_an_error() {
        let err = Settings::from_lookup(lookup_from(&[("RABBITMQ_HOST", "localhost")])).unwrap_err();
        assert!(matches!(err, RabbitMQError::ConfigError(_)));
    }

    #[test]
    fn test_malformed_number_is_an_error() {
        let err = Settings::from_lookup(lookup_from(&[
            ("RABBITMQ_QUEUE", "jobs"),
            ("RABBITMQ_PORT", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("RABBITMQ_PORT"));
    }

    #[test]
    fn test_empty_backup_file_means_none() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("RABBITMQ_QUEUE", "jobs"),
            ("RABBITMQ_BACKUP_FILE", ""),
        ]))
        .unwrap();
        assert_eq!(settings.backup.file, None);
    }
}
