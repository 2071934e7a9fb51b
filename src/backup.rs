//! Local spill file for messages the broker could not take.
//!
//! One message per line. Replay renames the file first so that messages
//! falling back while the replay runs land in a fresh file. Lines a failed
//! replay did not publish go back into the live file.

use chrono::Local;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::rabbitmq::{MessagePublisher, RabbitMQError, Result};

#[derive(Debug, Clone)]
pub struct BackupFile {
    path: PathBuf,
}

impl BackupFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `payload` and a trailing newline in a single write.
    pub async fn append(&self, payload: &[u8]) -> Result<()> {
        let mut line = Vec::with_capacity(payload.len() + 1);
        line.extend_from_slice(payload);
        line.push(b'\n');

        self.append_raw(&line).await?;
        debug!(path = %self.path.display(), bytes = payload.len(), "Message written to backup file");
        Ok(())
    }

    async fn append_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| RabbitMQError::backup(&self.path, e))?;

        file.write_all(bytes)
            .await
            .map_err(|e| RabbitMQError::backup(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| RabbitMQError::backup(&self.path, e))
    }

    /// True when the file exists and holds at least one byte.
    pub async fn is_pending(&self) -> bool {
        match fs::metadata(&self.path).await {
            Ok(meta) => meta.is_file() && meta.len() > 0,
            Err(_) => false,
        }
    }

    /// Moves the backup file aside and returns where it went, or `None`
    /// when there is nothing to replay.
    pub async fn take_for_replay(&self) -> Result<Option<PathBuf>> {
        if !self.is_pending().await {
            return Ok(None);
        }

        let target = self.replay_path().await;
        fs::rename(&self.path, &target)
            .await
            .map_err(|e| RabbitMQError::backup(&self.path, e))?;

        debug!(from = %self.path.display(), to = %target.display(), "Backup file moved aside for replay");
        Ok(Some(target))
    }

    async fn replay_path(&self) -> PathBuf {
        let mut base: OsString = self.path.as_os_str().to_owned();
        base.push(format!("_{}", Local::now().format("%Y%m%d%H%M%S")));

        let mut candidate = PathBuf::from(&base);
        let mut suffix = 1;
        while fs::try_exists(&candidate).await.unwrap_or(false) {
            let mut name = base.clone();
            name.push(format!("_{}", suffix));
            candidate = PathBuf::from(name);
            suffix += 1;
        }
        candidate
    }

    /// Hands every backed-up line to `publisher` and deletes the replayed file.
    ///
    /// A publisher error stops the replay: the failed line and everything
    /// after it are appended back to the live backup file, lines already
    /// published are dropped, and the error is returned.
    pub async fn replay<P>(&self, publisher: &P) -> Result<usize>
    where
        P: MessagePublisher + ?Sized,
    {
        let Some(replay_path) = self.take_for_replay().await? else {
            return Ok(0);
        };

        let file = File::open(&replay_path)
            .await
            .map_err(|e| RabbitMQError::backup(&replay_path, e))?;
        let mut reader = BufReader::new(file);

        let mut line = Vec::new();
        let mut count = 0;
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| RabbitMQError::backup(&replay_path, e))?;
            if read == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }

            if let Err(e) = publisher.publish(&line).await {
                let mut remainder = std::mem::take(&mut line);
                remainder.push(b'\n');
                reader
                    .read_to_end(&mut remainder)
                    .await
                    .map_err(|e| RabbitMQError::backup(&replay_path, e))?;
                drop(reader);

                self.return_unpublished(&replay_path, remainder).await?;
                warn!(
                    path = %self.path.display(),
                    replayed = count,
                    "Replay stopped, unpublished messages returned to backup file: {}", e
                );
                return Err(e);
            }
            count += 1;
        }
        drop(reader);

        fs::remove_file(&replay_path)
            .await
            .map_err(|e| RabbitMQError::backup(&replay_path, e))?;

        info!(path = %self.path.display(), count, "Backup file replayed");
        Ok(count)
    }

    // On failure the renamed file stays on disk and the error names it.
    async fn return_unpublished(&self, replay_path: &Path, mut remainder: Vec<u8>) -> Result<()> {
        if remainder.last() != Some(&b'\n') {
            remainder.push(b'\n');
        }
        self.append_raw(&remainder).await?;

        fs::remove_file(replay_path)
            .await
            .map_err(|e| RabbitMQError::backup(replay_path, e))
    }
}
