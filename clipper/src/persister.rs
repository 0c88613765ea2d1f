//! Clip persistence sinks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Local;
use hls_tail::MediaSegment;
use tmi_chat::ChatMessage;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::PersistError;
use crate::utils::sanitize_filename;

/// Stores one clip: the buffered media plus the offending user's recent messages.
#[async_trait]
pub trait Persister: Send + Sync {
    /// Returns a locator for the stored clip, or `None` when nothing was stored.
    async fn persist(
        &self,
        username: &str,
        media: &[MediaSegment],
        messages: &[ChatMessage],
    ) -> Result<Option<String>, PersistError>;
}

/// One `"[author]: text"` line per message.
pub fn describe_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]: {}", m.author_name, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Writes `<dir>/<YYYY-mm-dd_HHMMSS>_<user>.ts` with the concatenated segment
/// payloads, plus a `.txt` sidecar holding [`describe_messages`].
#[derive(Debug, Clone)]
pub struct LocalFilePersister {
    output_dir: PathBuf,
}

impl LocalFilePersister {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Create a fresh `.ts` file, adding a counter if the timestamped name is taken.
    async fn create_clip_file(&self, stem: &str) -> Result<(PathBuf, fs::File), PersistError> {
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{stem}.ts")
            } else {
                format!("{stem}-{attempt}.ts")
            };
            let path = self.output_dir.join(name);

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 100 => {
                    attempt += 1;
                }
                Err(e) => return Err(PersistError::io("creating", &path, e)),
            }
        }
    }
}

#[async_trait]
impl Persister for LocalFilePersister {
    async fn persist(
        &self,
        username: &str,
        media: &[MediaSegment],
        messages: &[ChatMessage],
    ) -> Result<Option<String>, PersistError> {
        if media.is_empty() {
            debug!(user = %username, "No media buffered, nothing to persist");
            return Ok(None);
        }

        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| PersistError::io("creating directory", &self.output_dir, e))?;

        let stem = format!(
            "{}_{}",
            Local::now().format("%Y-%m-%d_%H%M%S"),
            sanitize_filename(username)
        );
        let (clip_path, mut file) = self.create_clip_file(&stem).await?;

        let mut written = 0usize;
        for segment in media {
            file.write_all(&segment.payload)
                .await
                .map_err(|e| PersistError::io("writing", &clip_path, e))?;
            written += segment.payload.len();
        }
        file.flush()
            .await
            .map_err(|e| PersistError::io("flushing", &clip_path, e))?;

        let description_path = clip_path.with_extension("txt");
        fs::write(&description_path, describe_messages(messages))
            .await
            .map_err(|e| PersistError::io("writing", &description_path, e))?;

        info!(
            user = %username,
            path = %clip_path.display(),
            segments = media.len(),
            bytes = written,
            messages = messages.len(),
            "Clip persisted"
        );

        Ok(Some(clip_path.to_string_lossy().into_owned()))
    }
}
