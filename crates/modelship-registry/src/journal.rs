//! Append-only registry event log
//!
//! One JSON object per line. Replaying the log in order rebuilds the
//! registry and doubles as the audit trail.

use chrono::{DateTime, Utc};
use modelship_core::{ModelshipError, ModelshipResult, Version};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A registry mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    VersionCreated {
        version: Version,
    },
    VersionTagged {
        model: String,
        version: u64,
        key: String,
        value: String,
    },
    AliasSet {
        model: String,
        alias: String,
        version: u64,
    },
}

impl RegistryEvent {
    /// Model the event belongs to
    pub fn model(&self) -> &str {
        match self {
            RegistryEvent::VersionCreated { version } => &version.model,
            RegistryEvent::VersionTagged { model, .. }
            | RegistryEvent::AliasSet { model, .. } => model,
        }
    }
}

/// A journaled event with its identity and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub event: RegistryEvent,
}

struct LogState {
    file: Option<File>,
    /// Bytes of the file covered by `records`
    len: u64,
    records: Vec<EventRecord>,
}

/// Durable, append-only journal of registry events
pub struct EventLog {
    path: Option<PathBuf>,
    state: Mutex<LogState>,
}

impl EventLog {
    /// Journal that keeps history in memory only
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LogState {
                file: None,
                len: 0,
                records: Vec::new(),
            }),
        }
    }

    /// Open (or create) a journal file and return it with the records to replay
    pub async fn open(path: &Path) -> ModelshipResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
                info!(path = %parent.display(), "Created registry directory");
            }
        }

        let (records, valid_len) = match tokio::fs::read_to_string(path).await {
            Ok(content) => parse_records(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), 0),
            Err(e) => return Err(e.into()),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let on_disk = file.metadata().await?.len();
        if on_disk > valid_len {
            // drop a torn trailing write so the next append starts on a fresh line
            file.set_len(valid_len).await?;
        }

        info!(
            path = %path.display(),
            events = records.len(),
            "Opened registry journal"
        );

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(LogState {
                file: Some(file),
                len: valid_len,
                records,
            }),
        })
    }

    /// Path of the backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Durably append an event; returns the stored record
    pub async fn append(&self, event: RegistryEvent) -> ModelshipResult<EventRecord> {
        let record = EventRecord {
            id: Uuid::new_v4(),
            at: Utc::now(),
            event,
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(file) = state.file.as_mut() {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');

            // settle a write left in flight by a dropped append
            if let Err(e) = file.flush().await {
                warn!(error = %e, "Earlier journal write failed");
            }
            // bytes past `len` belong to an append that never completed
            let on_disk = file.metadata().await?.len();
            if on_disk > state.len {
                warn!(
                    bytes = on_disk - state.len,
                    "Truncating unacknowledged journal bytes"
                );
                file.set_len(state.len).await.map_err(|e| {
                    ModelshipError::Storage(format!("journal truncate failed: {}", e))
                })?;
            }

            if let Err(e) = write_line(file, &line).await {
                if let Err(rollback) = file.set_len(state.len).await {
                    warn!(error = %rollback, "Failed to roll back partial journal append");
                }
                return Err(ModelshipError::Storage(format!("journal append failed: {}", e)));
            }
            state.len += line.len() as u64;
        }
        state.records.push(record.clone());

        debug!(event_id = %record.id, model = record.event.model(), "Journaled registry event");
        Ok(record)
    }

    /// All records in append order
    pub async fn records(&self) -> Vec<EventRecord> {
        self.state.lock().await.records.clone()
    }

    /// Records for one model in append order
    pub async fn history(&self, model: &str) -> Vec<EventRecord> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .filter(|r| r.event.model() == model)
            .cloned()
            .collect()
    }

    /// Force journal contents to stable storage
    pub async fn sync(&self) -> ModelshipResult<()> {
        let mut state = self.state.lock().await;
        if let Some(file) = state.file.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}

/// Parse journal content, returning records and the byte length of the intact prefix.
fn parse_records(content: &str) -> ModelshipResult<(Vec<EventRecord>, u64)> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    for line in content.split_inclusive('\n') {
        if !line.ends_with('\n') {
            warn!(bytes = line.len(), "Discarding incomplete trailing journal entry");
            break;
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            let record = serde_json::from_str::<EventRecord>(trimmed).map_err(|e| {
                ModelshipError::Storage(format!("corrupt journal entry at byte {}: {}", offset, e))
            })?;
            records.push(record);
        }
        offset += line.len();
    }

    Ok((records, offset as u64))
}
