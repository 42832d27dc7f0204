//! Outbound Message Sender
//!
//! Delivery is fire-and-confirm: a sender either accepts a request or
//! rejects it. Every request carries an idempotency key built from the
//! execution id and node id, and both outboxes here drop a request whose
//! key was already delivered, so a replayed dispatch sends once.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::store::ExecutionId;
use crate::workflow::MessageTemplate;

/// Deduplication key for one side effect: `"<executionId>:<nodeId>"`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(execution_id: ExecutionId, node_id: &str) -> Self {
        Self(format!("{}:{}", execution_id, node_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single "deliver message" call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub key: IdempotencyKey,
    pub recipient: String,
    pub template: MessageTemplate,
    pub workflow_id: String,
    pub node_id: String,
}

/// Confirmation returned by a sender.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub key: IdempotencyKey,
    pub accepted_at: DateTime<Utc>,
    /// True if the key had already been delivered and nothing new was sent
    pub duplicate: bool,
}

pub trait MessageSender: Send + Sync {
    fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError>;
}

#[derive(Debug, Default)]
struct OutboxState {
    delivered: Vec<DeliveryRequest>,
    keys: HashSet<IdempotencyKey>,
    attempts: usize,
    rejected_recipients: HashSet<String>,
}

/// In-memory sender that records what it delivered.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    state: Mutex<OutboxState>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every delivery to `recipient` fail.
    pub fn reject_recipient(&self, recipient: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.rejected_recipients.insert(recipient.into());
        }
    }

    /// Messages actually delivered, in order.
    pub fn delivered(&self) -> Vec<DeliveryRequest> {
        self.state
            .lock()
            .map(|s| s.delivered.clone())
            .unwrap_or_default()
    }

    /// Number of `deliver` calls, duplicates and rejections included.
    pub fn attempts(&self) -> usize {
        self.state.lock().map(|s| s.attempts).unwrap_or_default()
    }
}

impl MessageSender for MemoryOutbox {
    fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DeliveryError::Rejected("outbox lock poisoned".to_string()))?;
        state.attempts += 1;

        if state.rejected_recipients.contains(&request.recipient) {
            return Err(DeliveryError::Rejected(format!(
                "recipient {} refused",
                request.recipient
            )));
        }

        let duplicate = !state.keys.insert(request.key.clone());
        if duplicate {
            debug!("Skipping duplicate delivery {}", request.key);
        } else {
            state.delivered.push(request.clone());
        }

        Ok(DeliveryReceipt {
            key: request.key.clone(),
            accepted_at: Utc::now(),
            duplicate,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct OutboxLine {
    sent_at: DateTime<Utc>,
    #[serde(flatten)]
    request: DeliveryRequest,
}

/// Append-only JSON-lines outbox, deduplicated by idempotency key.
///
/// Each delivery holds an exclusive OS lock on the outbox file from the
/// duplicate check through the append, so processes sharing the file
/// never both send the same key.
#[derive(Debug, Clone)]
pub struct FileOutbox {
    path: PathBuf,
}

impl FileOutbox {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Reads every delivered request back.
    pub fn entries(&self) -> Result<Vec<DeliveryRequest>, DeliveryError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: OutboxLine = serde_json::from_str(&line)?;
            entries.push(parsed.request);
        }
        Ok(entries)
    }
}

impl MessageSender for FileOutbox {
    fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt, DeliveryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut lock = RwLock::new(file);
        let mut file = lock.write()?;

        let now = Utc::now();
        if self.entries()?.iter().any(|e| e.key == request.key) {
            debug!("Skipping duplicate delivery {}", request.key);
            return Ok(DeliveryReceipt {
                key: request.key.clone(),
                accepted_at: now,
                duplicate: true,
            });
        }

        let line = serde_json::to_string(&OutboxLine {
            sent_at: now,
            request: request.clone(),
        })?;
        writeln!(file, "{}", line)?;

        info!("Queued message {} for {}", request.key, request.recipient);
        Ok(DeliveryReceipt {
            key: request.key.clone(),
            accepted_at: now,
            duplicate: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(execution_id: ExecutionId, node_id: &str) -> DeliveryRequest {
        DeliveryRequest {
            key: IdempotencyKey::new(execution_id, node_id),
            recipient: "ada@example.com".to_string(),
            template: MessageTemplate::Stored {
                template_id: "tpl_welcome".to_string(),
            },
            workflow_id: "welcome".to_string(),
            node_id: node_id.to_string(),
        }
    }

    #[test]
    fn test_key_format() {
        let id = ExecutionId::new();
        assert_eq!(IdempotencyKey::new(id, "mail").as_str(), format!("{}:mail", id));
    }

    #[test]
    fn test_memory_outbox_deduplicates() {
        let outbox = MemoryOutbox::new();
        let req = request(ExecutionId::new(), "mail");

        assert!(!outbox.deliver(&req).unwrap().duplicate);
        assert!(outbox.deliver(&req).unwrap().duplicate);
        assert!(outbox.deliver(&req).unwrap().duplicate);

        assert_eq!(outbox.delivered().len(), 1);
        assert_eq!(outbox.attempts(), 3);
    }

    #[test]
    fn test_memory_outbox_rejection() {
        let outbox = MemoryOutbox::new();
        outbox.reject_recipient("ada@example.com");
        assert!(matches!(
            outbox.deliver(&request(ExecutionId::new(), "mail")),
            Err(DeliveryError::Rejected(_))
        ));
        assert!(outbox.delivered().is_empty());
    }

    #[test]
    fn test_file_outbox_deduplicates_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/outbox.jsonl");
        let id = ExecutionId::new();

        FileOutbox::open(&path).deliver(&request(id, "mail")).unwrap();
        let receipt = FileOutbox::open(&path).deliver(&request(id, "mail")).unwrap();
        assert!(receipt.duplicate);

        FileOutbox::open(&path).deliver(&request(id, "followup")).unwrap();

        let entries = FileOutbox::open(&path).entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].node_id, "followup");
    }

    #[test]
    fn test_file_outbox_concurrent_handles_send_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let ids: Vec<ExecutionId> = (0..50).map(|_| ExecutionId::new()).collect();

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let outbox = FileOutbox::open(&path);
                let ids = ids.clone();
                std::thread::spawn(move || {
                    for id in ids {
                        outbox.deliver(&request(id, "mail")).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(FileOutbox::open(&path).entries().unwrap().len(), ids.len());
    }
}
