//! Durable alert history
//!
//! Every lifecycle transition and delivery attempt is appended to a
//! JSONL audit log by a single writer task. Producers never block: records
//! are handed over a bounded channel and a full or failed writer is
//! surfaced through a fault flag the manager escalates as an internal
//! alert.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use super::{AlertStatus, DeliveryStatus};
use crate::core::event::{DetectionKind, Severity};

const QUEUE_DEPTH: usize = 1024;

/// One audit line
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub alert_id: Uuid,
    #[serde(flatten)]
    pub entry: HistoryEntry,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum HistoryEntry {
    Created {
        kind: DetectionKind,
        severity: Severity,
        source: String,
        target: String,
    },
    Merged {
        occurrence_count: u32,
    },
    StatusChanged {
        from: AlertStatus,
        to: AlertStatus,
    },
    DeliveryAttempt {
        channel: String,
        attempt: u32,
        outcome: DeliveryStatus,
        error: Option<String>,
    },
}

/// Producer side of the history writer
#[derive(Clone)]
pub struct HistoryHandle {
    tx: Option<mpsc::Sender<HistoryRecord>>,
    fault: Arc<AtomicBool>,
    hostname: String,
}

impl HistoryHandle {
    /// A handle that records nothing (tests, history disabled)
    pub fn disabled() -> Self {
        Self {
            tx: None,
            fault: Arc::new(AtomicBool::new(false)),
            hostname: String::new(),
        }
    }

    /// Enqueue a record. Never blocks; a full queue counts as a fault.
    pub fn record(&self, alert_id: Uuid, entry: HistoryEntry) {
        let Some(tx) = &self.tx else {
            return;
        };
        let record = HistoryRecord {
            timestamp: Utc::now(),
            hostname: self.hostname.clone(),
            alert_id,
            entry,
        };
        if tx.try_send(record).is_err() {
            self.fault.store(true, Ordering::Relaxed);
        }
    }

    /// Consume the fault flag. True means at least one record was lost or
    /// unwritable since the last check.
    pub fn take_fault(&self) -> bool {
        self.fault.swap(false, Ordering::Relaxed)
    }
}

/// Spawn the single writer task appending to `path`
pub fn spawn_writer(path: PathBuf) -> (HistoryHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<HistoryRecord>(QUEUE_DEPTH);
    let fault = Arc::new(AtomicBool::new(false));
    let writer_fault = fault.clone();

    let task = tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let Err(err) = append_line(&path, &record).await {
                // Keep consuming so producers stay unblocked; processing
                // continues in-memory while the store is down.
                if !writer_fault.swap(true, Ordering::Relaxed) {
                    error!(path = %path.display(), error = %err, "alert history unavailable");
                }
            }
        }
        debug!("history writer stopped");
    });

    let handle = HistoryHandle {
        tx: Some(tx),
        fault,
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
    };
    (handle, task)
}

async fn append_line(path: &PathBuf, record: &HistoryRecord) -> std::io::Result<()> {
    let line = serde_json::to_string(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_appended_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let (handle, task) = spawn_writer(path.clone());

        let id = Uuid::new_v4();
        handle.record(
            id,
            HistoryEntry::Created {
                kind: DetectionKind::MitmSuspected,
                severity: Severity::Critical,
                source: "192.168.1.1/aa:aa:aa:aa:aa:aa".to_string(),
                target: "-".to_string(),
            },
        );
        handle.record(
            id,
            HistoryEntry::StatusChanged {
                from: AlertStatus::New,
                to: AlertStatus::Acknowledged,
            },
        );

        drop(handle);
        task.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("created"));
        assert!(lines[1].contains("status_changed"));
        assert!(lines[0].contains(&id.to_string()));
    }

    #[tokio::test]
    async fn test_unwritable_path_sets_fault() {
        let (handle, task) = spawn_writer(PathBuf::from("/nonexistent/dir/alerts.jsonl"));
        handle.record(
            Uuid::new_v4(),
            HistoryEntry::Merged {
                occurrence_count: 2,
            },
        );

        // Give the writer a moment to hit the error
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(handle.take_fault());
        assert!(!handle.take_fault(), "fault flag is consumed");

        drop(handle);
        task.await.unwrap();
    }

    #[test]
    fn test_disabled_handle_is_inert() {
        let handle = HistoryHandle::disabled();
        handle.record(
            Uuid::new_v4(),
            HistoryEntry::Merged {
                occurrence_count: 1,
            },
        );
        assert!(!handle.take_fault());
    }
}
