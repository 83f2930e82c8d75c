//! Alert model and lifecycle types
//!
//! The alert manager exclusively owns these records; no other component
//! transitions an alert's status.

pub mod history;
pub mod manager;
pub mod notify;

pub use self::history::{HistoryEntry, HistoryHandle, HistoryRecord};
pub use self::manager::{AlertManager, AlertManagerConfig};
pub use self::notify::{DeliveryError, Notifier, RetryPolicy};

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::event::{DetectionKind, IncidentKey, Severity, ThreatAssessment};

/// Alert lifecycle state. `resolved` is terminal: later evidence for the
/// same incident key gets a brand-new alert id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Resolved,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertStatus::New => write!(f, "new"),
            AlertStatus::Acknowledged => write!(f, "acknowledged"),
            AlertStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// Per-channel delivery progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelDelivery {
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelDelivery {
    fn pending() -> Self {
        Self {
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// A deduplicated, prioritized alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub kind: DetectionKind,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub interface: String,
    pub source: String,
    pub target: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u32,
    pub status: AlertStatus,
    pub combined_confidence: f32,
    /// Delivery progress per configured channel
    pub delivery: HashMap<String, ChannelDelivery>,
}

impl Alert {
    pub fn from_assessment(assessment: &ThreatAssessment, channels: &[String]) -> Self {
        let severity = Severity::from_confidence(assessment.combined_confidence);
        Self {
            id: Uuid::new_v4(),
            kind: assessment.key.kind,
            severity,
            title: format!(
                "{} {} → {} on {}",
                assessment.key.kind, assessment.key.source, assessment.key.target,
                assessment.interface
            ),
            description: assessment.message.clone(),
            interface: assessment.interface.clone(),
            source: assessment.key.source.clone(),
            target: assessment.key.target.clone(),
            first_seen: assessment.first_event,
            last_seen: assessment.last_event,
            occurrence_count: assessment.event_count,
            status: AlertStatus::New,
            combined_confidence: assessment.combined_confidence,
            delivery: channels
                .iter()
                .map(|name| (name.clone(), ChannelDelivery::pending()))
                .collect(),
        }
    }

    pub fn incident_key(&self) -> IncidentKey {
        IncidentKey {
            kind: self.kind,
            source: self.source.clone(),
            target: self.target.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert {0} not found")]
    NotFound(Uuid),
    #[error("invalid transition {from} → {to}")]
    InvalidTransition {
        from: AlertStatus,
        to: AlertStatus,
    },
}
