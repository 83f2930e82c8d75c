//! Alert lifecycle management
//!
//! Owns every alert record: deduplication/merge, status transitions,
//! delivery fan-out, history, and the read-only observer feed. State
//! transitions are serialized under one lock; delivery runs as detached
//! tasks per (alert, channel) and never holds that lock across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::history::{HistoryEntry, HistoryHandle};
use super::notify::{Notifier, RetryPolicy};
use super::{Alert, AlertError, AlertStatus, DeliveryStatus};
use crate::core::event::{DetectionKind, IncidentKey, Severity, ThreatAssessment};

const FEED_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    /// Rolling window within which same-key assessments merge
    pub correlation_window: Duration,
    pub retry: RetryPolicy,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            correlation_window: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct State {
    alerts: HashMap<Uuid, Alert>,
    /// Open (unresolved) alert per incident key
    open_index: HashMap<IncidentKey, Uuid>,
}

struct Inner {
    config: AlertManagerConfig,
    state: Mutex<State>,
    channels: Vec<Arc<dyn Notifier>>,
    history: HistoryHandle,
    feed: broadcast::Sender<Alert>,
}

/// Cheaply-clonable manager handle
#[derive(Clone)]
pub struct AlertManager {
    inner: Arc<Inner>,
}

impl AlertManager {
    pub fn new(
        config: AlertManagerConfig,
        channels: Vec<Arc<dyn Notifier>>,
        history: HistoryHandle,
    ) -> Self {
        let (feed, _) = broadcast::channel(FEED_DEPTH);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                channels,
                history,
                feed,
            }),
        }
    }

    /// Read-only feed of alert state changes for dashboard collaborators.
    /// The manager never blocks on slow or absent consumers.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.inner.feed.subscribe()
    }

    /// Submit a fused assessment. Merges into the open alert for the same
    /// incident key inside the correlation window; otherwise creates a new
    /// alert and fans delivery out to every channel.
    pub fn submit(&self, assessment: ThreatAssessment) -> Uuid {
        let severity = Severity::from_confidence(assessment.combined_confidence);
        let key = assessment.key.clone();
        let window = chrono::Duration::from_std(self.inner.config.correlation_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let now = Utc::now();

        let (id, created, retry_channels) = {
            let mut state = self.inner.state.lock();

            let open = state
                .open_index
                .get(&key)
                .copied()
                .filter(|id| match state.alerts.get(id) {
                    Some(alert) => {
                        alert.status != AlertStatus::Resolved
                            && now - alert.last_seen <= window
                    }
                    None => false,
                });

            match open {
                Some(id) => {
                    let alert = state.alerts.get_mut(&id).expect("indexed alert exists");
                    alert.occurrence_count += assessment.event_count.max(1);
                    alert.last_seen = alert.last_seen.max(assessment.last_event);
                    alert.combined_confidence =
                        alert.combined_confidence.max(assessment.combined_confidence);
                    alert.severity = alert.severity.max(severity);

                    let mut retry_channels = Vec::new();
                    if alert.status == AlertStatus::Acknowledged {
                        // Fresh evidence re-opens an acknowledged alert
                        alert.status = AlertStatus::New;
                        self.inner.history.record(
                            id,
                            HistoryEntry::StatusChanged {
                                from: AlertStatus::Acknowledged,
                                to: AlertStatus::New,
                            },
                        );
                        // Failed channels get a fresh retry budget
                        retry_channels = alert
                            .delivery
                            .iter()
                            .filter(|(_, d)| d.status == DeliveryStatus::Failed)
                            .map(|(name, _)| name.clone())
                            .collect();
                    }
                    self.inner.history.record(
                        id,
                        HistoryEntry::Merged {
                            occurrence_count: alert.occurrence_count,
                        },
                    );
                    let snapshot = alert.clone();
                    drop(state);
                    let _ = self.inner.feed.send(snapshot);
                    (id, false, retry_channels)
                }
                None => {
                    let channel_names: Vec<String> = self
                        .inner
                        .channels
                        .iter()
                        .map(|c| c.name().to_string())
                        .collect();
                    let alert = Alert::from_assessment(&assessment, &channel_names);
                    let id = alert.id;
                    self.inner.history.record(
                        id,
                        HistoryEntry::Created {
                            kind: alert.kind,
                            severity: alert.severity,
                            source: alert.source.clone(),
                            target: alert.target.clone(),
                        },
                    );
                    let snapshot = alert.clone();
                    state.open_index.insert(key, id);
                    state.alerts.insert(id, alert);
                    drop(state);
                    let _ = self.inner.feed.send(snapshot);
                    (id, true, Vec::new())
                }
            }
        };

        if created {
            info!(alert = %id, severity = %severity, "alert created");
            for channel in &self.inner.channels {
                spawn_delivery(self.inner.clone(), channel.clone(), id);
            }
        } else {
            debug!(alert = %id, "assessment merged into open alert");
            for name in retry_channels {
                if let Some(channel) = self
                    .inner
                    .channels
                    .iter()
                    .find(|c| c.name() == name)
                    .cloned()
                {
                    spawn_delivery(self.inner.clone(), channel, id);
                }
            }
        }

        self.escalate_history_fault(&assessment.key);
        id
    }

    /// `new → acknowledged`
    pub fn acknowledge(&self, id: Uuid) -> Result<(), AlertError> {
        self.transition(id, AlertStatus::Acknowledged, |status| {
            matches!(status, AlertStatus::New)
        })
    }

    /// `new|acknowledged → resolved`. Terminal: the incident key is freed,
    /// so the same key later gets a brand-new alert id.
    pub fn resolve(&self, id: Uuid) -> Result<(), AlertError> {
        self.transition(id, AlertStatus::Resolved, |status| {
            matches!(status, AlertStatus::New | AlertStatus::Acknowledged)
        })
    }

    fn transition(
        &self,
        id: Uuid,
        to: AlertStatus,
        allowed: impl Fn(AlertStatus) -> bool,
    ) -> Result<(), AlertError> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            let alert = state.alerts.get_mut(&id).ok_or(AlertError::NotFound(id))?;
            let from = alert.status;
            if !allowed(from) {
                return Err(AlertError::InvalidTransition { from, to });
            }
            alert.status = to;
            let snapshot = alert.clone();
            if to == AlertStatus::Resolved {
                let key = snapshot.incident_key();
                if state.open_index.get(&key) == Some(&id) {
                    state.open_index.remove(&key);
                }
            }
            self.inner
                .history
                .record(id, HistoryEntry::StatusChanged { from, to });
            snapshot
        };
        let _ = self.inner.feed.send(snapshot);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Alert> {
        self.inner.state.lock().alerts.get(&id).cloned()
    }

    pub fn open_alerts(&self) -> Vec<Alert> {
        let state = self.inner.state.lock();
        state
            .open_index
            .values()
            .filter_map(|id| state.alerts.get(id).cloned())
            .collect()
    }

    pub fn alert_count(&self) -> usize {
        self.inner.state.lock().alerts.len()
    }

    /// A history fault becomes a low-severity internal alert so operators
    /// learn about reduced auditability. Alert processing itself already
    /// continued in-memory.
    fn escalate_history_fault(&self, cause: &IncidentKey) {
        if cause.kind == DetectionKind::InternalFault {
            return;
        }
        if !self.inner.history.take_fault() {
            return;
        }
        warn!("alert history unavailable, escalating as internal alert");
        let now = Utc::now();
        self.submit(ThreatAssessment {
            key: IncidentKey {
                kind: DetectionKind::InternalFault,
                source: "alert-history".to_string(),
                target: "-".to_string(),
            },
            interface: "-".to_string(),
            combined_confidence: 0.2,
            ml_score: None,
            event_count: 1,
            first_event: now,
            last_event: now,
            detectors: vec!["alerts".to_string()],
            message: "alert history store unavailable; auditability reduced".to_string(),
        });
    }
}

/// Deliver one alert over one channel with bounded backoff. Detached from
/// intake; failures on this channel never touch the others.
fn spawn_delivery(inner: Arc<Inner>, channel: Arc<dyn Notifier>, alert_id: Uuid) {
    tokio::spawn(async move {
        let policy = inner.config.retry.clone();
        let started = std::time::Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let Some(alert) = inner.state.lock().alerts.get(&alert_id).cloned() else {
                return;
            };

            match channel.deliver(&alert).await {
                Ok(()) => {
                    update_delivery(&inner, alert_id, channel.name(), |d| {
                        d.status = DeliveryStatus::Delivered;
                        d.attempts = attempt;
                        d.last_error = None;
                    });
                    inner.history.record(
                        alert_id,
                        HistoryEntry::DeliveryAttempt {
                            channel: channel.name().to_string(),
                            attempt,
                            outcome: DeliveryStatus::Delivered,
                            error: None,
                        },
                    );
                    return;
                }
                Err(err) => {
                    let exhausted = attempt >= policy.max_attempts
                        || started.elapsed() >= policy.max_elapsed;
                    let outcome = if exhausted {
                        DeliveryStatus::Failed
                    } else {
                        DeliveryStatus::Pending
                    };
                    warn!(
                        alert = %alert_id,
                        channel = channel.name(),
                        attempt,
                        error = %err,
                        "delivery attempt failed"
                    );
                    update_delivery(&inner, alert_id, channel.name(), |d| {
                        d.status = outcome;
                        d.attempts = attempt;
                        d.last_error = Some(err.to_string());
                    });
                    inner.history.record(
                        alert_id,
                        HistoryEntry::DeliveryAttempt {
                            channel: channel.name().to_string(),
                            attempt,
                            outcome,
                            error: Some(err.to_string()),
                        },
                    );
                    if exhausted {
                        return;
                    }
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    });
}

fn update_delivery(
    inner: &Arc<Inner>,
    alert_id: Uuid,
    channel: &str,
    apply: impl FnOnce(&mut super::ChannelDelivery),
) {
    let snapshot = {
        let mut state = inner.state.lock();
        let Some(alert) = state.alerts.get_mut(&alert_id) else {
            return;
        };
        let Some(delivery) = alert.delivery.get_mut(channel) else {
            return;
        };
        apply(delivery);
        delivery.updated_at = Utc::now();
        alert.clone()
    };
    let _ = inner.feed.send(snapshot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::notify::DeliveryError;
    use async_trait::async_trait;
    use parking_lot::Mutex as PMutex;

    fn assessment(confidence: f32) -> ThreatAssessment {
        let now = Utc::now();
        ThreatAssessment {
            key: IncidentKey {
                kind: DetectionKind::BindingConflict,
                source: "10.0.0.1/aa:aa:aa:aa:aa:aa".to_string(),
                target: "10.0.0.2".to_string(),
            },
            interface: "eth0".to_string(),
            combined_confidence: confidence,
            ml_score: None,
            event_count: 1,
            first_event: now,
            last_event: now,
            detectors: vec!["bindings".to_string()],
            message: "conflict".to_string(),
        }
    }

    struct RecordingNotifier {
        name: String,
        delivered: Arc<PMutex<Vec<Uuid>>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &str {
            &self.name
        }
        async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
            self.delivered.lock().push(alert.id);
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        fn name(&self) -> &str {
            "broken"
        }
        async fn deliver(&self, _alert: &Alert) -> Result<(), DeliveryError> {
            Err(DeliveryError::Rejected(503))
        }
    }

    fn manager_with(channels: Vec<Arc<dyn Notifier>>) -> AlertManager {
        AlertManager::new(
            AlertManagerConfig {
                correlation_window: Duration::from_secs(10),
                retry: RetryPolicy {
                    max_attempts: 2,
                    initial_backoff: Duration::from_millis(10),
                    max_backoff: Duration::from_millis(20),
                    max_elapsed: Duration::from_secs(5),
                },
            },
            channels,
            HistoryHandle::disabled(),
        )
    }

    #[tokio::test]
    async fn test_dedup_merges_within_window() {
        let manager = manager_with(vec![]);
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(manager.submit(assessment(0.5)));
        }

        assert!(ids.windows(2).all(|w| w[0] == w[1]), "one open alert");
        let alert = manager.get(ids[0]).unwrap();
        assert_eq!(alert.occurrence_count, 5);
        assert_eq!(manager.alert_count(), 1);
    }

    #[tokio::test]
    async fn test_resolved_alert_gets_new_id() {
        let manager = manager_with(vec![]);
        let first = manager.submit(assessment(0.5));
        manager.resolve(first).unwrap();

        let second = manager.submit(assessment(0.5));
        assert_ne!(first, second, "resolved alerts are never reopened");
        assert_eq!(manager.alert_count(), 2);
        assert_eq!(
            manager.get(first).unwrap().status,
            AlertStatus::Resolved,
            "history is preserved"
        );
    }

    #[tokio::test]
    async fn test_fresh_evidence_reopens_acknowledged() {
        let manager = manager_with(vec![]);
        let id = manager.submit(assessment(0.5));
        manager.acknowledge(id).unwrap();
        assert_eq!(manager.get(id).unwrap().status, AlertStatus::Acknowledged);

        let same = manager.submit(assessment(0.5));
        assert_eq!(id, same);
        let alert = manager.get(id).unwrap();
        assert_eq!(alert.status, AlertStatus::New);
        assert_eq!(alert.occurrence_count, 2);
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let manager = manager_with(vec![]);
        let id = manager.submit(assessment(0.5));

        manager.acknowledge(id).unwrap();
        assert!(matches!(
            manager.acknowledge(id),
            Err(AlertError::InvalidTransition { .. })
        ));

        manager.resolve(id).unwrap();
        assert!(matches!(
            manager.resolve(id),
            Err(AlertError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.acknowledge(Uuid::new_v4()),
            Err(AlertError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_severity_mapped_from_confidence() {
        let manager = manager_with(vec![]);
        let id = manager.submit(assessment(0.9));
        assert_eq!(manager.get(id).unwrap().severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_healthy_one() {
        let delivered = Arc::new(PMutex::new(Vec::new()));
        let manager = manager_with(vec![
            Arc::new(FailingNotifier),
            Arc::new(RecordingNotifier {
                name: "healthy".to_string(),
                delivered: delivered.clone(),
            }),
        ]);

        let id = manager.submit(assessment(0.9));

        // Wait for the delivery tasks to settle
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let alert = manager.get(id).unwrap();
            let broken_done = alert.delivery["broken"].status == DeliveryStatus::Failed;
            let healthy_done =
                alert.delivery["healthy"].status == DeliveryStatus::Delivered;
            if broken_done && healthy_done {
                break;
            }
        }

        let alert = manager.get(id).unwrap();
        assert_eq!(alert.delivery["healthy"].status, DeliveryStatus::Delivered);
        assert_eq!(alert.delivery["broken"].status, DeliveryStatus::Failed);
        assert_eq!(alert.delivery["broken"].attempts, 2);
        assert_eq!(delivered.lock().len(), 1);

        // Intake stays open while channels churn
        let again = manager.submit(assessment(0.9));
        assert_eq!(again, id);
    }

    #[tokio::test]
    async fn test_feed_publishes_lifecycle() {
        let manager = manager_with(vec![]);
        let mut feed = manager.subscribe();

        let id = manager.submit(assessment(0.5));
        let created = feed.recv().await.unwrap();
        assert_eq!(created.id, id);
        assert_eq!(created.status, AlertStatus::New);

        manager.acknowledge(id).unwrap();
        let acked = feed.recv().await.unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
    }
}
