//! Detection aggregation
//!
//! Fuses concurrently-arriving detections that share an incident key into
//! one assessment per correlation window. Contributor confidences combine
//! as independent evidence: `combined = 1 − Π(1 − cᵢ)`. An attached
//! external scorer can only raise the result (`max(combined, ml_score)`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::event::{DetectionEvent, IncidentKey, ThreatAssessment};

/// Scoring interface an external ML collaborator implements. Training is
/// entirely outside this crate; only the score call crosses the boundary.
pub trait ThreatScorer: Send + Sync {
    /// A score in 0.0–1.0, or `None` when the scorer abstains
    fn score(&self, assessment: &ThreatAssessment) -> Option<f32>;
}

/// One incident accumulating inside its correlation window
struct Incident {
    interface: String,
    /// Π(1 − cᵢ), updated incrementally
    survival: f64,
    event_count: u32,
    first_event: DateTime<Utc>,
    last_event: DateTime<Utc>,
    detectors: Vec<String>,
    /// Highest-confidence contributor message
    best: (f32, String),
    opened: Instant,
}

/// Incident-keyed fusion of detector output
pub struct Aggregator {
    window: Duration,
    scorer: Option<Arc<dyn ThreatScorer>>,
    incidents: HashMap<IncidentKey, Incident>,
}

impl Aggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            scorer: None,
            incidents: HashMap::new(),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ThreatScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Fold one detection into its incident. Arrival order within the
    /// window does not matter; first/last timestamps are min/max folded.
    pub fn ingest(&mut self, event: DetectionEvent) {
        let key = event.incident_key();
        let incident = self.incidents.entry(key).or_insert_with(|| Incident {
            interface: event.interface.clone(),
            survival: 1.0,
            event_count: 0,
            first_event: event.timestamp,
            last_event: event.timestamp,
            detectors: Vec::new(),
            best: (-1.0, String::new()),
            opened: Instant::now(),
        });

        incident.survival *= 1.0 - event.confidence.clamp(0.0, 1.0) as f64;
        incident.event_count += 1;
        incident.first_event = incident.first_event.min(event.timestamp);
        incident.last_event = incident.last_event.max(event.timestamp);
        if !incident.detectors.contains(&event.detector) {
            incident.detectors.push(event.detector.clone());
        }
        if event.confidence > incident.best.0 {
            incident.best = (event.confidence, event.message);
        }
    }

    /// Assessments for incidents whose correlation window has elapsed
    pub fn flush_expired(&mut self) -> Vec<ThreatAssessment> {
        let window = self.window;
        let expired: Vec<IncidentKey> = self
            .incidents
            .iter()
            .filter(|(_, incident)| incident.opened.elapsed() >= window)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                let incident = self.incidents.remove(&key)?;
                Some(self.assess(key, incident))
            })
            .collect()
    }

    /// Drain everything regardless of window age (shutdown path)
    pub fn flush_all(&mut self) -> Vec<ThreatAssessment> {
        let incidents: Vec<(IncidentKey, Incident)> = self.incidents.drain().collect();
        incidents
            .into_iter()
            .map(|(key, incident)| self.assess(key, incident))
            .collect()
    }

    pub fn open_incidents(&self) -> usize {
        self.incidents.len()
    }

    fn assess(&self, key: IncidentKey, incident: Incident) -> ThreatAssessment {
        let combined = (1.0 - incident.survival) as f32;
        let mut assessment = ThreatAssessment {
            key,
            interface: incident.interface,
            combined_confidence: combined.clamp(0.0, 1.0),
            ml_score: None,
            event_count: incident.event_count,
            first_event: incident.first_event,
            last_event: incident.last_event,
            detectors: incident.detectors,
            message: incident.best.1,
        };

        if let Some(scorer) = &self.scorer {
            if let Some(score) = scorer.score(&assessment) {
                let score = score.clamp(0.0, 1.0);
                assessment.ml_score = Some(score);
                assessment.combined_confidence = assessment.combined_confidence.max(score);
            }
        }

        debug!(
            key = %assessment.key,
            confidence = assessment.combined_confidence,
            events = assessment.event_count,
            "incident assessed"
        );
        assessment
    }
}
