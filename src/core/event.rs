//! Detection events and threat assessments
//!
//! Unified detection record produced by every detector and the fused
//! assessment the aggregator hands to the alert manager.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::arp::MacAddr;

/// Alert severity, ordered
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Severity {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Severity {
    /// Severity mapping from combined confidence
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence >= 0.85 {
            Severity::Critical
        } else if confidence >= 0.6 {
            Severity::High
        } else if confidence >= 0.35 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Closed set of detection kinds. Adding a detector means adding a variant
/// here, not threading new ambient state through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    /// A second MAC observed for an IP that already has a binding
    BindingConflict,
    /// Competing claims for a gateway IP inside the correlation window
    MitmSuspected,
    /// A threshold rule fired on the sliding window
    RateAnomaly,
    /// A signature matched the event stream
    SignatureMatch,
    /// One MAC claiming many distinct IPs
    MacFanOut,
    /// Internal condition (e.g. audit store unavailable)
    InternalFault,
}

impl fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionKind::BindingConflict => write!(f, "binding_conflict"),
            DetectionKind::MitmSuspected => write!(f, "mitm_suspected"),
            DetectionKind::RateAnomaly => write!(f, "rate_anomaly"),
            DetectionKind::SignatureMatch => write!(f, "signature_match"),
            DetectionKind::MacFanOut => write!(f, "mac_fan_out"),
            DetectionKind::InternalFault => write!(f, "internal_fault"),
        }
    }
}

/// A single detector finding. Transient: consumed once by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Which detector produced this
    pub detector: String,
    pub kind: DetectionKind,
    pub interface: String,
    pub source_ip: Option<Ipv4Addr>,
    pub source_mac: Option<MacAddr>,
    pub target_ip: Option<Ipv4Addr>,
    pub target_mac: Option<MacAddr>,
    /// 0.0 - 1.0
    pub confidence: f32,
    pub message: String,
    /// Supporting evidence, keyed free-form
    pub evidence: HashMap<String, serde_json::Value>,
}

impl DetectionEvent {
    pub fn new(
        detector: &str,
        kind: DetectionKind,
        interface: &str,
        confidence: f32,
        message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            detector: detector.to_string(),
            kind,
            interface: interface.to_string(),
            source_ip: None,
            source_mac: None,
            target_ip: None,
            target_mac: None,
            confidence: confidence.clamp(0.0, 1.0),
            message,
            evidence: HashMap::new(),
        }
    }

    pub fn with_source(mut self, ip: Ipv4Addr, mac: MacAddr) -> Self {
        self.source_ip = Some(ip);
        self.source_mac = Some(mac);
        self
    }

    pub fn with_target(mut self, ip: Ipv4Addr, mac: Option<MacAddr>) -> Self {
        self.target_ip = Some(ip);
        self.target_mac = mac;
        self
    }

    pub fn with_evidence(mut self, key: &str, value: serde_json::Value) -> Self {
        self.evidence.insert(key.to_string(), value);
        self
    }

    /// Incident key the aggregator and alert manager correlate on
    pub fn incident_key(&self) -> IncidentKey {
        IncidentKey {
            kind: self.kind,
            source: identity(self.source_ip, self.source_mac),
            target: identity(self.target_ip, self.target_mac),
        }
    }
}

fn identity(ip: Option<Ipv4Addr>, mac: Option<MacAddr>) -> String {
    match (ip, mac) {
        (Some(ip), Some(mac)) => format!("{}/{}", ip, mac),
        (Some(ip), None) => ip.to_string(),
        (None, Some(mac)) => mac.to_string(),
        (None, None) => "-".to_string(),
    }
}

/// Correlation key: (kind, source identity, target identity)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncidentKey {
    pub kind: DetectionKind,
    pub source: String,
    pub target: String,
}

impl fmt::Display for IncidentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}→{}", self.kind, self.source, self.target)
    }
}

/// Fused view of one incident inside one correlation window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub key: IncidentKey,
    pub interface: String,
    /// Independent-evidence union of contributor confidences, possibly
    /// overridden upward by an external scorer
    pub combined_confidence: f32,
    /// Score supplied by the external scorer, if one was attached
    pub ml_score: Option<f32>,
    /// Number of detection events fused into this assessment
    pub event_count: u32,
    pub first_event: DateTime<Utc>,
    pub last_event: DateTime<Utc>,
    /// Which detectors contributed
    pub detectors: Vec<String>,
    /// Representative message from the highest-confidence contributor
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(Severity::from_confidence(0.9), Severity::Critical);
        assert_eq!(Severity::from_confidence(0.85), Severity::Critical);
        assert_eq!(Severity::from_confidence(0.7), Severity::High);
        assert_eq!(Severity::from_confidence(0.5), Severity::Medium);
        assert_eq!(Severity::from_confidence(0.1), Severity::Low);
        assert!(Severity::Critical > Severity::High);
    }

    #[test]
    fn test_incident_key_groups_same_pair() {
        let a = DetectionEvent::new(
            "bindings",
            DetectionKind::BindingConflict,
            "eth0",
            0.8,
            "conflict".to_string(),
        )
        .with_source(Ipv4Addr::new(10, 0, 0, 1), MacAddr([0xaa; 6]))
        .with_target(Ipv4Addr::new(10, 0, 0, 2), None);

        let b = DetectionEvent::new(
            "patterns",
            DetectionKind::BindingConflict,
            "eth0",
            0.3,
            "sig".to_string(),
        )
        .with_source(Ipv4Addr::new(10, 0, 0, 1), MacAddr([0xaa; 6]))
        .with_target(Ipv4Addr::new(10, 0, 0, 2), None);

        assert_eq!(a.incident_key(), b.incident_key());
    }

    #[test]
    fn test_confidence_clamped() {
        let event = DetectionEvent::new(
            "rate",
            DetectionKind::RateAnomaly,
            "eth0",
            3.7,
            "over".to_string(),
        );
        assert_eq!(event.confidence, 1.0);
    }
}
