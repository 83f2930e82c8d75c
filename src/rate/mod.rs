//! Rate-based anomaly detection
//!
//! Each interface owns an independent sliding window of per-second
//! sub-buckets counting normalized event types. On every tick the
//! configured threshold rules are evaluated against the window; a rule
//! must stay violated for `violation_count` consecutive ticks before it
//! fires (debounce), and fires once per sustained violation, not once
//! per tick.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::core::arp::{ArpEvent, ArpOp};
use crate::core::event::{DetectionEvent, DetectionKind};

const DETECTOR: &str = "rate";

/// Counter slots per bucket
const METRIC_SLOTS: usize = 4;

/// Which counter a threshold rule watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateMetric {
    Request,
    Reply,
    Gratuitous,
    Total,
}

impl RateMetric {
    fn slot(&self) -> Option<usize> {
        match self {
            RateMetric::Request => Some(0),
            RateMetric::Reply => Some(1),
            RateMetric::Gratuitous => Some(2),
            RateMetric::Total => None,
        }
    }
}

impl fmt::Display for RateMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateMetric::Request => write!(f, "request"),
            RateMetric::Reply => write!(f, "reply"),
            RateMetric::Gratuitous => write!(f, "gratuitous"),
            RateMetric::Total => write!(f, "total"),
        }
    }
}

/// A configured rate threshold. Immutable once loaded; a reload swaps the
/// whole rule set at the next tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub metric: RateMetric,
    /// Sub-buckets (seconds) the rule aggregates over
    pub window_size: u32,
    /// Consecutive violating ticks required before firing
    pub violation_count: u32,
    /// Multiplier over the learned baseline
    pub violation_ratio: f32,
}

/// Detector tuning
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Total sliding-window span per interface
    pub window: Duration,
    /// Floor under the learned baseline, in events/sec, so a silent
    /// network still has a meaningful threshold
    pub baseline_floor: f32,
    /// EWMA weight for baseline updates
    pub ewma_alpha: f32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            baseline_floor: 1.0,
            ewma_alpha: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    counts: [u64; METRIC_SLOTS],
}

/// Sliding window of sub-buckets for one interface. Never shared across
/// interfaces.
#[derive(Debug)]
pub struct SampleWindow {
    buckets: VecDeque<Bucket>,
    capacity: usize,
    /// Ticks observed since the window started
    ticks: u32,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        let mut buckets = VecDeque::with_capacity(capacity);
        buckets.push_back(Bucket::default());
        Self {
            buckets,
            capacity,
            ticks: 0,
        }
    }

    fn record(&mut self, slot: usize) {
        if let Some(current) = self.buckets.back_mut() {
            current.counts[slot] += 1;
        }
    }

    /// Open a new bucket, evicting the oldest when the window is full
    fn rotate(&mut self) {
        self.buckets.push_back(Bucket::default());
        while self.buckets.len() > self.capacity {
            self.buckets.pop_front();
        }
    }

    /// Observed events/sec for a metric over the last `span` buckets,
    /// the just-completed one included.
    fn rate(&self, metric: RateMetric, span: u32) -> f32 {
        let span = (span as usize).clamp(1, self.buckets.len());
        let total: u64 = self
            .buckets
            .iter()
            .rev()
            .take(span)
            .map(|bucket| match metric.slot() {
                Some(slot) => bucket.counts[slot],
                None => bucket.counts[0] + bucket.counts[1] + bucket.counts[3],
            })
            .sum();
        total as f32 / span as f32
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RuleState {
    consecutive: u32,
    fired: bool,
    baseline: f32,
}

/// Per-interface sliding-window threshold detector
pub struct RateDetector {
    config: RateConfig,
    rules: Vec<ThresholdRule>,
    pending_rules: Option<Vec<ThresholdRule>>,
    windows: HashMap<String, SampleWindow>,
    /// Keyed by (interface, rule index)
    states: HashMap<(String, usize), RuleState>,
}

impl RateDetector {
    pub fn new(config: RateConfig, rules: Vec<ThresholdRule>) -> Self {
        Self {
            config,
            rules,
            pending_rules: None,
            windows: HashMap::new(),
            states: HashMap::new(),
        }
    }

    /// Stage a new rule set; it takes effect at the next tick, never
    /// mid-window.
    pub fn reload_rules(&mut self, rules: Vec<ThresholdRule>) {
        info!(count = rules.len(), "staged rate rule reload");
        self.pending_rules = Some(rules);
    }

    /// Count one event into its interface's current sub-bucket
    pub fn record(&mut self, event: &ArpEvent) {
        let capacity = self.config.window.as_secs().max(1) as usize;
        let window = self
            .windows
            .entry(event.interface.clone())
            .or_insert_with(|| SampleWindow::new(capacity));

        match event.operation {
            ArpOp::Request => window.record(0),
            ArpOp::Reply => window.record(1),
            ArpOp::Unknown(_) => window.record(3),
        }
        if event.gratuitous {
            window.record(2);
        }
    }

    /// Interfaces with live windows
    pub fn interfaces(&self) -> Vec<String> {
        self.windows.keys().cloned().collect()
    }

    /// Evaluate all rules for one interface, then rotate its window
    pub fn tick(&mut self, interface: &str) -> Vec<DetectionEvent> {
        if let Some(rules) = self.pending_rules.take() {
            self.rules = rules;
            self.states.clear();
        }

        let Some(window) = self.windows.get_mut(interface) else {
            return Vec::new();
        };
        // The tick closes the current bucket; rules see it as the newest
        // sample. Rotation happens after evaluation.
        window.ticks = window.ticks.saturating_add(1);
        let ticks = window.ticks;

        let mut detections = Vec::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            let observed = window.rate(rule.metric, rule.window_size);
            let state = self
                .states
                .entry((interface.to_string(), idx))
                .or_default();

            // A freshly-started window is insufficient evidence
            if ticks < rule.violation_count {
                state.baseline = ewma(state.baseline, observed, self.config.ewma_alpha);
                continue;
            }

            let baseline = state.baseline.max(self.config.baseline_floor);
            let threshold = rule.violation_ratio * baseline;

            if observed > threshold {
                state.consecutive += 1;
                debug!(
                    interface,
                    metric = %rule.metric,
                    observed,
                    threshold,
                    consecutive = state.consecutive,
                    "rate threshold violated"
                );
                if state.consecutive >= rule.violation_count && !state.fired {
                    state.fired = true;
                    let confidence = ((observed / threshold) - 1.0).clamp(0.0, 1.0);
                    detections.push(
                        DetectionEvent::new(
                            DETECTOR,
                            DetectionKind::RateAnomaly,
                            interface,
                            confidence,
                            format!(
                                "{} rate {:.1}/s exceeds threshold {:.1}/s on {}",
                                rule.metric, observed, threshold, interface
                            ),
                        )
                        .with_evidence("metric", json!(rule.metric.to_string()))
                        .with_evidence("observed_per_sec", json!(observed))
                        .with_evidence("threshold_per_sec", json!(threshold))
                        .with_evidence("baseline_per_sec", json!(baseline)),
                    );
                }
            } else {
                // Condition cleared: re-arm and learn from the quiet tick.
                // Violating ticks never feed the baseline, so a sustained
                // flood cannot normalize itself.
                state.consecutive = 0;
                state.fired = false;
                state.baseline = ewma(state.baseline, observed, self.config.ewma_alpha);
            }
        }

        window.rotate();
        detections
    }
}

fn ewma(current: f32, observed: f32, alpha: f32) -> f32 {
    if current == 0.0 {
        observed
    } else {
        alpha * observed + (1.0 - alpha) * current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arp::MacAddr;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn reply_on(iface: &str) -> ArpEvent {
        ArpEvent {
            operation: ArpOp::Reply,
            sender_mac: MacAddr([0xaa; 6]),
            sender_ip: Ipv4Addr::new(10, 0, 0, 1),
            target_mac: MacAddr([0xbb; 6]),
            target_ip: Ipv4Addr::new(10, 0, 0, 2),
            interface: iface.to_string(),
            vlan: None,
            timestamp: Utc::now(),
            gratuitous: false,
        }
    }

    fn rule(violation_count: u32) -> ThresholdRule {
        ThresholdRule {
            metric: RateMetric::Reply,
            window_size: 1,
            violation_count,
            violation_ratio: 2.0,
        }
    }

    fn detector(violation_count: u32) -> RateDetector {
        RateDetector::new(RateConfig::default(), vec![rule(violation_count)])
    }

    fn burst(det: &mut RateDetector, iface: &str, count: usize) {
        for _ in 0..count {
            det.record(&reply_on(iface));
        }
    }

    /// Warm the window past the insufficient-evidence guard with quiet ticks
    fn warm_up(det: &mut RateDetector, iface: &str, ticks: usize) {
        det.record(&reply_on(iface));
        for _ in 0..ticks {
            assert!(det.tick(iface).is_empty());
        }
    }

    #[test]
    fn test_single_spike_does_not_fire() {
        let mut det = detector(2);
        warm_up(&mut det, "eth0", 3);

        burst(&mut det, "eth0", 50);
        // One violating tick with violation_count = 2: no fire
        assert!(det.tick("eth0").is_empty());
    }

    #[test]
    fn test_sustained_violation_fires_exactly_once() {
        let mut det = detector(2);
        warm_up(&mut det, "eth0", 3);

        let mut fired = 0;
        for _ in 0..4 {
            burst(&mut det, "eth0", 50);
            fired += det.tick("eth0").len();
        }

        assert_eq!(fired, 1, "one event per debounce period, not per tick");
    }

    #[test]
    fn test_refires_after_condition_clears() {
        let mut det = detector(2);
        warm_up(&mut det, "eth0", 3);

        for _ in 0..2 {
            burst(&mut det, "eth0", 50);
            det.tick("eth0");
        }

        // Quiet ticks clear the condition
        for _ in 0..3 {
            assert!(det.tick("eth0").is_empty());
        }

        let mut fired = 0;
        for _ in 0..2 {
            burst(&mut det, "eth0", 50);
            fired += det.tick("eth0").len();
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_new_window_never_fires() {
        let mut det = detector(3);
        burst(&mut det, "eth0", 500);
        // ticks < violation_count: insufficient evidence
        assert!(det.tick("eth0").is_empty());
        burst(&mut det, "eth0", 500);
        assert!(det.tick("eth0").is_empty());
    }

    #[test]
    fn test_interfaces_evaluated_independently() {
        let mut det = detector(1);
        warm_up(&mut det, "eth0", 2);
        warm_up(&mut det, "eth1", 2);

        burst(&mut det, "eth0", 50);
        assert_eq!(det.tick("eth0").len(), 1);
        assert!(det.tick("eth1").is_empty());
    }

    #[test]
    fn test_rule_reload_applies_next_tick() {
        let mut det = detector(1);
        warm_up(&mut det, "eth0", 2);

        det.reload_rules(vec![ThresholdRule {
            metric: RateMetric::Reply,
            window_size: 1,
            violation_count: 1,
            violation_ratio: 1000.0,
        }]);

        // The staged ratio makes this burst pass
        burst(&mut det, "eth0", 50);
        assert!(det.tick("eth0").is_empty());
    }

    #[test]
    fn test_confidence_scales_with_overshoot() {
        let mut mild = detector(1);
        warm_up(&mut mild, "eth0", 2);
        burst(&mut mild, "eth0", 3);
        let mild_conf = mild.tick("eth0")[0].confidence;

        let mut wild = detector(1);
        warm_up(&mut wild, "eth0", 2);
        burst(&mut wild, "eth0", 500);
        let wild_conf = wild.tick("eth0")[0].confidence;

        assert!(wild_conf > mild_conf);
        assert!(wild_conf <= 1.0);
    }

    #[test]
    fn test_gratuitous_metric_counted() {
        let mut det = RateDetector::new(
            RateConfig::default(),
            vec![ThresholdRule {
                metric: RateMetric::Gratuitous,
                window_size: 1,
                violation_count: 1,
                violation_ratio: 2.0,
            }],
        );
        det.record(&reply_on("eth0"));
        for _ in 0..2 {
            det.tick("eth0");
        }

        let mut gratuitous = reply_on("eth0");
        gratuitous.target_ip = gratuitous.sender_ip;
        gratuitous.gratuitous = true;
        for _ in 0..20 {
            det.record(&gratuitous);
        }
        assert_eq!(det.tick("eth0").len(), 1);
    }
}
