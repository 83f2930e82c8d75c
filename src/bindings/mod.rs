//! Binding table and spoof detection
//!
//! Maintains the authoritative IP↔MAC state per (interface, vlan) and
//! flags conflicting observations. A conflicting MAC supersedes the
//! binding rather than deleting it; the deposed MAC is retained as
//! `previous` for forensic comparison.
//!
//! The table is the one piece of state written by a single logical owner
//! and read concurrently. The lock covers only the read-modify-write
//! section; detection events are built after it is released.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::core::arp::{ArpEvent, ArpOp, MacAddr};
use crate::core::event::{DetectionEvent, DetectionKind};

const DETECTOR: &str = "bindings";

/// Confidence assigned to conflicts against a pinned gateway MAC and the
/// floor for learned-gateway conflicts.
const GATEWAY_CONFLICT_CONFIDENCE: f32 = 0.95;

/// Tuning for the binding table
#[derive(Debug, Clone)]
pub struct BindingConfig {
    /// Competing gateway claims inside this window are MITM-suspect
    pub correlation_window: Duration,
    /// Distinct IPs one MAC may claim before a fan-out detection
    pub mac_fanout_threshold: usize,
    /// Window for the gratuitous-ARP counter
    pub gratuitous_window: Duration,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            correlation_window: Duration::from_secs(10),
            mac_fanout_threshold: 8,
            gratuitous_window: Duration::from_secs(60),
        }
    }
}

/// Key: one binding per (interface, vlan, ip)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindingKey {
    interface: String,
    vlan: Option<u16>,
    ip: Ipv4Addr,
}

/// The MAC a binding held before it was superseded
#[derive(Debug, Clone, Serialize)]
pub struct PreviousMac {
    pub mac: MacAddr,
    pub deposed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct BindingEntry {
    mac: MacAddr,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    last_seen_mono: Instant,
    change_count: u32,
    is_gateway: bool,
    previous: Option<PreviousMac>,
}

/// Read-only view of a binding, for the observer feed
#[derive(Debug, Clone, Serialize)]
pub struct ArpBindingView {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub interface: String,
    pub vlan: Option<u16>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_gateway: bool,
    pub change_count: u32,
    pub previous: Option<PreviousMac>,
}

#[derive(Debug, Default)]
struct TableState {
    bindings: HashMap<BindingKey, BindingEntry>,
    /// Recent claimant MACs per gateway IP
    gateway_claims: HashMap<Ipv4Addr, Vec<(MacAddr, Instant)>>,
    /// IPs claimed by each MAC
    mac_to_ips: HashMap<MacAddr, HashSet<Ipv4Addr>>,
    /// Last fan-out detection per MAC, to avoid re-firing every frame
    fanout_alerted: HashMap<MacAddr, Instant>,
    /// Gratuitous announcements per source MAC in the current window
    gratuitous: HashMap<MacAddr, (u32, Instant)>,
}

/// What `observe` decided while the lock was held
enum Verdict {
    Clean,
    Conflict {
        old_mac: MacAddr,
        elapsed: Duration,
        is_gateway: bool,
        change_count: u32,
    },
    Mitm {
        claimants: Vec<String>,
    },
    FanOut {
        ip_count: usize,
    },
}

/// Authoritative IP↔MAC state with spoof and MITM detection
pub struct BindingTable {
    config: BindingConfig,
    /// Pinned gateway addresses from configuration. A `None` MAC marks the
    /// IP as a gateway without pinning its hardware address.
    trusted: HashMap<Ipv4Addr, Option<MacAddr>>,
    state: Mutex<TableState>,
}

impl BindingTable {
    pub fn new(config: BindingConfig) -> Self {
        Self {
            config,
            trusted: HashMap::new(),
            state: Mutex::new(TableState::default()),
        }
    }

    /// Pin a gateway IP, optionally to a known MAC
    pub fn add_trusted_gateway(&mut self, ip: Ipv4Addr, mac: Option<MacAddr>) {
        self.trusted.insert(ip, mac);
    }

    /// Process one normalized ARP event. Returns at most one detection.
    pub fn observe(&self, event: &ArpEvent) -> Option<DetectionEvent> {
        // Only replies and gratuitous announcements carry an authoritative
        // sender mapping.
        let authoritative = matches!(event.operation, ArpOp::Reply)
            || (matches!(event.operation, ArpOp::Request) && event.gratuitous);
        if !authoritative {
            return None;
        }

        // Malformed events are dropped, never scored
        if event.sender_ip.is_unspecified() || event.sender_mac.is_invalid_sender() {
            debug!(
                interface = %event.interface,
                sender_ip = %event.sender_ip,
                sender_mac = %event.sender_mac,
                "dropping malformed arp event"
            );
            return None;
        }

        let now = Instant::now();
        let key = BindingKey {
            interface: event.interface.clone(),
            vlan: event.vlan,
            ip: event.sender_ip,
        };
        let pinned = self.trusted.get(&event.sender_ip);
        let is_gateway_ip = pinned.is_some();

        let (verdict, gratuitous_seen) = {
            let mut state = self.state.lock();

            if event.gratuitous {
                let entry = state
                    .gratuitous
                    .entry(event.sender_mac)
                    .or_insert((0, now));
                if now.duration_since(entry.1) > self.config.gratuitous_window {
                    *entry = (0, now);
                }
                entry.0 += 1;
            }
            let gratuitous_seen = state
                .gratuitous
                .get(&event.sender_mac)
                .map(|(count, _)| *count)
                .unwrap_or(0);

            state
                .mac_to_ips
                .entry(event.sender_mac)
                .or_default()
                .insert(event.sender_ip);

            if is_gateway_ip {
                let claims = state.gateway_claims.entry(event.sender_ip).or_default();
                claims.push((event.sender_mac, now));
                let window = self.config.correlation_window;
                claims.retain(|(_, t)| now.duration_since(*t) <= window);
            }

            (
                self.apply_observation(&mut state, key, event, pinned, now),
                gratuitous_seen,
            )
        };

        // Lock released; build the detection event
        match verdict {
            Verdict::Clean => None,
            Verdict::Conflict {
                old_mac,
                elapsed,
                is_gateway,
                change_count,
            } => {
                let confidence = conflict_confidence(elapsed, is_gateway);
                Some(
                    DetectionEvent::new(
                        DETECTOR,
                        DetectionKind::BindingConflict,
                        &event.interface,
                        confidence,
                        format!(
                            "{} changed from {} to {} after {:?}",
                            event.sender_ip, old_mac, event.sender_mac, elapsed
                        ),
                    )
                    .with_source(event.sender_ip, event.sender_mac)
                    .with_target(event.target_ip, Some(event.target_mac))
                    .with_evidence("previous_mac", json!(old_mac.to_string()))
                    .with_evidence("change_count", json!(change_count))
                    .with_evidence("is_gateway", json!(is_gateway))
                    .with_evidence("gratuitous_seen", json!(gratuitous_seen)),
                )
            }
            Verdict::Mitm { claimants } => Some(
                DetectionEvent::new(
                    DETECTOR,
                    DetectionKind::MitmSuspected,
                    &event.interface,
                    1.0,
                    format!(
                        "competing claims for gateway {}: {}",
                        event.sender_ip,
                        claimants.join(", ")
                    ),
                )
                .with_source(event.sender_ip, event.sender_mac)
                .with_target(event.target_ip, Some(event.target_mac))
                .with_evidence("claimants", json!(claimants))
                .with_evidence("gratuitous_seen", json!(gratuitous_seen)),
            ),
            Verdict::FanOut { ip_count } => Some(
                DetectionEvent::new(
                    DETECTOR,
                    DetectionKind::MacFanOut,
                    &event.interface,
                    fanout_confidence(ip_count, self.config.mac_fanout_threshold),
                    format!("{} claims {} distinct IPs", event.sender_mac, ip_count),
                )
                .with_source(event.sender_ip, event.sender_mac)
                .with_evidence("ip_count", json!(ip_count)),
            ),
        }
    }

    fn apply_observation(
        &self,
        state: &mut TableState,
        key: BindingKey,
        event: &ArpEvent,
        pinned: Option<&Option<MacAddr>>,
        now: Instant,
    ) -> Verdict {
        let wall = event.timestamp;

        // A pinned gateway MAC is authoritative over anything learned
        if let Some(Some(pinned_mac)) = pinned {
            if event.sender_mac != *pinned_mac {
                if let Some(claimants) =
                    competing_claimants(state, event.sender_ip, *pinned_mac, &event.sender_mac)
                {
                    return Verdict::Mitm { claimants };
                }
                return Verdict::Conflict {
                    old_mac: *pinned_mac,
                    elapsed: Duration::ZERO,
                    is_gateway: true,
                    change_count: 0,
                };
            }
        }

        let is_gateway_ip = pinned.is_some();
        match state.bindings.get_mut(&key) {
            Some(entry) if entry.mac == event.sender_mac => {
                entry.last_seen = wall;
                entry.last_seen_mono = now;
                Verdict::Clean
            }
            Some(entry) => {
                let old_mac = entry.mac;
                let elapsed = now.duration_since(entry.last_seen_mono);
                entry.previous = Some(PreviousMac {
                    mac: old_mac,
                    deposed_at: wall,
                });
                entry.mac = event.sender_mac;
                entry.change_count += 1;
                entry.last_seen = wall;
                entry.last_seen_mono = now;
                let change_count = entry.change_count;
                let is_gateway = entry.is_gateway;

                if is_gateway {
                    if let Some(claimants) =
                        competing_claimants(state, event.sender_ip, old_mac, &event.sender_mac)
                    {
                        return Verdict::Mitm { claimants };
                    }
                }
                Verdict::Conflict {
                    old_mac,
                    elapsed,
                    is_gateway,
                    change_count,
                }
            }
            None => {
                state.bindings.insert(
                    key,
                    BindingEntry {
                        mac: event.sender_mac,
                        first_seen: wall,
                        last_seen: wall,
                        last_seen_mono: now,
                        change_count: 0,
                        is_gateway: is_gateway_ip,
                        previous: None,
                    },
                );

                // New binding is clean, but the claiming MAC may not be
                let ip_count = state
                    .mac_to_ips
                    .get(&event.sender_mac)
                    .map(|ips| ips.len())
                    .unwrap_or(0);
                if ip_count >= self.config.mac_fanout_threshold {
                    let window = self.config.correlation_window;
                    let recently = state
                        .fanout_alerted
                        .get(&event.sender_mac)
                        .map(|t| now.duration_since(*t) <= window)
                        .unwrap_or(false);
                    if !recently {
                        state.fanout_alerted.insert(event.sender_mac, now);
                        return Verdict::FanOut { ip_count };
                    }
                }
                Verdict::Clean
            }
        }
    }

    /// Gratuitous announcements seen from a MAC in the current window
    pub fn gratuitous_count(&self, mac: &MacAddr) -> u32 {
        self.state
            .lock()
            .gratuitous
            .get(mac)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    /// Distinct IPs a MAC has claimed
    pub fn ips_claimed(&self, mac: &MacAddr) -> usize {
        self.state
            .lock()
            .mac_to_ips
            .get(mac)
            .map(|ips| ips.len())
            .unwrap_or(0)
    }

    /// Evict bindings not seen within `max_age`. Gateway bindings are kept.
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.bindings.retain(|_, entry| {
            entry.is_gateway || now.duration_since(entry.last_seen_mono) < max_age
        });
        let window = self.config.gratuitous_window;
        state
            .gratuitous
            .retain(|_, (_, t)| now.duration_since(*t) < window);
    }

    /// Topology snapshot for the observer feed
    pub fn snapshot(&self) -> Vec<ArpBindingView> {
        let state = self.state.lock();
        let mut views: Vec<ArpBindingView> = state
            .bindings
            .iter()
            .map(|(key, entry)| ArpBindingView {
                ip: key.ip,
                mac: entry.mac,
                interface: key.interface.clone(),
                vlan: key.vlan,
                first_seen: entry.first_seen,
                last_seen: entry.last_seen,
                is_gateway: entry.is_gateway,
                change_count: entry.change_count,
                previous: entry.previous.clone(),
            })
            .collect();
        views.sort_by_key(|v| v.ip);
        views
    }

    pub fn binding_count(&self) -> usize {
        self.state.lock().bindings.len()
    }
}

/// Distinct claimant identities when a gateway IP has competing claims
/// inside the correlation window, including the legitimate holder.
fn competing_claimants(
    state: &TableState,
    ip: Ipv4Addr,
    legitimate: MacAddr,
    challenger: &MacAddr,
) -> Option<Vec<String>> {
    let claims = state.gateway_claims.get(&ip)?;
    let macs: HashSet<MacAddr> = claims.iter().map(|(mac, _)| *mac).collect();
    // Both the true gateway and the challenger announced inside the window
    if macs.contains(&legitimate) && macs.contains(challenger) {
        let mut names: Vec<String> = macs.iter().map(|m| m.to_string()).collect();
        names.sort();
        Some(names)
    } else {
        None
    }
}

/// Confidence for a binding conflict. Sub-second flips score highest; the
/// score decays linearly out to five minutes. Gateway conflicts are floored
/// near maximum regardless of timing.
fn conflict_confidence(elapsed: Duration, is_gateway: bool) -> f32 {
    let secs = elapsed.as_secs_f32();
    let recency = if secs < 1.0 {
        1.0
    } else {
        1.0 - (secs / 300.0).min(1.0) * 0.75
    };
    let confidence = 0.4 + 0.5 * recency;
    if is_gateway {
        confidence.max(GATEWAY_CONFLICT_CONFIDENCE)
    } else {
        confidence
    }
}

fn fanout_confidence(ip_count: usize, threshold: usize) -> f32 {
    let excess = ip_count.saturating_sub(threshold) as f32;
    (0.6 + excess * 0.02).min(0.95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reply(sender_ip: [u8; 4], sender_mac: u8, iface: &str) -> ArpEvent {
        ArpEvent {
            operation: ArpOp::Reply,
            sender_mac: MacAddr([sender_mac; 6]),
            sender_ip: Ipv4Addr::from(sender_ip),
            target_mac: MacAddr([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
            target_ip: Ipv4Addr::new(192, 168, 1, 100),
            interface: iface.to_string(),
            vlan: None,
            timestamp: Utc::now(),
            gratuitous: false,
        }
    }

    #[test]
    fn test_conflict_detected_and_previous_retained() {
        let table = BindingTable::new(BindingConfig::default());

        assert!(table.observe(&reply([10, 0, 0, 1], 0xaa, "eth0")).is_none());

        let detection = table
            .observe(&reply([10, 0, 0, 1], 0xbb, "eth0"))
            .expect("conflict expected");
        assert_eq!(detection.kind, DetectionKind::BindingConflict);
        assert!(detection.confidence > 0.0);

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].mac, MacAddr([0xbb; 6]));
        let previous = snapshot[0].previous.as_ref().expect("previous retained");
        assert_eq!(previous.mac, MacAddr([0xaa; 6]));
    }

    #[test]
    fn test_same_mac_refreshes_without_detection() {
        let table = BindingTable::new(BindingConfig::default());
        assert!(table.observe(&reply([10, 0, 0, 1], 0xaa, "eth0")).is_none());
        assert!(table.observe(&reply([10, 0, 0, 1], 0xaa, "eth0")).is_none());
        assert_eq!(table.binding_count(), 1);
    }

    #[test]
    fn test_interfaces_are_independent() {
        let table = BindingTable::new(BindingConfig::default());
        assert!(table.observe(&reply([10, 0, 0, 1], 0xaa, "eth0")).is_none());
        // Same IP, different MAC, different interface: a new binding
        assert!(table.observe(&reply([10, 0, 0, 1], 0xbb, "eth1")).is_none());
        assert_eq!(table.binding_count(), 2);
    }

    #[test]
    fn test_gateway_conflict_scores_higher() {
        let plain = BindingTable::new(BindingConfig::default());
        plain.observe(&reply([10, 0, 0, 1], 0xaa, "eth0"));
        // Age the binding far enough that recency no longer saturates
        {
            let mut state = plain.state.lock();
            for entry in state.bindings.values_mut() {
                entry.last_seen_mono = Instant::now() - Duration::from_secs(120);
            }
        }
        let plain_conf = plain
            .observe(&reply([10, 0, 0, 1], 0xbb, "eth0"))
            .unwrap()
            .confidence;

        let mut gateway = BindingTable::new(BindingConfig::default());
        gateway.add_trusted_gateway(Ipv4Addr::new(10, 0, 0, 1), None);
        gateway.observe(&reply([10, 0, 0, 1], 0xaa, "eth0"));
        {
            let mut state = gateway.state.lock();
            for entry in state.bindings.values_mut() {
                entry.last_seen_mono = Instant::now() - Duration::from_secs(120);
            }
            state.gateway_claims.clear();
        }
        let gateway_conf = gateway
            .observe(&reply([10, 0, 0, 1], 0xbb, "eth0"))
            .unwrap()
            .confidence;

        assert!(
            gateway_conf > plain_conf,
            "gateway {} should exceed plain {}",
            gateway_conf,
            plain_conf
        );
        assert!(gateway_conf >= GATEWAY_CONFLICT_CONFIDENCE);
    }

    #[test]
    fn test_third_party_gateway_claim_is_mitm() {
        let mut table = BindingTable::new(BindingConfig::default());
        let gw = Ipv4Addr::new(192, 168, 1, 1);
        table.add_trusted_gateway(gw, Some(MacAddr([0xaa; 6])));

        // True gateway announces
        assert!(table
            .observe(&reply([192, 168, 1, 1], 0xaa, "eth0"))
            .is_none());

        // Attacker claims the gateway IP while the true gateway is fresh
        let detection = table
            .observe(&reply([192, 168, 1, 1], 0xcc, "eth0"))
            .expect("mitm expected");
        assert_eq!(detection.kind, DetectionKind::MitmSuspected);
        assert_eq!(detection.confidence, 1.0);
    }

    #[test]
    fn test_pinned_gateway_without_prior_claim_is_conflict() {
        let mut table = BindingTable::new(BindingConfig::default());
        let gw = Ipv4Addr::new(192, 168, 1, 1);
        table.add_trusted_gateway(gw, Some(MacAddr([0xaa; 6])));

        // Attacker claims the pinned IP; the true gateway has not spoken
        // inside the window, so this is a (near-max) conflict, not MITM.
        let detection = table
            .observe(&reply([192, 168, 1, 1], 0xcc, "eth0"))
            .expect("conflict expected");
        assert_eq!(detection.kind, DetectionKind::BindingConflict);
        assert!(detection.confidence >= GATEWAY_CONFLICT_CONFIDENCE);
    }

    #[test]
    fn test_malformed_event_dropped() {
        let table = BindingTable::new(BindingConfig::default());

        let mut zero_mac = reply([10, 0, 0, 1], 0xaa, "eth0");
        zero_mac.sender_mac = MacAddr::ZERO;
        assert!(table.observe(&zero_mac).is_none());

        let unspecified = reply([0, 0, 0, 0], 0xaa, "eth0");
        assert!(table.observe(&unspecified).is_none());
        assert_eq!(table.binding_count(), 0);
    }

    #[test]
    fn test_requests_do_not_update_bindings() {
        let table = BindingTable::new(BindingConfig::default());
        let mut request = reply([10, 0, 0, 1], 0xaa, "eth0");
        request.operation = ArpOp::Request;
        assert!(table.observe(&request).is_none());
        assert_eq!(table.binding_count(), 0);
    }

    #[test]
    fn test_mac_fanout() {
        let table = BindingTable::new(BindingConfig {
            mac_fanout_threshold: 3,
            ..Default::default()
        });

        let mut detections = Vec::new();
        for i in 1..=5u8 {
            if let Some(d) = table.observe(&reply([10, 0, 0, i], 0xee, "eth0")) {
                detections.push(d);
            }
        }

        assert_eq!(detections.len(), 1, "fan-out fires once per window");
        assert_eq!(detections[0].kind, DetectionKind::MacFanOut);
    }

    #[test]
    fn test_gratuitous_and_claim_counters() {
        let table = BindingTable::new(BindingConfig::default());
        let mac = MacAddr([0xaa; 6]);
        for i in 1..=3u8 {
            let mut announce = reply([10, 0, 0, i], 0xaa, "eth0");
            announce.target_ip = announce.sender_ip;
            announce.gratuitous = true;
            table.observe(&announce);
        }

        assert_eq!(table.gratuitous_count(&mac), 3);
        assert_eq!(table.ips_claimed(&mac), 3);
        assert_eq!(table.gratuitous_count(&MacAddr([0xbb; 6])), 0);
    }

    #[test]
    fn test_cleanup_keeps_gateways() {
        let mut table = BindingTable::new(BindingConfig::default());
        table.add_trusted_gateway(Ipv4Addr::new(10, 0, 0, 1), None);
        table.observe(&reply([10, 0, 0, 1], 0xaa, "eth0"));
        table.observe(&reply([10, 0, 0, 2], 0xbb, "eth0"));

        {
            let mut state = table.state.lock();
            for entry in state.bindings.values_mut() {
                entry.last_seen_mono = Instant::now() - Duration::from_secs(7200);
            }
        }
        table.cleanup(Duration::from_secs(3600));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].is_gateway);
    }

    #[test]
    fn test_conflict_confidence_shape() {
        let fast = conflict_confidence(Duration::from_millis(200), false);
        let slow = conflict_confidence(Duration::from_secs(240), false);
        assert!(fast > slow);
        assert!((fast - 0.9).abs() < 1e-6);
        assert!(conflict_confidence(Duration::from_secs(240), true) >= 0.95);
    }
}
