//! Pattern matching against event sequences
//!
//! Keeps a bounded context buffer per (sender, target) pair so signatures
//! can describe multi-event shapes, not just single packets. For one
//! signature the kinds are attempted in a fixed tie-break order
//! exact → partial → fuzzy → regex; the first success ends evaluation for
//! that signature, so a signature never double-fires from two kinds.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde_json::json;
use tracing::trace;

use super::loader::{CompiledPattern, CompiledSignature};
use super::store::SignatureStore;
use super::{FieldPattern, PatternKind, FIELD_COUNT};
use crate::core::arp::ArpEvent;
use crate::core::event::{DetectionEvent, DetectionKind};

const DETECTOR: &str = "patterns";

/// A successful signature match
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub signature_id: String,
    pub description: String,
    /// The kind that actually matched (a fuzzy signature may win exactly)
    pub matched_kind: PatternKind,
    /// 1.0 for exact/regex, field ratio for partial, similarity for fuzzy
    pub quality: f32,
    /// base_confidence × quality
    pub confidence: f32,
}

/// Matching engine with per-pair context buffers
pub struct PatternEngine {
    store: Arc<SignatureStore>,
    contexts: HashMap<(Ipv4Addr, Ipv4Addr), VecDeque<ArpEvent>>,
    /// Events retained per (sender, target) pair
    depth: usize,
}

impl PatternEngine {
    pub fn new(store: Arc<SignatureStore>, depth: usize) -> Self {
        Self {
            store,
            contexts: HashMap::new(),
            depth: depth.max(1),
        }
    }

    /// Feed one event: update the pair's context buffer and match the
    /// resulting sequence against the current signature snapshot.
    pub fn observe(&mut self, event: &ArpEvent) -> Vec<DetectionEvent> {
        let key = (event.sender_ip, event.target_ip);
        let buffer = self.contexts.entry(key).or_default();
        buffer.push_back(event.clone());
        while buffer.len() > self.depth {
            buffer.pop_front();
        }

        let snapshot = self.store.snapshot();
        let sequence: Vec<ArpEvent> = buffer.iter().cloned().collect();
        match_sequence(&snapshot.signatures, &sequence)
            .into_iter()
            .map(|m| {
                DetectionEvent::new(
                    DETECTOR,
                    DetectionKind::SignatureMatch,
                    &event.interface,
                    m.confidence,
                    format!(
                        "signature {} matched ({}, quality {:.2})",
                        m.signature_id, m.matched_kind, m.quality
                    ),
                )
                .with_source(event.sender_ip, event.sender_mac)
                .with_target(event.target_ip, Some(event.target_mac))
                .with_evidence("signature_id", json!(m.signature_id))
                .with_evidence("matched_kind", json!(m.matched_kind.to_string()))
                .with_evidence("quality", json!(m.quality))
            })
            .collect()
    }

    /// Drop context buffers that have gone idle
    pub fn prune_contexts(&mut self, max_pairs: usize) {
        if self.contexts.len() > max_pairs {
            let excess = self.contexts.len() - max_pairs;
            let stale: Vec<(Ipv4Addr, Ipv4Addr)> = {
                let mut pairs: Vec<_> = self
                    .contexts
                    .iter()
                    .map(|(key, buf)| {
                        let last = buf
                            .back()
                            .map(|e| e.timestamp)
                            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
                        (*key, last)
                    })
                    .collect();
                pairs.sort_by_key(|(_, ts)| *ts);
                pairs.into_iter().take(excess).map(|(key, _)| key).collect()
            };
            for key in stale {
                self.contexts.remove(&key);
            }
        }
    }

    pub fn context_pairs(&self) -> usize {
        self.contexts.len()
    }
}

/// Match an event sequence against a signature set. Pure, no buffers.
pub fn match_sequence(
    signatures: &[CompiledSignature],
    sequence: &[ArpEvent],
) -> Vec<PatternMatch> {
    let Some(latest) = sequence.last() else {
        return Vec::new();
    };
    let encoding = latest.canonical_encoding();

    let mut matches = Vec::new();
    for signature in signatures {
        if !context_satisfied(signature, sequence) {
            continue;
        }
        if let Some((matched_kind, quality)) = try_signature(signature, latest, &encoding) {
            trace!(id = %signature.id, kind = %matched_kind, quality, "signature matched");
            matches.push(PatternMatch {
                signature_id: signature.id.clone(),
                description: signature.description.clone(),
                matched_kind,
                quality,
                confidence: (signature.base_confidence * quality).clamp(0.0, 1.0),
            });
        }
    }
    matches
}

fn context_satisfied(signature: &CompiledSignature, sequence: &[ArpEvent]) -> bool {
    let ctx = &signature.context;
    if sequence.len() < ctx.min_sequence {
        return false;
    }

    let considered = &sequence[sequence.len() - ctx.min_sequence..];

    if let Some(within) = ctx.within_seconds {
        let first = considered.first().map(|e| e.timestamp);
        let last = considered.last().map(|e| e.timestamp);
        if let (Some(first), Some(last)) = (first, last) {
            if (last - first).num_seconds() > within as i64 {
                return false;
            }
        }
    }

    if let Some(operations) = &ctx.operations {
        if operations.len() > sequence.len() {
            return false;
        }
        let tail = &sequence[sequence.len() - operations.len()..];
        for (event, wanted) in tail.iter().zip(operations) {
            if event.operation.to_string() != *wanted {
                return false;
            }
        }
    }

    true
}

/// Attempt one signature in tie-break order. A fuzzy signature is given
/// its exact chance first so an identical event reports quality 1.0, not
/// the similarity score.
fn try_signature(
    signature: &CompiledSignature,
    latest: &ArpEvent,
    encoding: &str,
) -> Option<(PatternKind, f32)> {
    match &signature.pattern {
        CompiledPattern::Exact(pattern) => {
            (encoding == pattern).then_some((PatternKind::Exact, 1.0))
        }
        CompiledPattern::Partial(fields) => {
            partial_quality(fields, latest).map(|quality| (PatternKind::Partial, quality))
        }
        CompiledPattern::Fuzzy { pattern, floor } => {
            if encoding == pattern {
                return Some((PatternKind::Exact, 1.0));
            }
            let similarity = similarity(encoding, pattern);
            (similarity >= *floor).then_some((PatternKind::Fuzzy, similarity))
        }
        CompiledPattern::Regex(regex) => {
            regex.is_match(encoding).then_some((PatternKind::Regex, 1.0))
        }
    }
}

/// All specified fields must equal; quality is the fraction of fields the
/// signature actually constrained.
fn partial_quality(fields: &FieldPattern, event: &ArpEvent) -> Option<f32> {
    let checks = [
        fields
            .operation
            .as_ref()
            .map(|want| event.operation.to_string() == *want),
        fields
            .sender_ip
            .as_ref()
            .map(|want| event.sender_ip.to_string() == *want),
        fields
            .sender_mac
            .as_ref()
            .map(|want| event.sender_mac.to_string() == *want),
        fields
            .target_ip
            .as_ref()
            .map(|want| event.target_ip.to_string() == *want),
        fields
            .target_mac
            .as_ref()
            .map(|want| event.target_mac.to_string() == *want),
        fields.gratuitous.map(|want| event.gratuitous == want),
    ];

    if checks.iter().flatten().all(|ok| *ok) {
        Some(fields.specified() as f32 / FIELD_COUNT as f32)
    } else {
        None
    }
}

/// Normalized Levenshtein similarity: 1 − distance / max(len)
fn similarity(a: &str, b: &str) -> f32 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f32 / max_len as f32
}

/// Two-row Levenshtein over chars
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (prev[j + 1] + 1)
                .min(current[j] + 1)
                .min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}
