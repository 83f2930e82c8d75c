//! Signature-based pattern matching
//!
//! Signatures describe known attack shapes and are matched against the
//! normalized event stream. The store is read-mostly: matchers take a
//! snapshot and a reload swaps the whole store atomically, so an in-flight
//! match never observes a half-updated database.

pub mod loader;
pub mod matcher;
pub mod store;

pub use self::loader::{load_file, LoadError, SignatureSet};
pub use self::matcher::{PatternEngine, PatternMatch};
pub use self::store::SignatureStore;

use serde::{Deserialize, Serialize};

/// How a signature's pattern is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// Byte-for-byte equality against the canonical encoding
    Exact,
    /// Required subset of fields equal, the rest wildcarded
    Partial,
    /// Normalized edit-distance similarity above a per-signature floor
    Fuzzy,
    /// Compiled regular expression over the canonical encoding
    Regex,
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternKind::Exact => write!(f, "exact"),
            PatternKind::Partial => write!(f, "partial"),
            PatternKind::Fuzzy => write!(f, "fuzzy"),
            PatternKind::Regex => write!(f, "regex"),
        }
    }
}

/// Field constraints for partial signatures. `None` is a wildcard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldPattern {
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub sender_ip: Option<String>,
    #[serde(default)]
    pub sender_mac: Option<String>,
    #[serde(default)]
    pub target_ip: Option<String>,
    #[serde(default)]
    pub target_mac: Option<String>,
    #[serde(default)]
    pub gratuitous: Option<bool>,
}

impl FieldPattern {
    /// Number of constrained (non-wildcard) fields
    pub fn specified(&self) -> usize {
        [
            self.operation.is_some(),
            self.sender_ip.is_some(),
            self.sender_mac.is_some(),
            self.target_ip.is_some(),
            self.target_mac.is_some(),
            self.gratuitous.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// Total wildcardable fields, the denominator of the partial-match ratio
pub const FIELD_COUNT: usize = 6;

/// Context a signature requires before it is even attempted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRequirements {
    /// Minimum events in the (sender, target) context buffer
    #[serde(default = "default_min_sequence")]
    pub min_sequence: usize,
    /// Required operation tail, newest last (e.g. ["request", "reply"])
    #[serde(default)]
    pub operations: Option<Vec<String>>,
    /// The considered events must span at most this many seconds
    #[serde(default)]
    pub within_seconds: Option<u64>,
}

fn default_min_sequence() -> usize {
    1
}

impl Default for ContextRequirements {
    fn default() -> Self {
        Self {
            min_sequence: default_min_sequence(),
            operations: None,
            within_seconds: None,
        }
    }
}

/// One signature as written in the database file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub kind: PatternKind,
    /// Pattern string for exact/fuzzy/regex signatures
    #[serde(default)]
    pub pattern: Option<String>,
    /// Field constraints for partial signatures
    #[serde(default)]
    pub fields: Option<FieldPattern>,
    pub base_confidence: f32,
    /// Minimum similarity for fuzzy signatures
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f32,
    #[serde(default)]
    pub context: ContextRequirements,
}

fn default_similarity_floor() -> f32 {
    0.75
}

/// On-disk signature database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureFile {
    pub signatures: Vec<SignatureSpec>,
}
