//! Signature database loading
//!
//! Compiles the on-disk database into a matcher-ready set. A signature
//! that fails to compile (malformed regex, missing pattern data) is
//! skipped with a warning; it never aborts the rest of the load.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{info, warn};

use super::{ContextRequirements, FieldPattern, PatternKind, SignatureFile, SignatureSpec};

/// Compiled, match-ready pattern data
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    Exact(String),
    Partial(FieldPattern),
    Fuzzy { pattern: String, floor: f32 },
    Regex(Regex),
}

/// A signature ready for matching
#[derive(Debug, Clone)]
pub struct CompiledSignature {
    pub id: String,
    pub description: String,
    pub kind: PatternKind,
    pub base_confidence: f32,
    pub context: ContextRequirements,
    pub pattern: CompiledPattern,
}

/// An immutable, fully-built signature set. Swapped whole on reload.
#[derive(Debug, Default)]
pub struct SignatureSet {
    pub signatures: Vec<CompiledSignature>,
    pub source: Option<PathBuf>,
    pub loaded_at: Option<DateTime<Utc>>,
    /// Entries skipped during compilation
    pub skipped: usize,
}

impl SignatureSet {
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("io error reading signature database: {0}")]
    Io(#[from] std::io::Error),
    #[error("signature database parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Load and compile a signature database file (JSON)
pub fn load_file(path: &Path) -> Result<SignatureSet, LoadError> {
    let content = fs::read_to_string(path)?;
    let file: SignatureFile = serde_json::from_str(&content)?;
    let mut set = compile(file.signatures);
    set.source = Some(path.to_path_buf());

    info!(
        path = %path.display(),
        loaded = set.len(),
        skipped = set.skipped,
        "signature database loaded"
    );
    Ok(set)
}

/// Compile specs into a set, skipping anything unusable
pub fn compile(specs: Vec<SignatureSpec>) -> SignatureSet {
    let mut signatures = Vec::with_capacity(specs.len());
    let mut skipped = 0;

    for spec in specs {
        match compile_one(&spec) {
            Some(compiled) => signatures.push(compiled),
            None => skipped += 1,
        }
    }

    SignatureSet {
        signatures,
        source: None,
        loaded_at: Some(Utc::now()),
        skipped,
    }
}

fn compile_one(spec: &SignatureSpec) -> Option<CompiledSignature> {
    if !(0.0..=1.0).contains(&spec.base_confidence) {
        warn!(
            id = %spec.id,
            base_confidence = spec.base_confidence,
            "skipping signature: base_confidence out of range"
        );
        return None;
    }

    let pattern = match spec.kind {
        PatternKind::Exact => {
            let Some(pattern) = spec.pattern.clone() else {
                warn!(id = %spec.id, "skipping exact signature without pattern");
                return None;
            };
            CompiledPattern::Exact(pattern)
        }
        PatternKind::Partial => {
            let Some(fields) = spec.fields.clone() else {
                warn!(id = %spec.id, "skipping partial signature without fields");
                return None;
            };
            if fields.specified() == 0 {
                warn!(id = %spec.id, "skipping partial signature with no constraints");
                return None;
            }
            CompiledPattern::Partial(fields)
        }
        PatternKind::Fuzzy => {
            let Some(pattern) = spec.pattern.clone() else {
                warn!(id = %spec.id, "skipping fuzzy signature without pattern");
                return None;
            };
            CompiledPattern::Fuzzy {
                pattern,
                floor: spec.similarity_floor.clamp(0.0, 1.0),
            }
        }
        PatternKind::Regex => {
            let Some(pattern) = spec.pattern.as_deref() else {
                warn!(id = %spec.id, "skipping regex signature without pattern");
                return None;
            };
            match Regex::new(pattern) {
                Ok(regex) => CompiledPattern::Regex(regex),
                Err(err) => {
                    warn!(id = %spec.id, error = %err, "skipping malformed regex signature");
                    return None;
                }
            }
        }
    };

    Some(CompiledSignature {
        id: spec.id.clone(),
        description: spec.description.clone(),
        kind: spec.kind,
        base_confidence: spec.base_confidence,
        context: spec.context.clone(),
        pattern,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn spec(id: &str, kind: PatternKind, pattern: Option<&str>) -> SignatureSpec {
        SignatureSpec {
            id: id.to_string(),
            description: String::new(),
            kind,
            pattern: pattern.map(String::from),
            fields: None,
            base_confidence: 0.8,
            similarity_floor: 0.75,
            context: ContextRequirements::default(),
        }
    }

    #[test]
    fn test_malformed_regex_skipped_not_fatal() {
        let set = compile(vec![
            spec("good", PatternKind::Exact, Some("op=reply")),
            spec("bad", PatternKind::Regex, Some("([unclosed")),
            spec("also-good", PatternKind::Regex, Some("sender=10\\..*")),
        ]);

        assert_eq!(set.len(), 2);
        assert_eq!(set.skipped, 1);
    }

    #[test]
    fn test_missing_pattern_data_skipped() {
        let set = compile(vec![
            spec("no-pattern", PatternKind::Exact, None),
            spec("no-fields", PatternKind::Partial, None),
        ]);
        assert!(set.is_empty());
        assert_eq!(set.skipped, 2);
    }

    #[test]
    fn test_out_of_range_confidence_skipped() {
        let mut bad = spec("hot", PatternKind::Exact, Some("x"));
        bad.base_confidence = 1.5;
        let set = compile(vec![bad]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_load_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"signatures": [
                {{"id": "gw-announce", "kind": "regex",
                  "pattern": "sender=192\\.168\\.1\\.1/.*gratuitous=1",
                  "base_confidence": 0.7}}
            ]}}"#
        )
        .unwrap();

        let set = load_file(file.path()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.signatures[0].id, "gw-announce");
    }

    #[test]
    fn test_load_file_parse_error_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            load_file(file.path()),
            Err(LoadError::Parse(_))
        ));
    }
}
