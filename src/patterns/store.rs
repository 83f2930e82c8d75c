//! Atomic signature store
//!
//! Readers take an `Arc` snapshot of the whole set; a reload builds the
//! new set off to the side and swaps the pointer. No reader ever observes
//! a partially-updated store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use super::loader::{load_file, LoadError, SignatureSet};

pub struct SignatureStore {
    current: RwLock<Arc<SignatureSet>>,
}

impl SignatureStore {
    pub fn new(set: SignatureSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// An empty store; matching is a no-op until a reload lands
    pub fn empty() -> Self {
        Self::new(SignatureSet::default())
    }

    /// Current snapshot. Matches run against this and are unaffected by
    /// concurrent reloads.
    pub fn snapshot(&self) -> Arc<SignatureSet> {
        self.current.read().clone()
    }

    /// Replace the whole store
    pub fn swap(&self, set: SignatureSet) {
        *self.current.write() = Arc::new(set);
    }

    /// Rebuild from the given file and swap in the result
    pub fn reload_from(&self, path: &Path) -> Result<usize, LoadError> {
        let set = load_file(path)?;
        let count = set.len();
        self.swap(set);
        Ok(count)
    }
}

/// Watch the signature database file and reload the store on change.
/// Returns the watcher; dropping it stops the watch.
pub fn watch_database(
    path: PathBuf,
    store: Arc<SignatureStore>,
) -> notify::Result<RecommendedWatcher> {
    let watched = path.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        match res {
            Ok(event)
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) =>
            {
                match store.reload_from(&watched) {
                    Ok(count) => {
                        info!(path = %watched.display(), count, "signature database reloaded")
                    }
                    // The previous set stays live on a failed reload
                    Err(err) => {
                        warn!(path = %watched.display(), error = %err, "signature reload failed")
                    }
                }
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "signature watcher error"),
        }
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "watching signature database");
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::loader::compile;
    use crate::patterns::{ContextRequirements, PatternKind, SignatureSpec};

    fn one_sig(id: &str) -> SignatureSet {
        compile(vec![SignatureSpec {
            id: id.to_string(),
            description: String::new(),
            kind: PatternKind::Exact,
            pattern: Some("op=reply".to_string()),
            fields: None,
            base_confidence: 0.5,
            similarity_floor: 0.75,
            context: ContextRequirements::default(),
        }])
    }

    #[test]
    fn test_snapshot_isolated_from_swap() {
        let store = SignatureStore::new(one_sig("old"));
        let before = store.snapshot();

        store.swap(one_sig("new"));

        // The old snapshot is whole and untouched
        assert_eq!(before.signatures[0].id, "old");
        assert_eq!(store.snapshot().signatures[0].id, "new");
    }

    #[test]
    fn test_failed_reload_keeps_previous_set() {
        let store = SignatureStore::new(one_sig("keep"));
        let missing = Path::new("/nonexistent/sigs.json");
        assert!(store.reload_from(missing).is_err());
        assert_eq!(store.snapshot().signatures[0].id, "keep");
    }
}
