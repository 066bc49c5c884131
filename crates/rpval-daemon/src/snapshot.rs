//! The published validation snapshot.
//!
//! Everything the serving collaborator reads is one record behind one
//! lock: the ROA list, the stability flags, the per-TAL authority lists
//! and the last-validation bookkeeping. The orchestrator replaces it
//! atomically after each validation stage, so readers always observe a
//! consistent iteration.

use std::sync::{Arc, RwLock};

use rpval_core::output::RoaList;
use serde::Serialize;

/// Publication points discovered for one trust anchor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TalAuthorities {
    /// The trust anchor's display name.
    pub name: String,
    /// `(rsync, rrdp)` pairs, rrdp empty when the CA has none.
    pub sia: Vec<SiaPair>,
    /// Validated ROA count under this anchor.
    pub roa_count: usize,
}

/// One harvested `(rsync, rrdp)` publication-point pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SiaPair {
    /// The rsync module URI.
    pub rsync: String,
    /// The RRDP notification URI, when advertised.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rrdp: String,
}

/// One iteration's published state.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Snapshot {
    /// The deduplicated ROA list.
    pub roas: RoaList,
    /// Whether the last iteration was stable.
    pub stable: bool,
    /// Whether any iteration has ever been stable.
    pub has_previous_stable: bool,
    /// Per-TAL discovery results.
    pub tals: Vec<TalAuthorities>,
    /// Unix milliseconds of the last validation.
    pub last_validation: i64,
    /// Iteration counter.
    pub iteration: u64,
    /// Wall-clock seconds the last validation stage took.
    pub validation_duration: f64,
    /// The validation message stream of the last iteration.
    pub messages: Vec<String>,
}

/// The handle the orchestrator publishes through and readers read from.
#[derive(Clone, Debug, Default)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<Snapshot>>,
}

impl SharedSnapshot {
    /// Creates an empty snapshot handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the published snapshot.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned (a writer panicked).
    pub fn publish(&self, snapshot: Snapshot) {
        *self.inner.write().expect("snapshot lock poisoned") = snapshot;
    }

    /// The ROA list plus the stability flags.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn roa_list(&self) -> (RoaList, bool, bool) {
        let guard = self.inner.read().expect("snapshot lock poisoned");
        (guard.roas.clone(), guard.stable, guard.has_previous_stable)
    }

    /// The full published record, for the info endpoint.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn info(&self) -> Snapshot {
        self.inner.read().expect("snapshot lock poisoned").clone()
    }

    /// Health contract: OK iff some stable state exists or existed.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn healthy(&self) -> bool {
        let guard = self.inner.read().expect("snapshot lock poisoned");
        guard.stable || guard.has_previous_stable
    }
}
