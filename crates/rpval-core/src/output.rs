//! ROA list assembly.
//!
//! Validation produces one batch of route origins per trust anchor; this
//! module flattens them into the published JSON shape, deduplicating on
//! the canonical `(asn, prefix, maxLength)` string while preserving first
//! occurrence. Signing and HTTP caching of the document belong to the
//! serving collaborator.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// One validated route origin in output form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoaEntry {
    /// The AS number as the literal string `AS<n>`.
    pub asn: String,
    /// The prefix in CIDR notation.
    pub prefix: String,
    /// The maximum announced length.
    #[serde(rename = "maxLength")]
    pub max_length: u8,
    /// The trust anchor this origin validated under.
    pub ta: String,
}

impl RoaEntry {
    /// Builds an entry from raw parts.
    #[must_use]
    pub fn new(asn: u32, prefix: impl Into<String>, max_length: u8, ta: impl Into<String>) -> Self {
        Self {
            asn: format!("AS{asn}"),
            prefix: prefix.into(),
            max_length,
            ta: ta.into(),
        }
    }

    /// The deduplication key: trust anchor excluded, so the same origin
    /// validated under two anchors appears once.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("{}/{}/{}", self.asn, self.prefix, self.max_length)
    }
}

/// Metadata attached to a published list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Number of entries.
    pub counts: usize,
    /// Unix timestamp of generation.
    pub generated: i64,
    /// Unix timestamp until which the list should be considered fresh.
    pub valid: i64,
}

/// The published ROA list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoaList {
    /// List metadata.
    pub metadata: Metadata,
    /// The deduplicated entries.
    pub roas: Vec<RoaEntry>,
}

impl RoaList {
    /// Assembles a list from per-TAL batches.
    ///
    /// `generated` stamps the metadata; `valid_for_secs` sets the
    /// freshness horizon.
    #[must_use]
    pub fn assemble(entries: Vec<RoaEntry>, generated: i64, valid_for_secs: i64) -> Self {
        let roas = dedup(entries);
        Self {
            metadata: Metadata {
                counts: roas.len(),
                generated,
                valid: generated + valid_for_secs,
            },
            roas,
        }
    }
}

/// First-occurrence deduplication on the canonical key.
#[must_use]
pub fn dedup(entries: Vec<RoaEntry>) -> Vec<RoaEntry> {
    let mut seen = HashSet::with_capacity(entries.len());
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.dedup_key()))
        .collect()
}
