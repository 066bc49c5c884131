//! Per-endpoint fetch statistics.
//!
//! Purely observational: nothing here feeds back into validation. The
//! serde field names match the JSON the info endpoint serves.

use serde::{Deserialize, Serialize};

/// Counters and timestamps for one RRDP or rsync endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    /// The endpoint URI.
    pub uri: String,
    /// Files delivered in the most recent fetch.
    #[serde(rename = "file-count")]
    pub file_count: usize,
    /// How many iterations have touched this endpoint.
    pub iteration: u64,
    /// Cumulative error count.
    pub errors: u64,
    /// Duration of the most recent fetch in seconds.
    pub duration: f64,
    /// Unix timestamp of the last successful fetch.
    #[serde(rename = "last-fetch")]
    pub last_fetch: i64,
    /// Unix timestamp of the last failed fetch.
    #[serde(rename = "last-fetch-error", skip_serializing_if = "is_zero")]
    pub last_fetch_error: i64,
    /// RRDP serial after the last successful fetch.
    #[serde(rename = "rrdp-serial", skip_serializing_if = "is_zero")]
    pub rrdp_serial: i64,
    /// RRDP session id after the last successful fetch.
    #[serde(rename = "rrdp-sessionid", skip_serializing_if = "String::is_empty")]
    pub rrdp_session_id: String,
    /// The last file an RRDP delta delivered.
    #[serde(rename = "rrdp-last-file", skip_serializing_if = "String::is_empty")]
    pub rrdp_last_file: String,
    /// Text of the most recent error.
    #[serde(rename = "last-error", skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl EndpointStats {
    /// Creates stats for an endpoint.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Records the start of a fetch attempt.
    pub fn begin_fetch(&mut self) {
        self.iteration += 1;
        self.file_count = 0;
    }

    /// Records a failed fetch.
    pub fn record_error(&mut self, at_unix: i64, error: impl Into<String>, duration: f64) {
        self.errors += 1;
        self.last_fetch_error = at_unix;
        self.last_error = error.into();
        self.duration = duration;
    }

    /// Records a successful fetch.
    pub fn record_success(&mut self, at_unix: i64, duration: f64) {
        self.last_fetch = at_unix;
        self.duration = duration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_counters() {
        let mut stats = EndpointStats::new("rsync://h/repo");
        stats.begin_fetch();
        stats.record_error(100, "connection refused", 1.5);
        stats.begin_fetch();
        stats.record_success(200, 0.5);

        assert_eq!(stats.iteration, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.last_fetch, 200);
        assert_eq!(stats.last_fetch_error, 100);
        assert_eq!(stats.last_error, "connection refused");
    }

    #[test]
    fn sparse_fields_are_omitted() {
        let stats = EndpointStats::new("rsync://h/repo");
        let json = serde_json::to_value(&stats).unwrap();
        let object = json.as_object().unwrap();
        assert!(!object.contains_key("rrdp-serial"));
        assert!(!object.contains_key("last-error"));
        assert!(object.contains_key("file-count"));
    }
}
