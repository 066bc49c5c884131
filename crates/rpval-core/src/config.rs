//! Validator configuration.
//!
//! One record carries every knob of the engine; defaults live next to the
//! definition. The daemon populates this from its command line, tests
//! construct it directly.

use std::path::PathBuf;
use std::time::Duration;

/// Default revalidation interval in server mode.
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(20 * 60);

/// Default per-invocation rsync timeout.
pub const DEFAULT_RSYNC_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Default per-request HTTP timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on non-stable iterations within one stability run.
pub const DEFAULT_MAX_ITERATIONS: u32 = 32;

/// Default cap on a single RRDP response body (64 MiB).
///
/// A notification, snapshot or delta larger than this is treated as
/// hostile and the endpoint is abandoned for the iteration.
pub const DEFAULT_RRDP_MAX_RESPONSE: u64 = 64 * 1024 * 1024;

/// Output mode of the daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Keep revalidating every `refresh` once stable.
    Server,
    /// Write the ROA list once and exit.
    Oneoff,
}

/// Engine configuration.
///
/// `tal_paths` and `tal_names` are parallel; when their lengths differ the
/// file stem of each TAL path is used as its display name.
#[derive(Clone, Debug)]
pub struct Config {
    /// TAL files to load at startup.
    pub tal_paths: Vec<PathBuf>,
    /// Display names for the TALs, parallel to `tal_paths`.
    pub tal_names: Vec<String>,
    /// Root of the local object cache.
    pub base_path: PathBuf,
    /// Walk publication points via their manifest (the default) instead of
    /// the raw directory listing.
    pub use_manifest: bool,
    /// Files present at a publication point but absent from its manifest
    /// invalidate the whole CA.
    pub strict_manifests: bool,
    /// A manifest entry whose file is missing or whose hash mismatches
    /// invalidates the whole CA.
    pub strict_hash: bool,
    /// Enforce strict DER and SignerInfo attribute ordering in CMS.
    pub strict_cms: bool,
    /// Enable the RRDP stage.
    pub rrdp_enabled: bool,
    /// Re-enable the paired rsync endpoint when RRDP fails.
    pub rrdp_failover: bool,
    /// Where RRDP session state is persisted between runs.
    pub rrdp_state_path: PathBuf,
    /// Per-response size cap for RRDP documents.
    pub rrdp_max_response: u64,
    /// The rsync binary to invoke.
    pub rsync_bin: PathBuf,
    /// Timeout for one rsync invocation.
    pub rsync_timeout: Duration,
    /// Timeout for one HTTP request.
    pub http_timeout: Duration,
    /// User-Agent header for RRDP and TAL fetches.
    pub user_agent: String,
    /// Sleep between stable validations in server mode.
    pub refresh: Duration,
    /// Fatal cap on non-stable iterations per stability run.
    pub max_iterations: u32,
    /// Server or oneoff.
    pub mode: RunMode,
    /// In oneoff mode, wait for a stable iteration before writing output.
    pub wait_stable: bool,
    /// Output sink for oneoff mode; `-` writes to stdout.
    pub output_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tal_paths: Vec::new(),
            tal_names: Vec::new(),
            base_path: PathBuf::from("cache"),
            use_manifest: true,
            strict_manifests: true,
            strict_hash: true,
            strict_cms: false,
            rrdp_enabled: true,
            rrdp_failover: true,
            rrdp_state_path: PathBuf::from("cache/rrdp.json"),
            rrdp_max_response: DEFAULT_RRDP_MAX_RESPONSE,
            rsync_bin: PathBuf::from("rsync"),
            rsync_timeout: DEFAULT_RSYNC_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            user_agent: default_user_agent(),
            refresh: DEFAULT_REFRESH,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            mode: RunMode::Server,
            wait_stable: true,
            output_path: PathBuf::from("output.json"),
        }
    }
}

impl Config {
    /// The display name for the TAL at `index`.
    ///
    /// Falls back to the file stem (or full path) when no explicit name
    /// was configured for that slot.
    #[must_use]
    pub fn tal_name(&self, index: usize) -> String {
        if self.tal_names.len() == self.tal_paths.len() {
            if let Some(name) = self.tal_names.get(index) {
                return name.clone();
            }
        }
        self.tal_paths
            .get(index)
            .map(|p| {
                p.file_stem()
                    .map_or_else(|| p.display().to_string(), |s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_default()
    }
}

/// The default User-Agent, derived from the crate version.
#[must_use]
pub fn default_user_agent() -> String {
    format!(
        "rpval/{} (+https://github.com/rpval/rpval)",
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert!(cfg.use_manifest);
        assert!(cfg.strict_manifests);
        assert!(cfg.strict_hash);
        assert!(!cfg.strict_cms);
        assert!(cfg.rrdp_enabled);
        assert!(cfg.rrdp_failover);
        assert_eq!(cfg.max_iterations, 32);
        assert_eq!(cfg.refresh, Duration::from_secs(1200));
        assert_eq!(cfg.rsync_timeout, Duration::from_secs(1200));
        assert_eq!(cfg.http_timeout, Duration::from_secs(60));
        assert_eq!(cfg.mode, RunMode::Server);
    }

    #[test]
    fn tal_name_falls_back_to_file_stem() {
        let cfg = Config {
            tal_paths: vec![PathBuf::from("tals/example.tal")],
            tal_names: Vec::new(),
            ..Config::default()
        };
        assert_eq!(cfg.tal_name(0), "example");
    }

    #[test]
    fn tal_name_uses_configured_names_when_parallel() {
        let cfg = Config {
            tal_paths: vec![PathBuf::from("a.tal"), PathBuf::from("b.tal")],
            tal_names: vec!["First".into(), "Second".into()],
            ..Config::default()
        };
        assert_eq!(cfg.tal_name(1), "Second");
    }
}
