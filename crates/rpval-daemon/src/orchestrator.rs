//! The iteration loop.
//!
//! One iteration runs RRDP sync, TAL fetch, rsync sync and validation in
//! that order, then compares the set of repositories the validators
//! referenced against the previous iteration. When the set stops
//! changing the system is stable: server mode sleeps the refresh
//! interval and revalidates, oneoff mode writes the ROA list and exits.
//!
//! The four fetch maps tie the stages together: validation discovers
//! publication points and fills `rsync_fetch`/`rrdp_fetch`, a successful
//! RRDP run removes its paired rsync module for the iteration, and
//! failed RRDP runs leave the rsync fallback in place when failover is
//! enabled (except for oversized responses, which are abandoned).
//!
//! A hard cap bounds the number of non-stable iterations per stability
//! run: exceeding it means a repository loop or an adversarial publisher
//! and is fatal by design. The counter resets whenever an iteration is
//! stable, so each re-convergence epoch gets the full budget.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rpval_core::cache::{atomic_write_json, bounded_read_json, Cache, CacheError};
use rpval_core::config::{Config, RunMode};
use rpval_core::fetch::HttpFetcher;
use rpval_core::objects::tal::Tal;
use rpval_core::observer::{NoopObserver, Observer, SpanId};
use rpval_core::output::{RoaEntry, RoaList};
use rpval_core::rrdp::{self, Deliver, RrdpState};
use rpval_core::rsync::RsyncDriver;
use rpval_core::stats::EndpointStats;
use rpval_core::uri::{HttpsUri, RsyncUri};
use rpval_core::validator::{SiaAuthority, Validator};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::snapshot::{SharedSnapshot, SiaPair, Snapshot, TalAuthorities};

/// How long a generated ROA list is advertised as fresh.
const OUTPUT_VALIDITY_SECS: i64 = 3600;

/// Cap on the RRDP state file size.
const MAX_STATE_FILE: u64 = 16 * 1024 * 1024;

/// Errors that terminate the process.
#[derive(Debug, Error)]
pub enum FatalError {
    /// Discovery kept growing past the iteration cap.
    #[error("no stable state after {iterations} iterations; a repository loop or adversarial publisher is likely")]
    ConvergenceCap {
        /// Iterations spent in this stability run.
        iterations: u32,
    },

    /// A TAL file could not be read or parsed.
    #[error("cannot load TAL {}: {detail}", path.display())]
    TalLoad {
        /// The TAL path.
        path: PathBuf,
        /// What went wrong.
        detail: String,
    },

    /// The cache base directory could not be created.
    #[error("cannot initialize cache: {0}")]
    CacheInit(#[source] CacheError),

    /// The oneoff output sink could not be written.
    #[error("cannot write output {}: {source}", path.display())]
    OutputWrite {
        /// The output path.
        path: PathBuf,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// What one iteration concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IterationOutcome {
    /// The repository set matched the previous iteration.
    pub stable: bool,
    /// Some iteration has been stable at least once.
    pub has_previous_stable: bool,
}

struct LoadedTal {
    name: String,
    tal: Tal,
}

/// The daemon's central state machine.
pub struct Orchestrator<F> {
    config: Config,
    cache: Cache,
    http: F,
    rsync: RsyncDriver,
    validator: Validator,
    snapshot: SharedSnapshot,
    observer: Arc<dyn Observer>,

    tals: Vec<LoadedTal>,
    tals_fetch: BTreeSet<usize>,

    rsync_fetch: BTreeMap<RsyncUri, Option<HttpsUri>>,
    rrdp_fetch: BTreeMap<HttpsUri, RsyncUri>,
    rrdp_fetch_domain: BTreeMap<HttpsUri, RsyncUri>,
    rrdp_info: BTreeMap<RsyncUri, RrdpState>,

    prev_repos: BTreeMap<RsyncUri, i64>,
    current_repos: BTreeMap<RsyncUri, i64>,

    rrdp_stats: BTreeMap<String, EndpointStats>,
    rsync_stats: BTreeMap<String, EndpointStats>,

    iteration: u64,
    epoch_iterations: u32,
    stable: bool,
    has_previous_stable: bool,
}

impl<F: HttpFetcher> Orchestrator<F> {
    /// Builds the orchestrator: loads TALs, creates the cache, restores
    /// persisted RRDP state.
    ///
    /// # Errors
    ///
    /// [`FatalError::TalLoad`] or [`FatalError::CacheInit`]; both are
    /// startup-fatal by the error policy.
    pub fn new(config: Config, http: F) -> Result<Self, FatalError> {
        let cache = Cache::create(&config.base_path).map_err(FatalError::CacheInit)?;

        let mut tals = Vec::new();
        for (index, path) in config.tal_paths.iter().enumerate() {
            let data = std::fs::read(path).map_err(|e| FatalError::TalLoad {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            let tal = Tal::parse(&data).map_err(|e| FatalError::TalLoad {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            tals.push(LoadedTal {
                name: config.tal_name(index),
                tal,
            });
        }

        let rrdp_info = match bounded_read_json::<BTreeMap<RsyncUri, RrdpState>>(
            &config.rrdp_state_path,
            MAX_STATE_FILE,
        ) {
            Ok(info) => info,
            Err(err) => {
                // A missing or corrupt state file only costs snapshot
                // refetches.
                info!("starting without RRDP state: {err}");
                BTreeMap::new()
            }
        };

        let validator = Validator {
            strict_hash: config.strict_hash,
            strict_manifests: config.strict_manifests,
            strict_cms: config.strict_cms,
            use_manifest: config.use_manifest,
        };
        let rsync = RsyncDriver::new(&config.rsync_bin, config.rsync_timeout);

        Ok(Self {
            config,
            cache,
            http,
            rsync,
            validator,
            snapshot: SharedSnapshot::new(),
            observer: Arc::new(NoopObserver),
            tals,
            tals_fetch: BTreeSet::new(),
            rsync_fetch: BTreeMap::new(),
            rrdp_fetch: BTreeMap::new(),
            rrdp_fetch_domain: BTreeMap::new(),
            rrdp_info,
            prev_repos: BTreeMap::new(),
            current_repos: BTreeMap::new(),
            rrdp_stats: BTreeMap::new(),
            rsync_stats: BTreeMap::new(),
            iteration: 0,
            epoch_iterations: 0,
            stable: false,
            has_previous_stable: false,
        })
    }

    /// A handle to the published snapshot for the serving collaborator.
    #[must_use]
    pub fn snapshot(&self) -> SharedSnapshot {
        self.snapshot.clone()
    }

    /// Replaces the no-op telemetry observer.
    pub fn set_observer(&mut self, observer: Arc<dyn Observer>) {
        self.observer = observer;
    }

    /// Per-RRDP-endpoint statistics, keyed by notification URI.
    #[must_use]
    pub fn rrdp_stats(&self) -> &BTreeMap<String, EndpointStats> {
        &self.rrdp_stats
    }

    /// Per-rsync-endpoint statistics, keyed by module URI.
    #[must_use]
    pub fn rsync_stats(&self) -> &BTreeMap<String, EndpointStats> {
        &self.rsync_stats
    }

    /// Runs iterations until oneoff completion (or forever in server
    /// mode).
    ///
    /// # Errors
    ///
    /// Any [`FatalError`].
    pub async fn run(&mut self) -> Result<(), FatalError> {
        loop {
            let outcome = self.run_iteration().await?;

            if self.config.mode == RunMode::Oneoff
                && (outcome.stable || !self.config.wait_stable)
            {
                self.write_output()?;
            }
            if self.config.mode == RunMode::Oneoff && outcome.stable {
                info!("stable, terminating");
                return Ok(());
            }

            if outcome.stable {
                info!(
                    refresh_secs = self.config.refresh.as_secs(),
                    "stable state, sleeping until revalidation"
                );
                tokio::time::sleep(self.config.refresh).await;
                self.stable = false;
            } else {
                info!("still exploring, revalidating now");
            }
        }
    }

    /// Runs one full iteration.
    ///
    /// # Errors
    ///
    /// [`FatalError::ConvergenceCap`] when the epoch budget is exceeded.
    pub async fn run_iteration(&mut self) -> Result<IterationOutcome, FatalError> {
        self.iteration += 1;
        self.epoch_iterations += 1;
        if self.epoch_iterations > self.config.max_iterations {
            return Err(FatalError::ConvergenceCap {
                iterations: self.epoch_iterations,
            });
        }
        info!(iteration = self.iteration, "starting iteration");
        let span = self.observer.span("iteration", SpanId::ROOT);

        if self.config.rrdp_enabled {
            let rrdp_span = self.observer.span("rrdp", span);
            self.stage_rrdp().await;
            self.save_rrdp_state();
            self.observer.finish(rrdp_span);
        }
        self.stage_tal().await;
        let rsync_span = self.observer.span("rsync", span);
        self.stage_rsync().await;
        self.observer.finish(rsync_span);
        let validation_started = Instant::now();
        let validation_span = self.observer.span("validation", span);
        let (roas, tal_infos, messages) = self.stage_validation();
        self.observer.finish(validation_span);
        let validation_duration = validation_started.elapsed().as_secs_f64();

        let stable = self.reduce();
        self.stable = stable;
        if stable {
            self.has_previous_stable = true;
            self.epoch_iterations = 0;
        }

        let now = Utc::now();
        self.snapshot.publish(Snapshot {
            roas: RoaList::assemble(roas, now.timestamp(), OUTPUT_VALIDITY_SECS),
            stable,
            has_previous_stable: self.has_previous_stable,
            tals: tal_infos,
            last_validation: now.timestamp_millis(),
            iteration: self.iteration,
            validation_duration,
            messages,
        });

        self.observer.finish(span);
        Ok(IterationOutcome {
            stable,
            has_previous_stable: self.has_previous_stable,
        })
    }

    // -----------------------------------------------------------------------
    // Stage 1: RRDP
    // -----------------------------------------------------------------------

    async fn stage_rrdp(&mut self) {
        let endpoints: Vec<(HttpsUri, RsyncUri)> = self
            .rrdp_fetch
            .iter()
            .map(|(notify, module)| (notify.clone(), module.clone()))
            .collect();

        for (notify, module) in endpoints {
            info!(rrdp = %notify, rsync = %module, "RRDP sync");
            let domain = self
                .rrdp_fetch_domain
                .get(&notify)
                .cloned()
                .unwrap_or_else(|| module.domain());

            let stats = self
                .rrdp_stats
                .entry(notify.as_str().to_string())
                .or_insert_with(|| EndpointStats::new(notify.as_str()));
            stats.begin_fetch();

            let started = Instant::now();
            let prior = self.rrdp_info.get(&module);
            let mut deliver = CacheDeliver {
                cache: &self.cache,
                stats,
            };
            let result = rrdp::fetch(
                &notify,
                &domain,
                &module,
                prior,
                &self.http,
                &mut deliver,
            )
            .await;
            let duration = started.elapsed().as_secs_f64();
            let now_unix = Utc::now().timestamp();

            match result {
                Ok(outcome) => {
                    let stats = self
                        .rrdp_stats
                        .get_mut(notify.as_str())
                        .expect("stats entry created above");
                    stats.record_success(now_unix, duration);
                    stats.rrdp_serial = outcome.state.serial;
                    stats.rrdp_session_id = outcome.state.sessionid.clone();
                    self.rrdp_info.insert(module.clone(), outcome.state);
                    // RRDP satisfied the publication point; rsync is not
                    // needed this iteration.
                    self.rsync_fetch.remove(&module);
                }
                Err(err) => {
                    let failover =
                        self.config.rrdp_failover && err.is_failover_eligible();
                    self.observer.capture(
                        &err.to_string(),
                        &HashMap::from([
                            ("rrdp".to_string(), notify.as_str().to_string()),
                            ("rsync".to_string(), module.as_str().to_string()),
                        ]),
                    );
                    let stats = self
                        .rrdp_stats
                        .get_mut(notify.as_str())
                        .expect("stats entry created above");
                    stats.record_error(now_unix, err.to_string(), duration);
                    if failover {
                        error!(
                            rrdp = %notify,
                            rsync = %module,
                            "RRDP failed, will fall back to rsync: {err}"
                        );
                    } else {
                        error!(
                            rrdp = %notify,
                            rsync = %module,
                            "RRDP failed, skipping rsync failover: {err}"
                        );
                        self.rsync_fetch.remove(&module);
                    }
                }
            }
        }
    }

    /// Persists the endpoint-state map.
    fn save_rrdp_state(&self) {
        if let Err(err) = atomic_write_json(&self.config.rrdp_state_path, &self.rrdp_info) {
            warn!("cannot save RRDP state: {err}");
        }
    }

    // -----------------------------------------------------------------------
    // Stage 2: TAL roots over HTTPS
    // -----------------------------------------------------------------------

    async fn stage_tal(&mut self) {
        let pending: Vec<usize> = self.tals_fetch.iter().copied().collect();
        self.tals_fetch.clear();

        for index in pending {
            let Some(loaded) = self.tals.get(index) else { continue };
            let Some(root_uri) = loaded.tal.rsync_uri().cloned() else {
                error!(tal = %loaded.name, "TAL has no rsync URI to cache the root under");
                continue;
            };

            let mut fetched = None;
            for uri in loaded.tal.https_uris() {
                match self.http.get(uri).await {
                    Ok(data) => {
                        fetched = Some((uri.clone(), data));
                        break;
                    }
                    Err(err) => {
                        error!(tal = %loaded.name, %uri, "TAL fetch failed: {err}");
                    }
                }
            }

            match fetched {
                Some((uri, data)) => {
                    if let Err(err) = self.cache.write(&root_uri, &data) {
                        error!(tal = %loaded.name, "cannot cache root certificate: {err}");
                    } else {
                        info!(tal = %loaded.name, %uri, "fetched root certificate");
                    }
                }
                None if self.config.rrdp_failover => {
                    info!(
                        tal = %loaded.name,
                        rsync = %root_uri,
                        "root certificate will be fetched with rsync"
                    );
                    self.rsync_fetch.insert(root_uri, None);
                }
                None => {
                    error!(tal = %loaded.name, "could not fetch root certificate");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stage 3: rsync
    // -----------------------------------------------------------------------

    async fn stage_rsync(&mut self) {
        let modules: Vec<RsyncUri> = self.rsync_fetch.keys().cloned().collect();
        for module in modules {
            info!(rsync = %module, "rsync sync");
            let dest = match self.cache.uri_to_path(&module, true) {
                Ok(dest) => dest,
                Err(err) => {
                    error!(rsync = %module, "unmappable rsync URI: {err}");
                    continue;
                }
            };

            let stats = self
                .rsync_stats
                .entry(module.as_str().to_string())
                .or_insert_with(|| EndpointStats::new(module.as_str()));
            stats.begin_fetch();

            let started = Instant::now();
            let result = self.rsync.fetch(&module, &dest).await;
            let duration = started.elapsed().as_secs_f64();
            let now_unix = Utc::now().timestamp();

            let stats = self
                .rsync_stats
                .get_mut(module.as_str())
                .expect("stats entry created above");
            match result {
                Ok(()) => {
                    stats.record_success(now_unix, duration);
                    stats.file_count = self.cache.file_count(&module).unwrap_or(0);
                }
                Err(err) => {
                    // The publication point keeps its previous cache.
                    error!(rsync = %module, "rsync failed: {err}");
                    self.observer.capture(
                        &err.to_string(),
                        &HashMap::from([("rsync".to_string(), module.as_str().to_string())]),
                    );
                    stats.record_error(now_unix, err.to_string(), duration);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stage 4: validation
    // -----------------------------------------------------------------------

    fn stage_validation(&mut self) -> (Vec<RoaEntry>, Vec<TalAuthorities>, Vec<String>) {
        self.current_repos.clear();
        let now = Utc::now();

        let mut all_roas = Vec::new();
        let mut tal_infos = Vec::new();
        let mut all_messages = Vec::new();

        for index in 0..self.tals.len() {
            let loaded = &self.tals[index];
            let name = loaded.name.clone();
            let Some(root_uri) = loaded.tal.rsync_uri().cloned() else {
                all_messages.push(format!("TAL {name}: no rsync URI"));
                continue;
            };

            let report = self
                .validator
                .run_tal(&loaded.tal, &root_uri, &self.cache, now);

            if !report.tal_valid {
                self.tals_fetch.insert(index);
            }

            let mut sia_pairs = Vec::new();
            for authority in &report.authorities {
                self.apply_authority(authority);
                sia_pairs.push(SiaPair {
                    rsync: authority.rsync.as_str().to_string(),
                    rrdp: authority
                        .notify
                        .as_ref()
                        .map(|n| n.as_str().to_string())
                        .unwrap_or_default(),
                });
            }

            let mut roa_count = 0;
            for roa in &report.roas {
                all_roas.push(RoaEntry::new(
                    roa.asn,
                    roa.prefix.clone(),
                    roa.max_length,
                    name.clone(),
                ));
                roa_count += 1;
            }

            info!(
                tal = %name,
                valid_objects = report.valid_objects,
                roas = roa_count,
                messages = report.messages.len(),
                "validation finished"
            );
            all_messages.extend(report.messages);
            tal_infos.push(TalAuthorities {
                name,
                sia: sia_pairs,
                roa_count,
            });
        }

        (all_roas, tal_infos, all_messages)
    }

    /// Registers one harvested publication point in the fetch sets.
    fn apply_authority(&mut self, authority: &SiaAuthority) {
        if let Some(notify) = &authority.notify {
            match self.rrdp_fetch_domain.get(notify) {
                Some(prev) if *prev != authority.domain => {
                    // First binding wins; a certificate advertising the
                    // same RRDP endpoint for another rsync domain is
                    // trying to override containment.
                    warn!(
                        rrdp = %notify,
                        kept = %prev,
                        rejected = %authority.domain,
                        "conflicting rsync domain for RRDP endpoint"
                    );
                    return;
                }
                Some(_) => {}
                None => {
                    self.rrdp_fetch_domain
                        .insert(notify.clone(), authority.domain.clone());
                }
            }
            self.rrdp_fetch.insert(notify.clone(), authority.rsync.clone());
        }
        self.rsync_fetch
            .insert(authority.rsync.clone(), authority.notify.clone());
        self.current_repos
            .insert(authority.rsync.clone(), Utc::now().timestamp());
    }

    // -----------------------------------------------------------------------
    // Stage 5: reduction
    // -----------------------------------------------------------------------

    /// Compares the referenced repository set against the previous
    /// iteration and replaces it. Stable iff the sets match and this is
    /// not the first iteration.
    fn reduce(&mut self) -> bool {
        let unchanged = self.prev_repos.len() == self.current_repos.len()
            && self
                .current_repos
                .keys()
                .all(|uri| self.prev_repos.contains_key(uri));
        for uri in self.current_repos.keys() {
            if !self.prev_repos.contains_key(uri) {
                info!(repository = %uri, "repository appeared");
            }
        }
        self.prev_repos = std::mem::take(&mut self.current_repos);
        unchanged && self.iteration > 1
    }

    // -----------------------------------------------------------------------
    // Oneoff output
    // -----------------------------------------------------------------------

    fn write_output(&self) -> Result<(), FatalError> {
        let (list, _, _) = self.snapshot.roa_list();
        let json = serde_json::to_string(&list).unwrap_or_else(|_| "{}".into());

        if self.config.output_path.as_os_str() == "-" {
            println!("{json}");
            return Ok(());
        }
        std::fs::write(&self.config.output_path, format!("{json}\n")).map_err(|source| {
            FatalError::OutputWrite {
                path: self.config.output_path.clone(),
                source,
            }
        })
    }
}

/// Cache-backed RRDP delivery with stats bookkeeping.
struct CacheDeliver<'a> {
    cache: &'a Cache,
    stats: &'a mut EndpointStats,
}

impl Deliver for CacheDeliver<'_> {
    fn deliver(
        &mut self,
        uri: &RsyncUri,
        data: &[u8],
        withdraw: bool,
    ) -> Result<(), CacheError> {
        if withdraw {
            self.cache.remove(uri)?;
        } else {
            self.cache.write(uri, data)?;
            self.stats.file_count += 1;
            self.stats.rrdp_last_file = uri.as_str().to_string();
        }
        Ok(())
    }

    fn current_hash(&self, uri: &RsyncUri) -> Option<[u8; 32]> {
        let data = self.cache.read(uri).ok()?;
        Some(Sha256::digest(&data).into())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use base64::Engine as _;
    use bytes::Bytes;
    use rpval_core::fetch::HttpError;

    use super::*;

    // -----------------------------------------------------------------------
    // Test doubles and fixtures
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct FakeHttp {
        responses: HashMap<String, Result<Vec<u8>, u16>>,
        too_large: std::collections::HashSet<String>,
    }

    impl FakeHttp {
        fn put(&mut self, uri: &str, body: impl Into<Vec<u8>>) {
            self.responses.insert(uri.to_string(), Ok(body.into()));
        }

        fn status(&mut self, uri: &str, status: u16) {
            self.responses.insert(uri.to_string(), Err(status));
        }

        fn too_large(&mut self, uri: &str) {
            self.too_large.insert(uri.to_string());
        }
    }

    impl HttpFetcher for FakeHttp {
        async fn get(&self, uri: &HttpsUri) -> Result<Bytes, HttpError> {
            if self.too_large.contains(uri.as_str()) {
                return Err(HttpError::TooLarge {
                    uri: uri.as_str().to_string(),
                    limit: 1,
                });
            }
            match self.responses.get(uri.as_str()) {
                Some(Ok(body)) => Ok(Bytes::from(body.clone())),
                Some(Err(status)) => Err(HttpError::Status {
                    uri: uri.as_str().to_string(),
                    status: *status,
                }),
                None => Err(HttpError::Status {
                    uri: uri.as_str().to_string(),
                    status: 404,
                }),
            }
        }
    }

    const SESSION: &str = "f4bd0b48-1549-4bd1-a1ca-bcb39a8a9754";

    fn snapshot_xml(serial: i64) -> Vec<u8> {
        format!(
            "<snapshot xmlns=\"http://www.ripe.net/rpki/rrdp\" version=\"1\" \
             session_id=\"{SESSION}\" serial=\"{serial}\"><publish \
             uri=\"rsync://repo.example.net/repo/a.cer\">{}</publish></snapshot>",
            base64::engine::general_purpose::STANDARD.encode(b"not-a-real-cert"),
        )
        .into_bytes()
    }

    fn notification_xml(serial: i64, snapshot_body: &[u8]) -> Vec<u8> {
        format!(
            "<notification xmlns=\"http://www.ripe.net/rpki/rrdp\" version=\"1\" \
             session_id=\"{SESSION}\" serial=\"{serial}\">\
             <snapshot uri=\"https://rrdp.example.net/snapshot.xml\" hash=\"{}\"/>\
             </notification>",
            hex::encode(Sha256::digest(snapshot_body)),
        )
        .into_bytes()
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            base_path: dir.join("cache"),
            rrdp_state_path: dir.join("cache/rrdp.json"),
            output_path: dir.join("output.json"),
            rsync_bin: PathBuf::from("false"),
            mode: RunMode::Oneoff,
            ..Config::default()
        }
    }

    fn orchestrator(dir: &std::path::Path, http: FakeHttp) -> Orchestrator<FakeHttp> {
        Orchestrator::new(test_config(dir), http).unwrap()
    }

    fn notify() -> HttpsUri {
        HttpsUri::parse("https://rrdp.example.net/notification.xml").unwrap()
    }

    fn module() -> RsyncUri {
        RsyncUri::parse("rsync://repo.example.net/repo").unwrap()
    }

    fn seed_rrdp(orc: &mut Orchestrator<FakeHttp>) {
        orc.rrdp_fetch.insert(notify(), module());
        orc.rrdp_fetch_domain.insert(notify(), module().domain());
        orc.rsync_fetch.insert(module(), Some(notify()));
    }

    // -----------------------------------------------------------------------
    // RRDP / rsync mutual exclusion
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn rrdp_success_suppresses_paired_rsync() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot_xml(1);
        let mut http = FakeHttp::default();
        http.put(
            "https://rrdp.example.net/notification.xml",
            notification_xml(1, &snapshot),
        );
        http.put("https://rrdp.example.net/snapshot.xml", snapshot);

        let mut orc = orchestrator(dir.path(), http);
        seed_rrdp(&mut orc);
        orc.stage_rrdp().await;

        assert!(!orc.rsync_fetch.contains_key(&module()));
        assert_eq!(orc.rrdp_info.get(&module()).unwrap().serial, 1);
        assert_eq!(orc.rrdp_info.get(&module()).unwrap().sessionid, SESSION);
        let stats = orc.rrdp_stats().get(notify().as_str()).unwrap();
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.file_count, 1);
    }

    #[tokio::test]
    async fn rrdp_failure_keeps_rsync_for_failover() {
        let dir = tempfile::tempdir().unwrap();
        let mut http = FakeHttp::default();
        http.status("https://rrdp.example.net/notification.xml", 500);

        let mut orc = orchestrator(dir.path(), http);
        seed_rrdp(&mut orc);
        orc.stage_rrdp().await;

        assert!(
            orc.rsync_fetch.contains_key(&module()),
            "failover must keep the rsync endpoint"
        );
        let stats = orc.rrdp_stats().get(notify().as_str()).unwrap();
        assert_eq!(stats.errors, 1);
        assert!(stats.last_error.contains("500"));
    }

    #[tokio::test]
    async fn oversized_response_is_abandoned_not_failed_over() {
        let dir = tempfile::tempdir().unwrap();
        let mut http = FakeHttp::default();
        http.too_large("https://rrdp.example.net/notification.xml");

        let mut orc = orchestrator(dir.path(), http);
        seed_rrdp(&mut orc);
        orc.stage_rrdp().await;

        assert!(
            !orc.rsync_fetch.contains_key(&module()),
            "an oversized response must not be mirrored over rsync"
        );
    }

    #[tokio::test]
    async fn rrdp_failure_without_failover_drops_rsync() {
        let dir = tempfile::tempdir().unwrap();
        let mut http = FakeHttp::default();
        http.status("https://rrdp.example.net/notification.xml", 500);

        let mut config = test_config(dir.path());
        config.rrdp_failover = false;
        let mut orc = Orchestrator::new(config, http).unwrap();
        seed_rrdp(&mut orc);
        orc.stage_rrdp().await;

        assert!(!orc.rsync_fetch.contains_key(&module()));
    }

    // -----------------------------------------------------------------------
    // State persistence
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn rrdp_state_round_trips_through_the_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot_xml(7);
        let mut http = FakeHttp::default();
        http.put(
            "https://rrdp.example.net/notification.xml",
            notification_xml(7, &snapshot),
        );
        http.put("https://rrdp.example.net/snapshot.xml", snapshot);

        let mut orc = orchestrator(dir.path(), http);
        seed_rrdp(&mut orc);
        orc.stage_rrdp().await;
        orc.save_rrdp_state();

        // The file holds the endpoint map, not some scalar.
        let reloaded: BTreeMap<RsyncUri, RrdpState> =
            bounded_read_json(&dir.path().join("cache/rrdp.json"), MAX_STATE_FILE).unwrap();
        let state = reloaded.get(&module()).unwrap();
        assert_eq!(state.serial, 7);
        assert_eq!(state.sessionid, SESSION);
        assert_eq!(state.path, notify().as_str());

        // A fresh orchestrator restores it.
        let orc2 = orchestrator(dir.path(), FakeHttp::default());
        assert_eq!(orc2.rrdp_info.get(&module()).unwrap().serial, 7);
    }

    // -----------------------------------------------------------------------
    // TAL fetch stage
    // -----------------------------------------------------------------------

    fn write_tal(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("example.tal");
        std::fs::write(
            &path,
            "https://tals.example.net/root.cer\n\
             rsync://repo.example.net/repo/root.cer\n\n\
             AAAA\n",
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn tal_https_success_caches_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut http = FakeHttp::default();
        http.put("https://tals.example.net/root.cer", b"root-cert-bytes".to_vec());

        let mut config = test_config(dir.path());
        config.tal_paths = vec![write_tal(dir.path())];
        let mut orc = Orchestrator::new(config, http).unwrap();
        orc.tals_fetch.insert(0);
        orc.stage_tal().await;

        let root = RsyncUri::parse("rsync://repo.example.net/repo/root.cer").unwrap();
        assert_eq!(orc.cache.read(&root).unwrap().as_ref(), b"root-cert-bytes");
        assert!(orc.tals_fetch.is_empty());
        assert!(orc.rsync_fetch.is_empty());
    }

    #[tokio::test]
    async fn tal_https_failure_queues_rsync_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut http = FakeHttp::default();
        http.status("https://tals.example.net/root.cer", 503);

        let mut config = test_config(dir.path());
        config.tal_paths = vec![write_tal(dir.path())];
        let mut orc = Orchestrator::new(config, http).unwrap();
        orc.tals_fetch.insert(0);
        orc.stage_tal().await;

        let root = RsyncUri::parse("rsync://repo.example.net/repo/root.cer").unwrap();
        assert!(orc.rsync_fetch.contains_key(&root));
    }

    // -----------------------------------------------------------------------
    // Authority registration
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn conflicting_rrdp_domain_first_seen_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut orc = orchestrator(dir.path(), FakeHttp::default());

        let first = SiaAuthority {
            rsync: module(),
            domain: module().domain(),
            notify: Some(notify()),
        };
        orc.apply_authority(&first);

        let second = SiaAuthority {
            rsync: RsyncUri::parse("rsync://evil.example.org/repo").unwrap(),
            domain: RsyncUri::parse("rsync://evil.example.org").unwrap(),
            notify: Some(notify()),
        };
        orc.apply_authority(&second);

        assert_eq!(
            orc.rrdp_fetch_domain.get(&notify()).unwrap(),
            &module().domain()
        );
        assert_eq!(orc.rrdp_fetch.get(&notify()).unwrap(), &module());
        // The conflicting authority is not registered at all.
        assert!(!orc
            .rsync_fetch
            .contains_key(&RsyncUri::parse("rsync://evil.example.org/repo").unwrap()));
    }

    // -----------------------------------------------------------------------
    // Stability and convergence
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn first_iteration_is_never_stable_second_is() {
        let dir = tempfile::tempdir().unwrap();
        let mut orc = orchestrator(dir.path(), FakeHttp::default());

        let first = orc.run_iteration().await.unwrap();
        assert!(!first.stable);
        assert!(!first.has_previous_stable);

        let second = orc.run_iteration().await.unwrap();
        assert!(second.stable);
        assert!(second.has_previous_stable);
    }

    #[tokio::test]
    async fn has_previous_stable_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut orc = orchestrator(dir.path(), FakeHttp::default());

        orc.run_iteration().await.unwrap();
        orc.run_iteration().await.unwrap();
        assert!(orc.has_previous_stable);

        // A repository appearing destabilizes the next iteration, but
        // has_previous_stable stays latched.
        orc.prev_repos.insert(module(), 0);
        let outcome = orc.run_iteration().await.unwrap();
        assert!(!outcome.stable);
        assert!(outcome.has_previous_stable);
        assert!(orc.snapshot.healthy());
    }

    #[tokio::test]
    async fn convergence_cap_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_iterations = 1;
        let mut orc = Orchestrator::new(config, FakeHttp::default()).unwrap();

        // Iteration 1 fits the budget but is never stable.
        orc.run_iteration().await.unwrap();
        let err = orc.run_iteration().await.unwrap_err();
        assert!(matches!(err, FatalError::ConvergenceCap { iterations: 2 }));
    }

    #[tokio::test]
    async fn epoch_counter_resets_after_stability() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_iterations = 2;
        let mut orc = Orchestrator::new(config, FakeHttp::default()).unwrap();

        orc.run_iteration().await.unwrap();
        let second = orc.run_iteration().await.unwrap();
        assert!(second.stable);
        assert_eq!(orc.epoch_iterations, 0);

        // A fresh epoch gets the full budget again.
        orc.prev_repos.insert(module(), 0);
        let third = orc.run_iteration().await.unwrap();
        assert!(!third.stable);
        let fourth = orc.run_iteration().await.unwrap();
        assert!(fourth.stable);
        assert_eq!(orc.epoch_iterations, 0);
    }

    #[tokio::test]
    async fn observer_sees_spans_and_captured_errors() {
        #[derive(Default)]
        struct Recording {
            spans: std::sync::Mutex<Vec<String>>,
            errors: std::sync::Mutex<Vec<String>>,
        }

        impl Observer for Recording {
            fn span(&self, name: &str, _parent: SpanId) -> SpanId {
                let mut spans = self.spans.lock().unwrap();
                spans.push(name.to_string());
                SpanId(spans.len() as u64)
            }
            fn finish(&self, _span: SpanId) {}
            fn capture(&self, error: &str, _tags: &HashMap<String, String>) {
                self.errors.lock().unwrap().push(error.to_string());
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut http = FakeHttp::default();
        http.status("https://rrdp.example.net/notification.xml", 500);

        let mut orc = orchestrator(dir.path(), http);
        let recording = Arc::new(Recording::default());
        orc.set_observer(recording.clone());
        seed_rrdp(&mut orc);
        orc.run_iteration().await.unwrap();

        let spans = recording.spans.lock().unwrap();
        assert!(spans.contains(&"iteration".to_string()));
        assert!(spans.contains(&"rrdp".to_string()));
        assert!(spans.contains(&"validation".to_string()));
        let errors = recording.errors.lock().unwrap();
        assert!(errors.iter().any(|e| e.contains("500")));
    }

    #[tokio::test]
    async fn snapshot_reflects_iteration_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut orc = orchestrator(dir.path(), FakeHttp::default());
        orc.run_iteration().await.unwrap();
        orc.run_iteration().await.unwrap();

        let info = orc.snapshot().info();
        assert_eq!(info.iteration, 2);
        assert!(info.stable);
        assert_eq!(info.roas.metadata.counts, 0);
    }
}
