//! The per-trust-anchor chain walk.
//!
//! Starting from a TAL-pinned root certificate in the local cache, the
//! walk opens each CA's publication point, enforces its manifest and CRL,
//! recurses into subordinate CAs and collects the route origins of valid
//! ROAs. Every failure is reported into a per-TAL message stream and
//! prunes exactly the affected subtree; the walk itself never aborts.
//!
//! Two strictness knobs change how much a bad publication point costs:
//! with `strict_hash` a single missing or mismatched manifest entry
//! invalidates the whole CA, with `strict_manifests` so does an unlisted
//! sibling file. Without them the walk degrades to object-by-object
//! skipping. `use_manifest = false` switches to exploration mode, which
//! walks the directory listing instead of the manifest and tolerates
//! missing manifests entirely; signatures and resource containment are
//! enforced in every mode.

use std::collections::HashSet;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::fetch::Fetcher;
use crate::objects::cert::Cert;
use crate::objects::crl::Crl;
use crate::objects::mft::{FileEntry, Manifest};
use crate::objects::resources::ResourceSet;
use crate::objects::roa::Roa;
use crate::objects::tal::Tal;
use crate::uri::{HttpsUri, RsyncUri};

/// Recursion bound for the in-cache chain walk.
///
/// Discovery growth across iterations is bounded by the orchestrator;
/// this bounds a single walk against a cache that encodes a cycle.
const MAX_DEPTH: u32 = 32;

/// Validation policy knobs.
#[derive(Clone, Debug)]
pub struct Validator {
    /// A missing or hash-mismatched manifest entry invalidates the CA.
    pub strict_hash: bool,
    /// An unlisted sibling file invalidates the CA.
    pub strict_manifests: bool,
    /// Strict CMS decoding.
    pub strict_cms: bool,
    /// Manifest-driven walk; `false` explores the directory listing.
    pub use_manifest: bool,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            strict_hash: true,
            strict_manifests: true,
            strict_cms: false,
            use_manifest: true,
        }
    }
}

/// A publication point harvested from a validated CA certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiaAuthority {
    /// The rsync module to fetch.
    pub rsync: RsyncUri,
    /// The rsync host-level URI, the RRDP containment domain.
    pub domain: RsyncUri,
    /// The RRDP notification URI, when the CA advertises one.
    pub notify: Option<HttpsUri>,
}

/// One validated route origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedRoa {
    /// The authorized AS number.
    pub asn: u32,
    /// The prefix in CIDR notation.
    pub prefix: String,
    /// The effective maxLength.
    pub max_length: u8,
}

/// Everything one TAL's walk produced.
#[derive(Clone, Debug, Default)]
pub struct TalReport {
    /// Whether the root certificate was present and matched the TAL key.
    pub tal_valid: bool,
    /// Validated route origins.
    pub roas: Vec<ValidatedRoa>,
    /// Harvested publication points, deduplicated by module.
    pub authorities: Vec<SiaAuthority>,
    /// The validation message stream.
    pub messages: Vec<String>,
    /// Count of objects that passed validation.
    pub valid_objects: usize,
}

impl Validator {
    /// Runs the walk for one TAL over the local cache.
    ///
    /// `root_uri` is the cache location of the root certificate (the
    /// TAL's rsync URI). A missing or key-mismatched root leaves
    /// `tal_valid` false so the orchestrator re-queues the TAL fetch.
    pub fn run_tal<F: Fetcher>(
        &self,
        tal: &Tal,
        root_uri: &RsyncUri,
        fetcher: &F,
        now: DateTime<Utc>,
    ) -> TalReport {
        let mut walk = Walk {
            policy: self,
            fetcher,
            now,
            report: TalReport::default(),
            seen_modules: HashSet::new(),
        };
        walk.run(tal, root_uri);
        walk.report
    }
}

struct Walk<'a, F> {
    policy: &'a Validator,
    fetcher: &'a F,
    now: DateTime<Utc>,
    report: TalReport,
    seen_modules: HashSet<RsyncUri>,
}

impl<F: Fetcher> Walk<'_, F> {
    fn message(&mut self, text: String) {
        warn!("{text}");
        self.report.messages.push(text);
    }

    fn run(&mut self, tal: &Tal, root_uri: &RsyncUri) {
        let bytes = match self.fetcher.open(root_uri) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.message(format!("trust anchor {root_uri}: not in cache: {err}"));
                return;
            }
        };
        let cert = match Cert::decode(bytes) {
            Ok(cert) => cert,
            Err(err) => {
                self.message(format!("trust anchor {root_uri}: {err}"));
                return;
            }
        };
        if !tal.key_matches(cert.public_key().raw_der()) {
            self.message(format!(
                "trust anchor {root_uri}: public key does not match the TAL"
            ));
            return;
        }
        if let Err(err) = cert.verify_self_signed() {
            self.message(format!("trust anchor {root_uri}: {err}"));
            return;
        }
        if !cert.validity().contains(self.now) {
            self.message(format!("trust anchor {root_uri}: outside validity window"));
            return;
        }
        if !cert.is_ca() {
            self.message(format!("trust anchor {root_uri}: not a CA certificate"));
            return;
        }
        // The root cert is the anchor; fetching succeeded and the key is
        // pinned, so the TAL needs no refetch even if its subtree fails.
        self.report.tal_valid = true;

        let resources = match ResourceSet::all()
            .resolve_child(cert.ip_resources(), cert.as_resources())
        {
            Some(resources) => resources,
            None => {
                self.message(format!(
                    "trust anchor {root_uri}: unresolvable resource declaration"
                ));
                return;
            }
        };
        self.process_ca(&cert, &resources, root_uri, 0);
    }

    /// Validates one CA's publication point and recurses.
    fn process_ca(
        &mut self,
        ca: &Cert,
        resources: &ResourceSet,
        ca_uri: &RsyncUri,
        depth: u32,
    ) {
        if depth > MAX_DEPTH {
            self.message(format!("{ca_uri}: CA chain deeper than {MAX_DEPTH}, pruning"));
            return;
        }
        let Some(repository) = ca.sia().ca_repository.clone() else {
            self.message(format!("{ca_uri}: CA without caRepository SIA"));
            return;
        };

        self.harvest(&repository, ca.sia().rpki_notify.clone());

        if self.policy.use_manifest {
            self.process_ca_manifest(ca, resources, ca_uri, &repository, depth);
        } else {
            self.process_ca_exploratory(ca, resources, &repository, depth);
        }
    }

    /// Records a harvested publication point once per module.
    fn harvest(&mut self, repository: &RsyncUri, notify: Option<HttpsUri>) {
        let module = repository.module();
        if self.seen_modules.insert(module.clone()) {
            self.report.authorities.push(SiaAuthority {
                domain: module.domain(),
                rsync: module,
                notify,
            });
        }
    }

    /// The manifest-driven walk of one CA.
    fn process_ca_manifest(
        &mut self,
        ca: &Cert,
        resources: &ResourceSet,
        ca_uri: &RsyncUri,
        repository: &RsyncUri,
        depth: u32,
    ) {
        let Some(mft_uri) = ca.sia().rpki_manifest.clone() else {
            self.message(format!("{ca_uri}: CA without rpkiManifest SIA"));
            return;
        };
        let bytes = match self.fetcher.open(&mft_uri) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.message(format!("{mft_uri}: manifest not in cache: {err}"));
                return;
            }
        };
        let manifest = match Manifest::decode(bytes, self.policy.strict_cms) {
            Ok(manifest) => manifest,
            Err(err) => {
                self.message(format!("{mft_uri}: {err}"));
                return;
            }
        };
        if let Err(err) = manifest.signed().verify() {
            self.message(format!("{mft_uri}: {err}"));
            return;
        }
        let Some(_ee_resources) =
            self.check_ee(manifest.signed().ee_cert(), ca, resources, &mft_uri, None)
        else {
            return;
        };
        if !manifest.validity().contains(self.now) {
            self.message(format!("{mft_uri}: outside thisUpdate/nextUpdate window"));
            return;
        }
        self.report.valid_objects += 1;

        // Exactly one CRL must be listed; it guards everything else.
        let crl_entry = match single_crl_entry(manifest.files()) {
            Ok(entry) => entry.clone(),
            Err(count) => {
                self.message(format!("{mft_uri}: {count} CRL entries, expected exactly 1"));
                return;
            }
        };
        let crl_uri = repository.join(&crl_entry.name);
        let crl = match self.load_crl(&crl_uri, &crl_entry, ca) {
            Some(crl) => crl,
            None => return,
        };

        // Read every listed file and hash-check it before anything is
        // processed: under strict hashing one bad entry condemns the CA.
        let mut entries: Vec<(String, Option<Bytes>)> = Vec::new();
        for entry in manifest.files() {
            let uri = repository.join(&entry.name);
            match self.fetcher.open(&uri) {
                Ok(data) if entry.matches(&data) => {
                    entries.push((entry.name.clone(), Some(data)));
                }
                Ok(_) => {
                    self.message(format!("{uri}: hash differs from manifest listing"));
                    if self.policy.strict_hash {
                        self.message(format!("{ca_uri}: CA invalidated by hash mismatch"));
                        return;
                    }
                    entries.push((entry.name.clone(), None));
                }
                Err(err) => {
                    self.message(format!("{uri}: listed on manifest but unreadable: {err}"));
                    if self.policy.strict_hash {
                        self.message(format!("{ca_uri}: CA invalidated by missing object"));
                        return;
                    }
                    entries.push((entry.name.clone(), None));
                }
            }
        }

        if self.policy.strict_manifests {
            let siblings = self.fetcher.list(repository).unwrap_or_default();
            let manifest_name = mft_uri.as_str().rsplit('/').next().unwrap_or("");
            let unlisted = unlisted_siblings(manifest.files(), &siblings, manifest_name);
            if !unlisted.is_empty() {
                self.message(format!(
                    "{ca_uri}: CA invalidated by unlisted files at publication point: {}",
                    unlisted.join(", ")
                ));
                return;
            }
        }

        for (name, data) in entries {
            let Some(data) = data else { continue };
            if name == crl_entry.name {
                continue;
            }
            let uri = repository.join(&name);
            self.process_entry(&name, data, &uri, ca, Some(&crl), resources, depth);
        }
    }

    /// Exploration mode: walk the directory listing, tolerate a missing
    /// manifest, use a CRL when one is present.
    fn process_ca_exploratory(
        &mut self,
        ca: &Cert,
        resources: &ResourceSet,
        repository: &RsyncUri,
        depth: u32,
    ) {
        let names = match self.fetcher.list(repository) {
            Ok(names) => names,
            Err(err) => {
                self.message(format!("{repository}: unreadable publication point: {err}"));
                return;
            }
        };

        let crl = names
            .iter()
            .filter(|n| n.ends_with(".crl"))
            .find_map(|name| {
                let uri = repository.join(name);
                let data = self.fetcher.open(&uri).ok()?;
                let crl = Crl::decode(data).ok()?;
                crl.verify_signature(ca.public_key()).ok()?;
                Some(crl)
            });

        for name in names {
            let uri = repository.join(&name);
            let data = match self.fetcher.open(&uri) {
                Ok(data) => data,
                Err(err) => {
                    self.message(format!("{uri}: unreadable: {err}"));
                    continue;
                }
            };
            self.process_entry(&name, data, &uri, ca, crl.as_ref(), resources, depth);
        }
    }

    /// Dispatches one publication-point object by file extension.
    #[allow(clippy::too_many_arguments)]
    fn process_entry(
        &mut self,
        name: &str,
        data: Bytes,
        uri: &RsyncUri,
        ca: &Cert,
        crl: Option<&Crl>,
        resources: &ResourceSet,
        depth: u32,
    ) {
        if name.ends_with(".cer") {
            self.process_child_ca(data, uri, ca, crl, resources, depth);
        } else if name.ends_with(".roa") {
            self.process_roa(data, uri, ca, crl, resources);
        } else {
            // CRLs were handled by the caller; ghostbusters and unknown
            // types do not affect the walk.
            debug!(%uri, "skipping non-walk object");
        }
    }

    fn process_child_ca(
        &mut self,
        data: Bytes,
        uri: &RsyncUri,
        parent: &Cert,
        crl: Option<&Crl>,
        resources: &ResourceSet,
        depth: u32,
    ) {
        let cert = match Cert::decode(data) {
            Ok(cert) => cert,
            Err(err) => {
                self.message(format!("{uri}: {err}"));
                return;
            }
        };
        if let Some(crl) = crl {
            if crl.contains(cert.serial()) {
                self.message(format!(
                    "{uri}: certificate serial {} is revoked",
                    cert.serial().to_hex()
                ));
                return;
            }
        }
        if let Err(err) = cert.verify_signature(parent.public_key()) {
            self.message(format!("{uri}: {err}"));
            return;
        }
        if cert.issuer() != parent.subject() {
            self.message(format!("{uri}: issuer does not match the signing CA"));
            return;
        }
        if let (Some(aki), Some(ski)) = (cert.aki(), parent.ski()) {
            if aki != ski {
                self.message(format!("{uri}: authority key id does not match the CA"));
                return;
            }
        }
        if !cert.validity().contains(self.now) {
            self.message(format!("{uri}: outside validity window"));
            return;
        }
        if !cert.is_ca() {
            // EE certificates are carried inside signed objects; a bare
            // non-CA certificate at a publication point is noise.
            self.message(format!("{uri}: certificate is not a CA"));
            return;
        }
        let child_resources = match resources
            .resolve_child(cert.ip_resources(), cert.as_resources())
        {
            Some(child) => child,
            None => {
                self.message(format!("{uri}: certificate over-claims its issuer's resources"));
                return;
            }
        };
        self.report.valid_objects += 1;
        self.process_ca(&cert, &child_resources, uri, depth + 1);
    }

    fn process_roa(
        &mut self,
        data: Bytes,
        uri: &RsyncUri,
        ca: &Cert,
        crl: Option<&Crl>,
        resources: &ResourceSet,
    ) {
        let roa = match Roa::decode(data, self.policy.strict_cms) {
            Ok(roa) => roa,
            Err(err) => {
                self.message(format!("{uri}: {err}"));
                return;
            }
        };
        if let Err(err) = roa.signed().verify() {
            self.message(format!("{uri}: {err}"));
            return;
        }
        let Some(ee_resources) =
            self.check_ee(roa.signed().ee_cert(), ca, resources, uri, crl)
        else {
            return;
        };
        if let Err(err) = roa.check_coverage(&ee_resources) {
            self.message(format!("{uri}: {err}"));
            return;
        }
        self.report.valid_objects += 1;
        for entry in roa.prefixes() {
            self.report.roas.push(ValidatedRoa {
                asn: roa.asn(),
                prefix: entry.prefix.to_string(),
                max_length: entry.effective_max_length(),
            });
        }
    }

    /// Chain checks for an EE certificate embedded in a signed object.
    ///
    /// Returns the EE's effective resources, or `None` after reporting.
    fn check_ee(
        &mut self,
        ee: &Cert,
        ca: &Cert,
        resources: &ResourceSet,
        uri: &RsyncUri,
        crl: Option<&Crl>,
    ) -> Option<ResourceSet> {
        if let Some(crl) = crl {
            if crl.contains(ee.serial()) {
                self.message(format!(
                    "{uri}: EE serial {} is revoked",
                    ee.serial().to_hex()
                ));
                return None;
            }
        }
        if let Err(err) = ee.verify_signature(ca.public_key()) {
            self.message(format!("{uri}: EE {err}"));
            return None;
        }
        if ee.issuer() != ca.subject() {
            self.message(format!("{uri}: EE issuer does not match the signing CA"));
            return None;
        }
        if !ee.validity().contains(self.now) {
            self.message(format!("{uri}: EE outside validity window"));
            return None;
        }
        match resources.resolve_child(ee.ip_resources(), ee.as_resources()) {
            Some(ee_resources) => Some(ee_resources),
            None => {
                self.message(format!("{uri}: EE over-claims the CA's resources"));
                None
            }
        }
    }

    fn load_crl(&mut self, crl_uri: &RsyncUri, entry: &FileEntry, ca: &Cert) -> Option<Crl> {
        let data = match self.fetcher.open(crl_uri) {
            Ok(data) => data,
            Err(err) => {
                self.message(format!("{crl_uri}: CRL not in cache: {err}"));
                return None;
            }
        };
        if !entry.matches(&data) {
            self.message(format!("{crl_uri}: hash differs from manifest listing"));
            if self.policy.strict_hash {
                return None;
            }
        }
        let crl = match Crl::decode(data) {
            Ok(crl) => crl,
            Err(err) => {
                self.message(format!("{crl_uri}: {err}"));
                return None;
            }
        };
        if let Err(err) = crl.verify_signature(ca.public_key()) {
            self.message(format!("{crl_uri}: {err}"));
            return None;
        }
        if !crl.validity().contains(self.now) {
            self.message(format!("{crl_uri}: outside thisUpdate/nextUpdate window"));
            return None;
        }
        Some(crl)
    }
}

/// Requires exactly one `.crl` entry on a manifest listing.
///
/// # Errors
///
/// Returns the offending count.
fn single_crl_entry(files: &[FileEntry]) -> Result<&FileEntry, usize> {
    let mut crls = files.iter().filter(|f| f.name.ends_with(".crl"));
    let first = crls.next();
    let extra = crls.count();
    match (first, extra) {
        (Some(entry), 0) => Ok(entry),
        (Some(_), extra) => Err(extra + 1),
        (None, _) => Err(0),
    }
}

/// Files present at the publication point but absent from the manifest.
///
/// The manifest itself is exempt: a manifest's file list can never name
/// its own file, since the listed hash would have to cover itself.
fn unlisted_siblings(
    files: &[FileEntry],
    siblings: &[String],
    manifest_name: &str,
) -> Vec<String> {
    let listed: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();
    siblings
        .iter()
        .filter(|name| name.as_str() != manifest_name && !listed.contains(name.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use sha2::{Digest, Sha256};

    use super::*;

    fn entry(name: &str, data: &[u8]) -> FileEntry {
        FileEntry {
            name: name.into(),
            hash: Bytes::copy_from_slice(Sha256::digest(data).as_slice()),
        }
    }

    #[test]
    fn exactly_one_crl_required() {
        let files = vec![entry("a.roa", b"x"), entry("ca.crl", b"y")];
        assert_eq!(single_crl_entry(&files).unwrap().name, "ca.crl");

        let none = vec![entry("a.roa", b"x")];
        assert_eq!(single_crl_entry(&none), Err(0));

        let two = vec![entry("a.crl", b"x"), entry("b.crl", b"y")];
        assert_eq!(single_crl_entry(&two), Err(2));
    }

    #[test]
    fn unlisted_siblings_detected() {
        let files = vec![entry("a.roa", b"x"), entry("ca.crl", b"y")];
        let siblings = vec![
            "a.roa".to_string(),
            "ca.crl".to_string(),
            "ca.mft".to_string(),
            "sneaky.roa".to_string(),
        ];
        assert_eq!(
            unlisted_siblings(&files, &siblings, "ca.mft"),
            vec!["sneaky.roa"]
        );

        let clean = vec!["a.roa".to_string()];
        assert!(unlisted_siblings(&files, &clean, "ca.mft").is_empty());
    }

    /// The manifest cannot list itself, so a conformant publication point
    /// (objects + CRL + the manifest file) must pass the completeness
    /// check with only the manifest name exempted.
    #[test]
    fn manifest_own_file_is_not_an_unlisted_sibling() {
        let files = vec![entry("a.roa", b"x"), entry("ca.crl", b"y")];
        let siblings = vec![
            "a.roa".to_string(),
            "ca.crl".to_string(),
            "ca.mft".to_string(),
        ];
        assert!(unlisted_siblings(&files, &siblings, "ca.mft").is_empty());
        // A second, foreign manifest is still flagged.
        let with_foreign = vec![
            "a.roa".to_string(),
            "ca.crl".to_string(),
            "ca.mft".to_string(),
            "other.mft".to_string(),
        ];
        assert_eq!(
            unlisted_siblings(&files, &with_foreign, "ca.mft"),
            vec!["other.mft"]
        );
    }

    #[test]
    fn missing_root_reports_and_leaves_tal_invalid() {
        struct EmptyFetcher;
        impl Fetcher for EmptyFetcher {
            fn open(
                &self,
                uri: &RsyncUri,
            ) -> Result<Bytes, crate::cache::CacheError> {
                Err(crate::cache::CacheError::IllegalPath {
                    uri: uri.as_str().to_string(),
                })
            }
            fn list(
                &self,
                _uri: &RsyncUri,
            ) -> Result<Vec<String>, crate::cache::CacheError> {
                Ok(Vec::new())
            }
        }

        let tal = crate::objects::tal::Tal::parse(
            b"rsync://tals.example.net/repo/root.cer\n\nAAAA\n",
        )
        .unwrap();
        let root = RsyncUri::parse("rsync://tals.example.net/repo/root.cer").unwrap();
        let report = Validator::default().run_tal(&tal, &root, &EmptyFetcher, Utc::now());

        assert!(!report.tal_valid);
        assert!(report.roas.is_empty());
        assert_eq!(report.messages.len(), 1);
        assert!(report.messages[0].contains("not in cache"));
    }
}
