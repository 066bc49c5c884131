//! The RRDP client (RFC 8182).
//!
//! One fetch run processes a notification document and brings the local
//! copy of the publication point up to the publisher's serial, either by
//! replaying deltas or by falling back to the full snapshot. The decision
//! follows the RFC: a snapshot is required whenever there is no usable
//! prior state, the publisher's session changed, the stored serial is
//! ahead of the publisher, or the delta chain does not reach back to the
//! stored serial.
//!
//! Storage is behind the [`Deliver`] trait so the cache writer, the
//! per-endpoint stats and the test harness are interchangeable. The
//! client itself enforces the two security rules that must not depend on
//! the storage backend: every referenced object must lie underneath the
//! endpoint's rsync domain, and hash attributes must match before content
//! is touched.

use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use xml::reader::{EventReader, XmlEvent};

use crate::cache::CacheError;
use crate::fetch::{HttpError, HttpFetcher};
use crate::uri::{HttpsUri, RsyncUri};

/// Persisted per-endpoint session state.
///
/// The field names are the on-disk JSON contract; the state file maps
/// rsync module URIs to these records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RrdpState {
    /// The paired rsync module URI.
    pub rsync: String,
    /// The notification URI.
    pub path: String,
    /// The publisher's session id.
    pub sessionid: String,
    /// The last applied serial.
    pub serial: i64,
}

/// Errors from one RRDP fetch run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RrdpError {
    /// An HTTP fetch failed.
    #[error("fetch of {uri} failed: {source}")]
    Fetch {
        /// The document URI.
        uri: String,
        /// The transport error.
        #[source]
        source: HttpError,
    },

    /// A document failed to parse.
    #[error("malformed RRDP document {uri}: {detail}")]
    Malformed {
        /// The document URI.
        uri: String,
        /// Parser diagnostic.
        detail: String,
    },

    /// A snapshot or delta did not carry the session/serial the
    /// notification announced.
    #[error("session discontinuity in {uri}")]
    SessionMismatch {
        /// The document URI.
        uri: String,
    },

    /// A document or object hash did not match its announcement.
    #[error("hash mismatch for {uri}")]
    HashMismatch {
        /// The object or document URI.
        uri: String,
    },

    /// The storage backend refused a write for a non-policy reason.
    #[error("delivery of {uri} failed: {source}")]
    Deliver {
        /// The object URI.
        uri: String,
        /// The cache error.
        #[source]
        source: CacheError,
    },
}

impl RrdpError {
    /// Whether the orchestrator may fall back to rsync for this failure.
    ///
    /// An oversized response is the one class that must not fail over.
    #[must_use]
    pub fn is_failover_eligible(&self) -> bool {
        match self {
            Self::Fetch { source, .. } => source.is_failover_eligible(),
            _ => true,
        }
    }
}

/// Storage seam for delivered objects.
pub trait Deliver {
    /// Writes (or, with `withdraw`, removes) the object at `uri`.
    ///
    /// # Errors
    ///
    /// [`CacheError`]; [`CacheError::IllegalPath`] is treated as a
    /// skip-and-log policy refusal by the client, everything else aborts
    /// the endpoint.
    fn deliver(&mut self, uri: &RsyncUri, data: &[u8], withdraw: bool) -> Result<(), CacheError>;

    /// The SHA-256 digest of the currently stored object, if present.
    fn current_hash(&self, uri: &RsyncUri) -> Option<[u8; 32]>;
}

/// The result of a successful fetch run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RrdpOutcome {
    /// State to persist for the next run.
    pub state: RrdpState,
    /// Number of objects delivered (published or withdrawn).
    pub delivered: usize,
    /// Whether the snapshot path was taken.
    pub used_snapshot: bool,
}

/// Runs one notification/snapshot/delta cycle for an endpoint.
///
/// # Errors
///
/// Any [`RrdpError`]; the caller decides failover from
/// [`RrdpError::is_failover_eligible`].
pub async fn fetch<F: HttpFetcher, D: Deliver>(
    notify_uri: &HttpsUri,
    rsync_domain: &RsyncUri,
    rsync_module: &RsyncUri,
    prior: Option<&RrdpState>,
    fetcher: &F,
    deliver: &mut D,
) -> Result<RrdpOutcome, RrdpError> {
    let data = get(fetcher, notify_uri).await?;
    let notification = parse_notification(&data)
        .map_err(|detail| RrdpError::Malformed {
            uri: notify_uri.as_str().to_string(),
            detail,
        })?;

    let new_state = RrdpState {
        rsync: rsync_module.as_str().to_string(),
        path: notify_uri.as_str().to_string(),
        sessionid: notification.session_id.clone(),
        serial: notification.serial,
    };

    // Same session, same serial: the local copy is already current.
    if let Some(prior) = prior {
        if prior.sessionid == notification.session_id && prior.serial == notification.serial {
            debug!(uri = %notify_uri, serial = notification.serial, "RRDP already current");
            return Ok(RrdpOutcome {
                state: new_state,
                delivered: 0,
                used_snapshot: false,
            });
        }
    }

    if let Some(deltas) = usable_delta_chain(prior, &notification) {
        let mut delivered = 0;
        for delta_ref in deltas {
            delivered += apply_delta(
                &notification,
                delta_ref,
                rsync_domain,
                fetcher,
                deliver,
            )
            .await?;
        }
        Ok(RrdpOutcome {
            state: new_state,
            delivered,
            used_snapshot: false,
        })
    } else {
        let delivered =
            apply_snapshot(&notification, rsync_domain, fetcher, deliver).await?;
        Ok(RrdpOutcome {
            state: new_state,
            delivered,
            used_snapshot: true,
        })
    }
}

async fn get<F: HttpFetcher>(fetcher: &F, uri: &HttpsUri) -> Result<Bytes, RrdpError> {
    fetcher.get(uri).await.map_err(|source| RrdpError::Fetch {
        uri: uri.as_str().to_string(),
        source,
    })
}

/// Returns the deltas to replay, in ascending serial order, or `None`
/// when the snapshot must be used.
fn usable_delta_chain<'n>(
    prior: Option<&RrdpState>,
    notification: &'n Notification,
) -> Option<Vec<&'n DeltaRef>> {
    let prior = prior?;
    if prior.sessionid != notification.session_id {
        return None;
    }
    if prior.serial > notification.serial {
        // The publisher moved backwards; only a snapshot can resolve it.
        return None;
    }
    let mut chain = Vec::new();
    for serial in (prior.serial + 1)..=notification.serial {
        let delta = notification.deltas.iter().find(|d| d.serial == serial)?;
        chain.push(delta);
    }
    Some(chain)
}

async fn apply_snapshot<F: HttpFetcher, D: Deliver>(
    notification: &Notification,
    rsync_domain: &RsyncUri,
    fetcher: &F,
    deliver: &mut D,
) -> Result<usize, RrdpError> {
    let uri = &notification.snapshot.uri;
    let data = get(fetcher, uri).await?;
    check_document_hash(uri.as_str(), &data, &notification.snapshot.hash)?;

    let elements = parse_snapshot(&data).map_err(|detail| RrdpError::Malformed {
        uri: uri.as_str().to_string(),
        detail,
    })?;
    if elements.session_id != notification.session_id
        || elements.serial != notification.serial
    {
        return Err(RrdpError::SessionMismatch {
            uri: uri.as_str().to_string(),
        });
    }

    let mut delivered = 0;
    for publish in elements.publishes {
        if deliver_checked(rsync_domain, &publish.uri, &publish.data, false, deliver)? {
            delivered += 1;
        }
    }
    Ok(delivered)
}

async fn apply_delta<F: HttpFetcher, D: Deliver>(
    notification: &Notification,
    delta_ref: &DeltaRef,
    rsync_domain: &RsyncUri,
    fetcher: &F,
    deliver: &mut D,
) -> Result<usize, RrdpError> {
    let uri = &delta_ref.uri;
    let data = get(fetcher, uri).await?;
    check_document_hash(uri.as_str(), &data, &delta_ref.hash)?;

    let delta = parse_delta(&data).map_err(|detail| RrdpError::Malformed {
        uri: uri.as_str().to_string(),
        detail,
    })?;
    if delta.session_id != notification.session_id || delta.serial != delta_ref.serial {
        return Err(RrdpError::SessionMismatch {
            uri: uri.as_str().to_string(),
        });
    }

    let mut delivered = 0;
    for element in delta.elements {
        match element {
            DeltaElement::Publish { uri, hash, data } => {
                // A hash on a publish pins the object being replaced.
                if let Some(expected) = hash {
                    match deliver.current_hash(&uri) {
                        Some(current) if current == expected => {}
                        _ => {
                            return Err(RrdpError::HashMismatch {
                                uri: uri.as_str().to_string(),
                            })
                        }
                    }
                }
                if deliver_checked(rsync_domain, &uri, &data, false, deliver)? {
                    delivered += 1;
                }
            }
            DeltaElement::Withdraw { uri, hash } => {
                match deliver.current_hash(&uri) {
                    Some(current) if current == hash => {}
                    _ => {
                        return Err(RrdpError::HashMismatch {
                            uri: uri.as_str().to_string(),
                        })
                    }
                }
                if deliver_checked(rsync_domain, &uri, &[], true, deliver)? {
                    delivered += 1;
                }
            }
        }
    }
    Ok(delivered)
}

/// Containment check plus delivery. Returns whether anything was stored.
fn deliver_checked<D: Deliver>(
    rsync_domain: &RsyncUri,
    uri: &RsyncUri,
    data: &[u8],
    withdraw: bool,
    deliver: &mut D,
) -> Result<bool, RrdpError> {
    if !rsync_domain.contains(uri) {
        warn!(%uri, domain = %rsync_domain, "RRDP object outside endpoint domain, skipping");
        return Ok(false);
    }
    match deliver.deliver(uri, data, withdraw) {
        Ok(()) => Ok(true),
        Err(CacheError::IllegalPath { uri: bad }) => {
            warn!(uri = %bad, "RRDP object maps to illegal path, skipping");
            Ok(false)
        }
        Err(source) => Err(RrdpError::Deliver {
            uri: uri.as_str().to_string(),
            source,
        }),
    }
}

fn check_document_hash(uri: &str, data: &[u8], expected: &[u8; 32]) -> Result<(), RrdpError> {
    let digest = Sha256::digest(data);
    if digest.as_slice() != expected {
        return Err(RrdpError::HashMismatch {
            uri: uri.to_string(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Document parsing
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct SnapshotRef {
    uri: HttpsUri,
    hash: [u8; 32],
}

#[derive(Clone, Debug)]
struct DeltaRef {
    serial: i64,
    uri: HttpsUri,
    hash: [u8; 32],
}

#[derive(Clone, Debug)]
struct Notification {
    session_id: String,
    serial: i64,
    snapshot: SnapshotRef,
    deltas: Vec<DeltaRef>,
}

struct SnapshotDoc {
    session_id: String,
    serial: i64,
    publishes: Vec<PublishElement>,
}

struct PublishElement {
    uri: RsyncUri,
    data: Vec<u8>,
}

enum DeltaElement {
    Publish {
        uri: RsyncUri,
        hash: Option<[u8; 32]>,
        data: Vec<u8>,
    },
    Withdraw {
        uri: RsyncUri,
        hash: [u8; 32],
    },
}

struct DeltaDoc {
    session_id: String,
    serial: i64,
    elements: Vec<DeltaElement>,
}

fn attr<'a>(
    attributes: &'a [xml::attribute::OwnedAttribute],
    name: &str,
) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.as_str())
}

fn parse_hash(value: &str) -> Result<[u8; 32], String> {
    let raw = hex::decode(value.trim()).map_err(|e| format!("bad hash: {e}"))?;
    <[u8; 32]>::try_from(raw).map_err(|_| "hash is not 32 bytes".to_string())
}

fn parse_serial(value: &str) -> Result<i64, String> {
    let serial: i64 = value.parse().map_err(|_| format!("bad serial {value}"))?;
    if serial < 0 {
        return Err(format!("negative serial {serial}"));
    }
    Ok(serial)
}

fn decode_base64_content(text: &str) -> Result<Vec<u8>, String> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| format!("bad base64 object body: {e}"))
}

fn parse_notification(data: &[u8]) -> Result<Notification, String> {
    let mut session_id = None;
    let mut serial = None;
    let mut snapshot = None;
    let mut deltas = Vec::new();

    for event in EventReader::new(data) {
        match event.map_err(|e| e.to_string())? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => match name.local_name.as_str() {
                "notification" => {
                    session_id = attr(&attributes, "session_id").map(str::to_string);
                    serial = Some(parse_serial(
                        attr(&attributes, "serial").ok_or("notification without serial")?,
                    )?);
                }
                "snapshot" => {
                    if snapshot.is_some() {
                        return Err("multiple snapshot elements".into());
                    }
                    let uri = attr(&attributes, "uri").ok_or("snapshot without uri")?;
                    let hash = attr(&attributes, "hash").ok_or("snapshot without hash")?;
                    snapshot = Some(SnapshotRef {
                        uri: HttpsUri::parse(uri).map_err(|e| e.to_string())?,
                        hash: parse_hash(hash)?,
                    });
                }
                "delta" => {
                    let serial = attr(&attributes, "serial").ok_or("delta without serial")?;
                    let uri = attr(&attributes, "uri").ok_or("delta without uri")?;
                    let hash = attr(&attributes, "hash").ok_or("delta without hash")?;
                    deltas.push(DeltaRef {
                        serial: parse_serial(serial)?,
                        uri: HttpsUri::parse(uri).map_err(|e| e.to_string())?,
                        hash: parse_hash(hash)?,
                    });
                }
                _ => {}
            },
            XmlEvent::EndDocument => break,
            _ => {}
        }
    }

    Ok(Notification {
        session_id: session_id.ok_or("notification without session_id")?,
        serial: serial.ok_or("notification without serial")?,
        snapshot: snapshot.ok_or("notification without snapshot")?,
        deltas,
    })
}

fn parse_snapshot(data: &[u8]) -> Result<SnapshotDoc, String> {
    let mut session_id = None;
    let mut serial = None;
    let mut publishes = Vec::new();
    let mut current: Option<(RsyncUri, String)> = None;

    for event in EventReader::new(data) {
        match event.map_err(|e| e.to_string())? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => match name.local_name.as_str() {
                "snapshot" => {
                    session_id = attr(&attributes, "session_id").map(str::to_string);
                    serial = Some(parse_serial(
                        attr(&attributes, "serial").ok_or("snapshot without serial")?,
                    )?);
                }
                "publish" => {
                    let uri = attr(&attributes, "uri").ok_or("publish without uri")?;
                    current = Some((
                        RsyncUri::parse(uri).map_err(|e| e.to_string())?,
                        String::new(),
                    ));
                }
                _ => {}
            },
            XmlEvent::Characters(text) => {
                if let Some((_, body)) = current.as_mut() {
                    body.push_str(&text);
                }
            }
            XmlEvent::EndElement { name } => {
                if name.local_name == "publish" {
                    let (uri, body) =
                        current.take().ok_or("unbalanced publish element")?;
                    publishes.push(PublishElement {
                        uri,
                        data: decode_base64_content(&body)?,
                    });
                }
            }
            _ => {}
        }
    }

    Ok(SnapshotDoc {
        session_id: session_id.ok_or("snapshot without session_id")?,
        serial: serial.ok_or("snapshot without serial")?,
        publishes,
    })
}

fn parse_delta(data: &[u8]) -> Result<DeltaDoc, String> {
    let mut session_id = None;
    let mut serial = None;
    let mut elements = Vec::new();
    let mut current: Option<(RsyncUri, Option<[u8; 32]>, String)> = None;

    for event in EventReader::new(data) {
        match event.map_err(|e| e.to_string())? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => match name.local_name.as_str() {
                "delta" => {
                    session_id = attr(&attributes, "session_id").map(str::to_string);
                    serial = Some(parse_serial(
                        attr(&attributes, "serial").ok_or("delta without serial")?,
                    )?);
                }
                "publish" => {
                    let uri = attr(&attributes, "uri").ok_or("publish without uri")?;
                    let hash = match attr(&attributes, "hash") {
                        Some(h) => Some(parse_hash(h)?),
                        None => None,
                    };
                    current = Some((
                        RsyncUri::parse(uri).map_err(|e| e.to_string())?,
                        hash,
                        String::new(),
                    ));
                }
                "withdraw" => {
                    let uri = attr(&attributes, "uri").ok_or("withdraw without uri")?;
                    let hash = attr(&attributes, "hash").ok_or("withdraw without hash")?;
                    elements.push(DeltaElement::Withdraw {
                        uri: RsyncUri::parse(uri).map_err(|e| e.to_string())?,
                        hash: parse_hash(hash)?,
                    });
                }
                _ => {}
            },
            XmlEvent::Characters(text) => {
                if let Some((_, _, body)) = current.as_mut() {
                    body.push_str(&text);
                }
            }
            XmlEvent::EndElement { name } => {
                if name.local_name == "publish" {
                    let (uri, hash, body) =
                        current.take().ok_or("unbalanced publish element")?;
                    elements.push(DeltaElement::Publish {
                        uri,
                        hash,
                        data: decode_base64_content(&body)?,
                    });
                }
            }
            _ => {}
        }
    }

    Ok(DeltaDoc {
        session_id: session_id.ok_or("delta without session_id")?,
        serial: serial.ok_or("delta without serial")?,
        elements,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use base64::Engine as _;

    use super::*;

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    struct MapFetcher {
        responses: HashMap<String, Result<Vec<u8>, HttpErrorKind>>,
    }

    enum HttpErrorKind {
        TooLarge,
        Status(u16),
    }

    impl MapFetcher {
        fn new() -> Self {
            Self {
                responses: HashMap::new(),
            }
        }

        fn put(&mut self, uri: &str, body: impl Into<Vec<u8>>) {
            self.responses.insert(uri.to_string(), Ok(body.into()));
        }

        fn fail(&mut self, uri: &str, kind: HttpErrorKind) {
            self.responses.insert(uri.to_string(), Err(kind));
        }
    }

    impl HttpFetcher for MapFetcher {
        async fn get(&self, uri: &HttpsUri) -> Result<Bytes, HttpError> {
            match self.responses.get(uri.as_str()) {
                Some(Ok(body)) => Ok(Bytes::from(body.clone())),
                Some(Err(HttpErrorKind::TooLarge)) => Err(HttpError::TooLarge {
                    uri: uri.as_str().to_string(),
                    limit: 10,
                }),
                Some(Err(HttpErrorKind::Status(status))) => Err(HttpError::Status {
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

    #[derive(Default)]
    struct MemoryDeliver {
        objects: HashMap<String, Vec<u8>>,
        refuse_illegal: bool,
    }

    impl Deliver for MemoryDeliver {
        fn deliver(
            &mut self,
            uri: &RsyncUri,
            data: &[u8],
            withdraw: bool,
        ) -> Result<(), CacheError> {
            if self.refuse_illegal && uri.as_str().contains("..") {
                return Err(CacheError::IllegalPath {
                    uri: uri.as_str().to_string(),
                });
            }
            if withdraw {
                self.objects.remove(uri.as_str());
            } else {
                self.objects.insert(uri.as_str().to_string(), data.to_vec());
            }
            Ok(())
        }

        fn current_hash(&self, uri: &RsyncUri) -> Option<[u8; 32]> {
            self.objects
                .get(uri.as_str())
                .map(|data| Sha256::digest(data).into())
        }
    }

    // -----------------------------------------------------------------------
    // Fixture builders
    // -----------------------------------------------------------------------

    const SESSION: &str = "9df4b597-af9e-4dca-bdda-719cce2c4e28";

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    fn hash_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn snapshot_xml(serial: i64, publishes: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = format!(
            "<snapshot xmlns=\"http://www.ripe.net/rpki/rrdp\" version=\"1\" \
             session_id=\"{SESSION}\" serial=\"{serial}\">"
        );
        for (uri, data) in publishes {
            body.push_str(&format!("<publish uri=\"{uri}\">{}</publish>", b64(data)));
        }
        body.push_str("</snapshot>");
        body.into_bytes()
    }

    fn delta_xml(serial: i64, body_inner: &str) -> Vec<u8> {
        format!(
            "<delta xmlns=\"http://www.ripe.net/rpki/rrdp\" version=\"1\" \
             session_id=\"{SESSION}\" serial=\"{serial}\">{body_inner}</delta>"
        )
        .into_bytes()
    }

    fn notification_xml(
        serial: i64,
        snapshot_body: &[u8],
        deltas: &[(i64, &[u8])],
    ) -> Vec<u8> {
        let mut body = format!(
            "<notification xmlns=\"http://www.ripe.net/rpki/rrdp\" version=\"1\" \
             session_id=\"{SESSION}\" serial=\"{serial}\">\
             <snapshot uri=\"https://rrdp.example.net/snapshot.xml\" hash=\"{}\"/>",
            hash_hex(snapshot_body)
        );
        for (delta_serial, delta_body) in deltas {
            body.push_str(&format!(
                "<delta serial=\"{delta_serial}\" \
                 uri=\"https://rrdp.example.net/delta-{delta_serial}.xml\" hash=\"{}\"/>",
                hash_hex(delta_body)
            ));
        }
        body.push_str("</notification>");
        body.into_bytes()
    }

    fn notify_uri() -> HttpsUri {
        HttpsUri::parse("https://rrdp.example.net/notification.xml").unwrap()
    }

    fn domain() -> RsyncUri {
        RsyncUri::parse("rsync://repo.example.net").unwrap()
    }

    fn module() -> RsyncUri {
        RsyncUri::parse("rsync://repo.example.net/repo").unwrap()
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    #[test]
    fn notification_parses_refs() {
        let snapshot = snapshot_xml(3, &[]);
        let delta = delta_xml(3, "");
        let data = notification_xml(3, &snapshot, &[(3, &delta)]);
        let parsed = parse_notification(&data).unwrap();
        assert_eq!(parsed.session_id, SESSION);
        assert_eq!(parsed.serial, 3);
        assert_eq!(parsed.deltas.len(), 1);
        assert_eq!(parsed.deltas[0].serial, 3);
    }

    #[test]
    fn notification_requires_snapshot() {
        let data = format!(
            "<notification version=\"1\" session_id=\"{SESSION}\" serial=\"1\"/>"
        );
        assert!(parse_notification(data.as_bytes()).is_err());
    }

    #[test]
    fn snapshot_parses_publishes() {
        let data = snapshot_xml(7, &[("rsync://repo.example.net/repo/a.cer", b"cert")]);
        let parsed = parse_snapshot(&data).unwrap();
        assert_eq!(parsed.serial, 7);
        assert_eq!(parsed.publishes.len(), 1);
        assert_eq!(parsed.publishes[0].data, b"cert");
    }

    #[test]
    fn base64_with_line_breaks_decodes() {
        assert_eq!(
            decode_base64_content("aGVs\n  bG8=\n").unwrap(),
            b"hello"
        );
    }

    #[test]
    fn delta_parses_publish_and_withdraw() {
        let inner = format!(
            "<publish uri=\"rsync://repo.example.net/repo/a.roa\">{}</publish>\
             <withdraw uri=\"rsync://repo.example.net/repo/b.roa\" hash=\"{}\"/>",
            b64(b"roa"),
            hash_hex(b"old"),
        );
        let parsed = parse_delta(&delta_xml(9, &inner)).unwrap();
        assert_eq!(parsed.serial, 9);
        assert_eq!(parsed.elements.len(), 2);
    }

    // -----------------------------------------------------------------------
    // Fetch behavior
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn first_fetch_takes_snapshot() {
        let snapshot = snapshot_xml(1, &[("rsync://repo.example.net/repo/a.cer", b"cert")]);
        let mut fetcher = MapFetcher::new();
        fetcher.put(
            "https://rrdp.example.net/notification.xml",
            notification_xml(1, &snapshot, &[]),
        );
        fetcher.put("https://rrdp.example.net/snapshot.xml", snapshot);

        let mut deliver = MemoryDeliver::default();
        let outcome = fetch(&notify_uri(), &domain(), &module(), None, &fetcher, &mut deliver)
            .await
            .unwrap();

        assert!(outcome.used_snapshot);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.state.serial, 1);
        assert_eq!(outcome.state.sessionid, SESSION);
        assert!(deliver
            .objects
            .contains_key("rsync://repo.example.net/repo/a.cer"));
    }

    #[tokio::test]
    async fn unchanged_serial_applies_nothing() {
        let snapshot = snapshot_xml(5, &[("rsync://repo.example.net/repo/a.cer", b"cert")]);
        let mut fetcher = MapFetcher::new();
        fetcher.put(
            "https://rrdp.example.net/notification.xml",
            notification_xml(5, &snapshot, &[]),
        );
        // Snapshot deliberately absent: it must not be fetched.

        let prior = RrdpState {
            rsync: module().as_str().to_string(),
            path: notify_uri().as_str().to_string(),
            sessionid: SESSION.to_string(),
            serial: 5,
        };
        let mut deliver = MemoryDeliver::default();
        let outcome = fetch(
            &notify_uri(),
            &domain(),
            &module(),
            Some(&prior),
            &fetcher,
            &mut deliver,
        )
        .await
        .unwrap();

        assert!(!outcome.used_snapshot);
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.state.serial, 5);
    }

    #[tokio::test]
    async fn session_rollover_forces_snapshot() {
        let snapshot = snapshot_xml(2, &[("rsync://repo.example.net/repo/a.cer", b"v2")]);
        let delta = delta_xml(2, "");
        let mut fetcher = MapFetcher::new();
        fetcher.put(
            "https://rrdp.example.net/notification.xml",
            notification_xml(2, &snapshot, &[(2, &delta)]),
        );
        fetcher.put("https://rrdp.example.net/snapshot.xml", snapshot);

        let prior = RrdpState {
            rsync: module().as_str().to_string(),
            path: notify_uri().as_str().to_string(),
            sessionid: "an-older-session".to_string(),
            serial: 1,
        };
        let mut deliver = MemoryDeliver::default();
        let outcome = fetch(
            &notify_uri(),
            &domain(),
            &module(),
            Some(&prior),
            &fetcher,
            &mut deliver,
        )
        .await
        .unwrap();

        assert!(outcome.used_snapshot, "session change must refetch snapshot");
    }

    #[tokio::test]
    async fn covered_serials_replay_deltas() {
        let publish = format!(
            "<publish uri=\"rsync://repo.example.net/repo/new.roa\">{}</publish>",
            b64(b"roa-content"),
        );
        let delta = delta_xml(6, &publish);
        let snapshot = snapshot_xml(6, &[]);
        let mut fetcher = MapFetcher::new();
        fetcher.put(
            "https://rrdp.example.net/notification.xml",
            notification_xml(6, &snapshot, &[(6, &delta)]),
        );
        fetcher.put("https://rrdp.example.net/delta-6.xml", delta);
        // Snapshot absent: delta replay must not touch it.

        let prior = RrdpState {
            rsync: module().as_str().to_string(),
            path: notify_uri().as_str().to_string(),
            sessionid: SESSION.to_string(),
            serial: 5,
        };
        let mut deliver = MemoryDeliver::default();
        let outcome = fetch(
            &notify_uri(),
            &domain(),
            &module(),
            Some(&prior),
            &fetcher,
            &mut deliver,
        )
        .await
        .unwrap();

        assert!(!outcome.used_snapshot);
        assert_eq!(outcome.delivered, 1);
        assert!(deliver
            .objects
            .contains_key("rsync://repo.example.net/repo/new.roa"));
    }

    #[tokio::test]
    async fn delta_gap_falls_back_to_snapshot() {
        let snapshot = snapshot_xml(9, &[("rsync://repo.example.net/repo/a.cer", b"v9")]);
        let delta = delta_xml(9, "");
        let mut fetcher = MapFetcher::new();
        fetcher.put(
            "https://rrdp.example.net/notification.xml",
            // Only delta 9 is published; prior serial 5 needs 6..=9.
            notification_xml(9, &snapshot, &[(9, &delta)]),
        );
        fetcher.put("https://rrdp.example.net/snapshot.xml", snapshot);

        let prior = RrdpState {
            rsync: module().as_str().to_string(),
            path: notify_uri().as_str().to_string(),
            sessionid: SESSION.to_string(),
            serial: 5,
        };
        let mut deliver = MemoryDeliver::default();
        let outcome = fetch(
            &notify_uri(),
            &domain(),
            &module(),
            Some(&prior),
            &fetcher,
            &mut deliver,
        )
        .await
        .unwrap();
        assert!(outcome.used_snapshot);
    }

    #[tokio::test]
    async fn withdraw_hash_mismatch_fails() {
        let withdraw = format!(
            "<withdraw uri=\"rsync://repo.example.net/repo/a.roa\" hash=\"{}\"/>",
            hash_hex(b"what the publisher thinks is cached"),
        );
        let delta = delta_xml(2, &withdraw);
        let snapshot = snapshot_xml(2, &[]);
        let mut fetcher = MapFetcher::new();
        fetcher.put(
            "https://rrdp.example.net/notification.xml",
            notification_xml(2, &snapshot, &[(2, &delta)]),
        );
        fetcher.put("https://rrdp.example.net/delta-2.xml", delta);

        let prior = RrdpState {
            rsync: module().as_str().to_string(),
            path: notify_uri().as_str().to_string(),
            sessionid: SESSION.to_string(),
            serial: 1,
        };
        let mut deliver = MemoryDeliver::default();
        deliver.deliver(
            &RsyncUri::parse("rsync://repo.example.net/repo/a.roa").unwrap(),
            b"what is actually cached",
            false,
        )
        .unwrap();

        let result = fetch(
            &notify_uri(),
            &domain(),
            &module(),
            Some(&prior),
            &fetcher,
            &mut deliver,
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RrdpError::HashMismatch { .. }));
        assert!(err.is_failover_eligible());
    }

    #[tokio::test]
    async fn oversized_response_is_not_failover_eligible() {
        let mut fetcher = MapFetcher::new();
        fetcher.fail(
            "https://rrdp.example.net/notification.xml",
            HttpErrorKind::TooLarge,
        );
        let mut deliver = MemoryDeliver::default();
        let err = fetch(&notify_uri(), &domain(), &module(), None, &fetcher, &mut deliver)
            .await
            .unwrap_err();
        assert!(!err.is_failover_eligible());

        let mut fetcher = MapFetcher::new();
        fetcher.fail(
            "https://rrdp.example.net/notification.xml",
            HttpErrorKind::Status(500),
        );
        let err = fetch(&notify_uri(), &domain(), &module(), None, &fetcher, &mut deliver)
            .await
            .unwrap_err();
        assert!(err.is_failover_eligible());
    }

    #[tokio::test]
    async fn outside_domain_objects_are_skipped_not_fatal() {
        let snapshot = snapshot_xml(
            1,
            &[
                ("rsync://elsewhere.example.org/repo/evil.cer", b"evil"),
                ("rsync://repo.example.net/repo/good.cer", b"good"),
            ],
        );
        let mut fetcher = MapFetcher::new();
        fetcher.put(
            "https://rrdp.example.net/notification.xml",
            notification_xml(1, &snapshot, &[]),
        );
        fetcher.put("https://rrdp.example.net/snapshot.xml", snapshot);

        let mut deliver = MemoryDeliver::default();
        let outcome = fetch(&notify_uri(), &domain(), &module(), None, &fetcher, &mut deliver)
            .await
            .unwrap();
        assert_eq!(outcome.delivered, 1);
        assert!(!deliver
            .objects
            .contains_key("rsync://elsewhere.example.org/repo/evil.cer"));
    }

    #[tokio::test]
    async fn illegal_path_refusal_skips_element() {
        let snapshot = snapshot_xml(
            1,
            &[
                ("rsync://repo.example.net/../escape", b"evil"),
                ("rsync://repo.example.net/repo/good.cer", b"good"),
            ],
        );
        let mut fetcher = MapFetcher::new();
        fetcher.put(
            "https://rrdp.example.net/notification.xml",
            notification_xml(1, &snapshot, &[]),
        );
        fetcher.put("https://rrdp.example.net/snapshot.xml", snapshot);

        let mut deliver = MemoryDeliver {
            refuse_illegal: true,
            ..MemoryDeliver::default()
        };
        let outcome = fetch(&notify_uri(), &domain(), &module(), None, &fetcher, &mut deliver)
            .await
            .unwrap();
        // The traversal attempt is refused, the endpoint still completes.
        assert_eq!(outcome.delivered, 1);
        assert!(deliver
            .objects
            .contains_key("rsync://repo.example.net/repo/good.cer"));
    }

    #[tokio::test]
    async fn corrupted_snapshot_hash_fails() {
        let snapshot = snapshot_xml(1, &[]);
        let mut tampered = snapshot.clone();
        tampered.push(b' ');
        let mut fetcher = MapFetcher::new();
        fetcher.put(
            "https://rrdp.example.net/notification.xml",
            notification_xml(1, &snapshot, &[]),
        );
        fetcher.put("https://rrdp.example.net/snapshot.xml", tampered);

        let mut deliver = MemoryDeliver::default();
        let err = fetch(&notify_uri(), &domain(), &module(), None, &fetcher, &mut deliver)
            .await
            .unwrap_err();
        assert!(matches!(err, RrdpError::HashMismatch { .. }));
    }
}
