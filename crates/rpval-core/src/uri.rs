//! Typed wrappers for the two URI schemes the RPKI uses.
//!
//! Repository publication points are addressed by `rsync://` URIs; RRDP
//! notification documents live behind HTTP(S) URIs. Both are kept as
//! validated newtypes so the fetch maps in the orchestrator cannot mix
//! them up, and so path logic (module extraction, containment) lives in
//! one place instead of being re-derived from strings at every call site.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from URI validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    /// The URI does not carry the expected scheme.
    #[error("unexpected scheme in {uri}")]
    BadScheme {
        /// The offending URI string.
        uri: String,
    },

    /// The URI has no authority (host) component.
    #[error("missing authority in {uri}")]
    MissingAuthority {
        /// The offending URI string.
        uri: String,
    },

    /// The URI contains characters outside the visible-ASCII range.
    #[error("illegal character in {uri}")]
    IllegalCharacter {
        /// The offending URI string.
        uri: String,
    },
}

/// An `rsync://` URI identifying a repository object or subtree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RsyncUri(String);

const RSYNC_SCHEME: &str = "rsync://";

impl RsyncUri {
    /// Parses and validates an `rsync://` URI.
    ///
    /// # Errors
    ///
    /// Returns [`UriError`] if the scheme is not `rsync://`, the authority
    /// is empty, or the string contains control or non-ASCII characters.
    pub fn parse(s: &str) -> Result<Self, UriError> {
        if !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(UriError::IllegalCharacter { uri: s.into() });
        }
        let rest = s.strip_prefix(RSYNC_SCHEME).ok_or_else(|| UriError::BadScheme {
            uri: s.into(),
        })?;
        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return Err(UriError::MissingAuthority { uri: s.into() });
        }
        Ok(Self(s.trim_end_matches('/').to_string()))
    }

    /// The full URI string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host part, e.g. `rpki.example.net` for
    /// `rsync://rpki.example.net/repo/a.cer`.
    #[must_use]
    pub fn authority(&self) -> &str {
        self.0[RSYNC_SCHEME.len()..]
            .split('/')
            .next()
            .unwrap_or("")
    }

    /// Everything after the scheme: `<host>/<path…>`. This is the relative
    /// form the cache mapper appends to its base directory.
    #[must_use]
    pub fn relative_path(&self) -> &str {
        &self.0[RSYNC_SCHEME.len()..]
    }

    /// The host-level URI, `rsync://<host>`.
    #[must_use]
    pub fn domain(&self) -> RsyncUri {
        RsyncUri(format!("{RSYNC_SCHEME}{}", self.authority()))
    }

    /// The module-level URI, `rsync://<host>/<first-segment>`.
    ///
    /// Rsync fetching happens per module: syncing the module directory
    /// covers every publication point beneath it.
    #[must_use]
    pub fn module(&self) -> RsyncUri {
        let mut segments = self.0[RSYNC_SCHEME.len()..].splitn(3, '/');
        let host = segments.next().unwrap_or("");
        match segments.next() {
            Some(module) if !module.is_empty() => {
                RsyncUri(format!("{RSYNC_SCHEME}{host}/{module}"))
            }
            _ => RsyncUri(format!("{RSYNC_SCHEME}{host}")),
        }
    }

    /// Appends a file name (or relative path) to this URI.
    #[must_use]
    pub fn join(&self, name: &str) -> RsyncUri {
        RsyncUri(format!("{}/{}", self.0, name.trim_start_matches('/')))
    }

    /// Whether `other` lies underneath this URI on a path-segment boundary.
    ///
    /// `rsync://h/a` contains `rsync://h/a/b.cer` but not `rsync://h/ab`.
    #[must_use]
    pub fn contains(&self, other: &RsyncUri) -> bool {
        other.0 == self.0
            || other
                .0
                .strip_prefix(&self.0)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for RsyncUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An `https://` (or, tolerated, `http://`) URI for RRDP documents and
/// TAL certificate downloads.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HttpsUri(String);

impl HttpsUri {
    /// Parses and validates an HTTP(S) URI.
    ///
    /// # Errors
    ///
    /// Returns [`UriError`] on a foreign scheme, empty authority, or
    /// non-ASCII content.
    pub fn parse(s: &str) -> Result<Self, UriError> {
        if !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(UriError::IllegalCharacter { uri: s.into() });
        }
        let rest = s
            .strip_prefix("https://")
            .or_else(|| s.strip_prefix("http://"))
            .ok_or_else(|| UriError::BadScheme { uri: s.into() })?;
        if rest.split('/').next().unwrap_or("").is_empty() {
            return Err(UriError::MissingAuthority { uri: s.into() });
        }
        Ok(Self(s.to_string()))
    }

    /// The full URI string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves a possibly relative reference against this URI's directory.
    ///
    /// RRDP notification files may reference snapshots and deltas with
    /// relative paths; absolute references are returned unchanged.
    #[must_use]
    pub fn resolve(&self, reference: &str) -> HttpsUri {
        if reference.starts_with("https://") || reference.starts_with("http://") {
            return HttpsUri(reference.to_string());
        }
        let dir = match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        };
        HttpsUri(format!("{dir}/{}", reference.trim_start_matches('/')))
    }
}

impl fmt::Display for HttpsUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
