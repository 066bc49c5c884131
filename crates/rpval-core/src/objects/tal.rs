//! Trust Anchor Locators (RFC 8630).
//!
//! A TAL is a small text file: optional `#` comment lines, one or more
//! URIs for the root certificate, a blank line, then the base64-encoded
//! `SubjectPublicKeyInfo` the fetched certificate must match byte for
//! byte.

use base64::Engine as _;
use bytes::Bytes;
use thiserror::Error;

use crate::uri::{HttpsUri, RsyncUri};

/// Errors from TAL parsing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TalError {
    /// The file is not valid UTF-8.
    #[error("TAL is not UTF-8 text")]
    NotText,

    /// No usable certificate URI was found.
    #[error("TAL carries no certificate URI")]
    NoUri,

    /// A URI line failed to parse under either scheme.
    #[error("unusable TAL URI: {uri}")]
    BadUri {
        /// The offending line.
        uri: String,
    },

    /// The key section failed to decode as base64.
    #[error("TAL key is not valid base64: {detail}")]
    BadKey {
        /// Decoder diagnostic.
        detail: String,
    },
}

/// One candidate location of the root certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TalUri {
    /// Fetch over HTTPS.
    Https(HttpsUri),
    /// Fetch over rsync.
    Rsync(RsyncUri),
}

/// A parsed trust anchor locator.
#[derive(Clone, Debug)]
pub struct Tal {
    uris: Vec<TalUri>,
    key: Bytes,
}

impl Tal {
    /// Parses the TAL text format.
    ///
    /// # Errors
    ///
    /// Any [`TalError`].
    pub fn parse(data: &[u8]) -> Result<Self, TalError> {
        let text = std::str::from_utf8(data).map_err(|_| TalError::NotText)?;

        let mut uris = Vec::new();
        let mut key_b64 = String::new();
        let mut in_key = false;
        for line in text.lines() {
            let line = line.trim();
            if in_key {
                key_b64.push_str(line);
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            if line.is_empty() {
                // The first blank line after the comments ends the URI
                // section; everything below it is the key.
                in_key = true;
                continue;
            }
            let uri = if line.starts_with("rsync://") {
                TalUri::Rsync(
                    RsyncUri::parse(line).map_err(|_| TalError::BadUri { uri: line.into() })?,
                )
            } else {
                TalUri::Https(
                    HttpsUri::parse(line).map_err(|_| TalError::BadUri { uri: line.into() })?,
                )
            };
            uris.push(uri);
        }

        if uris.is_empty() {
            return Err(TalError::NoUri);
        }
        let key = base64::engine::general_purpose::STANDARD
            .decode(&key_b64)
            .map_err(|err| TalError::BadKey {
                detail: err.to_string(),
            })?;
        if key.is_empty() {
            return Err(TalError::BadKey {
                detail: "empty key".into(),
            });
        }
        Ok(Self {
            uris,
            key: Bytes::from(key),
        })
    }

    /// All candidate URIs in file order.
    #[must_use]
    pub fn uris(&self) -> &[TalUri] {
        &self.uris
    }

    /// The HTTPS candidates, in file order.
    pub fn https_uris(&self) -> impl Iterator<Item = &HttpsUri> {
        self.uris.iter().filter_map(|u| match u {
            TalUri::Https(uri) => Some(uri),
            TalUri::Rsync(_) => None,
        })
    }

    /// The first rsync candidate, if any.
    #[must_use]
    pub fn rsync_uri(&self) -> Option<&RsyncUri> {
        self.uris.iter().find_map(|u| match u {
            TalUri::Rsync(uri) => Some(uri),
            TalUri::Https(_) => None,
        })
    }

    /// The expected `SubjectPublicKeyInfo`, DER-encoded.
    #[must_use]
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Whether a certificate's SPKI equals the pinned key.
    #[must_use]
    pub fn key_matches(&self, spki_der: &Bytes) -> bool {
        *spki_der == self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = "\
# Example trust anchor
https://tals.example.net/root.cer
rsync://tals.example.net/repo/root.cer

MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA0Zt0
mbp1DUmwabL/xM3H
";

    #[test]
    fn parses_uris_and_key() {
        let tal = Tal::parse(EXAMPLE.as_bytes()).unwrap();
        assert_eq!(tal.uris().len(), 2);
        assert_eq!(tal.https_uris().count(), 1);
        assert_eq!(
            tal.rsync_uri().unwrap().as_str(),
            "rsync://tals.example.net/repo/root.cer"
        );
        // Key is the base64 payload with line breaks removed.
        assert!(!tal.key().is_empty());
    }

    #[test]
    fn key_match_is_byte_exact() {
        let tal = Tal::parse(EXAMPLE.as_bytes()).unwrap();
        let key = tal.key().clone();
        assert!(tal.key_matches(&key));
        let mut other = key.to_vec();
        other[0] ^= 0xff;
        assert!(!tal.key_matches(&Bytes::from(other)));
    }

    #[test]
    fn rejects_missing_uri() {
        let result = Tal::parse(b"# only comments\n\nAAAA\n");
        assert!(matches!(result, Err(TalError::NoUri)));
    }

    #[test]
    fn rejects_bad_base64() {
        let result = Tal::parse(b"rsync://h/root.cer\n\n!!!not-base64!!!\n");
        assert!(matches!(result, Err(TalError::BadKey { .. })));
    }

    #[test]
    fn rejects_binary_input() {
        let result = Tal::parse(&[0xff, 0xfe, 0x00]);
        assert!(matches!(result, Err(TalError::NotText)));
    }

    #[test]
    fn rejects_unusable_uri_line() {
        let result = Tal::parse(b"ftp://h/root.cer\n\nAAAA\n");
        assert!(matches!(result, Err(TalError::BadUri { .. })));
    }
}
