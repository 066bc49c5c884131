//! DER/CMS/X.509 decoding for the RPKI object profiles.
//!
//! Each submodule owns one object type: [`cert`] for CA and EE
//! certificates, [`crl`] for revocation lists, [`sigobj`] for the CMS
//! envelope shared by [`mft`] manifests and [`roa`] route origin
//! attestations, and [`tal`] for the trust-anchor-locator text format.
//! [`resources`] implements the RFC 3779 IP and AS resource sets and
//! their containment algebra; [`x509`] holds the pieces shared by
//! certificates and CRLs (times, algorithm identifiers, public keys).
//!
//! Decoders work on [`bytes::Bytes`] and never panic on hostile input:
//! every malformed structure surfaces as an [`ObjectError`].

use thiserror::Error;

pub mod cert;
pub mod crl;
pub mod mft;
pub mod oid;
pub mod resources;
pub mod roa;
pub mod sigobj;
pub mod tal;
pub mod x509;

/// Errors from object decoding and cryptographic verification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ObjectError {
    /// The input could not be parsed as the expected structure.
    #[error("malformed {what}: {detail}")]
    Malformed {
        /// The object or field being decoded.
        what: &'static str,
        /// Parser diagnostic.
        detail: String,
    },

    /// The object is well-formed but uses a construct outside the RPKI
    /// profile (unknown critical extension, foreign algorithm, wrong
    /// content type).
    #[error("unsupported profile in {what}: {detail}")]
    UnknownProfile {
        /// The object or field being decoded.
        what: &'static str,
        /// What was encountered.
        detail: String,
    },

    /// A cryptographic signature or digest did not verify.
    #[error("invalid signature on {what}")]
    SignatureInvalid {
        /// The object whose signature failed.
        what: &'static str,
    },
}

impl ObjectError {
    /// Wraps a bcder decode error as [`ObjectError::Malformed`].
    pub(crate) fn malformed<E: std::fmt::Display>(what: &'static str, err: E) -> Self {
        Self::Malformed {
            what,
            detail: err.to_string(),
        }
    }

    /// Builds an [`ObjectError::UnknownProfile`].
    pub(crate) fn profile(what: &'static str, detail: impl Into<String>) -> Self {
        Self::UnknownProfile {
            what,
            detail: detail.into(),
        }
    }
}
