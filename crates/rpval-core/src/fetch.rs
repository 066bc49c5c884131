//! The fetcher seams between the engine and its transports.
//!
//! The validator only ever reads the local cache, so its seam is the
//! synchronous [`Fetcher`]. The RRDP client and the TAL stage need the
//! network; their seam is the async [`HttpFetcher`], implemented over
//! reqwest in the daemon and over an in-memory map in tests.

use bytes::Bytes;
use thiserror::Error;

use crate::cache::{Cache, CacheError};
use crate::uri::{HttpsUri, RsyncUri};

/// Read access to repository objects by URI.
pub trait Fetcher {
    /// Reads the object at `uri`.
    ///
    /// # Errors
    ///
    /// [`CacheError`] when the object is missing or unreadable.
    fn open(&self, uri: &RsyncUri) -> Result<Bytes, CacheError>;

    /// Lists the file names directly at a publication point.
    ///
    /// # Errors
    ///
    /// [`CacheError`] when the directory cannot be read.
    fn list(&self, uri: &RsyncUri) -> Result<Vec<String>, CacheError>;
}

impl Fetcher for Cache {
    fn open(&self, uri: &RsyncUri) -> Result<Bytes, CacheError> {
        self.read(uri)
    }

    fn list(&self, uri: &RsyncUri) -> Result<Vec<String>, CacheError> {
        self.list_dir(uri)
    }
}

/// Errors from HTTP fetching.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HttpError {
    /// The response body exceeded the configured cap.
    ///
    /// Deliberately distinct from the transport errors: an oversized
    /// response is never failed over to rsync, since mirroring a hostile
    /// payload over another transport helps nobody.
    #[error("response for {uri} exceeds {limit} bytes")]
    TooLarge {
        /// The requested URI.
        uri: String,
        /// The configured cap.
        limit: u64,
    },

    /// A non-success status code.
    #[error("{uri} replied with status {status}")]
    Status {
        /// The requested URI.
        uri: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Connection, TLS, timeout or body-read failure.
    #[error("transport failure for {uri}: {detail}")]
    Transport {
        /// The requested URI.
        uri: String,
        /// Client diagnostic.
        detail: String,
    },
}

impl HttpError {
    /// Whether this failure may be recovered by falling back to rsync.
    #[must_use]
    pub fn is_failover_eligible(&self) -> bool {
        !matches!(self, Self::TooLarge { .. })
    }
}

/// Async HTTP GET with a response-size cap.
pub trait HttpFetcher {
    /// Fetches the body at `uri`, enforcing the implementation's size cap.
    ///
    /// # Errors
    ///
    /// Any [`HttpError`].
    fn get(
        &self,
        uri: &HttpsUri,
    ) -> impl std::future::Future<Output = Result<Bytes, HttpError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_large_is_not_failover_eligible() {
        let err = HttpError::TooLarge {
            uri: "https://x/notification.xml".into(),
            limit: 10,
        };
        assert!(!err.is_failover_eligible());

        let err = HttpError::Status {
            uri: "https://x/notification.xml".into(),
            status: 500,
        };
        assert!(err.is_failover_eligible());

        let err = HttpError::Transport {
            uri: "https://x/notification.xml".into(),
            detail: "timeout".into(),
        };
        assert!(err.is_failover_eligible());
    }
}
