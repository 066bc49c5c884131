//! The reqwest-backed HTTP fetcher.
//!
//! One client serves both RRDP documents and TAL root certificates: a
//! per-request timeout, the configured User-Agent, and a streaming size
//! cap that classifies oversized bodies as the non-failover
//! [`HttpError::TooLarge`].

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rpval_core::fetch::{HttpError, HttpFetcher};
use rpval_core::uri::HttpsUri;

/// A shared HTTP client with a response-size cap.
#[derive(Clone, Debug)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
    max_response: u64,
}

impl ReqwestFetcher {
    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns the underlying builder error when TLS initialization
    /// fails.
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        max_response: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            max_response,
        })
    }
}

impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, uri: &HttpsUri) -> Result<Bytes, HttpError> {
        let response = self
            .client
            .get(uri.as_str())
            .send()
            .await
            .map_err(|e| HttpError::Transport {
                uri: uri.as_str().to_string(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                uri: uri.as_str().to_string(),
                status: status.as_u16(),
            });
        }

        // Reject early on a declared length, then enforce the cap while
        // streaming in case the declaration lied.
        if let Some(length) = response.content_length() {
            if length > self.max_response {
                return Err(HttpError::TooLarge {
                    uri: uri.as_str().to_string(),
                    limit: self.max_response,
                });
            }
        }

        let mut body = BytesMut::new();
        let mut response = response;
        while let Some(chunk) = response.chunk().await.map_err(|e| HttpError::Transport {
            uri: uri.as_str().to_string(),
            detail: e.to_string(),
        })? {
            if (body.len() as u64).saturating_add(chunk.len() as u64) > self.max_response {
                return Err(HttpError::TooLarge {
                    uri: uri.as_str().to_string(),
                    limit: self.max_response,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}
