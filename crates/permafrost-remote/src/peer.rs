//! HTTP client for the peer storage-node API.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use permafrost_model::DataObjectId;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};

/// Client for downloading objects from peers and probing their existence.
///
/// Downloads stream to a caller-chosen path with an incremental content-hash
/// check; probes are lightweight `HEAD` requests. Both are bounded by their
/// own timeout so a hung peer cannot stall a worker indefinitely.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    download_timeout: Duration,
    probe_timeout: Duration,
}

impl PeerClient {
    /// Build a client with the given per-request timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(download_timeout: Duration, probe_timeout: Duration) -> RemoteResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|source| RemoteError::Http {
                operation: "client.build",
                url: String::new(),
                source,
            })?;
        Ok(Self {
            http,
            download_timeout,
            probe_timeout,
        })
    }

    /// Stream an object from a peer to `dest`, verifying its content hash.
    ///
    /// Returns the number of bytes written. The destination file is left in
    /// place on success and on failure alike; callers own temp-file cleanup.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures, non-success status codes,
    /// local IO failures, or when the received bytes hash to something other
    /// than `expected_hash`.
    pub async fn download_object(
        &self,
        operator_url: &str,
        id: DataObjectId,
        dest: &Path,
        expected_hash: &str,
    ) -> RemoteResult<u64> {
        let url = object_url(operator_url, id);
        let response = self
            .http
            .get(&url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|source| RemoteError::Http {
                operation: "download.request",
                url: url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(RemoteError::UnexpectedStatus {
                operation: "download.request",
                url,
                status: response.status().as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|source| RemoteError::io("download.create", dest, source))?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| RemoteError::Http {
                operation: "download.stream",
                url: url.clone(),
                source,
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|source| RemoteError::io("download.write", dest, source))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|source| RemoteError::io("download.flush", dest, source))?;

        let actual = hex::encode(hasher.finalize());
        if actual != expected_hash {
            return Err(RemoteError::HashMismatch {
                url,
                expected: expected_hash.to_string(),
                actual,
            });
        }
        debug!(object_id = %id, bytes = written, "object downloaded");
        Ok(written)
    }

    /// Probe whether a peer currently serves the object (`HEAD`).
    ///
    /// # Errors
    ///
    /// Returns an error only on transport failures; a non-success status is
    /// reported as `Ok(false)`.
    pub async fn probe_object(&self, operator_url: &str, id: DataObjectId) -> RemoteResult<bool> {
        let url = object_url(operator_url, id);
        let response = self
            .http
            .head(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|source| RemoteError::Http {
                operation: "probe.request",
                url,
                source,
            })?;
        Ok(response.status().is_success())
    }
}

fn object_url(operator_url: &str, id: DataObjectId) -> String {
    format!("{}/files/{id}", operator_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Path as RoutePath;
    use axum::http::StatusCode;
    use axum::routing::get;
    use sha2::{Digest, Sha256};

    const PAYLOAD: &[u8] = b"permafrost test payload";

    async fn serve_fixture() -> String {
        let app = Router::new().route(
            "/files/{id}",
            get(|RoutePath(id): RoutePath<String>| async move {
                if id == "1" {
                    Ok(PAYLOAD.to_vec())
                } else {
                    Err(StatusCode::NOT_FOUND)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn payload_hash() -> String {
        hex::encode(Sha256::digest(PAYLOAD))
    }

    #[tokio::test]
    async fn download_verifies_the_content_hash() {
        let base = serve_fixture().await;
        let dir = tempfile::Builder::new()
            .prefix("permafrost-peer-")
            .tempdir()
            .expect("tempdir");
        let dest = dir.path().join("1.tmp");

        let client =
            PeerClient::new(Duration::from_secs(5), Duration::from_secs(1)).expect("client");
        let written = client
            .download_object(&base, DataObjectId::new(1), &dest, &payload_hash())
            .await
            .expect("download");
        assert_eq!(written, PAYLOAD.len() as u64);
        assert_eq!(std::fs::read(&dest).expect("read"), PAYLOAD);
    }

    #[tokio::test]
    async fn mismatched_hash_is_rejected() {
        let base = serve_fixture().await;
        let dir = tempfile::Builder::new()
            .prefix("permafrost-peer-")
            .tempdir()
            .expect("tempdir");
        let dest = dir.path().join("1.tmp");

        let client =
            PeerClient::new(Duration::from_secs(5), Duration::from_secs(1)).expect("client");
        let err = client
            .download_object(&base, DataObjectId::new(1), &dest, "deadbeef")
            .await
            .expect_err("hash mismatch");
        assert!(matches!(err, RemoteError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn probe_reports_presence_and_absence() {
        let base = serve_fixture().await;
        let client =
            PeerClient::new(Duration::from_secs(5), Duration::from_secs(1)).expect("client");
        assert!(
            client
                .probe_object(&base, DataObjectId::new(1))
                .await
                .expect("probe")
        );
        assert!(
            !client
                .probe_object(&base, DataObjectId::new(2))
                .await
                .expect("probe")
        );
    }
}
