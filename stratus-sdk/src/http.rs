//! HTTP transport
//!
//! reqwest-backed implementation of [`BlobberTransport`] speaking the
//! node wire protocol:
//!
//! - `POST {base}/v1/connection/create/{alloc}`: multipart, field
//!   `connection_id`
//! - `POST {base}/v1/file/upload/{alloc}`: multipart fragment stream
//! - `POST {base}/v1/connection/commit/{alloc}`: JSON commit request
//! - `POST {base}/v1/connection/rollback/{alloc}`: best-effort undo
//! - `POST {base}/writemarker/lock/{alloc}` / `.../unlock/{alloc}`
//! - `GET  {base}/v1/writemarker/latest/{alloc}`
//! - `GET  {base}/v1/file/meta|list|download/{alloc}`
//! - `POST {base}/v1/file/rename|copy|move/{alloc}`, `/v1/dir/{alloc}`
//!
//! Every request carries the allocation transaction as the auth token.
//! HTTP 429 turns into [`StratusError::RateLimited`] with the advertised
//! delay; any other non-2xx into [`StratusError::BlobberReject`] with the
//! response body as the reason.

use crate::allocation::{Allocation, Blobber};
use crate::transport::{
    BlobberTransport, CommitPayload, FileMeta, FragmentPayload, RemoteEntry,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use stratus_core::{Result, StratusError};
use tracing::debug;

const ALLOCATION_TX_HEADER: &str = "X-Allocation-Tx";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared, stateless HTTP transport. One instance serves the whole
/// process.
pub struct HttpBlobberTransport {
    client: Client,
}

impl HttpBlobberTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StratusError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn url(blobber: &Blobber, route: &str, alloc_id: &str) -> String {
        format!(
            "{}/{}/{}",
            blobber.base_url.trim_end_matches('/'),
            route,
            alloc_id
        )
    }

    async fn check(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(StratusError::RateLimited { retry_after_secs });
        }
        let reason = resp.text().await.unwrap_or_default();
        Err(StratusError::BlobberReject {
            status: status.as_u16(),
            reason,
        })
    }

    async fn post_form(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        route: &str,
        form: Form,
    ) -> Result<Response> {
        let url = Self::url(blobber, route, &alloc.id);
        let resp = self
            .client
            .post(&url)
            .header(ALLOCATION_TX_HEADER, &alloc.tx)
            .multipart(form)
            .send()
            .await
            .map_err(|e| StratusError::Transport(e.to_string()))?;
        Self::check(resp).await
    }

    async fn get(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        route: &str,
        query: &[(&str, String)],
    ) -> Result<Response> {
        let url = Self::url(blobber, route, &alloc.id);
        let resp = self
            .client
            .get(&url)
            .header(ALLOCATION_TX_HEADER, &alloc.tx)
            .query(query)
            .send()
            .await
            .map_err(|e| StratusError::Transport(e.to_string()))?;
        Self::check(resp).await
    }
}

#[derive(Deserialize)]
struct LatestMarkerResponse {
    sequence: Option<u64>,
}

#[derive(Deserialize)]
struct ListResponse {
    entries: Vec<RemoteEntry>,
}

#[async_trait]
impl BlobberTransport for HttpBlobberTransport {
    async fn create_connection(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
    ) -> Result<()> {
        debug!(node = %blobber.base_url, connection_id, "creating connection");
        let form = Form::new().text("connection_id", connection_id.to_string());
        self.post_form(alloc, blobber, "v1/connection/create", form)
            .await?;
        Ok(())
    }

    async fn upload_fragment(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        payload: &FragmentPayload,
    ) -> Result<()> {
        let form = Form::new()
            .text("connection_id", payload.connection_id.clone())
            .text("remote_path", payload.remote_path.clone())
            .text("chunk_index", payload.chunk_index.to_string())
            .text("is_final", payload.is_final.to_string())
            .part(
                "fragment",
                Part::stream(reqwest::Body::from(payload.data.clone()))
                    .file_name("fragment"),
            );
        self.post_form(alloc, blobber, "v1/file/upload", form).await?;
        Ok(())
    }

    async fn commit(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        payload: &CommitPayload,
    ) -> Result<()> {
        debug!(node = %blobber.base_url, changes = payload.changes.len(), "sending commit");
        let url = Self::url(blobber, "v1/connection/commit", &alloc.id);
        let resp = self
            .client
            .post(&url)
            .header(ALLOCATION_TX_HEADER, &alloc.tx)
            .json(payload)
            .send()
            .await
            .map_err(|e| StratusError::Transport(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn rollback(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
    ) -> Result<()> {
        let form = Form::new().text("connection_id", connection_id.to_string());
        self.post_form(alloc, blobber, "v1/connection/rollback", form)
            .await?;
        Ok(())
    }

    async fn lock_write_marker(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
    ) -> Result<()> {
        let form = Form::new().text("connection_id", connection_id.to_string());
        self.post_form(alloc, blobber, "writemarker/lock", form)
            .await?;
        Ok(())
    }

    async fn unlock_write_marker(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
    ) -> Result<()> {
        let form = Form::new().text("connection_id", connection_id.to_string());
        self.post_form(alloc, blobber, "writemarker/unlock", form)
            .await?;
        Ok(())
    }

    async fn latest_write_marker(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
    ) -> Result<Option<u64>> {
        let resp = self
            .get(alloc, blobber, "v1/writemarker/latest", &[])
            .await?;
        let body: LatestMarkerResponse = resp
            .json()
            .await
            .map_err(|e| StratusError::Serialization(e.to_string()))?;
        Ok(body.sequence)
    }

    async fn file_meta(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        remote_path: &str,
    ) -> Result<Option<FileMeta>> {
        let result = self
            .get(
                alloc,
                blobber,
                "v1/file/meta",
                &[("path", remote_path.to_string())],
            )
            .await;
        match result {
            Ok(resp) => {
                let meta: FileMeta = resp
                    .json()
                    .await
                    .map_err(|e| StratusError::Serialization(e.to_string()))?;
                Ok(Some(meta))
            }
            Err(StratusError::BlobberReject { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_dir(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        remote_path: &str,
    ) -> Result<Vec<RemoteEntry>> {
        let resp = self
            .get(
                alloc,
                blobber,
                "v1/file/list",
                &[("path", remote_path.to_string())],
            )
            .await?;
        let body: ListResponse = resp
            .json()
            .await
            .map_err(|e| StratusError::Serialization(e.to_string()))?;
        Ok(body.entries)
    }

    async fn download_fragment(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        remote_path: &str,
        chunk_index: u32,
    ) -> Result<Bytes> {
        let resp = self
            .get(
                alloc,
                blobber,
                "v1/file/download",
                &[
                    ("path", remote_path.to_string()),
                    ("chunk_index", chunk_index.to_string()),
                ],
            )
            .await?;
        resp.bytes()
            .await
            .map_err(|e| StratusError::Transport(e.to_string()))
    }

    async fn delete_file(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
        remote_path: &str,
    ) -> Result<()> {
        let url = Self::url(blobber, "v1/file", &alloc.id);
        let resp = self
            .client
            .delete(&url)
            .header(ALLOCATION_TX_HEADER, &alloc.tx)
            .query(&[("path", remote_path), ("connection_id", connection_id)])
            .send()
            .await
            .map_err(|e| StratusError::Transport(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn rename_file(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
        remote_path: &str,
        new_name: &str,
    ) -> Result<()> {
        let form = Form::new()
            .text("connection_id", connection_id.to_string())
            .text("path", remote_path.to_string())
            .text("new_name", new_name.to_string());
        self.post_form(alloc, blobber, "v1/file/rename", form).await?;
        Ok(())
    }

    async fn copy_file(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
        remote_path: &str,
        destination: &str,
    ) -> Result<()> {
        let form = Form::new()
            .text("connection_id", connection_id.to_string())
            .text("path", remote_path.to_string())
            .text("dest", destination.to_string());
        self.post_form(alloc, blobber, "v1/file/copy", form).await?;
        Ok(())
    }

    async fn move_file(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
        remote_path: &str,
        destination: &str,
    ) -> Result<()> {
        let form = Form::new()
            .text("connection_id", connection_id.to_string())
            .text("path", remote_path.to_string())
            .text("dest", destination.to_string());
        self.post_form(alloc, blobber, "v1/file/move", form).await?;
        Ok(())
    }

    async fn create_dir(
        &self,
        alloc: &Allocation,
        blobber: &Blobber,
        connection_id: &str,
        remote_path: &str,
    ) -> Result<()> {
        let form = Form::new()
            .text("connection_id", connection_id.to_string())
            .text("path", remote_path.to_string());
        self.post_form(alloc, blobber, "v1/dir", form).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobber(url: &str) -> Blobber {
        Blobber {
            index: 0,
            base_url: url.to_string(),
            public_key: Vec::new(),
        }
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let b = blobber("http://node.example.com/");
        assert_eq!(
            HttpBlobberTransport::url(&b, "v1/connection/create", "alloc-1"),
            "http://node.example.com/v1/connection/create/alloc-1"
        );
    }

    #[test]
    fn test_client_builds() {
        assert!(HttpBlobberTransport::new().is_ok());
    }
}
