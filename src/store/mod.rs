use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Table holding the caller-owned job records patched in integrated mode
const RECORD_TABLE: &str = "songs";

/// Blob storage capability: fetch and store named objects
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download an object's bytes
    async fn download(&self, bucket: &str, object: &str) -> Result<Bytes>;

    /// Upload an object, returning its public URL
    async fn upload(
        &self,
        bucket: &str,
        object: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<String>;
}

/// Remote job record capability: PATCH-by-id, never read back
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn patch_record(&self, record_id: &str, patch: &RecordPatch) -> Result<()>;
}

/// Status values the remote record understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Processing,
    Completed,
    Failed,
}

/// Fields patched onto the remote job record
#[derive(Debug, Clone, Serialize)]
pub struct RecordPatch {
    pub status: RecordStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl RecordPatch {
    pub fn processing() -> Self {
        Self {
            status: RecordStatus::Processing,
            public_url: None,
            duration_seconds: None,
            completed_at: None,
            log: None,
        }
    }

    pub fn completed(public_url: String, duration_seconds: Option<f64>) -> Self {
        Self {
            status: RecordStatus::Completed,
            public_url: Some(public_url),
            duration_seconds,
            completed_at: Some(Utc::now()),
            log: None,
        }
    }

    pub fn failed(log: String) -> Self {
        Self {
            status: RecordStatus::Failed,
            public_url: None,
            duration_seconds: None,
            completed_at: Some(Utc::now()),
            log: Some(log),
        }
    }
}

/// Supabase-style remote store speaking plain HTTP.
///
/// Objects live under `/storage/v1/object/<bucket>/<name>` and records are
/// patched through the REST surface at `/rest/v1/<table>?id=eq.<id>`.
pub struct HttpRemoteStore {
    base_url: String,
    service_key: String,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            service_key: service_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn object_url(&self, bucket: &str, object: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, object)
    }

    /// Public (unauthenticated) URL for an uploaded object
    fn public_url(&self, bucket: &str, object: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, bucket, object
        )
    }
}

#[async_trait]
impl ObjectStore for HttpRemoteStore {
    async fn download(&self, bucket: &str, object: &str) -> Result<Bytes> {
        let url = self.object_url(bucket, object);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .send()
            .await
            .with_context(|| format!("failed to fetch object {}/{}", bucket, object))?;

        if !response.status().is_success() {
            anyhow::bail!(
                "remote store returned HTTP {} for {}/{}",
                response.status(),
                bucket,
                object
            );
        }

        response
            .bytes()
            .await
            .context("failed to read object body")
    }

    async fn upload(
        &self,
        bucket: &str,
        object: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<String> {
        let url = self.object_url(bucket, object);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .with_context(|| format!("failed to upload object {}/{}", bucket, object))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "remote store rejected upload of {}/{}: HTTP {} {}",
                bucket,
                object,
                status,
                detail
            );
        }

        Ok(self.public_url(bucket, object))
    }
}

#[async_trait]
impl RecordStore for HttpRemoteStore {
    async fn patch_record(&self, record_id: &str, patch: &RecordPatch) -> Result<()> {
        let url = format!(
            "{}/rest/v1/{}?id=eq.{}",
            self.base_url, RECORD_TABLE, record_id
        );

        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .json(patch)
            .send()
            .await
            .with_context(|| format!("failed to patch record {}", record_id))?;

        if !response.status().is_success() {
            anyhow::bail!(
                "remote store returned HTTP {} patching record {}",
                response.status(),
                record_id
            );
        }

        Ok(())
    }
}
