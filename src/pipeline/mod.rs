use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::extract::{AudioExtractor, ExtractError};
use crate::registry::{ExternalRef, Outcome, TokenRegistry, TransitionResult};
use crate::store::{ObjectStore, RecordPatch, RecordStore};
use crate::vault::VaultSync;
use crate::JobError;

/// Remote-store collaborators used in integrated mode
pub struct Integration {
    pub objects: Arc<dyn ObjectStore>,
    pub records: Arc<dyn RecordStore>,
    pub audio_bucket: String,
}

/// Orchestrates one extraction job from submission to a terminal registry
/// state.
///
/// Submission registers a Pending token and returns immediately; the job
/// itself runs on a spawned task behind the concurrency gate. Step order
/// within a job: acquire gate, mark the remote record PROCESSING (integrated
/// mode), refresh credentials if implausible, extract, upload + mark
/// COMPLETED (integrated mode), transition the registry. The gate permit is
/// held for the task scope, so it is released on every exit path.
pub struct Pipeline {
    registry: Arc<TokenRegistry>,
    extractor: Arc<dyn AudioExtractor>,
    vault: Arc<VaultSync>,
    gate: Arc<Semaphore>,
    download_dir: PathBuf,
    integration: Option<Integration>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<TokenRegistry>,
        extractor: Arc<dyn AudioExtractor>,
        vault: Arc<VaultSync>,
        max_concurrent: usize,
        download_dir: PathBuf,
        integration: Option<Integration>,
    ) -> Self {
        Self {
            registry,
            extractor,
            vault,
            gate: Arc::new(Semaphore::new(max_concurrent)),
            download_dir,
            integration,
        }
    }

    /// Register a job and spawn its background task, returning the token
    pub fn submit(self: &Arc<Self>, url: String, external_ref: Option<ExternalRef>) -> String {
        let token = self.registry.create(external_ref.clone());
        tracing::info!(token = %token, url = %url, "job accepted");

        let pipeline = self.clone();
        let job_token = token.clone();
        tokio::spawn(async move {
            pipeline.run_job(job_token, url, external_ref).await;
        });

        token
    }

    async fn run_job(self: Arc<Self>, token: String, url: String, external_ref: Option<ExternalRef>) {
        // Owned permit: released when the task scope ends, whatever happened.
        let _permit = match self.gate.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // Semaphore closed; only possible during shutdown.
                self.registry
                    .transition(&token, Outcome::Failed("service shutting down".to_string()));
                return;
            }
        };

        tracing::debug!(token = %token, "gate acquired, starting extraction");
        let result = self.execute(&url, external_ref.as_ref()).await;

        match result {
            Ok(artifact) => {
                match self.registry.transition(&token, Outcome::Ready(artifact.clone())) {
                    TransitionResult::Transitioned => {
                        tracing::info!(token = %token, artifact = %artifact.display(), "job ready");
                    }
                    TransitionResult::Evicted => {
                        // Lost the race against the sweeper: nobody can claim
                        // this artifact anymore, so remove it now.
                        tracing::warn!(token = %token, "token evicted mid-job, discarding artifact");
                        remove_artifact(&artifact).await;
                    }
                    TransitionResult::AlreadyTerminal => {
                        tracing::error!(token = %token, "duplicate terminal transition ignored");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(token = %token, error = %err, "job failed");
                if let (Some(integration), Some(external_ref)) =
                    (&self.integration, external_ref.as_ref())
                {
                    if let Err(e) = integration
                        .records
                        .patch_record(&external_ref.record_id, &RecordPatch::failed(err.to_string()))
                        .await
                    {
                        tracing::error!(error = %e, "failed to mark remote record FAILED");
                    }
                }
                self.registry.transition(&token, Outcome::Failed(err.to_string()));
            }
        }
    }

    async fn execute(
        &self,
        url: &str,
        external_ref: Option<&ExternalRef>,
    ) -> Result<PathBuf, JobError> {
        if let (Some(integration), Some(external_ref)) = (&self.integration, external_ref) {
            // Best effort; the job itself does not depend on this marker.
            if let Err(e) = integration
                .records
                .patch_record(&external_ref.record_id, &RecordPatch::processing())
                .await
            {
                tracing::warn!(error = %e, "failed to mark remote record PROCESSING");
            }
        }

        self.vault.ensure_plausible().await;
        let cookie_file = self.vault.cookie_file_if_plausible();

        let artifact = self
            .extractor
            .extract(url, cookie_file.as_deref(), &self.download_dir)
            .await
            .map_err(|e| match e {
                ExtractError::AuthRejected(detail) => JobError::AuthRejected(detail),
                other => JobError::Extraction(other.to_string()),
            })?;

        if let (Some(integration), Some(external_ref)) = (&self.integration, external_ref) {
            if let Err(err) = self
                .upload_and_complete(integration, external_ref, url, &artifact, cookie_file.as_deref())
                .await
            {
                // The job is failed as a whole; a locally extracted file with
                // no remote counterpart would mislead the record's owner.
                remove_artifact(&artifact).await;
                return Err(err);
            }
        }

        Ok(artifact)
    }

    async fn upload_and_complete(
        &self,
        integration: &Integration,
        external_ref: &ExternalRef,
        url: &str,
        artifact: &PathBuf,
        cookie_file: Option<&std::path::Path>,
    ) -> Result<(), JobError> {
        let duration = self.extractor.probe_duration(url, cookie_file).await;

        let object = format!(
            "{}/{}_{}.mp3",
            external_ref.user_id,
            external_ref.record_id,
            Utc::now().timestamp_millis()
        );

        let body = tokio::fs::read(artifact)
            .await
            .map_err(|e| JobError::StorageUpload(format!("failed to read artifact: {}", e)))?;

        let public_url = integration
            .objects
            .upload(&integration.audio_bucket, &object, body.into(), "audio/mpeg")
            .await
            .map_err(|e| JobError::StorageUpload(e.to_string()))?;

        tracing::info!(object = %object, "artifact uploaded");

        integration
            .records
            .patch_record(
                &external_ref.record_id,
                &RecordPatch::completed(public_url, duration),
            )
            .await
            .map_err(|e| JobError::StorageUpload(format!("record update failed: {}", e)))?;

        Ok(())
    }
}

async fn remove_artifact(path: &PathBuf) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::error!(path = %path.display(), error = %e, "failed to delete artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JobState;
    use crate::store::RecordStatus;
    use anyhow::Result;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    /// Extractor double that writes a real file and records its concurrency
    struct FakeExtractor {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        hold: Duration,
        fail_with: Option<ExtractError>,
    }

    impl FakeExtractor {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                hold: Duration::from_millis(30),
                fail_with: None,
            })
        }

        fn failing(error: ExtractError) -> Arc<Self> {
            Arc::new(Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                hold: Duration::from_millis(5),
                fail_with: Some(error),
            })
        }

        fn max_observed(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AudioExtractor for FakeExtractor {
        async fn extract(
            &self,
            _url: &str,
            _cookie_file: Option<&Path>,
            output_dir: &Path,
        ) -> Result<PathBuf, ExtractError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(error) = &self.fail_with {
                return Err(match error {
                    ExtractError::AuthRejected(d) => ExtractError::AuthRejected(d.clone()),
                    ExtractError::Engine(d) => ExtractError::Engine(d.clone()),
                    ExtractError::NoOutput => ExtractError::NoOutput,
                    ExtractError::Spawn(_) => ExtractError::NoOutput,
                });
            }

            let path = output_dir.join(format!("{}.mp3", Uuid::new_v4()));
            fs_err::write(&path, b"ID3 fake audio").unwrap();
            Ok(path)
        }

        async fn probe_duration(&self, _url: &str, _cookie_file: Option<&Path>) -> Option<f64> {
            Some(212.0)
        }
    }

    struct FakeObjects {
        fail_upload: bool,
    }

    #[async_trait]
    impl ObjectStore for FakeObjects {
        async fn download(&self, _bucket: &str, _object: &str) -> Result<Bytes> {
            anyhow::bail!("not used")
        }

        async fn upload(
            &self,
            bucket: &str,
            object: &str,
            _body: Bytes,
            _content_type: &str,
        ) -> Result<String> {
            if self.fail_upload {
                anyhow::bail!("bucket quota exceeded");
            }
            Ok(format!("https://cdn.example/{}/{}", bucket, object))
        }
    }

    #[derive(Default)]
    struct FakeRecords {
        patches: Mutex<Vec<(String, RecordStatus)>>,
    }

    #[async_trait]
    impl RecordStore for FakeRecords {
        async fn patch_record(&self, record_id: &str, patch: &RecordPatch) -> Result<()> {
            self.patches
                .lock()
                .unwrap()
                .push((record_id.to_string(), patch.status));
            Ok(())
        }
    }

    fn pipeline_with(
        extractor: Arc<dyn AudioExtractor>,
        capacity: usize,
        dir: &TempDir,
        integration: Option<Integration>,
    ) -> (Arc<Pipeline>, Arc<TokenRegistry>) {
        let registry = Arc::new(TokenRegistry::new());
        let vault = Arc::new(VaultSync::unconfigured(dir.path().join("cookies.txt")));
        let pipeline = Arc::new(Pipeline::new(
            registry.clone(),
            extractor,
            vault,
            capacity,
            dir.path().to_path_buf(),
            integration,
        ));
        (pipeline, registry)
    }

    async fn wait_for_terminal(registry: &TokenRegistry, token: &str) -> JobState {
        for _ in 0..200 {
            match registry.get(token) {
                Some(view) if view.state != JobState::Pending => return view.state,
                Some(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                None => panic!("token disappeared while waiting for terminal state"),
            }
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_returns_pending_token_immediately() {
        let dir = TempDir::new().unwrap();
        let (pipeline, registry) = pipeline_with(FakeExtractor::ok(), 1, &dir, None);

        let token = pipeline.submit("https://example.com/video1".to_string(), None);
        // Observable as Pending right away; extraction happens in background.
        assert!(matches!(
            registry.get(&token),
            Some(view) if view.state == JobState::Pending || matches!(view.state, JobState::Ready { .. })
        ));

        let state = wait_for_terminal(&registry, &token).await;
        assert!(matches!(state, JobState::Ready { .. }));
    }

    #[tokio::test]
    async fn gate_capacity_one_serializes_extractions() {
        let dir = TempDir::new().unwrap();
        let extractor = FakeExtractor::ok();
        let (pipeline, registry) = pipeline_with(extractor.clone(), 1, &dir, None);

        let tokens: Vec<String> = (0..4)
            .map(|i| pipeline.submit(format!("https://example.com/video{}", i), None))
            .collect();

        for token in &tokens {
            let state = wait_for_terminal(&registry, token).await;
            assert!(matches!(state, JobState::Ready { .. }));
        }
        assert_eq!(extractor.max_observed(), 1);
    }

    #[tokio::test]
    async fn gate_capacity_two_allows_two_in_flight() {
        let dir = TempDir::new().unwrap();
        let extractor = FakeExtractor::ok();
        let (pipeline, registry) = pipeline_with(extractor.clone(), 2, &dir, None);

        let tokens: Vec<String> = (0..6)
            .map(|i| pipeline.submit(format!("https://example.com/video{}", i), None))
            .collect();

        for token in &tokens {
            wait_for_terminal(&registry, token).await;
        }
        assert!(extractor.max_observed() <= 2);
    }

    #[tokio::test]
    async fn failure_releases_gate_for_next_job() {
        let dir = TempDir::new().unwrap();
        let failing = FakeExtractor::failing(ExtractError::Engine("boom".to_string()));
        let (pipeline, registry) = pipeline_with(failing, 1, &dir, None);

        let first = pipeline.submit("https://example.com/bad".to_string(), None);
        let state = wait_for_terminal(&registry, &first).await;
        assert!(matches!(state, JobState::Failed { .. }));

        // A fresh pipeline step on the same gate still gets through.
        let second = pipeline.submit("https://example.com/bad2".to_string(), None);
        let state = wait_for_terminal(&registry, &second).await;
        assert!(matches!(state, JobState::Failed { .. }));
    }

    #[tokio::test]
    async fn auth_rejection_surfaces_distinctly() {
        let dir = TempDir::new().unwrap();
        let failing = FakeExtractor::failing(ExtractError::AuthRejected(
            "Sign in to confirm you're not a bot".to_string(),
        ));
        let (pipeline, registry) = pipeline_with(failing, 1, &dir, None);

        let token = pipeline.submit("https://example.com/gated".to_string(), None);
        match wait_for_terminal(&registry, &token).await {
            JobState::Failed { reason } => {
                assert!(reason.contains("sign-in or bot check"), "reason: {}", reason)
            }
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn integrated_success_uploads_and_completes_record() {
        let dir = TempDir::new().unwrap();
        let records = Arc::new(FakeRecords::default());
        let integration = Integration {
            objects: Arc::new(FakeObjects { fail_upload: false }),
            records: records.clone(),
            audio_bucket: "youtube_audio".to_string(),
        };
        let (pipeline, registry) = pipeline_with(FakeExtractor::ok(), 1, &dir, Some(integration));

        let external_ref = ExternalRef {
            record_id: "song-42".to_string(),
            user_id: "user-7".to_string(),
        };
        let token = pipeline.submit("https://example.com/v".to_string(), Some(external_ref));

        let state = wait_for_terminal(&registry, &token).await;
        assert!(matches!(state, JobState::Ready { .. }));

        let patches = records.patches.lock().unwrap().clone();
        assert_eq!(
            patches,
            vec![
                ("song-42".to_string(), RecordStatus::Processing),
                ("song-42".to_string(), RecordStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn upload_failure_fails_job_and_discards_artifact() {
        let dir = TempDir::new().unwrap();
        let records = Arc::new(FakeRecords::default());
        let integration = Integration {
            objects: Arc::new(FakeObjects { fail_upload: true }),
            records: records.clone(),
            audio_bucket: "youtube_audio".to_string(),
        };
        let (pipeline, registry) = pipeline_with(FakeExtractor::ok(), 1, &dir, Some(integration));

        let external_ref = ExternalRef {
            record_id: "song-42".to_string(),
            user_id: "user-7".to_string(),
        };
        let token = pipeline.submit("https://example.com/v".to_string(), Some(external_ref));

        match wait_for_terminal(&registry, &token).await {
            JobState::Failed { reason } => assert!(reason.contains("upload"), "reason: {}", reason),
            other => panic!("unexpected state: {:?}", other),
        }

        // No orphaned audio files left behind.
        let leftover = fs_err::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map(|x| x == "mp3").unwrap_or(false))
            .count();
        assert_eq!(leftover, 0);

        let patches = records.patches.lock().unwrap().clone();
        assert_eq!(
            patches,
            vec![
                ("song-42".to_string(), RecordStatus::Processing),
                ("song-42".to_string(), RecordStatus::Failed),
            ]
        );
    }

    #[tokio::test]
    async fn straggling_worker_cleans_up_after_eviction() {
        let dir = TempDir::new().unwrap();
        let extractor = Arc::new(FakeExtractor {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            hold: Duration::from_millis(100),
            fail_with: None,
        });
        let (pipeline, registry) = pipeline_with(extractor, 1, &dir, None);

        let token = pipeline.submit("https://example.com/slow".to_string(), None);

        // Evict while the extraction is still in flight.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let evicted = registry.evict_expired(Duration::ZERO);
        assert_eq!(evicted.len(), 1);

        // Give the worker time to finish and notice the eviction.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(registry.get(&token).is_none());

        let leftover = fs_err::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map(|x| x == "mp3").unwrap_or(false))
            .count();
        assert_eq!(leftover, 0, "evicted job's artifact should be deleted");
    }
}
