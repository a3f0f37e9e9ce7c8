//! Optimization orchestrator.
//!
//! The entry point behind the HTTP layer. Accepting a request is synchronous
//! bookkeeping: validate, mint the destination key, persist the request
//! context, enqueue, answer. Everything after the response (reading the
//! upload, the pool run, the blob upload, SSE and webhook fan-out) happens
//! on a spawned task and reports only through those channels.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blob::BlobSink;
use crate::config::Config;
use crate::context::{ContextRegistry, RequestContext, StoredFile, CONTROLLER_PARAMS};
use crate::error::ApiError;
use crate::events::{EventBroker, OptimizationEvent};
use crate::notify::{CallbackNotifier, CallbackSink};
use crate::pathgen;
use crate::pool::{OptimizeTask, PoolConfig, PoolStats, TaskOutcome, WorkerPool};
use crate::transform::{
    BlurPlaceholderOptions, ImageTransformer, OptimizationOptions, OutputFormat, TransformError,
    WatermarkOptions,
};

/// Synchronous response for a single-image accept.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeAccepted {
    pub message: String,
    pub original_size: u64,
    pub data: String,
    pub download_url: String,
    pub callbacks_scheduled: usize,
    pub optimization_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAccepted {
    pub message: String,
    pub count: usize,
    pub callbacks_scheduled: usize,
    pub optimization_id: String,
    pub results: Vec<BatchAcceptedItem>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAcceptedItem {
    pub file: String,
    pub data: String,
    pub download_url: String,
}

#[derive(Clone)]
pub struct OptimizationService {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    transformer: Arc<ImageTransformer>,
    pool: WorkerPool,
    contexts: ContextRegistry<RequestContext>,
    broker: Arc<EventBroker>,
    notifier: CallbackNotifier,
    blob: Arc<dyn BlobSink>,
    /// Gate for the synchronous codec endpoints, sized like the pool so the
    /// codec library never sees more parallelism than configured.
    codec_gate: Semaphore,
}

impl OptimizationService {
    pub fn new(
        config: Config,
        transformer: Arc<ImageTransformer>,
        blob: Arc<dyn BlobSink>,
        broker: Arc<EventBroker>,
    ) -> Self {
        let pool = WorkerPool::new(
            PoolConfig {
                min_threads: config.pool_min_threads,
                max_threads: config.queue_concurrency,
                idle_timeout: config.pool_idle_timeout,
                queue_depth: config.queue_max_depth,
            },
            Arc::clone(&transformer),
        );
        let contexts = ContextRegistry::new(CONTROLLER_PARAMS, config.client_context_ttl);
        let codec_gate = Semaphore::new(config.queue_concurrency.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                transformer,
                pool,
                contexts,
                broker,
                notifier: CallbackNotifier::new(),
                blob,
                codec_gate,
            }),
        }
    }

    pub fn contexts(&self) -> &ContextRegistry<RequestContext> {
        &self.inner.contexts
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.inner.broker
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub async fn shutdown(&self) {
        self.inner.pool.shutdown().await;
    }

    fn download_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.inner.config.download_base_url.trim_end_matches('/'),
            key
        )
    }

    fn validate_options(options: &OptimizationOptions) -> Result<(), ApiError> {
        if let Some(width) = options.width {
            if !(1..=8000).contains(&width) {
                return Err(ApiError::InvalidParameter(
                    "width must be between 1 and 8000".into(),
                ));
            }
        }
        if let Some(height) = options.height {
            if !(1..=8000).contains(&height) {
                return Err(ApiError::InvalidParameter(
                    "height must be between 1 and 8000".into(),
                ));
            }
        }
        if !(1..=100).contains(&options.quality) {
            return Err(ApiError::InvalidParameter(
                "quality must be between 1 and 100".into(),
            ));
        }
        if let Some(radius) = options.blur_radius {
            if !(1..=50).contains(&radius) {
                return Err(ApiError::InvalidParameter(
                    "blurRadius must be between 1 and 50".into(),
                ));
            }
        }
        Ok(())
    }

    /// Accept a single upload: context-write happens before this returns,
    /// the worker runs after.
    pub async fn accept_single(
        &self,
        file: StoredFile,
        callbacks: Vec<CallbackSink>,
        options: OptimizationOptions,
    ) -> Result<OptimizeAccepted, ApiError> {
        Self::validate_options(&options)?;
        if !self.inner.pool.has_capacity(1) {
            return Err(ApiError::QueueSaturated);
        }

        let new_file_path = pathgen::mint(options.format.path_extension());
        let optimization_id = Uuid::new_v4().to_string();
        if self.inner.contexts.has(&optimization_id).await {
            // A v4 collision is practically impossible; refusing beats
            // silently clobbering another request's state.
            return Err(ApiError::Internal("optimization id collision".into()));
        }

        let original_size = file.size;
        let callbacks_scheduled = callbacks.len();
        let context =
            RequestContext::single(file, options, callbacks, new_file_path.clone());
        self.inner.contexts.set(&optimization_id, context).await;

        let svc = self.clone();
        let task_id = optimization_id.clone();
        tokio::spawn(async move {
            svc.run_single(task_id).await;
        });

        info!(id = %optimization_id, key = %new_file_path, "optimization accepted");
        Ok(OptimizeAccepted {
            message: "Image accepted for optimization".to_string(),
            original_size,
            download_url: self.download_url(&new_file_path),
            data: new_file_path,
            callbacks_scheduled,
            optimization_id,
        })
    }

    /// Accept a batch: one minted key and one result slot per file, one
    /// consolidated callback at the end.
    pub async fn accept_batch(
        &self,
        files: Vec<StoredFile>,
        callbacks: Vec<CallbackSink>,
        options: OptimizationOptions,
    ) -> Result<BatchAccepted, ApiError> {
        Self::validate_options(&options)?;
        if files.is_empty() {
            return Err(ApiError::MissingFile("files"));
        }
        if !self.inner.pool.has_capacity(files.len()) {
            return Err(ApiError::QueueSaturated);
        }

        let new_file_paths: Vec<String> = files
            .iter()
            .map(|_| pathgen::mint(options.format.path_extension()))
            .collect();
        let optimization_id = Uuid::new_v4().to_string();
        if self.inner.contexts.has(&optimization_id).await {
            return Err(ApiError::Internal("optimization id collision".into()));
        }

        let results: Vec<BatchAcceptedItem> = files
            .iter()
            .zip(&new_file_paths)
            .map(|(file, path)| BatchAcceptedItem {
                file: file.original_name.clone(),
                data: path.clone(),
                download_url: self.download_url(path),
            })
            .collect();

        let count = files.len();
        let callbacks_scheduled = callbacks.len();
        let context = RequestContext::batch(files, options, callbacks, new_file_paths);
        self.inner.contexts.set(&optimization_id, context).await;

        let svc = self.clone();
        let task_id = optimization_id.clone();
        tokio::spawn(async move {
            svc.run_batch(task_id).await;
        });

        info!(id = %optimization_id, count, "batch optimization accepted");
        Ok(BatchAccepted {
            message: "Batch accepted for optimization".to_string(),
            count,
            callbacks_scheduled,
            optimization_id,
            results,
        })
    }

    /// Asynchronous arm for a single upload. Every branch ends in a terminal
    /// SSE event plus the callback fan-out; nothing propagates upward.
    async fn run_single(&self, id: String) {
        let Some(context) = self.inner.contexts.get(&id).await else {
            // Fatal for this task: without the context there is no callback
            // list, so SSE and the log are the only witnesses.
            error!(id = %id, "request context missing before dispatch");
            self.inner
                .broker
                .publish(OptimizationEvent::error(&id, "request context missing"))
                .await;
            return;
        };
        let Some(file) = context.file.clone() else {
            error!(id = %id, "single-image context has no file handle");
            self.fail(&id, &context.callbacks, "upload handle missing".to_string())
                .await;
            return;
        };
        let Some(new_file_path) = context.new_file_path.clone() else {
            error!(id = %id, "single-image context has no destination key");
            self.fail(&id, &context.callbacks, "destination key missing".to_string())
                .await;
            return;
        };

        self.inner
            .broker
            .publish(OptimizationEvent::progress(&id, 10, "queued"))
            .await;

        let bytes = match tokio::fs::read(&file.path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                self.fail(&id, &context.callbacks, format!("failed to read upload: {err}"))
                    .await;
                return;
            }
        };

        let outcome = match self
            .inner
            .pool
            .submit(OptimizeTask {
                bytes,
                options: context.options.clone(),
                original_name: file.original_name.clone(),
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail(&id, &context.callbacks, format!("worker pool rejected task: {err}"))
                    .await;
                return;
            }
        };
        if !outcome.success {
            let message = outcome
                .error
                .unwrap_or_else(|| "optimization failed".to_string());
            self.fail(&id, &context.callbacks, message).await;
            return;
        }

        self.inner
            .broker
            .publish(OptimizationEvent::progress(&id, 60, "optimized"))
            .await;

        let format = outcome.format.unwrap_or(context.options.format);
        if let Err(err) = self
            .put_with_retry(&new_file_path, outcome.buffer.clone(), &format.mime())
            .await
        {
            self.fail(&id, &context.callbacks, format!("upload failed: {err}"))
                .await;
            return;
        }

        self.inner
            .broker
            .publish(OptimizationEvent::progress(&id, 90, "uploaded"))
            .await;

        let payload = json!({
            "optimizationId": id,
            "status": "success",
            "data": new_file_path,
            "downloadUrl": self.download_url(&new_file_path),
            "fileName": file.original_name,
            "format": format.as_str(),
            "originalSize": outcome.original_size,
            "optimizedSize": outcome.optimized_size,
        });
        self.inner
            .broker
            .publish(OptimizationEvent::complete(&id, payload.clone()))
            .await;
        let summary = self.inner.notifier.notify(&context.callbacks, &payload).await;
        info!(id = %id, delivered = summary.delivered, "optimization complete");
    }

    /// Asynchronous arm for a batch. Per-file failures never affect
    /// siblings; the batch always ends in one consolidated terminal event
    /// and a single callback fan-out.
    async fn run_batch(&self, id: String) {
        let Some(context) = self.inner.contexts.get(&id).await else {
            error!(id = %id, "request context missing before batch dispatch");
            self.inner
                .broker
                .publish(OptimizationEvent::error(&id, "request context missing"))
                .await;
            return;
        };
        let files = context.files.clone();
        let total = files.len();

        self.inner
            .broker
            .publish(OptimizationEvent::progress(&id, 5, "batch queued"))
            .await;

        // Read every upload first; an unreadable file occupies its slot as a
        // failure without submitting work for it.
        let mut slots: Vec<Result<usize, String>> = Vec::with_capacity(total);
        let mut tasks = Vec::new();
        for file in &files {
            match tokio::fs::read(&file.path).await {
                Ok(bytes) => {
                    slots.push(Ok(tasks.len()));
                    tasks.push(OptimizeTask {
                        bytes: Bytes::from(bytes),
                        options: context.options.clone(),
                        original_name: file.original_name.clone(),
                    });
                }
                Err(err) => slots.push(Err(format!("failed to read upload: {err}"))),
            }
        }

        let outcomes = match self.inner.pool.submit_many(tasks).await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                self.fail(&id, &context.callbacks, format!("worker pool rejected batch: {err}"))
                    .await;
                return;
            }
        };

        let mut results = Vec::with_capacity(total);
        let mut successful = 0usize;
        for (index, (file, slot)) in files.iter().zip(&slots).enumerate() {
            let entry = match slot {
                Ok(task_index) => {
                    self.finish_batch_file(&id, index, file, &outcomes[*task_index])
                        .await
                }
                Err(message) => BatchFileResult::failed(file, message.clone()),
            };
            if entry.success {
                successful += 1;
            }
            let percent = 5 + ((index + 1) * 90 / total.max(1)) as u8;
            self.inner
                .broker
                .publish(OptimizationEvent::file_progress(
                    &id,
                    percent,
                    format!("processed {}", file.original_name),
                    index,
                    file.original_name.clone(),
                ))
                .await;
            results.push(entry);
        }

        let status = match successful {
            0 => "error",
            n if n == total => "success",
            _ => "partial",
        };
        let payload = json!({
            "optimizationId": id,
            "status": status,
            "totalFiles": total,
            "successfulFiles": successful,
            "failedFiles": total - successful,
            "results": results,
        });
        self.inner
            .broker
            .publish(OptimizationEvent::complete(&id, payload.clone()))
            .await;
        let summary = self.inner.notifier.notify(&context.callbacks, &payload).await;
        info!(id = %id, successful, total, delivered = summary.delivered, "batch complete");
    }

    /// Upload one successful batch slot under its per-index key.
    async fn finish_batch_file(
        &self,
        id: &str,
        index: usize,
        file: &StoredFile,
        outcome: &TaskOutcome,
    ) -> BatchFileResult {
        if !outcome.success {
            return BatchFileResult::failed(
                file,
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "optimization failed".to_string()),
            );
        }
        let key = format!("{id}_{index}");
        let format = outcome.format.unwrap_or(OutputFormat::Jpeg);
        match self
            .put_with_retry(&key, outcome.buffer.clone(), &format.mime())
            .await
        {
            Ok(()) => BatchFileResult {
                file_name: file.original_name.clone(),
                success: true,
                data: Some(key.clone()),
                download_url: Some(self.download_url(&key)),
                error: None,
                original_size: outcome.original_size,
                optimized_size: outcome.optimized_size,
            },
            Err(err) => BatchFileResult::failed(file, format!("upload failed: {err}")),
        }
    }

    /// Terminal failure path: SSE `Error` plus an error-status callback.
    async fn fail(&self, id: &str, callbacks: &[CallbackSink], message: String) {
        error!(id = %id, %message, "optimization failed");
        self.inner
            .broker
            .publish(OptimizationEvent::error(id, message.clone()))
            .await;
        let payload = json!({
            "optimizationId": id,
            "status": "error",
            "error": message,
        });
        self.inner.notifier.notify(callbacks, &payload).await;
    }

    async fn put_with_retry(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), crate::blob::BlobError> {
        let attempts = self.inner.config.max_retries.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.inner.blob.put(key, bytes.clone(), content_type).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(key, attempt, %err, "blob upload attempt failed");
                    last = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            200 * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }
        Err(last.unwrap_or(crate::blob::BlobError::InvalidKey(key.to_string())))
    }

    // --- synchronous codec operations (bounded by the codec gate) ---

    pub async fn blur_placeholder(
        &self,
        bytes: Vec<u8>,
        options: BlurPlaceholderOptions,
    ) -> Result<Vec<u8>, ApiError> {
        self.run_codec(move |t| t.blur_placeholder(&bytes, &options))
            .await
    }

    pub async fn convert(
        &self,
        bytes: Vec<u8>,
        format: OutputFormat,
    ) -> Result<Vec<u8>, ApiError> {
        self.run_codec(move |t| t.convert(&bytes, format)).await
    }

    pub async fn thumbnail(
        &self,
        bytes: Vec<u8>,
        width: u32,
        height: Option<u32>,
    ) -> Result<Vec<u8>, ApiError> {
        self.run_codec(move |t| t.thumbnail(&bytes, width, height))
            .await
    }

    pub async fn watermark(
        &self,
        bytes: Vec<u8>,
        text: String,
        options: WatermarkOptions,
    ) -> Result<Vec<u8>, ApiError> {
        self.run_codec(move |t| t.watermark(&bytes, &text, &options))
            .await
    }

    async fn run_codec<F>(&self, op: F) -> Result<Vec<u8>, ApiError>
    where
        F: FnOnce(&ImageTransformer) -> Result<Vec<u8>, TransformError> + Send + 'static,
    {
        let _permit = self
            .inner
            .codec_gate
            .acquire()
            .await
            .map_err(|_| ApiError::Internal("codec gate closed".into()))?;
        let transformer = Arc::clone(&self.inner.transformer);
        let result = tokio::task::spawn_blocking(move || op(&transformer))
            .await
            .map_err(|_| ApiError::Internal("codec task aborted".into()))?;
        result.map_err(map_transform_error)
    }
}

fn map_transform_error(err: TransformError) -> ApiError {
    match err {
        TransformError::Decode(_) | TransformError::InvalidParameter(_) => {
            ApiError::InvalidParameter(err.to_string())
        }
        other => ApiError::Internal(other.to_string()),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchFileResult {
    file_name: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    original_size: usize,
    optimized_size: usize,
}

impl BatchFileResult {
    fn failed(file: &StoredFile, error: String) -> Self {
        Self {
            file_name: file.original_name.clone(),
            success: false,
            data: None,
            download_url: None,
            error: Some(error),
            original_size: file.size as usize,
            optimized_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::codecs::png::PngEncoder;
    use image::{ColorType, ImageEncoder, Rgba, RgbaImage};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingBlobSink {
        calls: Mutex<Vec<(String, usize, String)>>,
    }

    #[async_trait]
    impl BlobSink for RecordingBlobSink {
        async fn put(
            &self,
            key: &str,
            bytes: Bytes,
            content_type: &str,
        ) -> Result<(), crate::blob::BlobError> {
            self.calls
                .lock()
                .await
                .push((key.to_string(), bytes.len(), content_type.to_string()));
            Ok(())
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 100, 255])
        });
        let mut buf = Vec::new();
        PngEncoder::new(&mut buf)
            .write_image(img.as_raw(), width, height, ColorType::Rgba8)
            .unwrap();
        buf
    }

    fn write_upload(dir: &Path, name: &str, bytes: &[u8]) -> StoredFile {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        StoredFile {
            path,
            original_name: name.to_string(),
            size: bytes.len() as u64,
            mime: "image/png".to_string(),
        }
    }

    fn make_service(blob: Arc<dyn BlobSink>) -> OptimizationService {
        let config = Config {
            download_base_url: "https://cdn.example.com".to_string(),
            ..Default::default()
        };
        let broker = Arc::new(EventBroker::new(
            Duration::from_secs(60),
            Duration::from_millis(100),
        ));
        OptimizationService::new(config, Arc::new(ImageTransformer::new()), blob, broker)
    }

    async fn wait_terminal(
        service: &OptimizationService,
        id: &str,
    ) -> OptimizationEvent {
        let mut rx = service.broker().subscribe(id).await.unwrap();
        timeout(Duration::from_secs(20), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.is_terminal() {
                    return event;
                }
            }
        })
        .await
        .expect("terminal event within deadline")
    }

    #[tokio::test]
    async fn single_accept_mints_key_and_uploads_under_it() {
        let blob = Arc::new(RecordingBlobSink::default());
        let service = make_service(blob.clone());
        let dir = tempfile::tempdir().unwrap();
        let file = write_upload(dir.path(), "photo.png", &png_bytes(400, 200));

        let accepted = service
            .accept_single(
                file,
                Vec::new(),
                OptimizationOptions {
                    width: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(accepted.data.starts_with("optimized/"));
        assert!(accepted.data.ends_with(".jpeg"));
        assert_eq!(
            accepted.download_url,
            format!("https://cdn.example.com/{}", accepted.data)
        );
        assert_eq!(accepted.callbacks_scheduled, 0);
        assert!(!accepted.optimization_id.is_empty());

        let event = wait_terminal(&service, &accepted.optimization_id).await;
        assert_eq!(event.kind(), "complete");

        let calls = blob.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, accepted.data);
        assert_eq!(calls[0].2, "image/jpeg");
        assert!(calls[0].1 > 0);
    }

    #[tokio::test]
    async fn out_of_range_options_are_rejected_at_accept() {
        let service = make_service(Arc::new(RecordingBlobSink::default()));
        let dir = tempfile::tempdir().unwrap();
        let file = write_upload(dir.path(), "a.png", &png_bytes(10, 10));
        let err = service
            .accept_single(
                file,
                Vec::new(),
                OptimizationOptions {
                    width: Some(9000),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn undecodable_upload_fails_over_sse_without_touching_blob() {
        let blob = Arc::new(RecordingBlobSink::default());
        let service = make_service(blob.clone());
        let dir = tempfile::tempdir().unwrap();
        let file = write_upload(dir.path(), "bad.bin", b"this is not an image");

        let accepted = service
            .accept_single(file, Vec::new(), OptimizationOptions::default())
            .await
            .unwrap();

        let event = wait_terminal(&service, &accepted.optimization_id).await;
        assert_eq!(event.kind(), "error");
        assert!(blob.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn batch_uploads_per_index_keys_and_preserves_order() {
        let blob = Arc::new(RecordingBlobSink::default());
        let service = make_service(blob.clone());
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write_upload(dir.path(), "one.png", &png_bytes(64, 64)),
            write_upload(dir.path(), "two.png", &png_bytes(64, 64)),
            write_upload(dir.path(), "three.png", &png_bytes(64, 64)),
        ];

        let accepted = service
            .accept_batch(
                files,
                Vec::new(),
                OptimizationOptions {
                    format: OutputFormat::Webp,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(accepted.count, 3);
        assert_eq!(accepted.results.len(), 3);
        assert_eq!(accepted.results[0].file, "one.png");
        assert_eq!(accepted.results[2].file, "three.png");

        let event = wait_terminal(&service, &accepted.optimization_id).await;
        let OptimizationEvent::Complete { payload, .. } = event else {
            panic!("expected complete event");
        };
        assert_eq!(payload["totalFiles"], 3);
        assert_eq!(payload["successfulFiles"], 3);
        assert_eq!(payload["results"].as_array().unwrap().len(), 3);
        assert_eq!(payload["results"][0]["fileName"], "one.png");

        let calls = blob.calls.lock().await;
        let mut keys: Vec<String> = calls.iter().map(|(k, _, _)| k.clone()).collect();
        keys.sort();
        let id = &accepted.optimization_id;
        let expected: Vec<String> = (0..3).map(|i| format!("{id}_{i}")).collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn sibling_failure_does_not_sink_the_batch() {
        let blob = Arc::new(RecordingBlobSink::default());
        let service = make_service(blob.clone());
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write_upload(dir.path(), "good.png", &png_bytes(32, 32)),
            write_upload(dir.path(), "bad.bin", b"garbage"),
        ];

        let accepted = service
            .accept_batch(files, Vec::new(), OptimizationOptions::default())
            .await
            .unwrap();
        let event = wait_terminal(&service, &accepted.optimization_id).await;
        let OptimizationEvent::Complete { payload, .. } = event else {
            panic!("expected complete event");
        };
        assert_eq!(payload["status"], "partial");
        assert_eq!(payload["successfulFiles"], 1);
        assert_eq!(payload["failedFiles"], 1);
        assert_eq!(blob.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn completion_fires_exactly_one_webhook() {
        use axum::routing::post;
        use axum::{Json, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let app_hits = Arc::clone(&hits);
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |axum::extract::State(hits): axum::extract::State<
                        Arc<AtomicUsize>,
                    >,
                     Json(body): Json<Value>| async move {
                        assert_eq!(body["status"], "success");
                        hits.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    },
                ),
            )
            .with_state(app_hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let blob = Arc::new(RecordingBlobSink::default());
        let service = make_service(blob);
        let dir = tempfile::tempdir().unwrap();
        let file = write_upload(dir.path(), "photo.png", &png_bytes(50, 50));
        let callbacks = vec![CallbackSink {
            url: format!("http://{addr}/hook"),
            method: Default::default(),
            headers: HashMap::new(),
        }];

        let accepted = service
            .accept_single(file, callbacks, OptimizationOptions::default())
            .await
            .unwrap();
        assert_eq!(accepted.callbacks_scheduled, 1);

        wait_terminal(&service, &accepted.optimization_id).await;
        // The notifier settles after the terminal event; give it a beat.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
