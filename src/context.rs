//! Typed per-request context registries over the TTL store.
//!
//! Each context type gets its own registry with a `"<type>:<id>"` key
//! scheme. Writes carry merge-on-write bookkeeping: `client_id` defaults to
//! the id, `created_at` survives re-writes, `updated_at` refreshes. The
//! orchestrator only requires the `controller-params` flavor.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notify::CallbackSink;
use crate::transform::OptimizationOptions;
use crate::ttl_store::TtlStore;

pub const CONTROLLER_PARAMS: &str = "controller-params";

/// A spooled upload on local disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub path: PathBuf,
    pub original_name: String,
    pub size: u64,
    pub mime: String,
}

/// Everything needed to finish an in-flight optimization after the HTTP
/// response has been committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub client_id: String,
    pub file: Option<StoredFile>,
    #[serde(default)]
    pub files: Vec<StoredFile>,
    pub options: OptimizationOptions,
    #[serde(default)]
    pub callbacks: Vec<CallbackSink>,
    pub new_file_path: Option<String>,
    #[serde(default)]
    pub new_file_paths: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn single(
        file: StoredFile,
        options: OptimizationOptions,
        callbacks: Vec<CallbackSink>,
        new_file_path: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            client_id: String::new(),
            file: Some(file),
            files: Vec::new(),
            options,
            callbacks,
            new_file_path: Some(new_file_path),
            new_file_paths: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn batch(
        files: Vec<StoredFile>,
        options: OptimizationOptions,
        callbacks: Vec<CallbackSink>,
        new_file_paths: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            client_id: String::new(),
            file: None,
            files,
            options,
            callbacks,
            new_file_path: None,
            new_file_paths,
            created_at: now,
            updated_at: now,
        }
    }

    /// Paths of every temp file this context owns.
    pub fn temp_paths(&self) -> Vec<PathBuf> {
        self.file
            .iter()
            .map(|f| f.path.clone())
            .chain(self.files.iter().map(|f| f.path.clone()))
            .collect()
    }
}

/// Identity bookkeeping applied on every registry write.
pub trait ContextValue: Clone + Send + Sync {
    fn on_write(&mut self, id: &str, prior: Option<&Self>);
}

impl ContextValue for RequestContext {
    fn on_write(&mut self, id: &str, prior: Option<&Self>) {
        if self.client_id.is_empty() {
            self.client_id = id.to_string();
        }
        if let Some(prior) = prior {
            self.created_at = prior.created_at;
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug)]
pub struct ContextRegistry<T> {
    kind: &'static str,
    store: TtlStore<T>,
}

impl<T: ContextValue> ContextRegistry<T> {
    pub fn new(kind: &'static str, default_ttl: Duration) -> Self {
        Self {
            kind,
            store: TtlStore::new(default_ttl),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.kind, id)
    }

    pub async fn set(&self, id: &str, mut value: T) {
        let key = self.key(id);
        let prior = self.store.get(&key).await;
        value.on_write(id, prior.as_ref());
        self.store.set(key, value).await;
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        self.store.get(&self.key(id)).await
    }

    pub async fn has(&self, id: &str) -> bool {
        self.store.has(&self.key(id)).await
    }

    pub async fn delete(&self, id: &str) -> bool {
        self.store.delete(&self.key(id)).await
    }

    pub async fn update_ttl(&self, id: &str, ttl: Duration) -> bool {
        self.store.update_ttl(&self.key(id), ttl).await
    }

    /// Ids of live contexts of this type.
    pub async fn ids(&self) -> Vec<String> {
        let prefix = format!("{}:", self.kind);
        self.store
            .keys()
            .await
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.store.is_empty().await
    }

    /// Eagerly evict expired entries in the underlying store, reporting how
    /// many were removed. Values are dropped, not returned; use
    /// `drain_expired` when owned resources must be reclaimed.
    pub async fn sweep(&self) -> usize {
        self.store.sweep().await
    }

    /// Evict expired contexts, returning `(id, value)` pairs so the caller
    /// can reclaim owned resources.
    pub async fn drain_expired(&self) -> Vec<(String, T)> {
        let prefix = format!("{}:", self.kind);
        self.store
            .drain_expired()
            .await
            .into_iter()
            .map(|(k, v)| {
                let id = k.strip_prefix(&prefix).unwrap_or(&k).to_string();
                (id, v)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::OptimizationOptions;
    use tokio::time::sleep;

    fn sample_file() -> StoredFile {
        StoredFile {
            path: PathBuf::from("/tmp/upload"),
            original_name: "photo.jpg".to_string(),
            size: 1024,
            mime: "image/jpeg".to_string(),
        }
    }

    fn sample_context() -> RequestContext {
        RequestContext::single(
            sample_file(),
            OptimizationOptions::default(),
            Vec::new(),
            "optimized/x.jpeg".to_string(),
        )
    }

    #[tokio::test]
    async fn write_defaults_client_id_to_id() {
        let registry = ContextRegistry::new(CONTROLLER_PARAMS, Duration::from_secs(60));
        registry.set("req-1", sample_context()).await;
        let ctx = registry.get("req-1").await.unwrap();
        assert_eq!(ctx.client_id, "req-1");
    }

    #[tokio::test]
    async fn rewrite_preserves_created_at_and_refreshes_updated_at() {
        let registry = ContextRegistry::new(CONTROLLER_PARAMS, Duration::from_secs(60));
        registry.set("req-1", sample_context()).await;
        let first = registry.get("req-1").await.unwrap();

        sleep(Duration::from_millis(20)).await;
        registry.set("req-1", sample_context()).await;
        let second = registry.get("req-1").await.unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn ids_strip_the_type_prefix() {
        let registry = ContextRegistry::new(CONTROLLER_PARAMS, Duration::from_secs(60));
        registry.set("a", sample_context()).await;
        registry.set("b", sample_context()).await;
        let mut ids = registry.ids().await;
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn drained_contexts_expose_temp_paths() {
        let registry: ContextRegistry<RequestContext> =
            ContextRegistry::new(CONTROLLER_PARAMS, Duration::from_millis(10));
        registry.set("a", sample_context()).await;
        sleep(Duration::from_millis(30)).await;
        let drained = registry.drain_expired().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "a");
        assert_eq!(drained[0].1.temp_paths(), vec![PathBuf::from("/tmp/upload")]);
        assert!(registry.get("a").await.is_none());
    }
}
