//! Directory-backed destination
//!
//! Every object is one pretty-printed JSON file at
//! `<root>/<group|core>/<Kind>/<namespace|_cluster>/<name>.json`.
//! There is no change feed, so observers fall back to polling.

use super::{Destination, WatchEvent, admit, settle_status};
use crate::error::ApplyError;
use crate::manifest;
use crate::types::ResourceKey;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use walkdir::WalkDir;

const CLUSTER_SCOPE_DIR: &str = "_cluster";
const CORE_GROUP_DIR: &str = "core";

#[derive(Debug)]
pub struct DirectoryDestination {
    name: String,
    root: PathBuf,
    settle: bool,
    revision: AtomicU64,
    /// Serializes read-modify-write cycles on the tree
    write_lock: Mutex<()>,
}

impl DirectoryDestination {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let seed = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        Self {
            name: name.into(),
            root: root.into(),
            settle: false,
            revision: AtomicU64::new(seed),
            write_lock: Mutex::new(()),
        }
    }

    /// Bring workloads to ready as soon as they are applied
    pub fn with_settle(mut self, settle: bool) -> Self {
        self.settle = settle;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the object identified by `key`
    pub fn path_for(&self, key: &ResourceKey) -> PathBuf {
        let group = if key.group.is_empty() {
            CORE_GROUP_DIR
        } else {
            key.group.as_str()
        };
        self.root
            .join(group)
            .join(&key.kind)
            .join(key.namespace.as_deref().unwrap_or(CLUSTER_SCOPE_DIR))
            .join(format!("{}.json", key.name))
    }

    async fn read_object(&self, key: &ResourceKey) -> Result<Option<Value>, ApplyError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| ApplyError::Invalid {
                    key: key.to_string(),
                    message: format!("{}: {e}", path.display()),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ApplyError::from_io(&e, key)),
        }
    }

    async fn write_object(&self, key: &ResourceKey, object: &Value) -> Result<(), ApplyError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ApplyError::from_io(&e, key))?;
        }
        let content = serde_json::to_string_pretty(object).map_err(|e| ApplyError::Invalid {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        // Write then rename so readers never see a torn file
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, content)
            .await
            .map_err(|e| ApplyError::from_io(&e, key))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| ApplyError::from_io(&e, key))
    }
}

fn unavailable(err: impl std::fmt::Display) -> ApplyError {
    ApplyError::Unavailable {
        message: err.to_string(),
    }
}

fn list_files(root: &Path) -> Result<Vec<PathBuf>, ApplyError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(unavailable)?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == "json")
        {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[async_trait]
impl Destination for DirectoryDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Value>, ApplyError> {
        self.read_object(key).await
    }

    async fn list(&self) -> Result<Vec<Value>, ApplyError> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || list_files(&root))
            .await
            .map_err(unavailable)??;

        let mut objects = Vec::with_capacity(files.len());
        for file in files {
            let content = match tokio::fs::read_to_string(&file).await {
                Ok(content) => content,
                // Deleted between walk and read
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(unavailable(format!("{}: {e}", file.display()))),
            };
            match serde_json::from_str::<Value>(&content) {
                Ok(object) => objects.push(object),
                Err(e) => log::warn!("Skipping unreadable object {}: {e}", file.display()),
            }
        }
        Ok(objects)
    }

    async fn watch(&self) -> Result<mpsc::Receiver<WatchEvent>, ApplyError> {
        Err(ApplyError::WatchUnsupported {
            destination: self.name.clone(),
        })
    }

    async fn apply(&self, incoming: &Value) -> Result<Value, ApplyError> {
        let key = manifest::live_key(incoming).ok_or_else(|| ApplyError::Invalid {
            key: "<unnamed>".to_string(),
            message: "manifest has no kind or name".to_string(),
        })?;
        let _guard = self.write_lock.lock().await;

        let existing = self.read_object(&key).await?;
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = admit(existing.as_ref(), incoming, revision);
        if self.settle {
            settle_status(&mut stored);
        }
        self.write_object(&key, &stored).await?;
        log::debug!("Wrote {key} to {}", self.path_for(&key).display());
        Ok(stored)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ApplyError> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::remove_file(self.path_for(key))
            .await
            .map_err(|e| ApplyError::from_io(&e, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn namespace(name: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": name}})
    }

    #[tokio::test]
    async fn test_apply_list_delete() {
        let temp = TempDir::new().unwrap();
        let dest = DirectoryDestination::new("disk", temp.path());

        dest.apply(&namespace("web")).await.unwrap();
        dest.apply(&json!({"apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "frontend", "namespace": "web"}, "spec": {"replicas": 2}}))
            .await
            .unwrap();

        let ns_key = ResourceKey::new("", "Namespace", None, "web");
        assert!(temp.path().join("core/Namespace/_cluster/web.json").exists());
        assert!(temp.path().join("apps/Deployment/web/frontend.json").exists());
        assert_eq!(dest.list().await.unwrap().len(), 2);

        dest.delete(&ns_key).await.unwrap();
        assert_eq!(dest.get(&ns_key).await.unwrap(), None);
        assert!(dest.delete(&ns_key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_settle_and_resource_version() {
        let temp = TempDir::new().unwrap();
        let dest = DirectoryDestination::new("disk", temp.path()).with_settle(true);
        let deployment = json!({"apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "api", "namespace": "web"}, "spec": {"replicas": 3}});

        let first = dest.apply(&deployment).await.unwrap();
        let second = dest.apply(&deployment).await.unwrap();
        assert_eq!(second["status"]["readyReplicas"], json!(3));
        assert_ne!(
            first["metadata"]["resourceVersion"],
            second["metadata"]["resourceVersion"]
        );
        assert_eq!(first["metadata"]["uid"], second["metadata"]["uid"]);
    }

    #[tokio::test]
    async fn test_watch_unsupported_and_empty_root() {
        let temp = TempDir::new().unwrap();
        let dest = DirectoryDestination::new("disk", temp.path().join("missing"));
        assert!(dest.watch().await.is_err());
        assert!(dest.list().await.unwrap().is_empty());
    }
}
