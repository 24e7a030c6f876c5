//! Manifest sources: where rendered desired state comes from
//!
//! Rendering (templating, chart expansion) happens upstream. A source only
//! hands back the already-rendered manifests for a revision.

use crate::application::Application;
use crate::error::RenderError;
use crate::manifest::ManifestSet;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use walkdir::WalkDir;

const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Rendered manifests of `app` at `revision`, or at the app's target
    /// revision when `revision` is None
    async fn resolve(
        &self,
        app: &Application,
        revision: Option<&str>,
    ) -> Result<ManifestSet, RenderError>;
}

/// Reads `<source.path>/<revision>/**/*.{yaml,yml,json}`
///
/// Files are read in path order; YAML files may hold several documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectorySource;

impl DirectorySource {
    pub fn new() -> Self {
        Self
    }
}

fn io_error(path: &Path, err: impl std::fmt::Display) -> RenderError {
    RenderError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>, RenderError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        let is_manifest = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| MANIFEST_EXTENSIONS.contains(&e));
        if entry.file_type().is_file() && is_manifest {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Parse one file into manifests, skipping empty YAML documents
pub fn parse_manifests(origin: &str, content: &str, json: bool) -> Result<Vec<Value>, RenderError> {
    let parse_error = |message: String| RenderError::Parse {
        origin: origin.to_string(),
        message,
    };

    if json {
        return match serde_json::from_str::<Value>(content).map_err(|e| parse_error(e.to_string()))? {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        };
    }

    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document).map_err(|e| parse_error(e.to_string()))?;
        if !value.is_null() {
            manifests.push(value);
        }
    }
    Ok(manifests)
}

fn load_revision(dir: &Path) -> Result<Vec<Value>, RenderError> {
    let mut manifests = Vec::new();
    for file in manifest_files(dir)? {
        let content = std::fs::read_to_string(&file).map_err(|e| io_error(&file, e))?;
        let origin = file
            .strip_prefix(dir)
            .unwrap_or(&file)
            .display()
            .to_string();
        let json = file.extension().is_some_and(|e| e == "json");
        manifests.extend(parse_manifests(&origin, &content, json)?);
    }
    Ok(manifests)
}

#[async_trait]
impl ManifestSource for DirectorySource {
    async fn resolve(
        &self,
        app: &Application,
        revision: Option<&str>,
    ) -> Result<ManifestSet, RenderError> {
        let revision = revision.unwrap_or(&app.source.revision).to_string();
        let dir = app.source.path.join(&revision);
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(RenderError::UnknownRevision {
                app: app.name.clone(),
                revision,
            });
        }

        let manifests = tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || load_revision(&dir)
        })
        .await
        .map_err(|e| io_error(&dir, e))??;

        log::debug!(
            "Resolved {} manifests for {} at {revision}",
            manifests.len(),
            app.name
        );
        Ok(ManifestSet::new(revision, manifests))
    }
}

/// In-memory source for embedding and tests
///
/// Revisions are published explicitly per application.
#[derive(Debug, Default)]
pub struct StaticSource {
    revisions: Mutex<HashMap<(String, String), Vec<Value>>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `manifests` available as `revision` of `app`
    pub fn publish(&self, app: &str, revision: &str, manifests: Vec<Value>) {
        self.revisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((app.to_string(), revision.to_string()), manifests);
    }
}

#[async_trait]
impl ManifestSource for StaticSource {
    async fn resolve(
        &self,
        app: &Application,
        revision: Option<&str>,
    ) -> Result<ManifestSet, RenderError> {
        let revision = revision.unwrap_or(&app.source.revision).to_string();
        let manifests = self
            .revisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(app.name.clone(), revision.clone()))
            .cloned()
            .ok_or_else(|| RenderError::UnknownRevision {
                app: app.name.clone(),
                revision: revision.clone(),
            })?;
        Ok(ManifestSet::new(revision, manifests))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const MULTI_DOC: &str = "\
apiVersion: v1
kind: Namespace
metadata:
  name: web
---
# comment only
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: production
";

    #[test]
    fn test_parse_multi_document_yaml() {
        let manifests = parse_manifests("all.yaml", MULTI_DOC, false).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[1]["data"]["mode"], json!("production"));
    }

    #[test]
    fn test_parse_error_names_origin() {
        let err = parse_manifests("broken.yaml", "kind: [unterminated", false).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[tokio::test]
    async fn test_directory_source_reads_revision() {
        let temp = TempDir::new().unwrap();
        let rev = temp.path().join("v1");
        std::fs::create_dir_all(rev.join("nested")).unwrap();
        std::fs::write(rev.join("a.yaml"), MULTI_DOC).unwrap();
        std::fs::write(
            rev.join("nested/b.json"),
            r#"{"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "token"}}"#,
        )
        .unwrap();
        std::fs::write(rev.join("README.md"), "not a manifest").unwrap();

        let app = Application::new("web", temp.path(), "v1", "local");
        let set = DirectorySource::new().resolve(&app, None).await.unwrap();
        assert_eq!(set.revision, "v1");
        assert_eq!(set.manifests.len(), 3);

        let again = DirectorySource::new().resolve(&app, Some("v1")).await.unwrap();
        assert_eq!(set.digest, again.digest);

        let err = DirectorySource::new().resolve(&app, Some("v2")).await.unwrap_err();
        assert!(matches!(err, RenderError::UnknownRevision { .. }));
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticSource::new();
        let app = Application::new("web", "unused", "r1", "local");
        source.publish("web", "r1", vec![json!({"kind": "Namespace"})]);

        assert_eq!(source.resolve(&app, None).await.unwrap().manifests.len(), 1);
        assert!(source.resolve(&app, Some("r2")).await.is_err());
    }
}
