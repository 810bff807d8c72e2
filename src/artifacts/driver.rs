//! # Artifact Driver Contract
//!
//! Every storage backend implements [`ArtifactDriver`]. Keys are slash
//! separated on every platform; drivers translate local paths before building
//! wire requests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use super::errors::{ArtifactError, ArtifactResult};
use super::types::{Artifact, ArtifactLocation};

/// Streaming read of an artifact's contents
pub type ByteStream = BoxStream<'static, ArtifactResult<Bytes>>;

#[async_trait]
pub trait ArtifactDriver: Send + Sync + fmt::Debug {
    /// Short backend name used in logs
    fn name(&self) -> &str;

    /// Download a single object, or every object below a prefix, to `local_path`
    async fn load(&self, artifact: &Artifact, local_path: &Path) -> ArtifactResult<()>;

    /// Upload a file, or a directory tree, from `local_path`
    async fn save(&self, local_path: &Path, artifact: &Artifact) -> ArtifactResult<()>;

    async fn open_stream(&self, artifact: &Artifact) -> ArtifactResult<ByteStream>;

    /// Remove the object or prefix. Deleting something absent succeeds.
    async fn delete(&self, artifact: &Artifact) -> ArtifactResult<()>;

    /// Keys below the artifact's prefix, or just the key on an exact match
    async fn list_objects(&self, artifact: &Artifact) -> ArtifactResult<Vec<String>>;

    async fn is_directory(&self, artifact: &Artifact) -> ArtifactResult<bool>;
}

/// Chooses a driver for an artifact location
pub trait DriverFactory: Send + Sync {
    fn driver_for(&self, location: &ArtifactLocation) -> ArtifactResult<Arc<dyn ArtifactDriver>>;
}

/// Factory that hands out one driver for every location
#[derive(Debug, Clone)]
pub struct SingleDriverFactory(pub Arc<dyn ArtifactDriver>);

impl DriverFactory for SingleDriverFactory {
    fn driver_for(&self, _location: &ArtifactLocation) -> ArtifactResult<Arc<dyn ArtifactDriver>> {
        Ok(self.0.clone())
    }
}

/// Translate backslash separators into slashes
pub fn normalize_key(key: &str) -> String {
    key.replace('\\', "/")
}

/// `key` relative to `prefix`, without leading separators
pub(crate) fn relative_key<'a>(prefix: &str, key: &'a str) -> &'a str {
    let prefix = prefix.trim_end_matches('/');
    key.strip_prefix(prefix)
        .unwrap_or(key)
        .trim_start_matches('/')
}

/// Join a slash separated key onto a local directory
pub(crate) fn local_target(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(root.to_path_buf(), |path, segment| path.join(segment))
}

/// Write bytes to `path`, creating parent directories
pub(crate) async fn write_local(path: &Path, contents: &[u8]) -> ArtifactResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ArtifactError::io(parent, &e))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| ArtifactError::io(path, &e))
}

/// Files to upload: the path itself, or every file below a directory paired
/// with its slash separated relative key
pub(crate) fn collect_upload_files(local_path: &Path) -> ArtifactResult<Vec<(PathBuf, String)>> {
    let metadata = std::fs::metadata(local_path).map_err(|e| ArtifactError::io(local_path, &e))?;
    if metadata.is_file() {
        return Ok(vec![(local_path.to_path_buf(), String::new())]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(local_path).sort_by_file_name() {
        let entry = entry.map_err(|e| ArtifactError::Io {
            path: local_path.display().to_string(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(local_path)
            .map_err(|e| ArtifactError::Io {
                path: entry.path().display().to_string(),
                message: e.to_string(),
            })?;
        let relative = normalize_key(&relative.to_string_lossy());
        files.push((entry.path().to_path_buf(), relative));
    }
    Ok(files)
}

/// Key for an uploaded file below the artifact's key
pub(crate) fn upload_key(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        base.to_string()
    } else {
        format!("{}/{relative}", base.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_helpers() {
        assert_eq!(normalize_key("out\\bin\\app"), "out/bin/app");
        assert_eq!(relative_key("logs/", "logs/a/b.txt"), "a/b.txt");
        assert_eq!(relative_key("logs", "logs/a.txt"), "a.txt");
        assert_eq!(upload_key("out/", "a/b"), "out/a/b");
        assert_eq!(upload_key("out/bin", ""), "out/bin");
        assert_eq!(
            local_target(Path::new("/tmp/x"), "a//b"),
            PathBuf::from("/tmp/x/a/b")
        );
    }

    #[test]
    fn test_collect_upload_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("sub").join("b.txt"), b"b").unwrap();

        let files = collect_upload_files(dir.path()).unwrap();
        let keys: Vec<&str> = files.iter().map(|(_, key)| key.as_str()).collect();
        assert_eq!(keys, vec!["a.txt", "sub/b.txt"]);

        let single = collect_upload_files(&dir.path().join("a.txt")).unwrap();
        assert_eq!(single[0].1, "");
    }
}
