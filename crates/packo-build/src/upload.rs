//! Source packaging.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use packo_core::SourceRef;

use crate::error::UploadError;

/// Packages a local source tree and publishes it under a registry.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// Upload `path` and return the content-addressed reference to it.
    async fn upload(&self, path: &Path, registry: &str) -> Result<SourceRef, UploadError>;
}

/// Computes the content address of a source tree without pushing it.
///
/// The digest covers every regular file's relative path and contents, walked
/// in sorted order, so the same tree always yields the same reference.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestUploader;

impl DigestUploader {
    /// Create a new DigestUploader.
    pub fn new() -> Self {
        Self
    }

    /// Hex-encoded SHA-256 of the tree rooted at `root`.
    pub fn digest_tree(root: &Path) -> Result<String, UploadError> {
        if !root.is_dir() {
            return Err(UploadError::NotADirectory(root.to_path_buf()));
        }

        let mut files = Vec::new();
        collect_files(root, root, &mut files)?;
        files.sort();

        let mut hasher = Sha256::new();
        for relative in &files {
            let path = root.join(relative);
            let io_err = |source| UploadError::Io {
                path: path.clone(),
                source,
            };

            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            let mut file = File::open(&path).map_err(io_err)?;
            io::copy(&mut file, &mut hasher).map_err(io_err)?;
            hasher.update([0u8]);
        }

        debug!(root = %root.display(), files = files.len(), "Hashed source tree");
        Ok(hex::encode(hasher.finalize()))
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), UploadError> {
    let io_err = |source| UploadError::Io {
        path: dir.to_path_buf(),
        source,
    };

    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(io_err)?;

        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ArtifactUploader for DigestUploader {
    async fn upload(&self, path: &Path, registry: &str) -> Result<SourceRef, UploadError> {
        let registry = registry.trim_end_matches('/');
        if registry.is_empty() || registry.contains(char::is_whitespace) {
            return Err(UploadError::InvalidRegistry(registry.to_string()));
        }

        let root = path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || Self::digest_tree(&root))
            .await
            .map_err(|e| UploadError::Join(e.to_string()))??;

        let reference = SourceRef::from_digest(&format!("{}/source", registry), &digest);
        info!(path = %path.display(), source = %reference, "Source uploaded");
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn test_upload_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "cmd/controller/main.go", "package main");
        write(dir.path(), "go.mod", "module example.com/kpack");

        let uploader = DigestUploader::new();
        let first = uploader.upload(dir.path(), "registry.local/").await.unwrap();
        let second = uploader.upload(dir.path(), "registry.local").await.unwrap();

        assert_eq!(first, second);
        assert!(first.as_str().starts_with("registry.local/source@sha256:"));
        assert_eq!(first.digest().unwrap().len(), "sha256:".len() + 64);

        write(dir.path(), "cmd/controller/main.go", "package main // changed");
        let third = uploader.upload(dir.path(), "registry.local").await.unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_file_names_contribute_to_digest() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write(a.path(), "one.txt", "same");
        write(b.path(), "two.txt", "same");

        assert_ne!(
            DigestUploader::digest_tree(a.path()).unwrap(),
            DigestUploader::digest_tree(b.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let err = DigestUploader::new()
            .upload(&missing, "registry.local")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_invalid_registry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = DigestUploader::new().upload(dir.path(), "").await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidRegistry(_)));
    }
}
