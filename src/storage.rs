//! Digest-addressed file storage.
//!
//! Everything staged into a sandbox (reference outputs, submitted files,
//! comparators) is fetched from a [`FileCacher`] by its digest, the lowercase
//! hex SHA-256 of the content.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

pub trait FileCacher: Send + Sync {
    /// Returns the content stored under `digest`
    fn get(&self, digest: &str) -> Result<Vec<u8>>;

    /// Stores `content` and returns its digest
    fn put(&self, content: &[u8]) -> Result<String>;

    fn put_file(&self, path: &Path) -> Result<String> {
        let content =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        self.put(&content)
    }
}

pub fn compute_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// In-process storage, used by tests and one-shot runs
#[derive(Default)]
pub struct MemoryCacher {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCacher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileCacher for MemoryCacher {
    fn get(&self, digest: &str) -> Result<Vec<u8>> {
        self.files
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| anyhow!("Digest {digest} not found in storage"))
    }

    fn put(&self, content: &[u8]) -> Result<String> {
        let digest = compute_digest(content);
        self.files
            .write()
            .entry(digest.clone())
            .or_insert_with(|| content.to_vec());
        Ok(digest)
    }
}

/// Storage backed by a directory holding one file per digest
pub struct DirCacher {
    root: PathBuf,
}

impl DirCacher {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create storage dir {}", root.display()))?;
        Ok(Self { root })
    }

    /// Opens the storage in the per-user data directory
    pub fn open_default() -> Result<Self> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "outjudge")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;
        Self::open(proj_dirs.data_local_dir().join("storage"))
    }

    fn path_of(&self, digest: &str) -> Result<PathBuf> {
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("Malformed digest {digest:?}");
        }
        Ok(self.root.join(digest))
    }
}

impl FileCacher for DirCacher {
    fn get(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.path_of(digest)?;
        fs::read(&path).with_context(|| format!("Digest {digest} not found in storage"))
    }

    fn put(&self, content: &[u8]) -> Result<String> {
        let digest = compute_digest(content);
        let path = self.path_of(&digest)?;
        if !path.exists() {
            // Write then rename so readers never see a partial file
            let tmp = self.root.join(format!(".{digest}.tmp"));
            fs::write(&tmp, content)?;
            fs::rename(&tmp, &path)?;
            log::debug!("Stored {} bytes as {digest}", content.len());
        }
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_sha256_hex() {
        assert_eq!(
            compute_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_memory_cacher() {
        let cacher = MemoryCacher::new();
        let digest = cacher.put(b"42\n").unwrap();
        assert_eq!(cacher.get(&digest).unwrap(), b"42\n");
        assert!(cacher.get("deadbeef").is_err());
    }

    #[test]
    fn test_dir_cacher() {
        let dir = tempfile::tempdir().unwrap();
        let cacher = DirCacher::open(dir.path()).unwrap();
        let digest = cacher.put(b"hello").unwrap();
        assert_eq!(cacher.put(b"hello").unwrap(), digest);
        assert_eq!(cacher.get(&digest).unwrap(), b"hello");
        assert!(cacher.get("../etc/passwd").is_err());
    }
}
