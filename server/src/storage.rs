//! Object storage through the bucket the platform mounts into the container.
//!
//! Keys are bucket-relative paths such as `voices/alice.wav` or
//! `tts/<uuid>.wav`; they map one-to-one onto files under the mount root.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    InvalidKey(String),

    #[error("failed to access '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Check that `key` stays inside the bucket.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.trim().is_empty() {
        return Err(StorageError::InvalidKey("Object key cannot be empty".to_string()));
    }
    if key.contains('\\') || key.contains('\0') {
        return Err(StorageError::InvalidKey(format!(
            "Object key contains an invalid character: {key}"
        )));
    }
    if key.starts_with('/') {
        return Err(StorageError::InvalidKey(format!(
            "Object key must be relative to the bucket: {key}"
        )));
    }
    if key.split('/').any(|segment| segment.is_empty()) {
        return Err(StorageError::InvalidKey(format!(
            "Object key has an empty path segment: {key}"
        )));
    }
    let escapes = Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(StorageError::InvalidKey(format!(
            "Object key may not contain '.' or '..' segments: {key}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BucketStore {
    root: PathBuf,
}

impl BucketStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of an object.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Write an object, creating intermediate directories.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&path, bytes).await.map_err(io_err)?;
        Ok(())
    }

    /// Fresh key for a synthesized clip: `{prefix}/{uuid}.wav`.
    pub fn new_output_key(prefix: &str) -> String {
        let id = uuid::Uuid::new_v4();
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{id}.wav")
        } else {
            format!("{prefix}/{id}.wav")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_accepts_nested_keys() {
        assert!(validate_key("voices/alice.wav").is_ok());
        assert!(validate_key("prompt.wav").is_ok());
    }

    #[test]
    fn test_validate_key_rejects_escapes() {
        for key in [
            "",
            "   ",
            "/etc/passwd",
            "../secret.wav",
            "voices/../../x.wav",
            "voices//x.wav",
            "./x.wav",
            "voices\\x.wav",
            "voices/",
        ] {
            assert!(validate_key(key).is_err(), "accepted {key:?}");
        }
    }

    #[test]
    fn test_new_output_key() {
        let key = BucketStore::new_output_key("tts");
        assert!(key.starts_with("tts/"));
        assert!(key.ends_with(".wav"));
        assert_eq!(key.len(), "tts/".len() + 36 + ".wav".len());
        assert!(validate_key(&key).is_ok());

        let bare = BucketStore::new_output_key("");
        assert!(!bare.contains('/'));
    }

    #[tokio::test]
    async fn test_put_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = BucketStore::new(dir.path());

        assert!(!store.exists("tts/a.wav").await.unwrap());
        store.put("tts/a.wav", b"RIFF").await.unwrap();
        assert!(store.exists("tts/a.wav").await.unwrap());
        assert_eq!(std::fs::read(dir.path().join("tts/a.wav")).unwrap(), b"RIFF");
    }

    #[tokio::test]
    async fn test_exists_ignores_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("voices")).unwrap();
        let store = BucketStore::new(dir.path());
        assert!(!store.exists("voices").await.unwrap());
    }
}
