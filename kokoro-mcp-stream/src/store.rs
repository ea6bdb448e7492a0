//! Audio payload storage.
//!
//! Every synthesized chunk is handed to an [`AudioStore`], which keeps the
//! bytes somewhere the caller can reach and returns an [`AudioRef`].
//! [`MemoryAudioStore`] keeps payloads in process for real-time delivery;
//! [`FileAudioStore`] writes WAV files into the temp audio directory and
//! references them by the URL under which that directory is published.

use crate::engine::RawAudio;
use async_trait::async_trait;
use kokoro_mcp_common::config::{AudioDelivery, Config};
use kokoro_mcp_common::error::StoreError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Scheme prefix of in-memory references.
pub const MEMORY_SCHEME: &str = "memory://";

/// Caller-resolvable reference to a stored audio payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AudioRef(String);

impl AudioRef {
    /// Wrap a reference string.
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// The reference as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AudioRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage for synthesized audio payloads.
#[async_trait]
pub trait AudioStore: Send + Sync {
    /// Store the payload of chunk `index` of `session_id`.
    async fn put(&self, session_id: &str, index: u64, audio: RawAudio)
    -> Result<AudioRef, StoreError>;

    /// Load a stored payload back.
    async fn resolve(&self, audio_ref: &AudioRef) -> Result<RawAudio, StoreError>;

    /// Drop every payload stored for `session_id`, returning how many were
    /// released.
    async fn release_session(&self, session_id: &str) -> Result<usize, StoreError>;

    /// Whether references point at published files rather than in-process
    /// payloads.
    fn delivery(&self) -> AudioDelivery;
}

/// Build the store selected by `config.delivery`.
pub fn store_from_config(config: &Config) -> Arc<dyn AudioStore> {
    match config.delivery {
        AudioDelivery::Memory => Arc::new(MemoryAudioStore::new()),
        AudioDelivery::File => Arc::new(FileAudioStore::new(
            config.temp_audio_dir.clone(),
            config.audio_base_url(),
        )),
    }
}

// =============================================================================
// Memory store
// =============================================================================

/// Keeps payloads in memory under `memory://<session>/<index>`.
#[derive(Debug, Default)]
pub struct MemoryAudioStore {
    payloads: RwLock<HashMap<AudioRef, RawAudio>>,
}

impl MemoryAudioStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payloads currently held.
    pub async fn len(&self) -> usize {
        self.payloads.read().await.len()
    }

    /// Whether the store holds no payloads.
    pub async fn is_empty(&self) -> bool {
        self.payloads.read().await.is_empty()
    }
}

#[async_trait]
impl AudioStore for MemoryAudioStore {
    async fn put(
        &self,
        session_id: &str,
        index: u64,
        audio: RawAudio,
    ) -> Result<AudioRef, StoreError> {
        let audio_ref = AudioRef::new(format!("{}{}/{}", MEMORY_SCHEME, session_id, index));
        self.payloads.write().await.insert(audio_ref.clone(), audio);
        Ok(audio_ref)
    }

    async fn resolve(&self, audio_ref: &AudioRef) -> Result<RawAudio, StoreError> {
        self.payloads
            .read()
            .await
            .get(audio_ref)
            .cloned()
            .ok_or_else(|| StoreError::UnknownRef(audio_ref.to_string()))
    }

    async fn release_session(&self, session_id: &str) -> Result<usize, StoreError> {
        let prefix = format!("{}{}/", MEMORY_SCHEME, session_id);
        let mut payloads = self.payloads.write().await;
        let before = payloads.len();
        payloads.retain(|r, _| !r.as_str().starts_with(&prefix));
        Ok(before - payloads.len())
    }

    fn delivery(&self) -> AudioDelivery {
        AudioDelivery::Memory
    }
}

// =============================================================================
// File store
// =============================================================================

/// Writes payloads as `<session>_<index>.wav` into a directory published at
/// `base_url`.
#[derive(Debug, Clone)]
pub struct FileAudioStore {
    dir: PathBuf,
    base_url: String,
}

impl FileAudioStore {
    /// Create a store writing into `dir`, whose files are served under
    /// `base_url` (e.g. `http://127.0.0.1:8080/audio`).
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Directory that holds the audio files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// URL under which `file_name` is published.
    pub fn uri_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.base_url, file_name)
    }

    /// Map a published URI back to a path inside the audio directory.
    ///
    /// # Errors
    /// - `StoreError::InvalidUri` if the URI cannot be parsed or names no file
    /// - `StoreError::OutsideDirectory` if it is not under the published
    ///   prefix or would escape the directory
    pub fn path_for_uri(&self, uri: &str) -> Result<PathBuf, StoreError> {
        let parsed =
            reqwest::Url::parse(uri).map_err(|e| StoreError::InvalidUri(format!("{}: {}", uri, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(StoreError::InvalidUri(uri.to_string()));
        }

        let base_path = reqwest::Url::parse(&self.base_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default();
        let file_name = parsed
            .path()
            .strip_prefix(&base_path)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| StoreError::OutsideDirectory(uri.to_string()))?;

        if file_name.is_empty() {
            return Err(StoreError::InvalidUri(uri.to_string()));
        }
        if file_name.contains(['/', '\\']) || file_name.starts_with('.') {
            return Err(StoreError::OutsideDirectory(uri.to_string()));
        }

        Ok(self.dir.join(file_name))
    }

    /// Delete the file addressed by `uri`.
    ///
    /// Returns whether the file existed.
    pub async fn cleanup(&self, uri: &str) -> Result<bool, StoreError> {
        let path = self.path_for_uri(uri)?;

        // Symlinks could still point elsewhere.
        if let (Ok(dir), Ok(real)) = (
            tokio::fs::canonicalize(&self.dir).await,
            tokio::fs::canonicalize(&path).await,
        ) {
            if !real.starts_with(&dir) {
                return Err(StoreError::OutsideDirectory(uri.to_string()));
            }
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "Deleted audio file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Audio file already gone");
                Ok(false)
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/ogg" | "audio/opus" => "ogg",
        "audio/flac" => "flac",
        _ => "wav",
    }
}

#[async_trait]
impl AudioStore for FileAudioStore {
    async fn put(
        &self,
        session_id: &str,
        index: u64,
        audio: RawAudio,
    ) -> Result<AudioRef, StoreError> {
        let file_name = format!("{}_{}.{}", session_id, index, extension_for(&audio.mime_type));
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(&file_name), &audio.data).await?;
        debug!(file = %file_name, bytes = audio.data.len(), "Wrote audio file");
        Ok(AudioRef::new(self.uri_for(&file_name)))
    }

    async fn resolve(&self, audio_ref: &AudioRef) -> Result<RawAudio, StoreError> {
        let path = self.path_for_uri(audio_ref.as_str())?;
        let mime_type = match path.extension().and_then(|e| e.to_str()) {
            Some("mp3") => "audio/mpeg",
            Some("ogg") => "audio/ogg",
            Some("flac") => "audio/flac",
            _ => "audio/wav",
        };
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(RawAudio {
                data,
                mime_type: mime_type.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::UnknownRef(audio_ref.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn release_session(&self, session_id: &str) -> Result<usize, StoreError> {
        let prefix = format!("{}_", session_id);
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut released = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&prefix) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => released += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to delete audio file"),
            }
        }
        Ok(released)
    }

    fn delivery(&self) -> AudioDelivery {
        AudioDelivery::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_store(dir: &TempDir) -> FileAudioStore {
        FileAudioStore::new(dir.path(), "http://127.0.0.1:8080/audio")
    }

    #[tokio::test]
    async fn test_memory_store_put_resolve_release() {
        let store = MemoryAudioStore::new();
        let r0 = store.put("s1", 0, RawAudio::wav(vec![1, 2])).await.unwrap();
        let r1 = store.put("s1", 1, RawAudio::wav(vec![3])).await.unwrap();
        store.put("s2", 0, RawAudio::wav(vec![4])).await.unwrap();

        assert_eq!(r0.as_str(), "memory://s1/0");
        assert_eq!(store.resolve(&r1).await.unwrap().data, vec![3]);

        assert_eq!(store.release_session("s1").await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
        assert!(matches!(
            store.resolve(&r0).await,
            Err(StoreError::UnknownRef(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_release_does_not_match_id_prefixes() {
        let store = MemoryAudioStore::new();
        store.put("s1", 0, RawAudio::wav(vec![1])).await.unwrap();
        store.put("s10", 0, RawAudio::wav(vec![2])).await.unwrap();
        assert_eq!(store.release_session("s1").await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_file_store_writes_wav_and_returns_url() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);

        let audio_ref = store.put("abc", 3, RawAudio::wav(b"RIFF".to_vec())).await.unwrap();
        assert_eq!(audio_ref.as_str(), "http://127.0.0.1:8080/audio/abc_3.wav");
        assert_eq!(std::fs::read(dir.path().join("abc_3.wav")).unwrap(), b"RIFF");

        let resolved = store.resolve(&audio_ref).await.unwrap();
        assert_eq!(resolved.data, b"RIFF");
        assert_eq!(resolved.mime_type, "audio/wav");
    }

    #[tokio::test]
    async fn test_file_store_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let store = FileAudioStore::new(dir.path().join("nested"), "http://h:1/audio");
        store.put("s", 0, RawAudio::wav(vec![0])).await.unwrap();
        assert!(dir.path().join("nested").join("s_0.wav").exists());
    }

    #[tokio::test]
    async fn test_cleanup_deletes_file_once() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);
        let audio_ref = store.put("abc", 0, RawAudio::wav(vec![1])).await.unwrap();

        assert!(store.cleanup(audio_ref.as_str()).await.unwrap());
        assert!(!dir.path().join("abc_0.wav").exists());
        assert!(!store.cleanup(audio_ref.as_str()).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_rejects_traversal_and_foreign_paths() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);

        for uri in [
            "http://127.0.0.1:8080/audio/../secret.wav",
            "http://127.0.0.1:8080/audio/%2e%2e/secret.wav",
            "http://127.0.0.1:8080/audio/sub/x.wav",
            "http://127.0.0.1:8080/other/x.wav",
            "http://127.0.0.1:8080/audio/.hidden",
        ] {
            let err = store.cleanup(uri).await.unwrap_err();
            assert!(
                matches!(err, StoreError::OutsideDirectory(_)),
                "{} gave {:?}",
                uri,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_cleanup_rejects_malformed_uri() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);

        assert!(matches!(
            store.cleanup("not a url").await,
            Err(StoreError::InvalidUri(_))
        ));
        assert!(matches!(
            store.cleanup("ftp://127.0.0.1/audio/x.wav").await,
            Err(StoreError::InvalidUri(_))
        ));
        assert!(matches!(
            store.cleanup("http://127.0.0.1:8080/audio/").await,
            Err(StoreError::InvalidUri(_))
        ));
    }

    #[tokio::test]
    async fn test_file_release_session_removes_only_its_files() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir);
        store.put("a", 0, RawAudio::wav(vec![1])).await.unwrap();
        store.put("a", 1, RawAudio::wav(vec![1])).await.unwrap();
        store.put("b", 0, RawAudio::wav(vec![1])).await.unwrap();

        assert_eq!(store.release_session("a").await.unwrap(), 2);
        assert!(dir.path().join("b_0.wav").exists());
    }

    #[tokio::test]
    async fn test_release_session_on_missing_directory() {
        let dir = TempDir::new().unwrap();
        let store = FileAudioStore::new(dir.path().join("never-created"), "http://h:1/audio");
        assert_eq!(store.release_session("a").await.unwrap(), 0);
    }

    #[test]
    fn test_store_from_config_follows_delivery() {
        let mut config = Config::default();
        config.delivery = AudioDelivery::Memory;
        assert_eq!(store_from_config(&config).delivery(), AudioDelivery::Memory);
        config.delivery = AudioDelivery::File;
        assert_eq!(store_from_config(&config).delivery(), AudioDelivery::File);
    }
}
