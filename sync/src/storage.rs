//! Durable replica state on disk.
//!
//! The whole replica is one JSON snapshot file in the data directory. Saves
//! go to a temporary file that is synced and renamed over the previous one,
//! so a crash leaves either the old or the new state. A file whose envelope
//! cannot be parsed is moved aside and reported; single records that fail to
//! decode are isolated by the engine instead.

use crate::error::Result;
use laguna_engine::ReplicaSnapshot;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Name of the state file inside the data directory.
pub const STATE_FILE: &str = "laguna-state.json";

/// What was found in the data directory.
#[derive(Debug)]
pub enum Loaded {
    /// No state file yet
    Empty,
    /// A readable snapshot
    Restored(ReplicaSnapshot),
    /// The state file was unreadable and has been moved to `path`
    Quarantined { path: PathBuf, reason: String },
}

/// Snapshot file storage in a data directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open storage in `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state file.
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Read the state file.
    pub async fn load(&self) -> Result<Loaded> {
        let path = self.state_path();
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Empty),
            Err(err) => return Err(err.into()),
        };

        match ReplicaSnapshot::from_json(&json) {
            Ok(snapshot) => Ok(Loaded::Restored(snapshot)),
            Err(err) => {
                let reason = err.to_string();
                let path = self.quarantine(&reason).await?;
                Ok(Loaded::Quarantined { path, reason })
            }
        }
    }

    /// Move the state file aside so the next load starts clean.
    ///
    /// Used for files that parse but cannot be restored, such as a snapshot
    /// written under another schema version.
    pub async fn quarantine(&self, reason: &str) -> Result<PathBuf> {
        let quarantined = self.dir.join(format!(
            "{}.corrupt-{}",
            STATE_FILE,
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        tokio::fs::rename(self.state_path(), &quarantined).await?;
        tracing::error!(
            path = %quarantined.display(),
            reason = %reason,
            "State file moved aside"
        );
        Ok(quarantined)
    }

    /// Atomically replace the state file.
    pub async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()> {
        let json = snapshot.to_json()?;
        let path = self.state_path();
        let temp_path = path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        // Atomic rename
        tokio::fs::rename(&temp_path, &path).await?;

        tracing::trace!(
            path = %path.display(),
            bytes = json.len(),
            "State saved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use laguna_engine::{LocalWrite, Replica};
    use serde_json::json;
    use tempfile::TempDir;

    fn snapshot() -> ReplicaSnapshot {
        let mut replica = Replica::new(crate::schema::default_schema(), "device-1");
        let fields = json!({"nombre": "Goku", "precio": 30.0})
            .as_object()
            .cloned()
            .unwrap();
        replica
            .write("figuras", "r1", LocalWrite::Create(fields), 1000)
            .unwrap();
        replica.export_snapshot().unwrap()
    }

    #[tokio::test]
    async fn empty_directory_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path().join("nested")).await.unwrap();

        assert!(matches!(storage.load().await.unwrap(), Loaded::Empty));
        assert!(storage.dir().exists());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let saved = snapshot();

        storage.save(&saved).await.unwrap();

        match storage.load().await.unwrap() {
            Loaded::Restored(loaded) => assert_eq!(loaded, saved),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!storage.state_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn unreadable_file_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        tokio::fs::write(storage.state_path(), "{ truncated")
            .await
            .unwrap();

        let loaded = storage.load().await.unwrap();

        let Loaded::Quarantined { path, reason } = loaded else {
            panic!("expected quarantine");
        };
        assert!(path.exists());
        assert!(!reason.is_empty());
        assert!(!storage.state_path().exists());
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "{ truncated"
        );

        // Next load starts clean
        assert!(matches!(storage.load().await.unwrap(), Loaded::Empty));
    }

    #[tokio::test]
    async fn readable_file_can_be_moved_aside() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        storage.save(&snapshot()).await.unwrap();

        let path = storage.quarantine("schema version mismatch").await.unwrap();

        assert!(path.exists());
        assert!(!storage.state_path().exists());
        assert!(matches!(storage.load().await.unwrap(), Loaded::Empty));
    }
}
