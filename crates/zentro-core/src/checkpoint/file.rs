//! Durable checkpoint store backed by one JSON file per version.
//!
//! Layout: `{dir}/{session_key}/{version:020}.json`. Writes go to a hidden
//! temp file in the same directory, are fsynced, then renamed into place, so
//! a crash leaves either the old latest version or the new one.
//!
//! The store owns a single background task (the "connection") that performs
//! all filesystem work. It is started by the first operation; concurrent
//! first callers wait for it to open.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{OnceCell, mpsc, oneshot};

use super::{CheckpointRecord, CheckpointStore, check_save};
use crate::core::turn::SessionKey;
use crate::error::CheckpointError;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

enum Command {
    Load {
        key: SessionKey,
        reply: oneshot::Sender<Result<Option<CheckpointRecord>, CheckpointError>>,
    },
    Save {
        key: SessionKey,
        record: Box<CheckpointRecord>,
        reply: oneshot::Sender<Result<(), CheckpointError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    retain_versions: usize,
    connection: OnceCell<mpsc::Sender<Command>>,
    closed: AtomicBool,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `dir`. Nothing touches the disk until the
    /// first operation.
    pub fn new(dir: impl Into<PathBuf>, retain_versions: usize) -> Self {
        Self {
            dir: dir.into(),
            retain_versions: retain_versions.max(1),
            connection: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Opens the connection on first use and returns its command sender.
    async fn connection(&self) -> Result<&mpsc::Sender<Command>, CheckpointError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CheckpointError::Closed);
        }
        self.connection
            .get_or_try_init(|| open(self.dir.clone(), self.retain_versions))
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, CheckpointError>>) -> Command,
    ) -> Result<T, CheckpointError> {
        let tx = self.connection().await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(build(reply_tx))
            .await
            .map_err(|_closed| CheckpointError::Closed)?;
        reply_rx.await.map_err(|_dropped| CheckpointError::Closed)?
    }
}

async fn open(dir: PathBuf, retain_versions: usize) -> Result<mpsc::Sender<Command>, CheckpointError> {
    let create_dir = dir.clone();
    tokio::task::spawn_blocking(move || {
        fs::create_dir_all(&create_dir).map_err(|e| CheckpointError::io(&create_dir, e))
    })
    .await
    .map_err(|e| CheckpointError::Open(e.to_string()))??;

    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    tokio::spawn(run_connection(dir.clone(), retain_versions, rx));
    tracing::info!(dir = %dir.display(), "checkpoint store opened");
    Ok(tx)
}

/// Serves commands until `Close` arrives or every sender is gone.
async fn run_connection(dir: PathBuf, retain_versions: usize, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Load { key, reply } => {
                let dir = dir.clone();
                let result = blocking(move || load_latest(&dir, &key)).await;
                let _ = reply.send(result);
            }
            Command::Save { key, record, reply } => {
                let dir = dir.clone();
                let result =
                    blocking(move || save_version(&dir, &key, &record, retain_versions)).await;
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                rx.close();
                // Anything queued behind the close is refused.
                while let Some(pending) = rx.recv().await {
                    reject(pending);
                }
                tracing::info!(dir = %dir.display(), "checkpoint store closed");
                let _ = reply.send(());
                return;
            }
        }
    }
}

fn reject(command: Command) {
    match command {
        Command::Load { reply, .. } => {
            let _ = reply.send(Err(CheckpointError::Closed));
        }
        Command::Save { reply, .. } => {
            let _ = reply.send(Err(CheckpointError::Closed));
        }
        Command::Close { reply } => {
            let _ = reply.send(());
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, CheckpointError>
where
    F: FnOnce() -> Result<T, CheckpointError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CheckpointError::Open(format!("checkpoint worker failed: {e}")))?
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let key = key.clone();
        self.request(|reply| Command::Load { key, reply }).await
    }

    async fn save(
        &self,
        key: &SessionKey,
        record: &CheckpointRecord,
    ) -> Result<(), CheckpointError> {
        let key = key.clone();
        let record = Box::new(record.clone());
        self.request(|reply| Command::Save { key, record, reply })
            .await
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(tx) = self.connection.get() else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(Command::Close { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
        Ok(())
    }
}

fn session_dir(root: &Path, key: &SessionKey) -> PathBuf {
    root.join(key.as_str())
}

fn version_path(dir: &Path, version: u64) -> PathBuf {
    dir.join(format!("{version:020}.json"))
}

/// Committed versions in `dir`, ascending. Temp files are skipped.
fn list_versions(dir: &Path) -> Result<Vec<u64>, CheckpointError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CheckpointError::io(dir, e)),
    };

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CheckpointError::io(dir, e))?;
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
            continue;
        };
        if let Ok(version) = stem.parse::<u64>() {
            versions.push(version);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

fn load_latest(root: &Path, key: &SessionKey) -> Result<Option<CheckpointRecord>, CheckpointError> {
    let dir = session_dir(root, key);
    let versions = list_versions(&dir)?;
    let Some(&latest) = versions.last() else {
        return Ok(None);
    };
    let path = version_path(&dir, latest);
    let bytes = fs::read(&path).map_err(|e| CheckpointError::io(&path, e))?;
    CheckpointRecord::decode(&bytes).map(Some)
}

fn save_version(
    root: &Path,
    key: &SessionKey,
    record: &CheckpointRecord,
    retain_versions: usize,
) -> Result<(), CheckpointError> {
    let dir = session_dir(root, key);
    fs::create_dir_all(&dir).map_err(|e| CheckpointError::io(&dir, e))?;

    let versions = list_versions(&dir)?;
    check_save(key, versions.last().copied().unwrap_or(0), record)?;

    let body = record.encode()?;
    let tmp_path = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let target = version_path(&dir, record.version);

    let written = write_synced(&tmp_path, &body).and_then(|()| {
        fs::rename(&tmp_path, &target).map_err(|e| CheckpointError::io(&target, e))
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    sync_dir(&dir)?;

    tracing::debug!(session = %key, version = record.version, "checkpoint saved");
    prune(&dir, &versions, record.version, retain_versions);
    Ok(())
}

fn write_synced(path: &Path, body: &[u8]) -> Result<(), CheckpointError> {
    let mut file = fs::File::create(path).map_err(|e| CheckpointError::io(path, e))?;
    file.write_all(body)
        .map_err(|e| CheckpointError::io(path, e))?;
    file.sync_all().map_err(|e| CheckpointError::io(path, e))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), CheckpointError> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| CheckpointError::io(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), CheckpointError> {
    Ok(())
}

/// Deletes versions older than the newest `retain` (including `latest`).
/// Failures only cost disk space, so they are logged and ignored.
fn prune(dir: &Path, previous: &[u64], latest: u64, retain: usize) {
    let keep_from = latest.saturating_sub(retain as u64 - 1);
    for &version in previous.iter().filter(|&&v| v < keep_from) {
        let path = version_path(dir, version);
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to prune checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::checkpoint::Scratch;
    use crate::core::turn::PendingTurn;

    fn next(record: &CheckpointRecord, text: &str) -> CheckpointRecord {
        record.successor(
            PendingTurn::new(text).complete(format!("re: {text}")),
            Scratch::default(),
        )
    }

    #[tokio::test]
    async fn test_nothing_is_created_before_first_use() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("checkpoints");
        let store = FileCheckpointStore::new(&dir, 3);
        assert!(!dir.exists());

        let key = SessionKey::parse("1:a").unwrap();
        assert!(store.load(&key).await.unwrap().is_none());
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp.path(), 3);
        let key = SessionKey::parse("1:a").unwrap();

        let v1 = next(&CheckpointRecord::empty(&key), "hello");
        store.save(&key, &v1).await.unwrap();

        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.turns, v1.turns);
        assert_eq!(loaded.version, 1);
        assert!(temp.path().join("1:a").join(format!("{:020}.json", 1)).is_file());
    }

    #[tokio::test]
    async fn test_prunes_to_retained_versions() {
        let temp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp.path(), 2);
        let key = SessionKey::default();

        let mut record = CheckpointRecord::empty(&key);
        for i in 0..4 {
            record = next(&record, &format!("m{i}"));
            store.save(&key, &record).await.unwrap();
        }

        assert_eq!(list_versions(&temp.path().join("api")).unwrap(), vec![3, 4]);
        assert_eq!(store.load(&key).await.unwrap().unwrap().turns.len(), 4);
    }

    #[tokio::test]
    async fn test_ignores_stray_temp_files() {
        let temp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp.path(), 3);
        let key = SessionKey::default();
        let v1 = next(&CheckpointRecord::empty(&key), "kept");
        store.save(&key, &v1).await.unwrap();

        fs::write(temp.path().join("api").join(".deadbeef.tmp"), b"{\"torn").unwrap();

        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_conflicting_save_keeps_previous_version() {
        let temp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp.path(), 3);
        let key = SessionKey::default();
        let v1 = next(&CheckpointRecord::empty(&key), "first");
        store.save(&key, &v1).await.unwrap();

        let rival = next(&CheckpointRecord::empty(&key), "rival");
        let err = store.save(&key, &rival).await.unwrap_err();
        assert!(matches!(err, CheckpointError::VersionConflict { expected: 2, .. }));
        assert_eq!(store.load(&key).await.unwrap().unwrap(), v1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let temp = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(temp.path(), 3);
        let key = SessionKey::default();
        store.load(&key).await.unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(store.load(&key).await, Err(CheckpointError::Closed)));
    }

    #[tokio::test]
    async fn test_close_before_open() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("never");
        let store = FileCheckpointStore::new(&dir, 3);
        store.close().await.unwrap();
        assert!(matches!(
            store.load(&SessionKey::default()).await,
            Err(CheckpointError::Closed)
        ));
        assert!(!dir.exists());
    }
}
