//! In-process checkpoint store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CheckpointRecord, CheckpointStore, check_save};
use crate::core::turn::SessionKey;
use crate::error::CheckpointError;

/// Keeps every saved version in memory. Not durable across restarts.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<SessionKey, Vec<CheckpointRecord>>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `save` fail with an I/O error until reset.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Every retained version for `key`, oldest first.
    pub fn versions(&self, key: &SessionKey) -> Vec<u64> {
        self.lock()
            .get(key)
            .map(|records| records.iter().map(|r| r.version).collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, Vec<CheckpointRecord>>> {
        // A poisoned map is still consistent: records are pushed whole.
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), CheckpointError> {
        if self.is_closed() {
            return Err(CheckpointError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &SessionKey) -> Result<Option<CheckpointRecord>, CheckpointError> {
        self.ensure_open()?;
        Ok(self.lock().get(key).and_then(|records| records.last().cloned()))
    }

    async fn save(
        &self,
        key: &SessionKey,
        record: &CheckpointRecord,
    ) -> Result<(), CheckpointError> {
        self.ensure_open()?;
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CheckpointError::io(
                key.as_str(),
                std::io::Error::other("injected save failure"),
            ));
        }

        let mut records = self.lock();
        let versions = records.entry(key.clone()).or_default();
        let latest = versions.last().map_or(0, |r| r.version);
        check_save(key, latest, record)?;
        versions.push(record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), CheckpointError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
