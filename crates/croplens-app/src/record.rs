//! The record under analysis and its keyed store seam.
//!
//! Row storage is an external collaborator here; the pipeline only
//! depends on the `RecordStore` trait. Readers always observe a whole
//! record snapshot because the only mutation primitive is a full-record
//! replace, which is what keeps `is_registered`, `analysis_status` and
//! the output fields consistent for concurrent status queries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::status::AnalysisStatus;
use crate::analysis::RegistrationFields;

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

/// A staged or registered crop record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzableRecord {
    pub id: u64,
    pub owner_id: u64,
    pub analysis_status: AnalysisStatus,
    pub is_registered: bool,
    pub image_path: String,
    /// Registration analysis output; `None` until a run completes.
    pub registration: Option<RegistrationFields>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl AnalyzableRecord {
    #[must_use]
    pub fn staged(id: u64, owner_id: u64, image_path: impl Into<String>) -> Self {
        let now_ms = current_timestamp_ms();
        Self {
            id,
            owner_id,
            analysis_status: AnalysisStatus::Pending,
            is_registered: false,
            image_path: image_path.into(),
            registration: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn set_status(&mut self, status: AnalysisStatus) {
        self.analysis_status = status;
        self.updated_at_ms = current_timestamp_ms();
    }

    pub fn apply_registration(&mut self, fields: RegistrationFields) {
        self.registration = Some(fields);
        self.updated_at_ms = current_timestamp_ms();
    }

    /// Open a fresh analysis cycle on a terminal record. Previous output
    /// fields stay in place until the new run overwrites them, but the
    /// registered flag drops for the duration of the re-run: readers
    /// must never see a registered record that is not `Completed`, so a
    /// re-analyzed record needs a fresh finalize once it completes.
    pub fn reset_for_reanalysis(&mut self) {
        debug_assert!(self.analysis_status.is_terminal());
        self.analysis_status = AnalysisStatus::Pending;
        self.is_registered = false;
        self.updated_at_ms = current_timestamp_ms();
    }
}

/// Seed for a store-assigned record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub owner_id: u64,
    pub image_path: String,
}

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("record {0} already exists")]
    Duplicate(u64),
    #[error("record {0} not found")]
    NotFound(u64),
    #[error("record storage failure: {0}")]
    Storage(String),
}

/// Keyed record storage collaborator.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record with a store-assigned id, created `Pending`
    /// and unregistered.
    async fn insert(&self, new: NewRecord) -> Result<AnalyzableRecord, RecordStoreError>;

    async fn get(&self, id: u64) -> Result<Option<AnalyzableRecord>, RecordStoreError>;

    /// Replace the whole record in one step. Fails if the id is unknown.
    async fn put(&self, record: AnalyzableRecord) -> Result<(), RecordStoreError>;

    async fn delete(&self, id: u64) -> Result<(), RecordStoreError>;
}

/// In-memory store used by tests and the one-shot CLI.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    next_id: AtomicU64,
    rows: Mutex<HashMap<u64, AnalyzableRecord>>,
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, new: NewRecord) -> Result<AnalyzableRecord, RecordStoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = AnalyzableRecord::staged(id, new.owner_id, new.image_path);
        let mut rows = self.rows.lock().expect("record table poisoned");
        if rows.contains_key(&id) {
            return Err(RecordStoreError::Duplicate(id));
        }
        rows.insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: u64) -> Result<Option<AnalyzableRecord>, RecordStoreError> {
        let rows = self.rows.lock().expect("record table poisoned");
        Ok(rows.get(&id).cloned())
    }

    async fn put(&self, record: AnalyzableRecord) -> Result<(), RecordStoreError> {
        let mut rows = self.rows.lock().expect("record table poisoned");
        if !rows.contains_key(&record.id) {
            return Err(RecordStoreError::NotFound(record.id));
        }
        rows.insert(record.id, record);
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<(), RecordStoreError> {
        let mut rows = self.rows.lock().expect("record table poisoned");
        rows.remove(&id)
            .map(|_| ())
            .ok_or(RecordStoreError::NotFound(id))
    }
}
