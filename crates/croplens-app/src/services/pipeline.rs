//! Shared pipeline error taxonomy and helpers.

use thiserror::Error;

use crate::analysis::status::TransitionError;
use crate::images::ImageStoreError;
use crate::record::{AnalyzableRecord, RecordStore, RecordStoreError};
use crate::services::guard::GuardError;
use crate::services::vision::VisionError;

pub type PipelineResult<T> = Result<T, AnalysisError>;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("record {0} not found")]
    RecordNotFound(u64),
    #[error("record {record_id} does not belong to requester {requester_id}")]
    NotOwner { record_id: u64, requester_id: u64 },
    #[error("record {0} is not registered")]
    NotRegistered(u64),
    #[error("record {0} has no stored image")]
    MissingImage(u64),
    #[error("analysis kind `{kind}` is not valid for this operation")]
    WrongKind { kind: &'static str },
    #[error("record {record_id} is not eligible: {reason}")]
    NotEligible { record_id: u64, reason: String },
    #[error("staged image is invalid: {0}")]
    InvalidStaging(String),
    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("analysis worker pool is full, retry later")]
    QueueFull,
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error(transparent)]
    Records(#[from] RecordStoreError),
    #[error(transparent)]
    Images(#[from] ImageStoreError),
    #[error("analysis task join failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl AnalysisError {
    /// Rejected synchronously before any external call; the caller's
    /// request was wrong, not the system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AnalysisError::RecordNotFound(_)
                | AnalysisError::NotOwner { .. }
                | AnalysisError::NotRegistered(_)
                | AnalysisError::MissingImage(_)
                | AnalysisError::WrongKind { .. }
                | AnalysisError::NotEligible { .. }
                | AnalysisError::InvalidStaging(_)
                | AnalysisError::IllegalTransition(_)
        )
    }

    /// Indicates a client retry-later, not a permanent failure.
    pub fn is_retry_later(&self) -> bool {
        matches!(self, AnalysisError::Guard(_) | AnalysisError::QueueFull)
    }
}

/// Fetch a record and enforce ownership, the shared precondition of
/// every pipeline operation.
pub(crate) async fn owned_record(
    records: &dyn RecordStore,
    record_id: u64,
    requester_id: u64,
) -> PipelineResult<AnalyzableRecord> {
    let record = records
        .get(record_id)
        .await?
        .ok_or(AnalysisError::RecordNotFound(record_id))?;
    if record.owner_id != requester_id {
        return Err(AnalysisError::NotOwner {
            record_id,
            requester_id,
        });
    }
    Ok(record)
}
