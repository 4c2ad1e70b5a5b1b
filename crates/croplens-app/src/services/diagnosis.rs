//! Diagnosis analysis orchestration.
//!
//! Read-only probes against an already-registered record: validates the
//! preconditions, takes the same per-record guard as registration so the
//! two can never race on one record, calls the vision gateway and hands
//! the result back untouched. Never writes to the record and never
//! drives the state machine.

use std::sync::Arc;

use tracing::debug;

use crate::analysis::{AnalysisKind, AnalysisOutcome, AnalysisRequest, DiagnosisTag};
use crate::images::{ImageRepository, ImageStoreError};
use crate::record::RecordStore;
use crate::services::guard::AnalysisGuard;
use crate::services::pipeline::{owned_record, AnalysisError, PipelineResult};
use crate::services::vision::{VisionClient, VisionModel};

pub struct DiagnosisPipeline<M> {
    records: Arc<dyn RecordStore>,
    images: Arc<dyn ImageRepository>,
    vision: Arc<VisionClient<M>>,
    guard: Arc<AnalysisGuard>,
}

impl<M> DiagnosisPipeline<M>
where
    M: VisionModel,
{
    pub fn new(
        records: Arc<dyn RecordStore>,
        images: Arc<dyn ImageRepository>,
        vision: Arc<VisionClient<M>>,
        guard: Arc<AnalysisGuard>,
    ) -> Self {
        Self {
            records,
            images,
            vision,
            guard,
        }
    }

    /// Run one diagnosis analysis and return the decoded result.
    ///
    /// All validation happens before any external call: the kind must be
    /// a diagnosis tag, the record must exist, belong to the requester,
    /// be registered, and have a locatable image. The caller blocks for
    /// the duration of the model call; other records are unaffected.
    pub async fn analyze(
        &self,
        record_id: u64,
        kind: AnalysisKind,
        requester_id: u64,
    ) -> PipelineResult<AnalysisOutcome> {
        let tag = match kind {
            AnalysisKind::Diagnosis(tag) => tag,
            AnalysisKind::Registration => {
                return Err(AnalysisError::WrongKind { kind: kind.name() })
            }
        };

        let record = owned_record(self.records.as_ref(), record_id, requester_id).await?;
        if !record.is_registered {
            return Err(AnalysisError::NotRegistered(record_id));
        }
        if record.image_path.trim().is_empty() {
            return Err(AnalysisError::MissingImage(record_id));
        }
        let bytes = self
            .images
            .load(&record.image_path)
            .await
            .map_err(|err| match err {
                ImageStoreError::NotFound { .. } => AnalysisError::MissingImage(record_id),
                other => AnalysisError::Images(other),
            })?;

        let request = AnalysisRequest::diagnosis(record_id, tag, record.image_path.clone());
        debug!(record_id, tag = tag.name(), "diagnosis analysis starting");

        // Bounded-wait acquisition: a diagnosis may briefly queue behind
        // an in-flight registration re-analysis of the same record, but a
        // stuck guard turns into a busy error instead of wedging.
        let _permit = self.guard.acquire(record_id).await?;
        let outcome = self.vision.analyze(&bytes, request.kind).await?;

        debug!(record_id, tag = tag.name(), "diagnosis analysis completed");
        Ok(outcome)
    }

    /// Convenience for callers that already hold a tag.
    pub async fn analyze_tag(
        &self,
        record_id: u64,
        tag: DiagnosisTag,
        requester_id: u64,
    ) -> PipelineResult<AnalysisOutcome> {
        self.analyze(record_id, AnalysisKind::Diagnosis(tag), requester_id)
            .await
    }
}
