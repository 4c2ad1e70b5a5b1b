//! Registration analysis orchestration.
//!
//! Owns the record's analysis lifecycle: acquires the per-record guard,
//! drives the state machine, dispatches the model call onto a bounded
//! worker pool and reconciles success or failure back into the record.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analysis::status::{transition, AnalysisEvent, AnalysisStatus};
use crate::analysis::{AnalysisFields, AnalysisKind, AnalysisRequest, StatusReport};
use crate::images::ImageRepository;
use crate::record::{AnalyzableRecord, NewRecord, RecordStore};
use crate::services::guard::{AnalysisGuard, GuardPermit};
use crate::services::pipeline::{owned_record, AnalysisError, PipelineResult};
use crate::services::vision::{VisionClient, VisionModel};

/// Image bytes staged for the combined create-and-analyze flow.
#[derive(Debug, Clone)]
pub struct StagedImage {
    pub image_path: String,
    pub bytes: Vec<u8>,
}

/// Handle to a dispatched registration run.
///
/// The submit call returns as soon as the record is `Analyzing`; callers
/// poll progress through the status query, or await `join` when they
/// want the reconciled record.
#[derive(Debug)]
pub struct SubmittedAnalysis {
    pub request: AnalysisRequest,
    task: JoinHandle<PipelineResult<AnalyzableRecord>>,
}

impl SubmittedAnalysis {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> PipelineResult<AnalyzableRecord> {
        self.task.await?
    }
}

pub struct RegistrationPipeline<M> {
    records: Arc<dyn RecordStore>,
    images: Arc<dyn ImageRepository>,
    vision: Arc<VisionClient<M>>,
    guard: Arc<AnalysisGuard>,
    worker_slots: Arc<Semaphore>,
}

impl<M> RegistrationPipeline<M>
where
    M: VisionModel + 'static,
{
    pub fn new(
        records: Arc<dyn RecordStore>,
        images: Arc<dyn ImageRepository>,
        vision: Arc<VisionClient<M>>,
        guard: Arc<AnalysisGuard>,
        worker_slots: usize,
    ) -> Self {
        Self {
            records,
            images,
            vision,
            guard,
            worker_slots: Arc::new(Semaphore::new(worker_slots.max(1))),
        }
    }

    /// Dispatch a registration analysis without blocking the caller.
    ///
    /// The guard is taken fail-fast and `Pending -> Analyzing` is
    /// persisted before returning, so a double submission surfaces as a
    /// busy or illegal-transition error instead of a second model call.
    /// When no worker slot is free the submission is rejected rather
    /// than queued.
    pub async fn submit(
        &self,
        record_id: u64,
        requester_id: u64,
    ) -> PipelineResult<SubmittedAnalysis> {
        let permit = self.guard.try_acquire(record_id)?;
        self.dispatch(permit, record_id, requester_id).await
    }

    /// Validate and dispatch under an already-held permit.
    ///
    /// The authoritative record read happens here, after the permit was
    /// acquired. A snapshot taken before the permit could go stale while
    /// a competing run finishes, and its `Pending` status would then pass
    /// the transition check and drag a terminal record back to
    /// `Analyzing`.
    async fn dispatch(
        &self,
        permit: GuardPermit,
        record_id: u64,
        requester_id: u64,
    ) -> PipelineResult<SubmittedAnalysis> {
        let mut record = owned_record(self.records.as_ref(), record_id, requester_id).await?;
        if record.image_path.trim().is_empty() {
            return Err(AnalysisError::MissingImage(record_id));
        }

        let slot = self
            .worker_slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| AnalysisError::QueueFull)?;

        let next = transition(record.analysis_status, AnalysisEvent::StartAnalysis)?;
        record.set_status(next);
        self.records.put(record.clone()).await?;

        let request = AnalysisRequest::registration(record_id, record.image_path.clone());
        let task = tokio::spawn(run_registration(
            Arc::clone(&self.records),
            Arc::clone(&self.images),
            Arc::clone(&self.vision),
            record,
            permit,
            slot,
        ));

        Ok(SubmittedAnalysis { request, task })
    }

    /// Combined create-and-analyze flow: stores the image, creates an
    /// ephemeral record and runs the registration analysis synchronously.
    /// On any failure the record and its image are both removed, so this
    /// flow never leaves an orphaned `FAILED` row behind. On success the
    /// record stays unregistered until `finalize`.
    pub async fn analyze_staged(
        &self,
        requester_id: u64,
        staged: StagedImage,
    ) -> PipelineResult<AnalyzableRecord> {
        if staged.image_path.trim().is_empty() {
            return Err(AnalysisError::InvalidStaging("empty image path".into()));
        }
        if staged.bytes.is_empty() {
            return Err(AnalysisError::InvalidStaging("empty image bytes".into()));
        }

        self.images.save(&staged.image_path, &staged.bytes).await?;
        let record = self
            .records
            .insert(NewRecord {
                owner_id: requester_id,
                image_path: staged.image_path.clone(),
            })
            .await?;
        let record_id = record.id;

        match self.run_staged(record, &staged.bytes).await {
            Ok(record) => Ok(record),
            Err(err) => {
                warn!(
                    record_id,
                    kind = AnalysisKind::Registration.name(),
                    error = %err,
                    "staged registration analysis failed, removing ephemeral record"
                );
                if let Err(cleanup) = self.records.delete(record_id).await {
                    warn!(record_id, error = %cleanup, "failed to remove ephemeral record");
                }
                if let Err(cleanup) = self.images.remove(&staged.image_path).await {
                    warn!(record_id, error = %cleanup, "failed to remove staged image");
                }
                Err(err)
            }
        }
    }

    async fn run_staged(
        &self,
        mut record: AnalyzableRecord,
        bytes: &[u8],
    ) -> PipelineResult<AnalyzableRecord> {
        let _permit = self.guard.try_acquire(record.id)?;

        let next = transition(record.analysis_status, AnalysisEvent::StartAnalysis)?;
        record.set_status(next);
        self.records.put(record.clone()).await?;

        let outcome = self.vision.analyze(bytes, AnalysisKind::Registration).await?;
        let fields = outcome
            .fields
            .into_registration()
            .ok_or(AnalysisError::WrongKind {
                kind: AnalysisKind::Registration.name(),
            })?;

        let next = transition(record.analysis_status, AnalysisEvent::AnalysisSucceeded)?;
        record.apply_registration(fields);
        record.set_status(next);
        self.records.put(record.clone()).await?;

        info!(record_id = record.id, "staged registration analysis completed");
        Ok(record)
    }

    /// Flip `is_registered` once the registration analysis completed.
    ///
    /// Holds the per-record guard for the read-check-write, so a
    /// finalize racing an in-flight run surfaces as busy instead of
    /// overwriting the run's row with a stale snapshot.
    pub async fn finalize(
        &self,
        record_id: u64,
        requester_id: u64,
    ) -> PipelineResult<AnalyzableRecord> {
        let _permit = self.guard.try_acquire(record_id)?;
        let mut record = owned_record(self.records.as_ref(), record_id, requester_id).await?;
        if record.analysis_status != AnalysisStatus::Completed {
            return Err(AnalysisError::NotEligible {
                record_id,
                reason: format!(
                    "analysis status is {}, expected COMPLETED",
                    record.analysis_status
                ),
            });
        }
        record.is_registered = true;
        record.set_status(AnalysisStatus::Completed);
        self.records.put(record.clone()).await?;
        Ok(record)
    }

    /// Open a fresh analysis cycle on a terminal record and dispatch it
    /// through the same bounded submit path. The permit is held from the
    /// terminal check through dispatch, so nothing can slip in between
    /// the reset and the new run.
    pub async fn reanalyze(
        &self,
        record_id: u64,
        requester_id: u64,
    ) -> PipelineResult<SubmittedAnalysis> {
        let permit = self.guard.try_acquire(record_id)?;
        let mut record = owned_record(self.records.as_ref(), record_id, requester_id).await?;
        if !record.analysis_status.is_terminal() {
            return Err(AnalysisError::NotEligible {
                record_id,
                reason: format!(
                    "analysis status is {}, only terminal runs can be re-analyzed",
                    record.analysis_status
                ),
            });
        }
        record.reset_for_reanalysis();
        self.records.put(record).await?;
        self.dispatch(permit, record_id, requester_id).await
    }

    /// Status-query surface for the HTTP collaborator.
    pub async fn status_report(
        &self,
        record_id: u64,
        requester_id: u64,
    ) -> PipelineResult<StatusReport> {
        let record = owned_record(self.records.as_ref(), record_id, requester_id).await?;
        Ok(StatusReport::for_record(&record))
    }
}

async fn run_registration<M>(
    records: Arc<dyn RecordStore>,
    images: Arc<dyn ImageRepository>,
    vision: Arc<VisionClient<M>>,
    mut record: AnalyzableRecord,
    permit: GuardPermit,
    slot: OwnedSemaphorePermit,
) -> PipelineResult<AnalyzableRecord>
where
    M: VisionModel,
{
    // Held for the whole run; released on every exit path.
    let _permit = permit;
    let _slot = slot;

    let attempt: PipelineResult<AnalysisFields> = async {
        let bytes = images.load(&record.image_path).await?;
        let outcome = vision.analyze(&bytes, AnalysisKind::Registration).await?;
        Ok(outcome.fields)
    }
    .await;

    match attempt.and_then(|fields| {
        fields
            .into_registration()
            .ok_or(AnalysisError::WrongKind {
                kind: AnalysisKind::Registration.name(),
            })
    }) {
        Ok(fields) => {
            let next = transition(record.analysis_status, AnalysisEvent::AnalysisSucceeded)?;
            // Output fields and the terminal status land in one replace,
            // so concurrent status readers never see a half-written row.
            record.apply_registration(fields);
            record.set_status(next);
            records.put(record.clone()).await?;
            info!(record_id = record.id, "registration analysis completed");
            Ok(record)
        }
        Err(err) => {
            warn!(
                record_id = record.id,
                kind = AnalysisKind::Registration.name(),
                error = %err,
                "registration analysis failed"
            );
            match transition(record.analysis_status, AnalysisEvent::AnalysisFailed) {
                Ok(next) => record.set_status(next),
                Err(_) => record.set_status(AnalysisStatus::Failed),
            }
            records.put(record.clone()).await?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::images::{test_image_bytes, MemoryImageRepository};
    use crate::record::{MemoryRecordStore, RecordStoreError};
    use crate::services::guard::GuardError;
    use crate::services::vision::testmodel::{quick_config, ScriptedModel, REGISTRATION_JSON};
    use crate::services::vision::VisionError;

    const OWNER: u64 = 7;

    /// Store wrapper that can park one `get` call mid-flight, signalling
    /// the test when the caller is parked.
    struct ParkingStore {
        inner: MemoryRecordStore,
        park_next_get: AtomicBool,
        parked: Arc<Notify>,
        resume: Arc<Notify>,
    }

    #[async_trait]
    impl RecordStore for ParkingStore {
        async fn insert(&self, new: NewRecord) -> Result<AnalyzableRecord, RecordStoreError> {
            self.inner.insert(new).await
        }

        async fn get(&self, id: u64) -> Result<Option<AnalyzableRecord>, RecordStoreError> {
            if self.park_next_get.swap(false, Ordering::SeqCst) {
                self.parked.notify_one();
                self.resume.notified().await;
            }
            self.inner.get(id).await
        }

        async fn put(&self, record: AnalyzableRecord) -> Result<(), RecordStoreError> {
            self.inner.put(record).await
        }

        async fn delete(&self, id: u64) -> Result<(), RecordStoreError> {
            self.inner.delete(id).await
        }
    }

    struct Harness {
        pipeline: RegistrationPipeline<ScriptedModel>,
        records: Arc<MemoryRecordStore>,
        images: Arc<MemoryImageRepository>,
    }

    fn harness(model: ScriptedModel, max_retries: usize, worker_slots: usize) -> Harness {
        let records = Arc::new(MemoryRecordStore::default());
        let images = Arc::new(MemoryImageRepository::default());
        let vision = Arc::new(VisionClient::new(
            model,
            quick_config("vision-test", max_retries),
        ));
        let guard = Arc::new(AnalysisGuard::new(Duration::from_millis(100)));
        let pipeline = RegistrationPipeline::new(
            Arc::clone(&records) as Arc<dyn RecordStore>,
            Arc::clone(&images) as Arc<dyn ImageRepository>,
            vision,
            guard,
            worker_slots,
        );
        Harness {
            pipeline,
            records,
            images,
        }
    }

    async fn staged_record(harness: &Harness, path: &str) -> AnalyzableRecord {
        harness
            .images
            .save(path, &test_image_bytes())
            .await
            .expect("save image");
        harness
            .records
            .insert(NewRecord {
                owner_id: OWNER,
                image_path: path.into(),
            })
            .await
            .expect("insert record")
    }

    #[tokio::test]
    async fn submit_runs_to_completion_and_finalize_registers() {
        let gate = Arc::new(Notify::new());
        let model = ScriptedModel::gated(REGISTRATION_JSON, Arc::clone(&gate));
        let harness = harness(model, 0, 4);
        let record = staged_record(&harness, "crops/1.png").await;

        let submitted = harness
            .pipeline
            .submit(record.id, OWNER)
            .await
            .expect("submit");
        assert_eq!(submitted.request.kind, AnalysisKind::Registration);

        // Persisted as Analyzing before the model call resolves.
        let in_flight = harness
            .records
            .get(record.id)
            .await
            .expect("get")
            .expect("record exists");
        assert_eq!(in_flight.analysis_status, AnalysisStatus::Analyzing);
        assert!(!in_flight.is_registered);

        gate.notify_one();
        let completed = submitted.join().await.expect("analysis succeeds");
        assert_eq!(completed.analysis_status, AnalysisStatus::Completed);
        assert!(!completed.is_registered, "finalize has not run yet");
        let fields = completed.registration.clone().expect("output fields");
        assert_eq!(fields.crop_name, "cherry tomato");

        let finalized = harness
            .pipeline
            .finalize(record.id, OWNER)
            .await
            .expect("finalize");
        assert!(finalized.is_registered);
        assert_eq!(finalized.analysis_status, AnalysisStatus::Completed);

        let report = harness
            .pipeline
            .status_report(record.id, OWNER)
            .await
            .expect("report");
        assert!(report.is_registered);
        assert!(report.analysis_result.is_some());
    }

    #[tokio::test]
    async fn double_submission_is_rejected_while_in_flight() {
        let gate = Arc::new(Notify::new());
        let model = ScriptedModel::gated(REGISTRATION_JSON, Arc::clone(&gate));
        let harness = harness(model.clone(), 0, 4);
        let record = staged_record(&harness, "crops/2.png").await;

        let submitted = harness
            .pipeline
            .submit(record.id, OWNER)
            .await
            .expect("first submit");

        let err = harness
            .pipeline
            .submit(record.id, OWNER)
            .await
            .expect_err("second submit while in flight");
        assert!(matches!(
            err,
            AnalysisError::Guard(GuardError::Busy(id)) if id == record.id
        ));

        gate.notify_one();
        submitted.join().await.expect("first run completes");
        assert_eq!(model.call_count(), 1, "only one model call happened");

        // After completion the guard is free, so the terminal state is
        // what rejects the next submission.
        let err = harness
            .pipeline
            .submit(record.id, OWNER)
            .await
            .expect_err("terminal record cannot restart in place");
        assert!(matches!(err, AnalysisError::IllegalTransition(_)));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn exhausted_worker_pool_rejects_instead_of_queueing() {
        let gate = Arc::new(Notify::new());
        let model = ScriptedModel::gated(REGISTRATION_JSON, Arc::clone(&gate));
        let harness = harness(model, 0, 1);
        let first = staged_record(&harness, "crops/3.png").await;
        let second = staged_record(&harness, "crops/4.png").await;

        let submitted = harness
            .pipeline
            .submit(first.id, OWNER)
            .await
            .expect("first submit takes the only slot");

        let err = harness
            .pipeline
            .submit(second.id, OWNER)
            .await
            .expect_err("no free worker slot");
        assert!(matches!(err, AnalysisError::QueueFull));
        assert!(err.is_retry_later());

        // The rejected record was left untouched and can be resubmitted.
        let untouched = harness
            .records
            .get(second.id)
            .await
            .expect("get")
            .expect("record exists");
        assert_eq!(untouched.analysis_status, AnalysisStatus::Pending);

        gate.notify_one();
        submitted.join().await.expect("first run completes");

        let resubmitted = harness
            .pipeline
            .submit(second.id, OWNER)
            .await
            .expect("slot free again");
        gate.notify_one();
        resubmitted.join().await.expect("second run completes");
    }

    #[tokio::test]
    async fn submission_reads_the_record_under_the_guard() {
        let parked = Arc::new(Notify::new());
        let resume = Arc::new(Notify::new());
        let store = Arc::new(ParkingStore {
            inner: MemoryRecordStore::default(),
            park_next_get: AtomicBool::new(false),
            parked: Arc::clone(&parked),
            resume: Arc::clone(&resume),
        });
        let images = Arc::new(MemoryImageRepository::default());
        images
            .save("crops/8.png", &test_image_bytes())
            .await
            .expect("save image");
        let model = ScriptedModel::content(REGISTRATION_JSON);
        let vision = Arc::new(VisionClient::new(
            model.clone(),
            quick_config("vision-test", 0),
        ));
        let guard = Arc::new(AnalysisGuard::new(Duration::from_millis(100)));
        let pipeline = Arc::new(RegistrationPipeline::new(
            Arc::clone(&store) as Arc<dyn RecordStore>,
            Arc::clone(&images) as Arc<dyn ImageRepository>,
            vision,
            guard,
            4,
        ));
        let record = store
            .insert(NewRecord {
                owner_id: OWNER,
                image_path: "crops/8.png".into(),
            })
            .await
            .expect("insert record");

        // First submission parks inside its authoritative read, guard
        // already held.
        store.park_next_get.store(true, Ordering::SeqCst);
        let first = {
            let pipeline = Arc::clone(&pipeline);
            let record_id = record.id;
            tokio::spawn(async move { pipeline.submit(record_id, OWNER).await })
        };
        parked.notified().await;

        // A competitor cannot interleave between the parked caller's
        // read and its transition; it bounces off the guard instead of
        // racing a stale snapshot past the state machine.
        let err = pipeline
            .submit(record.id, OWNER)
            .await
            .expect_err("guard is held by the parked submission");
        assert!(matches!(
            err,
            AnalysisError::Guard(GuardError::Busy(id)) if id == record.id
        ));

        resume.notify_one();
        let submitted = first
            .await
            .expect("join")
            .expect("parked submission proceeds");
        submitted.join().await.expect("run completes");

        assert_eq!(model.call_count(), 1, "exactly one model call happened");
        let final_record = store
            .get(record.id)
            .await
            .expect("get")
            .expect("record exists");
        assert_eq!(final_record.analysis_status, AnalysisStatus::Completed);
    }

    #[tokio::test]
    async fn failed_run_marks_the_record_failed() {
        let model = ScriptedModel::failing(500);
        let harness = harness(model, 0, 4);
        let record = staged_record(&harness, "crops/5.png").await;

        let submitted = harness
            .pipeline
            .submit(record.id, OWNER)
            .await
            .expect("submit");
        let err = submitted.join().await.expect_err("model fails");
        assert!(matches!(
            err,
            AnalysisError::Vision(VisionError::Status { status: 500 })
        ));

        let failed = harness
            .records
            .get(record.id)
            .await
            .expect("get")
            .expect("record persists outside the staged flow");
        assert_eq!(failed.analysis_status, AnalysisStatus::Failed);
        assert!(failed.registration.is_none());
    }

    #[tokio::test]
    async fn staged_flow_deletes_the_record_on_failure() {
        let model = ScriptedModel::failing(500);
        let harness = harness(model, 0, 4);

        let err = harness
            .pipeline
            .analyze_staged(
                OWNER,
                StagedImage {
                    image_path: "staged/1.png".into(),
                    bytes: test_image_bytes(),
                },
            )
            .await
            .expect_err("model fails");
        assert!(matches!(err, AnalysisError::Vision(_)));

        // First store-assigned id; the row must be gone, not FAILED.
        assert!(harness.records.get(1).await.expect("get").is_none());
        assert!(harness.images.load("staged/1.png").await.is_err());
    }

    #[tokio::test]
    async fn staged_flow_completes_unregistered() {
        let model = ScriptedModel::content(REGISTRATION_JSON);
        let harness = harness(model, 0, 4);

        let record = harness
            .pipeline
            .analyze_staged(
                OWNER,
                StagedImage {
                    image_path: "staged/2.png".into(),
                    bytes: test_image_bytes(),
                },
            )
            .await
            .expect("staged analysis");

        assert_eq!(record.analysis_status, AnalysisStatus::Completed);
        assert!(!record.is_registered);
        assert!(record.registration.is_some());
        assert!(harness.images.load("staged/2.png").await.is_ok());
    }

    #[tokio::test]
    async fn staged_flow_validates_inputs_before_any_call() {
        let model = ScriptedModel::content(REGISTRATION_JSON);
        let harness = harness(model.clone(), 0, 4);

        let err = harness
            .pipeline
            .analyze_staged(
                OWNER,
                StagedImage {
                    image_path: "  ".into(),
                    bytes: test_image_bytes(),
                },
            )
            .await
            .expect_err("empty path");
        assert!(matches!(err, AnalysisError::InvalidStaging(_)));

        let err = harness
            .pipeline
            .analyze_staged(
                OWNER,
                StagedImage {
                    image_path: "staged/3.png".into(),
                    bytes: Vec::new(),
                },
            )
            .await
            .expect_err("empty bytes");
        assert!(matches!(err, AnalysisError::InvalidStaging(_)));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn finalize_requires_a_completed_analysis() {
        let model = ScriptedModel::content(REGISTRATION_JSON);
        let harness = harness(model, 0, 4);
        let record = staged_record(&harness, "crops/6.png").await;

        let err = harness
            .pipeline
            .finalize(record.id, OWNER)
            .await
            .expect_err("still pending");
        assert!(matches!(err, AnalysisError::NotEligible { .. }));
        assert!(err.is_validation());

        let err = harness
            .pipeline
            .finalize(record.id, OWNER + 1)
            .await
            .expect_err("not the owner");
        assert!(matches!(err, AnalysisError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn finalize_is_rejected_while_a_run_is_in_flight() {
        let gate = Arc::new(Notify::new());
        let model = ScriptedModel::gated(REGISTRATION_JSON, Arc::clone(&gate));
        let harness = harness(model, 0, 4);
        let record = staged_record(&harness, "crops/9.png").await;

        let submitted = harness
            .pipeline
            .submit(record.id, OWNER)
            .await
            .expect("submit");

        let err = harness
            .pipeline
            .finalize(record.id, OWNER)
            .await
            .expect_err("the run holds the guard");
        assert!(matches!(
            err,
            AnalysisError::Guard(GuardError::Busy(id)) if id == record.id
        ));

        gate.notify_one();
        submitted.join().await.expect("run completes");

        let finalized = harness
            .pipeline
            .finalize(record.id, OWNER)
            .await
            .expect("guard free after the run");
        assert!(finalized.is_registered);
    }

    #[tokio::test]
    async fn reanalysis_demotes_registration_until_finalized_again() {
        let gate = Arc::new(Notify::new());
        let model = ScriptedModel::gated(REGISTRATION_JSON, Arc::clone(&gate));
        let harness = harness(model, 0, 4);
        let record = staged_record(&harness, "crops/10.png").await;

        let submitted = harness
            .pipeline
            .submit(record.id, OWNER)
            .await
            .expect("submit");
        gate.notify_one();
        submitted.join().await.expect("first run");
        harness
            .pipeline
            .finalize(record.id, OWNER)
            .await
            .expect("finalize");

        let resubmitted = harness
            .pipeline
            .reanalyze(record.id, OWNER)
            .await
            .expect("re-run starts");

        // No reader may see a registered record that is not Completed.
        let in_flight = harness
            .records
            .get(record.id)
            .await
            .expect("get")
            .expect("record exists");
        assert_eq!(in_flight.analysis_status, AnalysisStatus::Analyzing);
        assert!(!in_flight.is_registered);

        gate.notify_one();
        let completed = resubmitted.join().await.expect("second run");
        assert!(
            !completed.is_registered,
            "a re-analyzed record needs a fresh finalize"
        );

        let finalized = harness
            .pipeline
            .finalize(record.id, OWNER)
            .await
            .expect("finalize again");
        assert!(finalized.is_registered);
    }

    #[tokio::test]
    async fn reanalyze_restarts_only_terminal_records() {
        let model = ScriptedModel::content(REGISTRATION_JSON);
        let harness = harness(model, 0, 4);
        let record = staged_record(&harness, "crops/7.png").await;

        let err = harness
            .pipeline
            .reanalyze(record.id, OWNER)
            .await
            .expect_err("pending record has nothing to re-run");
        assert!(matches!(err, AnalysisError::NotEligible { .. }));

        let submitted = harness
            .pipeline
            .submit(record.id, OWNER)
            .await
            .expect("submit");
        submitted.join().await.expect("first run");

        let resubmitted = harness
            .pipeline
            .reanalyze(record.id, OWNER)
            .await
            .expect("terminal record can re-run");
        let record = resubmitted.join().await.expect("second run");
        assert_eq!(record.analysis_status, AnalysisStatus::Completed);
    }
}
