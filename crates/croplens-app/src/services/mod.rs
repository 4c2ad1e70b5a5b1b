//! Analysis services.
//!
//! `vision` talks to the model endpoint, `guard` serializes work per
//! record, and the two pipelines compose them: `registration` owns the
//! record lifecycle, `diagnosis` runs read-only probes on registered
//! records.

pub mod diagnosis;
pub mod guard;
pub mod pipeline;
pub mod registration;
pub mod vision;

pub use diagnosis::DiagnosisPipeline;
pub use guard::{AnalysisGuard, GuardError, GuardPermit};
pub use pipeline::{AnalysisError, PipelineResult};
pub use registration::{RegistrationPipeline, StagedImage, SubmittedAnalysis};
pub use vision::{OpenAiVisionModel, VisionClient, VisionConfig, VisionError, VisionModel};
