//! Analysis lifecycle state machine. Pure logic, no I/O.

use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use thiserror::Error;

/// Lifecycle state of a record's analysis run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Analyzing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    /// Terminal states have no outgoing transitions; a re-analysis must
    /// reset the record to `Pending` and start a fresh cycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Events that drive the analysis lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisEvent {
    StartAnalysis,
    AnalysisSucceeded,
    AnalysisFailed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal analysis transition: {event:?} while {from}")]
pub struct TransitionError {
    pub from: AnalysisStatus,
    pub event: AnalysisEvent,
}

/// Apply `event` to `current`, returning the next state.
///
/// The only legal edges are `Pending --StartAnalysis--> Analyzing`,
/// `Analyzing --AnalysisSucceeded--> Completed` and
/// `Analyzing --AnalysisFailed--> Failed`. `StartAnalysis` while already
/// `Analyzing` is rejected, which is how double submission is detected
/// independently of the per-record guard.
pub fn transition(
    current: AnalysisStatus,
    event: AnalysisEvent,
) -> Result<AnalysisStatus, TransitionError> {
    use AnalysisEvent::*;
    use AnalysisStatus::*;

    match (current, event) {
        (Pending, StartAnalysis) => Ok(Analyzing),
        (Analyzing, AnalysisSucceeded) => Ok(Completed),
        (Analyzing, AnalysisFailed) => Ok(Failed),
        (from, event) => Err(TransitionError { from, event }),
    }
}
