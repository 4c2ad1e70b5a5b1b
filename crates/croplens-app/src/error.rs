//! Application-level error type shared by the binary and services.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::AppConfigError;
use crate::images::ImageStoreError;
use crate::record::RecordStoreError;
use crate::services::pipeline::AnalysisError;
use crate::services::vision::VisionError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error(transparent)]
    Records(#[from] RecordStoreError),
    #[error(transparent)]
    Images(#[from] ImageStoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
