//! Croplens: vision-model crop analysis.
//!
//! A crop photo goes through one registration analysis that fills the
//! record's profile fields, then any number of diagnosis probes against
//! the registered record. The `services` module holds the pipelines and
//! the model gateway; `record` and `images` are the storage seams.

pub mod analysis;
pub mod config;
pub mod error;
pub mod images;
pub mod record;
pub mod services;

pub use error::AppError;
