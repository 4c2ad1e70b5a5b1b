//! Configuration loading and XDG path helpers.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::services::vision::VisionConfig;

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub vision: VisionSettings,
    pub dispatch: DispatchConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisionSettings {
    pub base_url: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub image_max_edge: u32,
    pub requests_per_second: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    pub worker_slots: usize,
    pub guard_wait_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub image_dir: PathBuf,
}

impl VisionSettings {
    pub fn to_vision_config(&self) -> VisionConfig {
        VisionConfig::builder()
            .model(self.model.clone())
            .max_output_tokens(self.max_output_tokens)
            .temperature(self.temperature)
            .timeout_secs(self.timeout_secs)
            .max_retries(self.max_retries)
            .image_max_edge(self.image_max_edge)
            .requests_per_second(self.requests_per_second)
            .build()
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_images = default_image_dir()?;
    let builder = Config::builder()
        .set_default("vision.base_url", "https://api.openai.com")?
        .set_default("vision.model", "gpt-4o-mini")?
        .set_default("vision.max_output_tokens", 1024)?
        .set_default("vision.temperature", 0.2)?
        .set_default("vision.timeout_secs", 60)?
        .set_default("vision.max_retries", 2)?
        .set_default("vision.image_max_edge", 1280)?
        .set_default("vision.requests_per_second", 8)?
        .set_default("dispatch.worker_slots", 8)?
        .set_default("dispatch.guard_wait_secs", 30)?
        .set_default(
            "storage.image_dir",
            default_images.to_string_lossy().to_string(),
        )?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("CROPLENS").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("io", "croplens", "croplens").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_image_dir() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().join("images"))
}
