//! Analysis kinds, per-kind result field sets and caller-facing reports.

pub mod status;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};

use crate::record::AnalyzableRecord;
use status::AnalysisStatus;

/// Which analysis run a request targets.
///
/// Registration produces the record's registration output fields and is
/// the only kind that mutates the record; diagnosis kinds are read-only
/// probes against an already-registered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisKind {
    Registration,
    Diagnosis(DiagnosisTag),
}

impl AnalysisKind {
    pub fn name(self) -> &'static str {
        match self {
            AnalysisKind::Registration => "registration",
            AnalysisKind::Diagnosis(tag) => tag.name(),
        }
    }
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The three independently invokable diagnosis analyses.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumString,
    AsRefStr,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum DiagnosisTag {
    CurrentStatus,
    DiseaseCheck,
    QualityMarket,
}

impl DiagnosisTag {
    pub fn name(self) -> &'static str {
        match self {
            DiagnosisTag::CurrentStatus => "current-status",
            DiagnosisTag::DiseaseCheck => "disease-check",
            DiagnosisTag::QualityMarket => "quality-market",
        }
    }
}

impl std::fmt::Display for DiagnosisTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Ephemeral description of a single analysis run. Never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub kind: AnalysisKind,
    pub record_id: u64,
    pub image_path: String,
}

impl AnalysisRequest {
    pub fn registration(record_id: u64, image_path: impl Into<String>) -> Self {
        Self {
            kind: AnalysisKind::Registration,
            record_id,
            image_path: image_path.into(),
        }
    }

    pub fn diagnosis(record_id: u64, tag: DiagnosisTag, image_path: impl Into<String>) -> Self {
        Self {
            kind: AnalysisKind::Diagnosis(tag),
            record_id,
            image_path: image_path.into(),
        }
    }
}

/// Registration analysis output. All fields are required in the model's
/// JSON response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationFields {
    pub crop_name: String,
    pub environment: String,
    pub temperature: String,
    pub height: String,
    pub how_to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentStatusFields {
    pub current_status_summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiseaseCheckFields {
    pub disease_status: String,
    pub disease_details: String,
    pub prevention_methods: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMarketFields {
    pub market_ratio: String,
    pub color_uniformity: String,
    pub saturation: String,
    pub brightness: String,
    pub taste_storage: String,
    pub transport_resistance: String,
    pub storage_evaluation: String,
}

/// Kind-specific decoded field set. Each variant carries only its own
/// fields; a `CurrentStatus` result never has disease or market data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnalysisFields {
    Registration(RegistrationFields),
    CurrentStatus(CurrentStatusFields),
    DiseaseCheck(DiseaseCheckFields),
    QualityMarket(QualityMarketFields),
}

impl AnalysisFields {
    pub fn into_registration(self) -> Option<RegistrationFields> {
        match self {
            AnalysisFields::Registration(fields) => Some(fields),
            _ => None,
        }
    }
}

/// Token accounting reported by the model endpoint, when available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// Result of a successful analysis run. Ephemeral; registration results
/// get reconciled into the record by the pipeline, diagnosis results are
/// returned to the caller untouched.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutcome {
    pub kind: AnalysisKind,
    pub fields: AnalysisFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Status-query surface consumed by the HTTP collaborator.
///
/// `analysis_result` is present only when the analysis completed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Whether the status query itself succeeded, not the analysis run;
    /// a `FAILED` analysis is still a successful query, reported through
    /// `analysis_status`.
    pub success: bool,
    pub analysis_status: AnalysisStatus,
    pub is_registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_result: Option<AnalysisFields>,
}

impl StatusReport {
    pub fn for_record(record: &AnalyzableRecord) -> Self {
        let analysis_result = if record.analysis_status == AnalysisStatus::Completed {
            record
                .registration
                .clone()
                .map(AnalysisFields::Registration)
        } else {
            None
        };
        Self {
            success: true,
            analysis_status: record.analysis_status,
            is_registered: record.is_registered,
            analysis_result,
        }
    }
}
