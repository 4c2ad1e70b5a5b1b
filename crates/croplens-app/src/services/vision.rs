//! Vision-language model gateway.
//!
//! Stateless given its inputs: prepares the image for transport, builds
//! a kind-specific instruction demanding strict JSON, invokes the model
//! endpoint under a rate limit and a hard per-call timeout, retries only
//! transport-class failures, then decodes the first JSON object found in
//! the model's text against the kind's schema. Never touches a record.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bon::Builder;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::analysis::{
    AnalysisFields, AnalysisKind, AnalysisOutcome, CurrentStatusFields, DiagnosisTag,
    DiseaseCheckFields, QualityMarketFields, RegistrationFields, TokenUsage,
};

type CallRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const JSON_ONLY_PREAMBLE: &str = "You are an agricultural vision analyst. Look at the attached crop image and respond with a single JSON object and nothing else: no prose, no markdown fences, no trailing commentary.";

/// Errors produced by the vision gateway.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("missing CROPLENS_API_KEY or OPENAI_API_KEY environment variable")]
    MissingApiKey,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("model endpoint returned status {status}")]
    Status { status: u16 },
    #[error("model call timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("model response contained no content")]
    EmptyResponse,
    #[error("model response contained no JSON object")]
    MissingJson,
    #[error("model response did not match the {kind} schema: {source}")]
    MalformedResponse {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode input image: {0}")]
    ImageDecode(#[source] image::ImageError),
    #[error("failed to re-encode image for transport: {0}")]
    ImageEncode(#[source] image::ImageError),
    #[error("image preparation task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl VisionError {
    /// Transport-class failures are the only ones worth another attempt;
    /// schema violations and validation failures never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            VisionError::Http(_) | VisionError::Timeout { .. } => true,
            VisionError::Status { status } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Parameters controlling a vision analysis call.
#[derive(Debug, Clone, Builder)]
pub struct VisionConfig {
    #[builder(into)]
    pub model: String,
    #[builder(default = 1024)]
    pub max_output_tokens: u32,
    #[builder(default = 0.2)]
    pub temperature: f32,
    /// Hard per-call budget; expiry converts to a transport-class error.
    #[builder(default = 60)]
    pub timeout_secs: u64,
    /// Extra attempts after the first, applied to transport-class
    /// failures only.
    #[builder(default = 2)]
    pub max_retries: usize,
    #[builder(default = 1280)]
    pub image_max_edge: u32,
    #[builder(default = 8)]
    pub requests_per_second: u32,
}

/// Fully rendered model call, ready for any provider.
#[derive(Debug, Clone)]
pub struct ModelInvocation {
    pub model: String,
    pub image_base64: String,
    pub image_mime: &'static str,
    pub instruction: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// Raw text reply from a provider, before schema decoding.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn generate(&self, invocation: &ModelInvocation) -> Result<ModelReply, VisionError>;
}

/// OpenAI-compatible chat-completions provider.
#[derive(Debug, Clone)]
pub struct OpenAiVisionModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiVisionModel {
    pub fn from_env(
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, VisionError> {
        let api_key = std::env::var("CROPLENS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| VisionError::MissingApiKey)?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.into(),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    ImageUrl { image_url: ImageUrl },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[async_trait]
impl VisionModel for OpenAiVisionModel {
    async fn generate(&self, invocation: &ModelInvocation) -> Result<ModelReply, VisionError> {
        let data_url = format!(
            "data:{};base64,{}",
            invocation.image_mime, invocation.image_base64
        );
        let request = ChatRequest {
            model: &invocation.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::ImageUrl {
                        image_url: ImageUrl { url: data_url },
                    },
                    ContentPart::Text {
                        text: &invocation.instruction,
                    },
                ],
            }],
            max_tokens: invocation.max_output_tokens,
            temperature: invocation.temperature,
        };

        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(VisionError::Status {
                status: status.as_u16(),
            });
        }

        let body: ChatResponse = response.json().await?;
        let usage = body.usage.map(|usage| TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        });
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(VisionError::EmptyResponse)?;

        Ok(ModelReply { content, usage })
    }
}

/// Analysis engine over any [`VisionModel`] provider.
pub struct VisionClient<M> {
    model: M,
    config: VisionConfig,
    limiter: Arc<CallRateLimiter>,
    backoff: ExponentialBuilder,
}

impl<M> VisionClient<M>
where
    M: VisionModel,
{
    pub fn new(model: M, config: VisionConfig) -> Self {
        let per_second = config.requests_per_second.max(1);
        let quota = Quota::per_second(NonZeroU32::new(per_second).expect("non-zero quota"));
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(config.max_retries)
            .with_jitter();

        Self {
            model,
            config,
            limiter: Arc::new(RateLimiter::direct(quota)),
            backoff,
        }
    }

    pub async fn analyze(
        &self,
        image_bytes: &[u8],
        kind: AnalysisKind,
    ) -> Result<AnalysisOutcome, VisionError> {
        let prepared =
            prepare_image_for_transport(image_bytes.to_vec(), self.config.image_max_edge).await?;

        let invocation = ModelInvocation {
            model: self.config.model.clone(),
            image_base64: BASE64_STANDARD.encode(&prepared.data),
            image_mime: prepared.mime_type,
            instruction: instruction_for(kind),
            max_output_tokens: self.config.max_output_tokens,
            temperature: self.config.temperature,
        };

        let reply = self.call_with_backoff(&invocation).await?;
        let fields = decode_fields(kind, &reply.content)?;

        if let Some(usage) = reply.usage.as_ref() {
            debug!(
                kind = %kind,
                prompt_tokens = ?usage.prompt_tokens,
                completion_tokens = ?usage.completion_tokens,
                total_tokens = ?usage.total_tokens,
                "vision analysis usage"
            );
        }

        Ok(AnalysisOutcome {
            kind,
            fields,
            usage: reply.usage,
        })
    }

    async fn call_with_backoff(
        &self,
        invocation: &ModelInvocation,
    ) -> Result<ModelReply, VisionError> {
        let attempt = || async { self.invoke_once(invocation).await };
        attempt
            .retry(self.backoff.clone())
            .when(|err: &VisionError| err.is_retryable())
            .await
    }

    async fn invoke_once(&self, invocation: &ModelInvocation) -> Result<ModelReply, VisionError> {
        self.limiter.until_ready().await;
        let seconds = self.config.timeout_secs;
        tokio::time::timeout(Duration::from_secs(seconds), self.model.generate(invocation))
            .await
            .map_err(|_| VisionError::Timeout { seconds })?
    }
}

/// Per-kind instruction. The schemas are part of the contract with the
/// model: each demands exactly the field set its decoder expects.
fn instruction_for(kind: AnalysisKind) -> String {
    let schema = match kind {
        AnalysisKind::Registration => {
            "Identify the crop and describe how to grow it. Respond with JSON: \
             {\"cropName\": string, \"environment\": string, \"temperature\": string, \
             \"height\": string, \"howTo\": string}"
        }
        AnalysisKind::Diagnosis(DiagnosisTag::CurrentStatus) => {
            "Summarize the crop's current condition. Respond with JSON: \
             {\"currentStatusSummary\": string}"
        }
        AnalysisKind::Diagnosis(DiagnosisTag::DiseaseCheck) => {
            "Check the crop for disease. Respond with JSON: \
             {\"diseaseStatus\": string, \"diseaseDetails\": string, \
             \"preventionMethods\": string}"
        }
        AnalysisKind::Diagnosis(DiagnosisTag::QualityMarket) => {
            "Evaluate harvest quality and marketability. Respond with JSON: \
             {\"marketRatio\": string, \"colorUniformity\": string, \"saturation\": string, \
             \"brightness\": string, \"tasteStorage\": string, \
             \"transportResistance\": string, \"storageEvaluation\": string}"
        }
    };
    format!("{JSON_ONLY_PREAMBLE}\n\n{schema}")
}

/// Decode the model's text into the field set for `kind`.
///
/// The model is not trusted to return clean JSON only, so the first
/// balanced `{...}` object in the content is extracted first.
fn decode_fields(kind: AnalysisKind, content: &str) -> Result<AnalysisFields, VisionError> {
    let raw = extract_json_object(content).ok_or(VisionError::MissingJson)?;
    let malformed = |source| VisionError::MalformedResponse {
        kind: kind.name(),
        source,
    };

    match kind {
        AnalysisKind::Registration => serde_json::from_str::<RegistrationFields>(raw)
            .map(AnalysisFields::Registration)
            .map_err(malformed),
        AnalysisKind::Diagnosis(DiagnosisTag::CurrentStatus) => {
            serde_json::from_str::<CurrentStatusFields>(raw)
                .map(AnalysisFields::CurrentStatus)
                .map_err(malformed)
        }
        AnalysisKind::Diagnosis(DiagnosisTag::DiseaseCheck) => {
            serde_json::from_str::<DiseaseCheckFields>(raw)
                .map(AnalysisFields::DiseaseCheck)
                .map_err(malformed)
        }
        AnalysisKind::Diagnosis(DiagnosisTag::QualityMarket) => {
            serde_json::from_str::<QualityMarketFields>(raw)
                .map(AnalysisFields::QualityMarket)
                .map_err(malformed)
        }
    }
}

/// Find the first balanced top-level JSON object in `text`, skipping
/// braces inside string literals.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone)]
struct PreparedImage {
    data: Vec<u8>,
    mime_type: &'static str,
}

async fn prepare_image_for_transport(
    bytes: Vec<u8>,
    max_edge: u32,
) -> Result<PreparedImage, VisionError> {
    tokio::task::spawn_blocking(move || shrink_for_transport(&bytes, max_edge)).await?
}

fn shrink_for_transport(bytes: &[u8], max_edge: u32) -> Result<PreparedImage, VisionError> {
    let mut dyn_image = image::load_from_memory(bytes).map_err(VisionError::ImageDecode)?;

    let max_edge = max_edge.max(1);
    let (width, height) = dyn_image.dimensions();
    let longest_edge = width.max(height);

    if longest_edge > max_edge {
        let scale = max_edge as f32 / longest_edge as f32;
        let target_width = ((width as f32 * scale).round() as u32).max(1);
        let target_height = ((height as f32 * scale).round() as u32).max(1);
        dyn_image = dyn_image.resize(target_width, target_height, FilterType::CatmullRom);
    }

    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, 90);
    encoder
        .encode_image(&dyn_image)
        .map_err(VisionError::ImageEncode)?;

    Ok(PreparedImage {
        data: buffer,
        mime_type: "image/jpeg",
    })
}

/// Scripted in-memory provider shared by the pipeline test suites.
#[cfg(test)]
pub(crate) mod testmodel {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Debug, Clone)]
    enum ScriptedReply {
        Content(String),
        Failure(u16),
    }

    /// Clonable fake provider with a shared call counter and an optional
    /// gate that holds each call until the test releases it.
    #[derive(Debug, Clone)]
    pub(crate) struct ScriptedModel {
        calls: Arc<AtomicUsize>,
        reply: ScriptedReply,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedModel {
        pub(crate) fn content(json: impl Into<String>) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                reply: ScriptedReply::Content(json.into()),
                gate: None,
            }
        }

        pub(crate) fn failing(status: u16) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                reply: ScriptedReply::Failure(status),
                gate: None,
            }
        }

        pub(crate) fn gated(json: impl Into<String>, gate: Arc<Notify>) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                reply: ScriptedReply::Content(json.into()),
                gate: Some(gate),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VisionModel for ScriptedModel {
        async fn generate(&self, _invocation: &ModelInvocation) -> Result<ModelReply, VisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = self.gate.as_ref() {
                gate.notified().await;
            }
            match &self.reply {
                ScriptedReply::Content(text) => Ok(ModelReply {
                    content: text.clone(),
                    usage: None,
                }),
                ScriptedReply::Failure(status) => Err(VisionError::Status { status: *status }),
            }
        }
    }

    pub(crate) const REGISTRATION_JSON: &str = r#"{"cropName":"cherry tomato","environment":"greenhouse","temperature":"21-27C","height":"1.5m","howTo":"stake and water at the base"}"#;

    pub(crate) fn quick_config(model: &str, max_retries: usize) -> VisionConfig {
        VisionConfig::builder()
            .model(model)
            .max_retries(max_retries)
            .timeout_secs(5)
            .requests_per_second(100)
            .build()
    }
}
