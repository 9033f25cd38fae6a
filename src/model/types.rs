//! Request and response messages of the generation service.
//!
//! Field names follow `generation.proto` so JSON bodies line up with the
//! existing gRPC callers. Every field defaults when absent, as in proto3.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecodingMethod {
    #[default]
    Greedy,
    Sample,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParameters {
    /// Unset means 1.0; an explicit 0.0 decodes greedily.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub top_k: u32,
    pub top_p: f32,
    pub typical_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoppingCriteria {
    pub max_new_tokens: u32,
    pub min_new_tokens: u32,
    pub time_limit_millis: u32,
    pub stop_sequences: Vec<String>,
    /// Unset means the matched stop sequence stays in the output text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_stop_sequence: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseOptions {
    pub input_text: bool,
    pub generated_tokens: bool,
    pub input_tokens: bool,
    pub token_logprobs: bool,
    pub token_ranks: bool,
    pub top_n_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LengthPenalty {
    pub start_index: u32,
    pub decay_factor: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StringChoices {
    pub choices: Vec<String>,
}

/// The five guided-decoding members form a one-of; at most one may be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodingParameters {
    pub repetition_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_penalty: Option<LengthPenalty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choice: Option<StringChoices>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    pub method: DecodingMethod,
    pub sampling: SamplingParameters,
    pub stopping: StoppingCriteria,
    pub response: ResponseOptions,
    pub decoding: DecodingParameters,
    pub truncate_input_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchedGenerationRequest {
    pub model_id: String,
    /// Deprecated alias of `adapter_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,
    pub requests: Vec<GenerationRequest>,
    pub params: Parameters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleGenerationRequest {
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,
    pub request: GenerationRequest,
    pub params: Parameters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    /// Only seen on intermediate stream messages.
    #[default]
    NotFinished,
    MaxTokens,
    EosToken,
    Cancelled,
    TimeLimit,
    StopSequence,
    TokenLimit,
    Error,
}

impl StopReason {
    pub fn is_finished(self) -> bool {
        self != StopReason::NotFinished
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::NotFinished => "NOT_FINISHED",
            StopReason::MaxTokens => "MAX_TOKENS",
            StopReason::EosToken => "EOS_TOKEN",
            StopReason::Cancelled => "CANCELLED",
            StopReason::TimeLimit => "TIME_LIMIT",
            StopReason::StopSequence => "STOP_SEQUENCE",
            StopReason::TokenLimit => "TOKEN_LIMIT",
            StopReason::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopToken {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenInfo {
    pub text: String,
    /// Absent when not requested, and for the first input token, which has
    /// no preceding context to score it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f32>,
    /// One-based; zero when ranks were not requested.
    pub rank: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top_tokens: Vec<TopToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationResponse {
    pub input_token_count: u32,
    pub generated_token_count: u32,
    pub text: String,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stop_sequence: String,
    /// Only populated for sampling requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<TokenInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub input_tokens: Vec<TokenInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchedGenerationResponse {
    pub responses: Vec<GenerationResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizeRequest {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchedTokenizeRequest {
    pub model_id: String,
    pub requests: Vec<TokenizeRequest>,
    pub return_tokens: bool,
    pub return_offsets: bool,
    pub truncate_input_tokens: u32,
}

/// Half-open character range `[start, end)` of a token in its input text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Offset {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizeResponse {
    pub token_count: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub offsets: Vec<Offset>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchedTokenizeResponse {
    pub responses: Vec<TokenizeResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelInfoRequest {
    pub model_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelKind {
    #[default]
    DecoderOnly,
    EncoderDecoder,
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DECODER_ONLY" => Ok(ModelKind::DecoderOnly),
            "ENCODER_DECODER" => Ok(ModelKind::EncoderDecoder),
            other => Err(format!("unknown model kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelInfoResponse {
    pub model_kind: ModelKind,
    pub max_sequence_length: u32,
    pub max_new_tokens: u32,
}
