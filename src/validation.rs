use std::time::Duration;

use crate::{
    config::GenerationLimits,
    error::ServiceError,
    model::{DecodingMethod, LengthPenalty, Parameters, ResponseFormat, ResponseOptions},
};

pub const MAX_TOP_N_TOKENS: u32 = 5;
pub const MAX_STOP_SEQUENCES: usize = 6;
pub const MAX_STOP_SEQUENCE_BYTES: usize = 240;

#[derive(Debug, Clone, PartialEq)]
pub enum DecodingStrategy {
    Greedy,
    Sample(SamplingConfig),
}

/// Sampling knobs with the "disabled" encodings resolved to `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub typical_p: Option<f32>,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum GuidedDecoding {
    #[default]
    None,
    Format(ResponseFormat),
    JsonSchema(String),
    Regex(String),
    Choice(Vec<String>),
    Grammar(String),
}

impl GuidedDecoding {
    pub fn is_none(&self) -> bool {
        matches!(self, GuidedDecoding::None)
    }

    pub fn name(&self) -> &'static str {
        match self {
            GuidedDecoding::None => "none",
            GuidedDecoding::Format(_) => "format",
            GuidedDecoding::JsonSchema(_) => "json_schema",
            GuidedDecoding::Regex(_) => "regex",
            GuidedDecoding::Choice(_) => "choice",
            GuidedDecoding::Grammar(_) => "grammar",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedParameters {
    pub strategy: DecodingStrategy,
    pub repetition_penalty: Option<f32>,
    pub length_penalty: Option<LengthPenalty>,
    pub guided: GuidedDecoding,
    pub max_new_tokens: u32,
    pub min_new_tokens: u32,
    pub time_limit: Option<Duration>,
    pub stop_sequences: Vec<String>,
    pub include_stop_sequence: bool,
    pub response: ResponseOptions,
    pub truncate_input_tokens: Option<u32>,
}

impl ValidatedParameters {
    /// Seed echoed back to the caller; greedy requests never carry one.
    pub fn seed(&self) -> Option<u64> {
        match &self.strategy {
            DecodingStrategy::Greedy => None,
            DecodingStrategy::Sample(sampling) => Some(sampling.seed),
        }
    }
}

pub fn validate(
    params: &Parameters,
    limits: &GenerationLimits,
) -> Result<ValidatedParameters, ServiceError> {
    let strategy = decoding_strategy(params)?;
    let guided = guided_decoding(params)?;

    let decoding = &params.decoding;
    if decoding.repetition_penalty < 0.0 || decoding.repetition_penalty.is_nan() {
        return Err(ServiceError::validation(
            "decoding.repetition_penalty",
            "must be >= 0",
        ));
    }
    let repetition_penalty = (decoding.repetition_penalty != 0.0 && decoding.repetition_penalty != 1.0)
        .then_some(decoding.repetition_penalty);

    if let Some(penalty) = decoding.length_penalty {
        if penalty.decay_factor.is_nan() || penalty.decay_factor < 1.0 {
            return Err(ServiceError::validation(
                "decoding.length_penalty.decay_factor",
                "must be >= 1.0",
            ));
        }
    }

    let stopping = &params.stopping;
    let max_new_tokens = match stopping.max_new_tokens {
        0 => limits.default_max_new_tokens,
        n if n > limits.max_new_tokens => {
            return Err(ServiceError::validation(
                "stopping.max_new_tokens",
                format!("must be <= {}", limits.max_new_tokens),
            ));
        }
        n => n,
    };
    if stopping.min_new_tokens > max_new_tokens {
        return Err(ServiceError::validation(
            "stopping.min_new_tokens",
            format!("must be <= max_new_tokens ({max_new_tokens})"),
        ));
    }

    if stopping.stop_sequences.len() > MAX_STOP_SEQUENCES {
        return Err(ServiceError::validation(
            "stopping.stop_sequences",
            format!("at most {MAX_STOP_SEQUENCES} stop sequences are allowed"),
        ));
    }
    for sequence in &stopping.stop_sequences {
        if sequence.is_empty() || sequence.len() > MAX_STOP_SEQUENCE_BYTES {
            return Err(ServiceError::validation(
                "stopping.stop_sequences",
                format!("each stop sequence must be 1 to {MAX_STOP_SEQUENCE_BYTES} bytes"),
            ));
        }
    }

    let mut response = params.response.clone();
    response.top_n_tokens = response.top_n_tokens.min(MAX_TOP_N_TOKENS);

    Ok(ValidatedParameters {
        strategy,
        repetition_penalty,
        length_penalty: decoding.length_penalty,
        guided,
        max_new_tokens,
        min_new_tokens: stopping.min_new_tokens,
        time_limit: (stopping.time_limit_millis > 0)
            .then(|| Duration::from_millis(u64::from(stopping.time_limit_millis))),
        stop_sequences: stopping.stop_sequences.clone(),
        include_stop_sequence: stopping.include_stop_sequence.unwrap_or(true),
        response,
        truncate_input_tokens: (params.truncate_input_tokens > 0)
            .then_some(params.truncate_input_tokens),
    })
}

/// Rejects prompts that leave no room to generate within the model's window.
pub fn check_input_length(
    input_token_count: u32,
    params: &ValidatedParameters,
    limits: &GenerationLimits,
) -> Result<(), ServiceError> {
    let required = input_token_count.saturating_add(params.min_new_tokens.max(1));
    if required > limits.max_sequence_length {
        return Err(ServiceError::validation(
            "input",
            format!(
                "input tokens ({input_token_count}) plus min_new_tokens ({}) must leave room within max_sequence_length ({})",
                params.min_new_tokens, limits.max_sequence_length
            ),
        ));
    }
    Ok(())
}

fn decoding_strategy(params: &Parameters) -> Result<DecodingStrategy, ServiceError> {
    if params.method == DecodingMethod::Greedy {
        return Ok(DecodingStrategy::Greedy);
    }

    let sampling = &params.sampling;
    let temperature = sampling.temperature.unwrap_or(1.0);
    if temperature < 0.0 || temperature.is_nan() {
        return Err(ServiceError::validation("sampling.temperature", "must be >= 0"));
    }
    if !(0.0..=1.0).contains(&sampling.top_p) {
        return Err(ServiceError::validation("sampling.top_p", "must be within [0, 1]"));
    }
    if !(0.0..=1.0).contains(&sampling.typical_p) {
        return Err(ServiceError::validation(
            "sampling.typical_p",
            "must be within [0, 1]",
        ));
    }
    if temperature == 0.0 {
        return Ok(DecodingStrategy::Greedy);
    }

    let disabled_at_one = |p: f32| (p > 0.0 && p < 1.0).then_some(p);
    Ok(DecodingStrategy::Sample(SamplingConfig {
        temperature,
        top_k: (sampling.top_k > 0).then_some(sampling.top_k),
        top_p: disabled_at_one(sampling.top_p),
        typical_p: disabled_at_one(sampling.typical_p),
        seed: sampling.seed.unwrap_or_else(rand::random),
    }))
}

fn guided_decoding(params: &Parameters) -> Result<GuidedDecoding, ServiceError> {
    let decoding = &params.decoding;
    let mut present = Vec::new();
    if let Some(format) = decoding.format {
        present.push(GuidedDecoding::Format(format));
    }
    if let Some(schema) = &decoding.json_schema {
        present.push(GuidedDecoding::JsonSchema(schema.clone()));
    }
    if let Some(regex) = &decoding.regex {
        present.push(GuidedDecoding::Regex(regex.clone()));
    }
    if let Some(choice) = &decoding.choice {
        present.push(GuidedDecoding::Choice(choice.choices.clone()));
    }
    if let Some(grammar) = &decoding.grammar {
        present.push(GuidedDecoding::Grammar(grammar.clone()));
    }

    if present.len() > 1 {
        let names: Vec<&str> = present.iter().map(GuidedDecoding::name).collect();
        return Err(ServiceError::validation(
            "decoding",
            format!(
                "only one guided decoding mode may be set, got {}",
                names.join(", ")
            ),
        ));
    }

    let guided = present.pop().unwrap_or_default();
    match &guided {
        GuidedDecoding::JsonSchema(schema) => {
            serde_json::from_str::<serde_json::Value>(schema).map_err(|e| {
                ServiceError::validation("decoding.json_schema", format!("not valid JSON: {e}"))
            })?;
        }
        GuidedDecoding::Regex(pattern) if pattern.is_empty() => {
            return Err(ServiceError::validation("decoding.regex", "must not be empty"));
        }
        GuidedDecoding::Grammar(grammar) if grammar.is_empty() => {
            return Err(ServiceError::validation("decoding.grammar", "must not be empty"));
        }
        GuidedDecoding::Choice(choices) if choices.is_empty() => {
            return Err(ServiceError::validation(
                "decoding.choice",
                "at least one choice is required",
            ));
        }
        _ => {}
    }
    Ok(guided)
}
