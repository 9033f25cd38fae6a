//! The seam between the serving core and whatever produces tokens.
//!
//! A session asks its engine for exactly one token per step. Engines are
//! shared across sessions and must not keep per-request state; everything a
//! step needs travels in [`StepRequest`].

mod echo;
pub mod logits;
#[cfg(feature = "tch-backend")]
mod tch_backend;

use async_trait::async_trait;
use rand::rngs::StdRng;
use thiserror::Error;

use crate::validation::{GuidedDecoding, ValidatedParameters};

pub use echo::EchoEngine;
#[cfg(feature = "tch-backend")]
pub use tch_backend::TorchEngine;

/// Failure while producing a token. Ends the session with `ERROR`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("decoding failed: {0}")]
    Decode(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// A scored alternative for one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: u32,
    pub logprob: f32,
}

/// Score of a token the engine selected or was given.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenScore {
    pub id: u32,
    pub logprob: f32,
    /// One-based rank among all candidates at this position.
    pub rank: u32,
    /// Descending by probability; may exceed the requested count on ties.
    pub top: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampledToken {
    pub score: TokenScore,
    pub is_eos: bool,
}

/// Everything an engine needs to produce the next token of one session.
pub struct StepRequest<'a> {
    pub input_ids: &'a [u32],
    pub generated_ids: &'a [u32],
    pub params: &'a ValidatedParameters,
    pub adapter_id: Option<&'a str>,
    /// Set while `min_new_tokens` has not been reached.
    pub suppress_eos: bool,
    pub rng: &'a mut StdRng,
}

impl StepRequest<'_> {
    pub fn top_n(&self) -> u32 {
        self.params.response.top_n_tokens
    }
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn next_token(&self, step: StepRequest<'_>) -> Result<SampledToken, EngineError>;

    /// Scores each prompt token given its prefix. The first token has no
    /// prefix and carries a NaN logprob.
    async fn score_prompt(
        &self,
        input_ids: &[u32],
        top_n: u32,
    ) -> Result<Vec<TokenScore>, EngineError>;

    fn supports_guided(&self, guided: &GuidedDecoding) -> bool {
        guided.is_none()
    }
}
