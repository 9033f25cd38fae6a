use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rand::{SeedableRng, rngs::StdRng};
use tracing::{debug, warn};

use crate::{
    engine::{EngineError, SampledToken, StepRequest, TokenScore},
    model::StopReason,
    tokenizer::TokenizerAdapter,
    validation::ValidatedParameters,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Running,
    Terminal(StopReason),
}

/// Facts gathered after a step, judged by [`STOP_PRECEDENCE`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopObservation {
    pub cancelled: bool,
    pub elapsed: Duration,
    pub time_limit: Option<Duration>,
    pub stop_sequence_matched: bool,
    pub eos: bool,
    pub generated: u32,
    pub min_new_tokens: u32,
    pub max_new_tokens: u32,
    pub total_tokens: u32,
    pub token_limit: u32,
    pub engine_failed: bool,
}

impl StopObservation {
    fn min_reached(&self) -> bool {
        self.generated >= self.min_new_tokens
    }
}

pub type StopPredicate = fn(&StopObservation) -> bool;

/// Termination checks in priority order; the first one that holds wins.
pub const STOP_PRECEDENCE: [(StopReason, StopPredicate); 7] = [
    (StopReason::Cancelled, was_cancelled),
    (StopReason::TimeLimit, time_limit_reached),
    (StopReason::StopSequence, stop_sequence_reached),
    (StopReason::EosToken, eos_reached),
    (StopReason::MaxTokens, max_tokens_reached),
    (StopReason::TokenLimit, token_limit_reached),
    (StopReason::Error, engine_failed),
];

fn was_cancelled(o: &StopObservation) -> bool {
    o.cancelled
}

fn time_limit_reached(o: &StopObservation) -> bool {
    o.time_limit.is_some_and(|limit| o.elapsed >= limit)
}

fn stop_sequence_reached(o: &StopObservation) -> bool {
    o.stop_sequence_matched && o.min_reached()
}

fn eos_reached(o: &StopObservation) -> bool {
    o.eos && o.min_reached()
}

fn max_tokens_reached(o: &StopObservation) -> bool {
    o.generated >= o.max_new_tokens
}

fn token_limit_reached(o: &StopObservation) -> bool {
    o.total_tokens >= o.token_limit
}

fn engine_failed(o: &StopObservation) -> bool {
    o.engine_failed
}

pub fn stop_reason_for(observation: &StopObservation) -> Option<StopReason> {
    STOP_PRECEDENCE
        .iter()
        .find(|(_, holds)| holds(observation))
        .map(|&(reason, _)| reason)
}

pub struct GenerationSession {
    params: Arc<ValidatedParameters>,
    tokenizer: Arc<TokenizerAdapter>,
    token_limit: u32,
    input_ids: Vec<u32>,
    generated_ids: Vec<u32>,
    scores: Vec<TokenScore>,
    text: String,
    stop_sequence: Option<String>,
    error: Option<String>,
    state: SessionState,
    started_at: Option<Instant>,
    rng: StdRng,
    emitted_text: usize,
    emitted_tokens: usize,
}

impl GenerationSession {
    pub fn new(
        params: Arc<ValidatedParameters>,
        tokenizer: Arc<TokenizerAdapter>,
        input_ids: Vec<u32>,
        token_limit: u32,
    ) -> Self {
        let rng = StdRng::seed_from_u64(params.seed().unwrap_or_default());
        Self {
            params,
            tokenizer,
            token_limit,
            input_ids,
            generated_ids: Vec::new(),
            scores: Vec::new(),
            text: String::new(),
            stop_sequence: None,
            error: None,
            state: SessionState::Pending,
            started_at: None,
            rng,
            emitted_text: 0,
            emitted_tokens: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Terminal(_))
    }

    pub fn stop_reason(&self) -> StopReason {
        match self.state {
            SessionState::Terminal(reason) => reason,
            _ => StopReason::NotFinished,
        }
    }

    pub fn params(&self) -> &ValidatedParameters {
        &self.params
    }

    pub fn input_ids(&self) -> &[u32] {
        &self.input_ids
    }

    pub fn input_token_count(&self) -> u32 {
        self.input_ids.len() as u32
    }

    pub fn generated_token_count(&self) -> u32 {
        self.generated_ids.len() as u32
    }

    pub fn scores(&self) -> &[TokenScore] {
        &self.scores
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn stop_sequence(&self) -> Option<&str> {
        self.stop_sequence.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|at| at.elapsed()).unwrap_or_default()
    }

    pub fn start(&mut self) {
        if self.state == SessionState::Pending {
            self.state = SessionState::Running;
            self.started_at = Some(Instant::now());
        }
    }

    /// Borrows what the engine needs for the next token.
    pub fn step_request<'a>(&'a mut self, adapter_id: Option<&'a str>) -> StepRequest<'a> {
        StepRequest {
            input_ids: &self.input_ids,
            generated_ids: &self.generated_ids,
            params: &self.params,
            adapter_id,
            suppress_eos: self.generated_token_count() < self.params.min_new_tokens,
            rng: &mut self.rng,
        }
    }

    /// Ends the session without consuming another token.
    pub fn cancel(&mut self) {
        if !self.is_terminal() {
            self.finish(StopReason::Cancelled);
        }
    }

    /// Fails the session before or between steps, keeping partial output.
    pub fn fail(&mut self, error: EngineError) {
        if !self.is_terminal() {
            warn!(%error, generated = self.generated_token_count(), "generation failed");
            self.error = Some(error.to_string());
            self.finish(StopReason::Error);
        }
    }

    /// Applies one engine outcome and runs the stop checks.
    pub fn advance(
        &mut self,
        outcome: Result<SampledToken, EngineError>,
        cancelled: bool,
    ) -> StopReason {
        if self.is_terminal() {
            return self.stop_reason();
        }
        self.start();

        // an incomplete trailing character may decode differently next time
        let previous_len = self.text.trim_end_matches('\u{FFFD}').len();
        let mut eos = false;
        let mut matched = None;
        let mut failed = false;
        match outcome {
            Ok(token) => {
                eos = token.is_eos;
                self.generated_ids.push(token.score.id);
                self.scores.push(token.score);
                match self.tokenizer.decode(&self.generated_ids) {
                    Ok(text) => {
                        self.text = text;
                        matched = self.find_stop_sequence(previous_len);
                    }
                    Err(err) => {
                        failed = true;
                        self.error = Some(err.to_string());
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, generated = self.generated_token_count(), "engine step failed");
                failed = true;
                self.error = Some(err.to_string());
            }
        }

        let generated = self.generated_token_count();
        let observation = StopObservation {
            cancelled,
            elapsed: self.elapsed(),
            time_limit: self.params.time_limit,
            stop_sequence_matched: matched.is_some(),
            eos,
            generated,
            min_new_tokens: self.params.min_new_tokens,
            max_new_tokens: self.params.max_new_tokens,
            total_tokens: self.input_token_count() + generated,
            token_limit: self.token_limit,
            engine_failed: failed,
        };

        if let Some(reason) = stop_reason_for(&observation) {
            if let (StopReason::StopSequence, Some((start, sequence))) = (reason, matched) {
                let end = if self.params.include_stop_sequence {
                    start + sequence.len()
                } else {
                    start
                };
                self.text.truncate(end);
                self.stop_sequence = Some(sequence);
            }
            self.finish(reason);
        }
        self.stop_reason()
    }

    /// Text produced since the previous call, withholding anything that may
    /// still turn into a stop sequence or an incomplete character.
    pub fn take_text_delta(&mut self) -> String {
        let visible = if self.is_terminal() {
            self.text.len()
        } else {
            self.text.len() - self.holdback()
        };
        if visible <= self.emitted_text {
            return String::new();
        }
        let delta = self
            .text
            .get(self.emitted_text..visible)
            .map(str::to_string)
            .unwrap_or_default();
        self.emitted_text = visible;
        delta
    }

    /// Scores of tokens not yet handed out by a previous call.
    pub fn take_new_scores(&mut self) -> &[TokenScore] {
        let start = self.emitted_tokens;
        self.emitted_tokens = self.scores.len();
        &self.scores[start..]
    }

    fn finish(&mut self, reason: StopReason) {
        self.state = SessionState::Terminal(reason);
        debug!(
            stop_reason = %reason,
            input_tokens = self.input_token_count(),
            generated_tokens = self.generated_token_count(),
            elapsed_ms = self.elapsed().as_millis() as u64,
            "session finished"
        );
    }

    /// Earliest stop sequence occurrence ending past `previous_len`.
    fn find_stop_sequence(&self, previous_len: usize) -> Option<(usize, String)> {
        self.params
            .stop_sequences
            .iter()
            .filter_map(|sequence| {
                self.text
                    .match_indices(sequence.as_str())
                    .find(|(start, _)| start + sequence.len() > previous_len)
                    .map(|(start, _)| (start, sequence.clone()))
            })
            .min_by_key(|(start, _)| *start)
    }

    fn holdback(&self) -> usize {
        let trimmed = self.text.trim_end_matches('\u{FFFD}');
        let incomplete = self.text.len() - trimmed.len();
        let partial_stop = self
            .params
            .stop_sequences
            .iter()
            .filter_map(|sequence| {
                (1..sequence.len())
                    .rev()
                    .filter(|&k| sequence.is_char_boundary(k))
                    .find(|&k| trimmed.ends_with(&sequence[..k]))
            })
            .max()
            .unwrap_or(0);
        incomplete + partial_stop
    }
}
