use std::time::Duration;

use async_trait::async_trait;

use super::{Candidate, EngineError, InferenceEngine, SampledToken, StepRequest, TokenScore};

/// Engine that echoes the prompt back one token per step, then EOS.
///
/// While EOS is suppressed it starts over from the first prompt token.
/// Useful for exercising the serving path without model weights.
pub struct EchoEngine {
    eos_token_id: Option<u32>,
    delay: Duration,
}

impl EchoEngine {
    pub fn new(eos_token_id: Option<u32>) -> Self {
        Self {
            eos_token_id,
            delay: Duration::ZERO,
        }
    }

    /// Sleeps this long before every token.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn certain(id: u32, top_n: u32) -> TokenScore {
        TokenScore {
            id,
            logprob: 0.0,
            rank: 1,
            top: if top_n > 0 {
                vec![Candidate { id, logprob: 0.0 }]
            } else {
                Vec::new()
            },
        }
    }
}

#[async_trait]
impl InferenceEngine for EchoEngine {
    async fn next_token(&self, step: StepRequest<'_>) -> Result<SampledToken, EngineError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let position = step.generated_ids.len();
        let prompt = step.input_ids;
        let next = match (prompt.get(position), self.eos_token_id) {
            (Some(&id), _) => Some(id),
            (None, Some(eos)) if !step.suppress_eos => Some(eos),
            (None, _) if !prompt.is_empty() => Some(prompt[position % prompt.len()]),
            (None, _) => None,
        };
        let id = next.ok_or_else(|| EngineError::Decode("nothing to echo for an empty prompt".into()))?;

        Ok(SampledToken {
            score: Self::certain(id, step.top_n()),
            is_eos: Some(id) == self.eos_token_id,
        })
    }

    async fn score_prompt(
        &self,
        input_ids: &[u32],
        top_n: u32,
    ) -> Result<Vec<TokenScore>, EngineError> {
        Ok(input_ids
            .iter()
            .enumerate()
            .map(|(idx, &id)| {
                let mut score = Self::certain(id, top_n);
                if idx == 0 {
                    score.logprob = f32::NAN;
                }
                score
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::{config::GenerationLimits, model::Parameters, validation::validate};

    #[tokio::test]
    async fn echoes_prompt_then_eos() {
        let engine = EchoEngine::new(Some(99));
        let params = validate(&Parameters::default(), &GenerationLimits::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let input = [5, 6];

        let mut generated = Vec::new();
        for _ in 0..3 {
            let token = engine
                .next_token(StepRequest {
                    input_ids: &input,
                    generated_ids: &generated,
                    params: &params,
                    adapter_id: None,
                    suppress_eos: false,
                    rng: &mut rng,
                })
                .await
                .unwrap();
            generated.push(token.score.id);
        }
        assert_eq!(generated, vec![5, 6, 99]);
    }

    #[tokio::test]
    async fn wraps_around_while_eos_is_suppressed() {
        let engine = EchoEngine::new(Some(99));
        let params = validate(&Parameters::default(), &GenerationLimits::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let token = engine
            .next_token(StepRequest {
                input_ids: &[5, 6],
                generated_ids: &[5, 6],
                params: &params,
                adapter_id: None,
                suppress_eos: true,
                rng: &mut rng,
            })
            .await
            .unwrap();
        assert_eq!(token.score.id, 5);
        assert!(!token.is_eos);
    }

    #[tokio::test]
    async fn prompt_scores_cover_every_input_token() {
        let scores = EchoEngine::new(None).score_prompt(&[1, 2, 3], 2).await.unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[0].logprob.is_nan());
        assert_eq!(scores[2].top.len(), 1);
    }
}
