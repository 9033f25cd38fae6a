use std::cmp::Ordering;

use rand::Rng;

use super::{Candidate, EngineError, SampledToken, StepRequest, TokenScore};
use crate::{
    model::LengthPenalty,
    validation::{DecodingStrategy, SamplingConfig},
};

pub fn select_next(
    mut logits: Vec<f32>,
    step: &mut StepRequest<'_>,
    eos_token_id: Option<u32>,
) -> Result<SampledToken, EngineError> {
    if logits.is_empty() {
        return Err(EngineError::Decode("engine returned no logits".into()));
    }

    if let Some(penalty) = step.params.repetition_penalty {
        let seen = step.input_ids.iter().chain(step.generated_ids);
        apply_repetition_penalty(&mut logits, seen.copied(), penalty);
    }
    if let (Some(penalty), Some(eos)) = (step.params.length_penalty, eos_token_id) {
        apply_length_penalty(&mut logits, eos, step.generated_ids.len(), penalty);
    }
    if step.suppress_eos {
        if let Some(slot) = eos_token_id.and_then(|eos| logits.get_mut(eos as usize)) {
            *slot = f32::NEG_INFINITY;
        }
    }

    let logprobs = log_softmax(&logits);
    let id = match &step.params.strategy {
        DecodingStrategy::Greedy => argmax(&logprobs),
        DecodingStrategy::Sample(config) => sample(&logits, config, &mut *step.rng),
    };

    Ok(SampledToken {
        score: score_token(&logprobs, id, step.top_n()),
        is_eos: Some(id) == eos_token_id,
    })
}

/// Divides positive logits (multiplies negative ones) of already-seen tokens.
pub fn apply_repetition_penalty<I>(logits: &mut [f32], seen: I, penalty: f32)
where
    I: IntoIterator<Item = u32>,
{
    let mut seen: Vec<u32> = seen.into_iter().collect();
    seen.sort_unstable();
    seen.dedup();
    for id in seen {
        if let Some(logit) = logits.get_mut(id as usize) {
            *logit = if *logit > 0.0 {
                *logit / penalty
            } else {
                *logit * penalty
            };
        }
    }
}

/// Exponentially raises the EOS logit once `start_index` tokens exist.
pub fn apply_length_penalty(
    logits: &mut [f32],
    eos_token_id: u32,
    generated: usize,
    penalty: LengthPenalty,
) {
    let start = penalty.start_index as usize;
    if generated < start {
        return;
    }
    if let Some(logit) = logits.get_mut(eos_token_id as usize) {
        let boost = penalty.decay_factor.powi((generated - start) as i32) - 1.0;
        *logit += logit.abs() * boost;
    }
}

pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NEG_INFINITY; logits.len()];
    }
    let sum: f32 = logits.iter().map(|&x| (x - max).exp()).sum();
    let log_sum = sum.ln();
    logits.iter().map(|&x| x - max - log_sum).collect()
}

pub fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map_or(0, |(idx, _)| idx as u32)
}

pub fn score_token(logprobs: &[f32], id: u32, top_n: u32) -> TokenScore {
    let logprob = logprobs.get(id as usize).copied().unwrap_or(f32::NEG_INFINITY);
    let better = logprobs.iter().filter(|&&lp| lp > logprob).count();
    TokenScore {
        id,
        logprob,
        rank: better as u32 + 1,
        top: top_candidates(logprobs, top_n),
    }
}

/// The `n` most likely candidates, extended by any tied with the n-th.
pub fn top_candidates(logprobs: &[f32], n: u32) -> Vec<Candidate> {
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..logprobs.len()).collect();
    order.sort_by(|&a, &b| {
        logprobs[b]
            .partial_cmp(&logprobs[a])
            .unwrap_or(Ordering::Equal)
    });

    let n = (n as usize).min(order.len());
    let Some(&last) = order.get(n.saturating_sub(1)) else {
        return Vec::new();
    };
    let cutoff = logprobs[last];
    order
        .into_iter()
        .enumerate()
        .take_while(|&(pos, idx)| pos < n || logprobs[idx] == cutoff)
        .map(|(_, idx)| Candidate {
            id: idx as u32,
            logprob: logprobs[idx],
        })
        .collect()
}

fn sample<R: Rng + ?Sized>(logits: &[f32], config: &SamplingConfig, rng: &mut R) -> u32 {
    let scaled: Vec<f32> = logits.iter().map(|&x| x / config.temperature).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<(u32, f32)> = scaled
        .iter()
        .enumerate()
        .map(|(idx, &x)| (idx as u32, (x - max).exp()))
        .filter(|&(_, p)| p > 0.0)
        .collect();
    if probs.is_empty() {
        return argmax(logits);
    }
    probs.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    normalize(&mut probs);

    if let Some(k) = config.top_k {
        probs.truncate(k as usize);
        normalize(&mut probs);
    }
    if let Some(p) = config.top_p {
        let keep = nucleus_len(probs.iter().map(|&(_, prob)| prob), p);
        probs.truncate(keep);
        normalize(&mut probs);
    }
    if let Some(p) = config.typical_p {
        let entropy: f32 = probs.iter().map(|&(_, prob)| -prob * prob.ln()).sum();
        probs.sort_by(|(_, a), (_, b)| {
            let da = (-a.ln() - entropy).abs();
            let db = (-b.ln() - entropy).abs();
            da.partial_cmp(&db).unwrap_or(Ordering::Equal)
        });
        let keep = nucleus_len(probs.iter().map(|&(_, prob)| prob), p);
        probs.truncate(keep);
        normalize(&mut probs);
    }

    let draw: f32 = rng.gen_range(0.0..1.0);
    let mut cumulative = 0.0;
    for &(id, prob) in &probs {
        cumulative += prob;
        if cumulative >= draw {
            return id;
        }
    }
    probs.last().map_or(0, |&(id, _)| id)
}

/// Length of the shortest prefix whose mass reaches `threshold`, at least one.
fn nucleus_len<I: IntoIterator<Item = f32>>(probs: I, threshold: f32) -> usize {
    let mut cumulative = 0.0;
    let mut len = 0;
    for prob in probs {
        len += 1;
        cumulative += prob;
        if cumulative >= threshold {
            break;
        }
    }
    len.max(1)
}

fn normalize(probs: &mut [(u32, f32)]) {
    let total: f32 = probs.iter().map(|&(_, p)| p).sum();
    if total > 0.0 {
        for (_, p) in probs.iter_mut() {
            *p /= total;
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::{
        config::GenerationLimits,
        model::{DecodingMethod, Parameters, SamplingParameters},
        validation::{ValidatedParameters, validate},
    };

    fn greedy() -> ValidatedParameters {
        validate(&Parameters::default(), &GenerationLimits::default()).unwrap()
    }

    fn step<'a>(
        params: &'a ValidatedParameters,
        generated: &'a [u32],
        rng: &'a mut StdRng,
        suppress_eos: bool,
    ) -> StepRequest<'a> {
        StepRequest {
            input_ids: &[],
            generated_ids: generated,
            params,
            adapter_id: None,
            suppress_eos,
            rng,
        }
    }

    #[test]
    fn greedy_picks_the_largest_logit() {
        let params = greedy();
        let mut rng = StdRng::seed_from_u64(0);
        let token = select_next(vec![0.1, 3.0, 2.0], &mut step(&params, &[], &mut rng, false), None).unwrap();
        assert_eq!(token.score.id, 1);
        assert_eq!(token.score.rank, 1);
        assert!(!token.is_eos);
    }

    #[test]
    fn suppressed_eos_is_never_selected() {
        let params = greedy();
        let mut rng = StdRng::seed_from_u64(0);
        let token = select_next(vec![5.0, 1.0, 0.5], &mut step(&params, &[], &mut rng, true), Some(0)).unwrap();
        assert_eq!(token.score.id, 1);

        let token = select_next(vec![5.0, 1.0, 0.5], &mut step(&params, &[], &mut rng, false), Some(0)).unwrap();
        assert!(token.is_eos);
    }

    #[test]
    fn rank_counts_strictly_better_candidates() {
        let logprobs = log_softmax(&[1.0, 4.0, 2.0, 4.0]);
        let score = score_token(&logprobs, 2, 0);
        assert_eq!(score.rank, 3);
        assert!(score.top.is_empty());
    }

    #[test]
    fn top_candidates_extend_on_ties() {
        let logprobs = [-1.0, -0.5, -2.0, -2.0, -2.0, -3.0];
        let top = top_candidates(&logprobs, 3);
        let ids: Vec<u32> = top.iter().map(|c| c.id).collect();
        assert_eq!(&ids[..2], &[1, 0]);
        assert_eq!(ids.len(), 5);
        assert!(top.windows(2).all(|w| w[0].logprob >= w[1].logprob));

        assert_eq!(top_candidates(&logprobs, 1).len(), 1);
        assert_eq!(top_candidates(&[-1.0], 5).len(), 1);
    }

    #[test]
    fn repetition_penalty_lowers_seen_tokens() {
        let mut logits = vec![2.0, -2.0, 2.0];
        apply_repetition_penalty(&mut logits, [0, 1, 0], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 2.0]);
    }

    #[test]
    fn length_penalty_boosts_eos_after_start() {
        let penalty = LengthPenalty {
            start_index: 2,
            decay_factor: 2.0,
        };
        let mut logits = vec![1.0, 3.0];
        apply_length_penalty(&mut logits, 0, 1, penalty);
        assert_eq!(logits[0], 1.0);
        apply_length_penalty(&mut logits, 0, 4, penalty);
        assert_eq!(logits[0], 4.0);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let params = validate(
            &Parameters {
                method: DecodingMethod::Sample,
                sampling: SamplingParameters {
                    temperature: Some(0.8),
                    top_k: 3,
                    seed: Some(7),
                    ..Default::default()
                },
                ..Default::default()
            },
            &GenerationLimits::default(),
        )
        .unwrap();
        let logits = vec![1.0, 1.2, 0.9, 1.1, -5.0];

        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..16)
                .map(|_| {
                    select_next(logits.clone(), &mut step(&params, &[], &mut rng, false), None)
                        .unwrap()
                        .score
                        .id
                })
                .collect::<Vec<_>>()
        };
        let first = draw(7);
        assert_eq!(first, draw(7));
        // top_k = 3 keeps ids 1, 3 and 0
        assert!(first.iter().all(|id| [0, 1, 3].contains(id)));
    }

    #[test]
    fn nucleus_keeps_at_least_one() {
        assert_eq!(nucleus_len([0.6, 0.3, 0.1], 0.5), 1);
        assert_eq!(nucleus_len([0.6, 0.3, 0.1], 0.8), 2);
        assert_eq!(nucleus_len([0.6, 0.3, 0.1], 0.0), 1);
    }
}
