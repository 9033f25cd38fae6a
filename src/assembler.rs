use crate::{
    engine::TokenScore,
    error::ServiceError,
    model::{
        BatchedTokenizeRequest, BatchedTokenizeResponse, GenerationResponse, ResponseOptions,
        StopReason, TokenInfo, TopToken,
    },
    session::GenerationSession,
    tokenizer::{TokenizeOptions, TokenizerAdapter},
};

fn wire_logprob(logprob: f32, options: &ResponseOptions) -> Option<f32> {
    Some(logprob).filter(|lp| options.token_logprobs && lp.is_finite())
}

/// Token detail entries with logprob, rank and top candidates gated by
/// `options`.
pub fn token_details(
    scores: &[TokenScore],
    options: &ResponseOptions,
    tokenizer: &TokenizerAdapter,
) -> Vec<TokenInfo> {
    scores
        .iter()
        .map(|score| TokenInfo {
            text: tokenizer.token_text(score.id),
            logprob: wire_logprob(score.logprob, options),
            rank: if options.token_ranks { score.rank } else { 0 },
            top_tokens: if options.top_n_tokens > 0 {
                score
                    .top
                    .iter()
                    .map(|candidate| TopToken {
                        text: tokenizer.token_text(candidate.id),
                        logprob: wire_logprob(candidate.logprob, options),
                    })
                    .collect()
            } else {
                Vec::new()
            },
        })
        .collect()
}

/// Complete response for a finished session in a batch.
pub fn final_response(
    session: &GenerationSession,
    input_text: &str,
    input_scores: &[TokenScore],
    tokenizer: &TokenizerAdapter,
) -> GenerationResponse {
    let options = &session.params().response;
    let text = if options.input_text {
        format!("{input_text}{}", session.text())
    } else {
        session.text().to_string()
    };
    let tokens = if options.generated_tokens {
        token_details(session.scores(), options, tokenizer)
    } else {
        Vec::new()
    };

    GenerationResponse {
        input_token_count: session.input_token_count(),
        generated_token_count: session.generated_token_count(),
        text,
        stop_reason: session.stop_reason(),
        stop_sequence: session.stop_sequence().unwrap_or_default().to_string(),
        seed: session.params().seed(),
        tokens,
        input_tokens: input_details(input_scores, options, tokenizer),
    }
}

/// First message of a stream: input accounting only, nothing generated yet.
pub fn stream_preamble(
    session: &GenerationSession,
    input_text: &str,
    input_scores: &[TokenScore],
    tokenizer: &TokenizerAdapter,
) -> GenerationResponse {
    let options = &session.params().response;
    GenerationResponse {
        input_token_count: session.input_token_count(),
        text: if options.input_text {
            input_text.to_string()
        } else {
            String::new()
        },
        input_tokens: input_details(input_scores, options, tokenizer),
        ..Default::default()
    }
}

/// Incremental message after a step. Carries the stop reason, stop sequence
/// and seed once the session is terminal.
pub fn stream_update(
    session: &mut GenerationSession,
    tokenizer: &TokenizerAdapter,
) -> GenerationResponse {
    let text = session.take_text_delta();
    let options = session.params().response.clone();
    let tokens = if options.generated_tokens {
        token_details(session.take_new_scores(), &options, tokenizer)
    } else {
        Vec::new()
    };

    let mut response = GenerationResponse {
        generated_token_count: session.generated_token_count(),
        text,
        tokens,
        ..Default::default()
    };
    if session.is_terminal() {
        response.stop_reason = session.stop_reason();
        response.stop_sequence = session.stop_sequence().unwrap_or_default().to_string();
        response.seed = session.params().seed();
    } else {
        response.stop_reason = StopReason::NotFinished;
    }
    response
}

pub fn tokenize_batch(
    request: &BatchedTokenizeRequest,
    tokenizer: &TokenizerAdapter,
) -> Result<BatchedTokenizeResponse, ServiceError> {
    let options = TokenizeOptions {
        return_tokens: request.return_tokens,
        return_offsets: request.return_offsets,
        truncate_input_tokens: (request.truncate_input_tokens > 0)
            .then_some(request.truncate_input_tokens),
    };
    let responses = request
        .requests
        .iter()
        .map(|item| tokenizer.tokenize(&item.text, options))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BatchedTokenizeResponse { responses })
}

fn input_details(
    scores: &[TokenScore],
    options: &ResponseOptions,
    tokenizer: &TokenizerAdapter,
) -> Vec<TokenInfo> {
    if options.input_tokens {
        token_details(scores, options, tokenizer)
    } else {
        Vec::new()
    }
}
