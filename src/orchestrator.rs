use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{Stream, future::join_all};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, debug_span, warn};

use crate::{
    assembler,
    error::ServiceError,
    model::{
        BatchedGenerationRequest, BatchedGenerationResponse, BatchedTokenizeRequest,
        BatchedTokenizeResponse, GenerationResponse, ModelInfoResponse, ModelRegistry,
        Parameters, ServedModel, SingleGenerationRequest,
    },
    session::GenerationSession,
    validation::{ValidatedParameters, check_input_length, validate},
};

/// Shared, per-call state every session of a request needs.
#[derive(Clone)]
struct GenerationPlan {
    model: Arc<ServedModel>,
    params: Arc<ValidatedParameters>,
    adapter_id: Option<String>,
}

struct PreparedInput {
    text: String,
    input_ids: Vec<u32>,
}

pub struct Orchestrator {
    registry: Arc<ModelRegistry>,
}

impl Orchestrator {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Runs every request of the batch to completion; responses keep
    /// request order. Dropping the returned future cancels the sessions.
    pub async fn generate(
        &self,
        request: BatchedGenerationRequest,
    ) -> Result<BatchedGenerationResponse, ServiceError> {
        let plan = self.plan(
            &request.model_id,
            request.prefix_id.as_deref(),
            request.adapter_id.as_deref(),
            &request.params,
        )?;
        let inputs = request
            .requests
            .into_iter()
            .map(|item| prepare(&plan, item.text))
            .collect::<Result<Vec<_>, _>>()?;

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let handles: Vec<_> = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                let plan = plan.clone();
                let cancel = cancel.child_token();
                tokio::spawn(
                    async move { run_session(plan, input, cancel, None).await }
                        .instrument(debug_span!("session", index)),
                )
            })
            .collect();

        let mut responses = Vec::with_capacity(handles.len());
        for joined in join_all(handles).await {
            let response = joined
                .map_err(|err| ServiceError::Inference(format!("generation task failed: {err}")))?;
            responses.push(response);
        }
        Ok(BatchedGenerationResponse { responses })
    }

    /// Starts one session whose messages arrive on the returned stream.
    pub fn generate_stream(
        &self,
        request: SingleGenerationRequest,
    ) -> Result<GenerationStream, ServiceError> {
        let plan = self.plan(
            &request.model_id,
            request.prefix_id.as_deref(),
            request.adapter_id.as_deref(),
            &request.params,
        )?;
        let input = prepare(&plan, request.request.text)?;

        let (sender, receiver) = mpsc::channel(plan.model.stream_buffer);
        let cancel = CancellationToken::new();
        let session_cancel = cancel.clone();
        tokio::spawn(
            async move {
                run_session(plan, input, session_cancel, Some(sender)).await;
            }
            .instrument(debug_span!("stream_session")),
        );
        Ok(GenerationStream::new(receiver, cancel))
    }

    pub fn tokenize(
        &self,
        request: &BatchedTokenizeRequest,
    ) -> Result<BatchedTokenizeResponse, ServiceError> {
        let model = self.registry.get(&request.model_id)?;
        assembler::tokenize_batch(request, &model.tokenizer)
    }

    pub fn model_info(&self, model_id: &str) -> Result<ModelInfoResponse, ServiceError> {
        self.registry.model_info(model_id)
    }

    /// Checks shared by every request in a batch; runs before any session starts.
    fn plan(
        &self,
        model_id: &str,
        prefix_id: Option<&str>,
        adapter_id: Option<&str>,
        params: &Parameters,
    ) -> Result<GenerationPlan, ServiceError> {
        let model = self.registry.get(model_id)?;
        let params = validate(params, &model.limits)?;
        if !model.engine.supports_guided(&params.guided) {
            return Err(ServiceError::validation(
                "decoding",
                format!(
                    "{} guided decoding is not supported by model '{}'",
                    params.guided.name(),
                    model.id
                ),
            ));
        }
        let adapter_id = resolve_adapter(&model, prefix_id, adapter_id)?;
        Ok(GenerationPlan {
            model,
            params: Arc::new(params),
            adapter_id,
        })
    }
}

/// Picks the adapter for a request. `adapter_id` wins over the deprecated
/// `prefix_id`.
fn resolve_adapter(
    model: &ServedModel,
    prefix_id: Option<&str>,
    adapter_id: Option<&str>,
) -> Result<Option<String>, ServiceError> {
    let prefix_id = prefix_id.filter(|id| !id.is_empty());
    let adapter_id = adapter_id.filter(|id| !id.is_empty());
    let chosen = match (adapter_id, prefix_id) {
        (Some(adapter), Some(prefix)) if adapter != prefix => {
            warn!(adapter_id = adapter, prefix_id = prefix, "adapter_id and prefix_id differ, using adapter_id");
            Some(adapter)
        }
        (Some(adapter), _) => Some(adapter),
        (None, prefix) => prefix,
    };
    match chosen {
        Some(name) if !model.has_adapter(name) => Err(ServiceError::NotFound(format!(
            "adapter '{name}' for model '{}'",
            model.id
        ))),
        other => Ok(other.map(str::to_string)),
    }
}

fn prepare(plan: &GenerationPlan, text: String) -> Result<PreparedInput, ServiceError> {
    let input_ids = plan
        .model
        .tokenizer
        .encode_truncated(&text, plan.params.truncate_input_tokens)?;
    check_input_length(input_ids.len() as u32, &plan.params, &plan.model.limits)?;
    Ok(PreparedInput { text, input_ids })
}

/// Drives one session to a terminal state. With a sender, every step is
/// streamed; a closed receiver cancels the session.
async fn run_session(
    plan: GenerationPlan,
    input: PreparedInput,
    cancel: CancellationToken,
    sender: Option<mpsc::Sender<GenerationResponse>>,
) -> GenerationResponse {
    let model = &plan.model;
    let tokenizer = model.tokenizer.as_ref();
    let mut session = GenerationSession::new(
        plan.params.clone(),
        model.tokenizer.clone(),
        input.input_ids,
        model.limits.max_sequence_length,
    );

    let input_scores = if plan.params.response.input_tokens {
        match model
            .engine
            .score_prompt(session.input_ids(), plan.params.response.top_n_tokens)
            .await
        {
            Ok(scores) => scores,
            Err(err) => {
                session.fail(err);
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    session.start();
    if let Some(sender) = &sender {
        let preamble = assembler::stream_preamble(&session, &input.text, &input_scores, tokenizer);
        if sender.send(preamble).await.is_err() {
            cancel.cancel();
        }
    }

    loop {
        if cancel.is_cancelled() {
            session.cancel();
        } else if !session.is_terminal() {
            let step = session.step_request(plan.adapter_id.as_deref());
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = model.engine.next_token(step) => Some(outcome),
            };
            match outcome {
                Some(outcome) => {
                    session.advance(outcome, cancel.is_cancelled());
                }
                None => session.cancel(),
            }
        }

        if let Some(sender) = &sender {
            let update = assembler::stream_update(&mut session, tokenizer);
            if sender.send(update).await.is_err() {
                cancel.cancel();
            }
        }
        if session.is_terminal() {
            break;
        }
    }

    assembler::final_response(&session, &input.text, &input_scores, tokenizer)
}

/// Messages of one streaming generation. Dropping the stream cancels the
/// session behind it.
pub struct GenerationStream {
    receiver: mpsc::Receiver<GenerationResponse>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl GenerationStream {
    fn new(receiver: mpsc::Receiver<GenerationResponse>, cancel: CancellationToken) -> Self {
        let guard = cancel.clone().drop_guard();
        Self {
            receiver,
            cancel,
            _guard: guard,
        }
    }

    pub async fn next_message(&mut self) -> Option<GenerationResponse> {
        self.receiver.recv().await
    }

    /// Ends the session; its final message is still delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for GenerationStream {
    type Item = GenerationResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::GenerationLimits,
        engine::EchoEngine,
        model::{GenerationRequest, ModelKind, StopReason},
        tokenizer::tests::fixture,
    };

    fn orchestrator(limits: GenerationLimits) -> Orchestrator {
        let tokenizer = Arc::new(fixture());
        let engine = Arc::new(EchoEngine::new(tokenizer.eos_token_id()));
        let model = ServedModel::new("echo", ModelKind::DecoderOnly, limits, tokenizer, engine)
            .with_adapters(["support-bot"]);
        Orchestrator::new(Arc::new(ModelRegistry::single(model)))
    }

    fn batch(texts: &[&str]) -> BatchedGenerationRequest {
        BatchedGenerationRequest {
            requests: texts
                .iter()
                .map(|text| GenerationRequest { text: text.to_string() })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn batch_responses_keep_request_order() {
        let response = orchestrator(GenerationLimits::default())
            .generate(batch(&["first", "2nd", "third one"]))
            .await
            .unwrap();
        let texts: Vec<&str> = response.responses.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "2nd", "third one"]);
        assert!(response.responses.iter().all(|r| r.stop_reason == StopReason::EosToken));
    }

    #[tokio::test]
    async fn one_invalid_input_rejects_the_whole_batch() {
        let limits = GenerationLimits {
            max_sequence_length: 8,
            ..Default::default()
        };
        let err = orchestrator(limits)
            .generate(batch(&["ok", "far too long for this model"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation { field: "input", .. }));
    }

    #[tokio::test]
    async fn truncation_makes_long_input_fit() {
        let limits = GenerationLimits {
            max_sequence_length: 12,
            ..Default::default()
        };
        let mut request = batch(&["far too long for this model"]);
        request.params.truncate_input_tokens = 5;
        let response = orchestrator(limits).generate(request).await.unwrap();
        assert_eq!(response.responses[0].input_token_count, 5);
        assert_eq!(response.responses[0].text, "model");
    }

    #[tokio::test]
    async fn adapter_id_wins_over_prefix_id() {
        let orchestrator = orchestrator(GenerationLimits::default());
        let mut request = batch(&["hi"]);
        request.adapter_id = Some("support-bot".into());
        request.prefix_id = Some("legacy".into());
        assert!(orchestrator.generate(request).await.is_ok());

        let mut request = batch(&["hi"]);
        request.prefix_id = Some("legacy".into());
        let err = orchestrator.generate(request).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn guided_decoding_is_rejected_when_unsupported() {
        let mut request = batch(&["hi"]);
        request.params.decoding.regex = Some("[a-z]+".into());
        let err = orchestrator(GenerationLimits::default())
            .generate(request)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation { field: "decoding", .. }));
    }

    #[tokio::test]
    async fn stream_ends_with_the_stop_reason() {
        let orchestrator = orchestrator(GenerationLimits::default());
        let mut stream = orchestrator
            .generate_stream(SingleGenerationRequest {
                request: GenerationRequest { text: "abc".into() },
                ..Default::default()
            })
            .unwrap();

        let mut messages = Vec::new();
        while let Some(message) = stream.next_message().await {
            messages.push(message);
        }
        assert_eq!(messages[0].input_token_count, 3);
        let text: String = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(text, "abc");
        let last = messages.last().unwrap();
        assert_eq!(last.stop_reason, StopReason::EosToken);
        assert_eq!(last.generated_token_count, 4);
        assert_eq!(messages.len(), 5);
    }
}
