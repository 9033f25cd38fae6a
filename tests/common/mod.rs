#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use textgen_service::{
    ModelRegistry, Orchestrator, ServedModel,
    config::GenerationLimits,
    engine::{EngineError, InferenceEngine, SampledToken, StepRequest, TokenScore},
    model::ModelKind,
    tokenizer::TokenizerAdapter,
};

pub const EOS: u32 = 256;

pub fn tokenizer() -> Arc<TokenizerAdapter> {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/tokenizer.json");
    Arc::new(TokenizerAdapter::from_file(Path::new(path)).unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Token(u32),
    /// Emits the token after sleeping for the given milliseconds.
    Slow(u32, u64),
    Eos,
    Fail(&'static str),
    /// Never completes.
    Hang,
}

/// One step per byte of `text`; the fixture vocabulary maps bytes to ids.
pub fn tokens(text: &str) -> Vec<Step> {
    text.bytes().map(|b| Step::Token(u32::from(b))).collect()
}

/// Engine replaying a fixed script, chosen by the prompt. Past the end of a
/// script it emits EOS.
pub struct ScriptedEngine {
    default_script: Vec<Step>,
    scripts: HashMap<Vec<u32>, Vec<Step>>,
    hanging: Arc<AtomicUsize>,
    abandoned: Arc<AtomicUsize>,
    finished: Arc<Mutex<Vec<Vec<u32>>>>,
}

impl ScriptedEngine {
    pub fn new(default_script: Vec<Step>) -> Self {
        Self {
            default_script,
            scripts: HashMap::new(),
            hanging: Arc::new(AtomicUsize::new(0)),
            abandoned: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_prompt(mut self, prompt: &str, script: Vec<Step>) -> Self {
        let ids = tokenizer().encode(prompt).unwrap();
        self.scripts.insert(ids, script);
        self
    }

    /// Counts steps that reached a `Hang`.
    pub fn hanging_steps(&self) -> Arc<AtomicUsize> {
        self.hanging.clone()
    }

    /// Counts hanging steps whose future was dropped.
    pub fn abandoned_steps(&self) -> Arc<AtomicUsize> {
        self.abandoned.clone()
    }

    /// Prompts in the order their EOS was emitted.
    pub fn finish_order(&self) -> Arc<Mutex<Vec<Vec<u32>>>> {
        self.finished.clone()
    }
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn sampled(id: u32) -> SampledToken {
    SampledToken {
        score: TokenScore {
            id,
            logprob: -0.25,
            rank: 1,
            top: Vec::new(),
        },
        is_eos: id == EOS,
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn next_token(&self, step: StepRequest<'_>) -> Result<SampledToken, EngineError> {
        let script = self
            .scripts
            .get(step.input_ids)
            .unwrap_or(&self.default_script);
        match script.get(step.generated_ids.len()).copied().unwrap_or(Step::Eos) {
            Step::Token(id) => Ok(sampled(id)),
            Step::Slow(id, millis) => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(sampled(id))
            }
            Step::Eos => {
                self.finished.lock().push(step.input_ids.to_vec());
                Ok(sampled(EOS))
            }
            Step::Fail(message) => Err(EngineError::Decode(message.to_string())),
            Step::Hang => {
                self.hanging.fetch_add(1, Ordering::SeqCst);
                let _counter = DropCounter(self.abandoned.clone());
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn score_prompt(
        &self,
        input_ids: &[u32],
        _top_n: u32,
    ) -> Result<Vec<TokenScore>, EngineError> {
        Ok(input_ids.iter().map(|&id| sampled(id).score).collect())
    }
}

pub fn served(engine: impl InferenceEngine + 'static, limits: GenerationLimits) -> ServedModel {
    ServedModel::new("scripted", ModelKind::DecoderOnly, limits, tokenizer(), Arc::new(engine))
        .with_adapters(["support-bot"])
        .with_stream_buffer(4)
}

pub fn orchestrator(engine: impl InferenceEngine + 'static) -> Orchestrator {
    let registry = ModelRegistry::single(served(engine, GenerationLimits::default()));
    Orchestrator::new(Arc::new(registry))
}
