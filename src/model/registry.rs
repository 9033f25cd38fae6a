use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    config::{AppConfig, GenerationLimits},
    engine::InferenceEngine,
    error::ServiceError,
    model::{ModelInfoResponse, ModelKind, loader},
    tokenizer::TokenizerAdapter,
};

/// A loaded model and everything needed to serve it.
pub struct ServedModel {
    pub id: String,
    pub kind: ModelKind,
    pub limits: GenerationLimits,
    pub tokenizer: Arc<TokenizerAdapter>,
    pub engine: Arc<dyn InferenceEngine>,
    /// Capacity of the per-stream message channel.
    pub stream_buffer: usize,
    adapters: HashSet<String>,
}

impl ServedModel {
    pub fn new(
        id: impl Into<String>,
        kind: ModelKind,
        limits: GenerationLimits,
        tokenizer: Arc<TokenizerAdapter>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            limits,
            tokenizer,
            engine,
            stream_buffer: 16,
            adapters: HashSet::new(),
        }
    }

    pub fn with_adapters<I, S>(mut self, adapters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.adapters.extend(adapters.into_iter().map(Into::into));
        self
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn has_adapter(&self, adapter_id: &str) -> bool {
        self.adapters.contains(adapter_id)
    }

    pub fn info(&self) -> ModelInfoResponse {
        ModelInfoResponse {
            model_kind: self.kind,
            max_sequence_length: self.limits.max_sequence_length,
            max_new_tokens: self.limits.max_new_tokens,
        }
    }
}

pub struct ModelRegistry {
    models: HashMap<String, Arc<ServedModel>>,
    default_id: String,
}

impl ModelRegistry {
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let model = loader::load_model(config)?;
        Ok(Self::single(model))
    }

    /// Registry serving one model, which is also the default.
    pub fn single(model: ServedModel) -> Self {
        let default_id = model.id.clone();
        let mut models = HashMap::new();
        models.insert(default_id.clone(), Arc::new(model));
        Self { models, default_id }
    }

    pub fn with_model(mut self, model: ServedModel) -> Self {
        self.models.insert(model.id.clone(), Arc::new(model));
        self
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_id
    }

    /// Looks up a model; an empty id selects the default model.
    pub fn get(&self, model_id: &str) -> Result<Arc<ServedModel>, ServiceError> {
        let id = if model_id.is_empty() {
            self.default_id.as_str()
        } else {
            model_id
        };
        self.models
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("model '{id}'")))
    }

    pub fn model_info(&self, model_id: &str) -> Result<ModelInfoResponse, ServiceError> {
        self.get(model_id).map(|model| model.info())
    }
}
