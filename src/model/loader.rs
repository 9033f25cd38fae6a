use std::sync::Arc;

use tracing::info;

use crate::{
    config::{AppConfig, EngineKind},
    engine::{EchoEngine, InferenceEngine},
    error::ServiceError,
    model::registry::ServedModel,
    tokenizer::TokenizerAdapter,
};

/// Loads the configured tokenizer and engine into a servable model.
pub fn load_model(config: &AppConfig) -> Result<ServedModel, ServiceError> {
    let tokenizer = Arc::new(load_tokenizer(config)?);
    let eos_token_id = tokenizer.eos_token_id();

    let engine: Arc<dyn InferenceEngine> = match config.engine {
        EngineKind::Echo => Arc::new(EchoEngine::new(eos_token_id)),
        EngineKind::Torch => torch_engine(config, eos_token_id)?,
    };
    info!(
        model_id = %config.model_id,
        engine = ?config.engine,
        eos_token_id = ?eos_token_id,
        adapters = config.adapters.len(),
        "model loaded"
    );

    Ok(ServedModel::new(
        config.model_id.clone(),
        config.model_kind,
        config.limits,
        tokenizer,
        engine,
    )
    .with_adapters(config.adapters.iter().cloned())
    .with_stream_buffer(config.stream_buffer))
}

fn load_tokenizer(config: &AppConfig) -> Result<TokenizerAdapter, ServiceError> {
    if config.tokenizer_path.exists() {
        return TokenizerAdapter::from_file(&config.tokenizer_path);
    }
    info!(
        path = %config.tokenizer_path.display(),
        model_id = %config.model_id,
        "tokenizer file missing, fetching from the hub"
    );
    TokenizerAdapter::from_pretrained(&config.model_id, config.revision.as_deref())
}

#[cfg(feature = "tch-backend")]
fn torch_engine(
    config: &AppConfig,
    eos_token_id: Option<u32>,
) -> Result<Arc<dyn InferenceEngine>, ServiceError> {
    let engine = crate::engine::TorchEngine::load(&config.module_path, config.device, eos_token_id)?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "tch-backend"))]
fn torch_engine(
    _config: &AppConfig,
    _eos_token_id: Option<u32>,
) -> Result<Arc<dyn InferenceEngine>, ServiceError> {
    Err(ServiceError::Other(
        "ENGINE=torch requires building with the tch-backend feature".into(),
    ))
}
