use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokio::task;

use super::{
    EngineError, InferenceEngine, SampledToken, StepRequest, TokenScore,
    logits::{log_softmax, score_token, select_next},
};
use crate::error::ServiceError;

/// TorchScript causal LM. Each step runs a full forward pass over the
/// sequence; there is no KV cache.
pub struct TorchEngine {
    module: Arc<Mutex<tch::CModule>>,
    device: Device,
    eos_token_id: Option<u32>,
}

impl TorchEngine {
    pub fn load(
        module_path: &Path,
        device: Device,
        eos_token_id: Option<u32>,
    ) -> Result<Self, ServiceError> {
        if !module_path.exists() {
            return Err(ServiceError::Other(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        let mut module = tch::CModule::load_on_device(module_path, device)
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        module.set_eval();

        Ok(Self {
            module: Arc::new(Mutex::new(module)),
            device,
            eos_token_id,
        })
    }

    /// Logits for every position of `ids`, one row per token.
    async fn forward(&self, ids: Vec<i64>, last_only: bool) -> Result<Vec<Vec<f32>>, EngineError> {
        let module = self.module.clone();
        let device = self.device;
        task::spawn_blocking(move || forward_blocking(&module, device, &ids, last_only))
            .await
            .map_err(|err| EngineError::Decode(format!("forward task failed: {err}")))?
    }
}

fn forward_blocking(
    module: &Mutex<tch::CModule>,
    device: Device,
    ids: &[i64],
    last_only: bool,
) -> Result<Vec<Vec<f32>>, EngineError> {
    if ids.is_empty() {
        return Err(EngineError::Decode("empty input sequence".into()));
    }
    no_grad(|| {
        let input = Tensor::from_slice(ids)
            .reshape([1, ids.len() as i64])
            .to(device);
        let output = module
            .lock()
            .forward_is(&[IValue::Tensor(input)])
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        // traced models return either the logits or a (logits, past) tuple
        let logits = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                IValue::Tensor(t) => t.shallow_clone(),
                _ => {
                    return Err(EngineError::Decode(
                        "expected tensor as first tuple element".into(),
                    ));
                }
            },
            _ => return Err(EngineError::Decode("unexpected model output format".into())),
        };

        // [1, seq_len, vocab] -> [seq_len, vocab]
        let logits = logits.squeeze_dim(0).to_kind(Kind::Float).to_device(Device::Cpu);
        let rows = if last_only {
            vec![logits.get(ids.len() as i64 - 1)]
        } else {
            (0..ids.len() as i64).map(|i| logits.get(i)).collect()
        };
        rows.iter()
            .map(|row| Vec::<f32>::try_from(row).map_err(|e| EngineError::Decode(e.to_string())))
            .collect()
    })
}

#[async_trait]
impl InferenceEngine for TorchEngine {
    async fn next_token(&self, mut step: StepRequest<'_>) -> Result<SampledToken, EngineError> {
        if step.adapter_id.is_some() {
            return Err(EngineError::Unsupported("adapters with a TorchScript module".into()));
        }
        let ids: Vec<i64> = step
            .input_ids
            .iter()
            .chain(step.generated_ids)
            .map(|&id| i64::from(id))
            .collect();
        let mut rows = self.forward(ids, true).await?;
        let logits = rows
            .pop()
            .ok_or_else(|| EngineError::Decode("model produced no logits".into()))?;
        select_next(logits, &mut step, self.eos_token_id)
    }

    async fn score_prompt(
        &self,
        input_ids: &[u32],
        top_n: u32,
    ) -> Result<Vec<TokenScore>, EngineError> {
        let Some(&first) = input_ids.first() else {
            return Ok(Vec::new());
        };
        let ids: Vec<i64> = input_ids.iter().map(|&id| i64::from(id)).collect();
        let rows = self.forward(ids, false).await?;

        let mut scores = vec![TokenScore {
            id: first,
            logprob: f32::NAN,
            rank: 0,
            top: Vec::new(),
        }];
        // row i predicts token i + 1
        for (row, &id) in rows.iter().zip(&input_ids[1..]) {
            scores.push(score_token(&log_softmax(row), id, top_n));
        }
        Ok(scores)
    }
}
