use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::model::ModelKind;

/// Which inference engine backs the served model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Echo,
    Torch,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub revision: Option<String>,
    pub model_kind: ModelKind,
    pub tokenizer_path: PathBuf,
    pub engine: EngineKind,
    pub module_path: PathBuf,
    pub limits: GenerationLimits,
    pub adapters: Vec<String>,
    pub stream_buffer: usize,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

/// Per-model bounds the validator enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    pub max_sequence_length: u32,
    /// Ceiling on `max_new_tokens`, reported through ModelInfo.
    pub max_new_tokens: u32,
    /// Used when a request leaves `max_new_tokens` at zero.
    pub default_max_new_tokens: u32,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_sequence_length: 2048,
            max_new_tokens: 1024,
            default_max_new_tokens: 20,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("SERVER_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let model_id = lookup("MODEL_ID").unwrap_or_else(|| "distilgpt2".to_string());
        let revision = lookup("MODEL_REVISION");
        let model_kind = match lookup("MODEL_KIND") {
            Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            None => ModelKind::DecoderOnly,
        };

        let tokenizer_path = PathBuf::from(
            lookup("TOKENIZER_PATH").unwrap_or_else(|| "models/tokenizer.json".to_string()),
        );
        let engine_name = lookup("ENGINE").map(|v| v.trim().to_lowercase());
        let engine = match engine_name.as_deref() {
            None | Some("echo") => EngineKind::Echo,
            Some("torch") => EngineKind::Torch,
            Some(other) => anyhow::bail!("unknown ENGINE '{other}', expected 'echo' or 'torch'"),
        };
        let module_path = PathBuf::from(
            lookup("MODULE_PATH").unwrap_or_else(|| "models/model.ts".to_string()),
        );

        let defaults = GenerationLimits::default();
        let limits = GenerationLimits {
            max_sequence_length: parse_or(&lookup, "MAX_SEQUENCE_LENGTH", defaults.max_sequence_length),
            max_new_tokens: parse_or(&lookup, "MAX_NEW_TOKENS", defaults.max_new_tokens),
            default_max_new_tokens: parse_or(
                &lookup,
                "DEFAULT_MAX_NEW_TOKENS",
                defaults.default_max_new_tokens,
            ),
        };
        if limits.default_max_new_tokens == 0 || limits.default_max_new_tokens > limits.max_new_tokens {
            anyhow::bail!(
                "DEFAULT_MAX_NEW_TOKENS must be between 1 and MAX_NEW_TOKENS ({})",
                limits.max_new_tokens
            );
        }

        let adapters = lookup("ADAPTERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let stream_buffer = parse_or(&lookup, "STREAM_BUFFER", 16usize).max(1);

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            model_id,
            revision,
            model_kind,
            tokenizer_path,
            engine,
            module_path,
            limits,
            adapters,
            stream_buffer,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
