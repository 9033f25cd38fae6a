pub mod assembler;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod tokenizer;
pub mod validation;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{ModelRegistry, ServedModel};
pub use orchestrator::{GenerationStream, Orchestrator};
pub use server::build_router;
