mod loader;
mod registry;
mod types;

pub use loader::load_model;
pub use registry::{ModelRegistry, ServedModel};
pub use types::*;
