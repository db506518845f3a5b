//! Configuration types and loading

mod loader;
mod types;

pub use loader::{apply_env_overrides, create_default_config, load, load_config};
pub use types::{
    Config, InterceptConfig, ListenPortSpec, ListenProto, LogConfig, ServerConfig,
};
