//! Configuration for Tessera multiplayer hosts.
//!
//! Settings persist to disk as RON and can be overridden from the command
//! line. Every section uses `#[serde(default)]`, so older or partial files
//! keep loading as new fields are added.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, NetworkConfig, SceneConfig, UpdateCheckType, default_config_dir,
};
pub use error::ConfigError;
