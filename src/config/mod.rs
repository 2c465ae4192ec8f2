//! Configuration module for comfypack
//!
//! Loads config from `$XDG_CONFIG_HOME/comfypack/config.toml` or `~/.config/comfypack/config.toml`.
//! Falls back to embedded defaults if file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//!
//! The loaded value is passed explicitly to every component; nothing reads
//! it from global state.
//!
//! # Example
//!
//! ```no_run
//! use comfypack::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Models dir: {}", config.layout.models_dir);
//! println!("Retries: {}", config.download.retries);
//! ```

pub mod schema;

pub use schema::{Config, GatedSource};
