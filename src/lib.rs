#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod install;
pub mod layout;
pub mod models;
pub mod package;
pub mod provision;

pub use error::{ProvisionError, Result};
