use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub package: PackageConfig,
    #[serde(default)]
    pub provision: ProvisionConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct LayoutConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    #[serde(default = "default_extensions_dir")]
    pub extensions_dir: String,
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,
    #[serde(default = "default_standard_categories")]
    pub standard_categories: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub progress: bool,
    #[serde(default = "default_true")]
    pub check_disk_space: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CredentialsConfig {
    #[serde(default = "default_file_name_suffix")]
    pub file_name_suffix: String,
    #[serde(default = "default_sources")]
    pub sources: Vec<GatedSource>,
}

/// A remote host that may require an API key
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct GatedSource {
    pub name: String,
    pub host: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct PackageConfig {
    #[serde(default = "default_manifest_names")]
    pub manifest_names: Vec<String>,
    #[serde(default = "default_acquisition_script")]
    pub acquisition_script: String,
    pub staging_dir: Option<PathBuf>,
    /// Models above this size are not bundled by `create`
    #[serde(default = "default_large_model_threshold_mb")]
    pub large_model_threshold_mb: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ProvisionConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_pip_install")]
    pub pip_install: String,
    #[serde(default = "default_apt_install")]
    pub apt_install: String,
    #[serde(default = "default_installer")]
    pub default_installer: String,
    #[serde(default = "default_gpu_env_prefix")]
    pub gpu_env_prefix: String,
}

// Default value functions
fn default_models_dir() -> String {
    "models".to_string()
}
fn default_extensions_dir() -> String {
    "custom_nodes".to_string()
}
fn default_workflows_dir() -> String {
    "user/default/workflows".to_string()
}
fn default_standard_categories() -> Vec<String> {
    [
        "checkpoints",
        "loras",
        "controlnet",
        "vae",
        "embeddings",
        "insightface",
        "ultralytics",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}
fn default_timeout_secs() -> u64 {
    3600
}
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("comfypack/{}", env!("CARGO_PKG_VERSION"))
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}
fn default_file_name_suffix() -> String {
    "_config.json".to_string()
}
fn default_sources() -> Vec<GatedSource> {
    vec![
        GatedSource {
            name: "civitai".to_string(),
            host: "civitai.com".to_string(),
        },
        GatedSource {
            name: "huggingface".to_string(),
            host: "huggingface.co".to_string(),
        },
    ]
}
fn default_manifest_names() -> Vec<String> {
    vec!["config.json".to_string(), "package_config.json".to_string()]
}
fn default_acquisition_script() -> String {
    "download_models.py".to_string()
}
fn default_large_model_threshold_mb() -> u64 {
    2048
}
fn default_shell() -> String {
    "sh".to_string()
}
fn default_python() -> String {
    "python3".to_string()
}
fn default_pip_install() -> String {
    "{python} -m pip install".to_string()
}
fn default_apt_install() -> String {
    "apt-get install -y".to_string()
}
fn default_installer() -> String {
    "pip".to_string()
}
fn default_gpu_env_prefix() -> String {
    "COMFYUI_".to_string()
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            extensions_dir: default_extensions_dir(),
            workflows_dir: default_workflows_dir(),
            standard_categories: default_standard_categories(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            progress: default_true(),
            check_disk_space: default_true(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            file_name_suffix: default_file_name_suffix(),
            sources: default_sources(),
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            manifest_names: default_manifest_names(),
            acquisition_script: default_acquisition_script(),
            staging_dir: None,
            large_model_threshold_mb: default_large_model_threshold_mb(),
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            python: default_python(),
            pip_install: default_pip_install(),
            apt_install: default_apt_install(),
            default_installer: default_installer(),
            gpu_env_prefix: default_gpu_env_prefix(),
        }
    }
}

impl Config {
    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from an explicit file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            ProvisionError::Config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;

        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.provision.shell.trim().is_empty() {
            return Err(ProvisionError::Config(
                "provision.shell must not be empty".to_string(),
            ));
        }

        match self.provision.default_installer.as_str() {
            "pip" | "apt" => {}
            other => {
                return Err(ProvisionError::Config(format!(
                    "Unknown default_installer: {other}. Must be 'pip' or 'apt'"
                )))
            }
        }

        if let Some(source) = self.credentials.sources.iter().find(|s| s.host.is_empty()) {
            return Err(ProvisionError::Config(format!(
                "credentials source '{}' has an empty host",
                source.name
            )));
        }

        Ok(())
    }
}

/// Default config file location: `$XDG_CONFIG_HOME/comfypack/config.toml`
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("comfypack").join("config.toml"))
}
