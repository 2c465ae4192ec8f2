use thiserror::Error;

/// Main error type for comfypack
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Manifest error: {0}\n\nTroubleshooting:\n- Validate the package config.json with a JSON linter\n- Every externalModels entry needs non-empty name, type and url fields\n- Run with RUST_LOG=debug for more details")]
    Manifest(#[from] ManifestError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Extraction error: {0}\n\nTroubleshooting:\n- Verify the package is a valid zip archive: unzip -t <archive>\n- Re-download or re-create the package\n- Check free space in the staging directory")]
    Extraction(String),

    #[error("Packaging error: {0}\n\nTroubleshooting:\n- Check that the workflow is a ComfyUI UI export (it has a \"nodes\" array)\n- Check write permissions in the output directory")]
    Packaging(String),

    #[error("Post-install command failed (exit code {code:?}): {command}\n\nTroubleshooting:\n- Run the command manually inside the installation directory\n- Later post-install commands were not run")]
    Command { command: String, code: Option<i32> },

    #[error("Dependency installer failed for '{spec}' (exit code {code:?})")]
    Dependency { spec: String, code: Option<i32> },

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/comfypack/config.toml\n- Remove the file to fall back to defaults\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Manifest parsing errors
///
/// `InvalidEntry` is scoped to a single `externalModels[index]` and never
/// prevents the rest of the document from loading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    Syntax(String),

    #[error("manifest root must be a JSON object")]
    NotAnObject,

    #[error("field '{field}' {reason}")]
    InvalidField { field: String, reason: String },

    #[error("externalModels[{index}]: field '{field}' {reason}")]
    InvalidEntry {
        index: usize,
        field: &'static str,
        reason: String,
    },
}

/// Artifact-level download errors
///
/// These are caught at the acquisition batch boundary and turned into
/// per-entry failure records.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Transport error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("Authentication required (HTTP {status})\n\nTroubleshooting:\n- Set <SOURCE>_API_KEY in the environment (e.g. CIVITAI_API_KEY)\n- Or create <source>_config.json with an \"apiKey\" field next to the package\n- Verify the key has not been revoked")]
    AuthRequired { status: u16 },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Not enough disk space: {required_mb} MB required, {available_mb} MB available")]
    InsufficientSpace { required_mb: u64, available_mb: u64 },

    #[error("Local IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Short, stable name of the failure kind for reports
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "TransportError",
            Self::AuthRequired { .. } => "AuthRequired",
            Self::HashMismatch { .. } => "HashMismatch",
            Self::InsufficientSpace { .. } => "InsufficientSpace",
            Self::Io(_) => "IoError",
        }
    }

    /// Transport errors are the only kind worth retrying
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
