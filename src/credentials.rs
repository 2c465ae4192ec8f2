//! Credential resolution for gated model hosts
//!
//! Lookup order for a source named `civitai`, first hit wins:
//! 1. the `CIVITAI_API_KEY` environment variable
//! 2. `civitai_config.json` (`{"apiKey": "..."}`) in the run context directory
//!
//! Absence is a normal outcome: the download proceeds unauthenticated.

use crate::config::schema::{CredentialsConfig, GatedSource};
use reqwest::Url;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Opaque API token for a named source
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Where a credential was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialOrigin {
    Environment(String),
    File(PathBuf),
}

#[derive(Deserialize)]
struct CredentialFile {
    #[serde(rename = "apiKey", alias = "api_key")]
    api_key: Option<String>,
}

/// Resolves credentials from the environment and the run context directory
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    context_dir: PathBuf,
    file_name_suffix: String,
}

impl CredentialResolver {
    #[must_use]
    pub fn new(context_dir: impl Into<PathBuf>, config: &CredentialsConfig) -> Self {
        Self {
            context_dir: context_dir.into(),
            file_name_suffix: config.file_name_suffix.clone(),
        }
    }

    /// `<SOURCE>_API_KEY`
    #[must_use]
    pub fn env_var(source: &str) -> String {
        format!("{}_API_KEY", source.to_ascii_uppercase().replace('-', "_"))
    }

    /// Credential file for a source, e.g. `civitai_config.json`
    #[must_use]
    pub fn file_path(&self, source: &str) -> PathBuf {
        self.context_dir
            .join(format!("{source}{}", self.file_name_suffix))
    }

    /// Resolve a credential for `source`, or `None` when none is configured
    #[must_use]
    pub fn resolve(&self, source: &str) -> Option<Credential> {
        self.resolve_with_origin(source).map(|(credential, _)| credential)
    }

    pub fn resolve_with_origin(&self, source: &str) -> Option<(Credential, CredentialOrigin)> {
        let var = Self::env_var(source);
        if let Ok(token) = std::env::var(&var) {
            if !token.trim().is_empty() {
                tracing::debug!("Using {var} for {source}");
                return Some((Credential::new(token.trim()), CredentialOrigin::Environment(var)));
            }
        }

        let path = self.file_path(source);
        read_credential_file(&path).map(|token| {
            tracing::debug!("Using credential file {} for {source}", path.display());
            (Credential::new(token), CredentialOrigin::File(path))
        })
    }
}

fn read_credential_file(path: &Path) -> Option<String> {
    if !path.exists() {
        return None;
    }

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!("Failed to read {}: {e}", path.display());
            return None;
        }
    };

    match serde_json::from_str::<CredentialFile>(&content) {
        Ok(file) => file
            .api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty()),
        Err(e) => {
            tracing::warn!("Ignoring malformed credential file {}: {e}", path.display());
            None
        }
    }
}

/// Gated source serving `url`, matched on host or any subdomain of it
#[must_use]
pub fn source_for_url<'a>(url: &Url, sources: &'a [GatedSource]) -> Option<&'a GatedSource> {
    let host = url.host_str()?.to_ascii_lowercase();
    sources.iter().find(|source| {
        let wanted = source.host.to_ascii_lowercase();
        host == wanted || host.ends_with(&format!(".{wanted}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn resolver(dir: &Path) -> CredentialResolver {
        CredentialResolver::new(dir, &CredentialsConfig::default())
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(CredentialResolver::env_var("civitai"), "CIVITAI_API_KEY");
        assert_eq!(CredentialResolver::env_var("my-mirror"), "MY_MIRROR_API_KEY");
    }

    #[test]
    #[serial]
    fn test_env_takes_precedence_over_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("cptestsrc_config.json"),
            r#"{"apiKey": "from-file"}"#,
        )
        .unwrap();
        std::env::set_var("CPTESTSRC_API_KEY", "from-env");

        let (credential, origin) = resolver(temp_dir.path())
            .resolve_with_origin("cptestsrc")
            .unwrap();
        assert_eq!(credential.secret(), "from-env");
        assert_eq!(
            origin,
            CredentialOrigin::Environment("CPTESTSRC_API_KEY".to_string())
        );

        std::env::remove_var("CPTESTSRC_API_KEY");
    }

    #[test]
    #[serial]
    fn test_file_used_when_env_missing_or_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cptestsrc_config.json");
        fs::write(&path, r#"{"api_key": "from-file"}"#).unwrap();
        std::env::set_var("CPTESTSRC_API_KEY", "");

        let (credential, origin) = resolver(temp_dir.path())
            .resolve_with_origin("cptestsrc")
            .unwrap();
        assert_eq!(credential.secret(), "from-file");
        assert_eq!(origin, CredentialOrigin::File(path));

        std::env::remove_var("CPTESTSRC_API_KEY");
    }

    #[test]
    #[serial]
    fn test_absent_credential() {
        let temp_dir = TempDir::new().unwrap();
        std::env::remove_var("CPTESTSRC_API_KEY");
        assert!(resolver(temp_dir.path()).resolve("cptestsrc").is_none());

        fs::write(temp_dir.path().join("cptestsrc_config.json"), "{not json").unwrap();
        assert!(resolver(temp_dir.path()).resolve("cptestsrc").is_none());

        fs::write(temp_dir.path().join("cptestsrc_config.json"), r#"{"apiKey": ""}"#).unwrap();
        assert!(resolver(temp_dir.path()).resolve("cptestsrc").is_none());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let credential = Credential::new("super-secret");
        assert_eq!(format!("{credential:?}"), "Credential(***)");
    }

    #[test]
    fn test_source_for_url() {
        let sources = CredentialsConfig::default().sources;

        let url = Url::parse("https://civitai.com/api/download/models/12345").unwrap();
        assert_eq!(source_for_url(&url, &sources).unwrap().name, "civitai");

        let url = Url::parse("https://cdn.HuggingFace.co/x/model.safetensors").unwrap();
        assert_eq!(source_for_url(&url, &sources).unwrap().name, "huggingface");

        let url = Url::parse("https://notcivitai.com/a.bin").unwrap();
        assert!(source_for_url(&url, &sources).is_none());

        let url = Url::parse("https://example.org/civitai.com/a.bin").unwrap();
        assert!(source_for_url(&url, &sources).is_none());
    }
}
