use crate::config::schema::{Config, GatedSource};
use crate::credentials::{source_for_url, Credential, CredentialResolver};
use crate::error::{DownloadError, ManifestError};
use crate::layout::Layout;
use crate::models::download::{sweep_partial_downloads, Downloader, Transport};
use crate::models::manifest::{EntryResult, Manifest, ModelEntry};
use crate::models::registry::CategoryInfo;
use crate::provision::runner::{shell_quote, CommandRunner};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// One way of acquiring a package's external models
///
/// Strategies are alternatives for the same goal and are tried in order
/// until one succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionStrategy {
    /// Acquisition script shipped inside the package, run as an opaque step
    EmbeddedScript(PathBuf),
    /// Download the manifest's `externalModels` directly
    DeclarativeEntries(Vec<EntryResult>),
}

/// Which strategy produced a batch report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyUsed {
    EmbeddedScript(PathBuf),
    DeclarativeEntries,
    None,
}

/// Failure category of a single entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Manifest,
    Transport,
    AuthRequired,
    HashMismatch,
    InsufficientSpace,
    Io,
}

impl FailureKind {
    const fn from_error(err: &DownloadError) -> Self {
        match err {
            DownloadError::Transport { .. } => Self::Transport,
            DownloadError::AuthRequired { .. } => Self::AuthRequired,
            DownloadError::HashMismatch { .. } => Self::HashMismatch,
            DownloadError::InsufficientSpace { .. } => Self::InsufficientSpace,
            DownloadError::Io(_) => Self::Io,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    Downloaded {
        bytes: u64,
        md5: String,
        attempts: u32,
        completed_at: String,
    },
    Failed {
        kind: FailureKind,
        message: String,
        /// Extra recovery instruction, e.g. which credential to configure
        hint: Option<String>,
    },
}

/// Outcome of one `externalModels` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOutcome {
    pub index: usize,
    pub name: Option<String>,
    pub url: Option<String>,
    pub destination: Option<PathBuf>,
    pub status: EntryStatus,
}

impl EntryOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, EntryStatus::Downloaded { .. })
    }

    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.status {
            EntryStatus::Failed { kind, .. } => Some(*kind),
            EntryStatus::Downloaded { .. } => None,
        }
    }

    /// Manual recovery instructions for a failed entry
    #[must_use]
    pub fn manual_hint(&self) -> Option<String> {
        let EntryStatus::Failed { message, hint, .. } = &self.status else {
            return None;
        };

        let label = self
            .name
            .clone()
            .unwrap_or_else(|| format!("externalModels[{}]", self.index));
        let mut text = format!("Failed to download {label}: {message}\n");
        match (&self.url, &self.destination) {
            (Some(url), Some(dest)) => {
                text.push_str("Please download manually:\n");
                text.push_str(&format!("  URL: {url}\n"));
                text.push_str(&format!("  Save to: {}\n", dest.display()));
            }
            _ => text.push_str("Fix the entry in the package config.json and re-run.\n"),
        }
        if let Some(hint) = hint {
            text.push_str(&format!("  {hint}\n"));
        }
        Some(text)
    }
}

/// Per-entry results of an acquisition batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub strategy: StrategyUsed,
    pub outcomes: Vec<EntryOutcome>,
    /// Exit failure of an embedded script that was tried first
    pub script_failure: Option<String>,
}

impl BatchReport {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            strategy: StrategyUsed::None,
            outcomes: Vec::new(),
            script_failure: None,
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntryOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Print the download summary and manual instructions for failures
    pub fn print_summary(&self) {
        if let Some(failure) = &self.script_failure {
            println!("Embedded download script failed ({failure}), used manifest entries instead");
        }

        match &self.strategy {
            StrategyUsed::EmbeddedScript(path) => {
                println!("Models acquired by package script {}", path.display());
                return;
            }
            StrategyUsed::None => {
                println!("No external models to download");
                return;
            }
            StrategyUsed::DeclarativeEntries => {}
        }

        for outcome in self.failures() {
            if let Some(hint) = outcome.manual_hint() {
                println!("\n{}", hint.trim_end());
            }
        }

        println!("\nDownload summary:");
        println!("  Total models: {}", self.outcomes.len());
        println!("  Successfully downloaded: {}", self.succeeded());
        println!("  Failed: {}", self.failed());

        if self.failed() > 0 {
            println!("\nSome downloads failed. Follow the manual instructions above to finish the installation.");
        }
    }
}

/// Acquires a manifest's external models into an installation
pub struct ModelManager<'a, T: Transport> {
    layout: &'a Layout,
    downloader: &'a Downloader<T>,
    resolver: CredentialResolver,
    sources: Vec<GatedSource>,
    python: String,
    retries: u32,
    retry_delay: Duration,
    credential_cache: HashMap<String, Option<Credential>>,
}

impl<'a, T: Transport> ModelManager<'a, T> {
    pub fn new(
        layout: &'a Layout,
        downloader: &'a Downloader<T>,
        resolver: CredentialResolver,
        config: &Config,
    ) -> Self {
        Self {
            layout,
            downloader,
            resolver,
            sources: config.credentials.sources.clone(),
            python: config.provision.python.clone(),
            retries: config.download.retries,
            retry_delay: Duration::from_millis(config.download.retry_delay_ms),
            credential_cache: HashMap::new(),
        }
    }

    /// Destination of an entry inside the installation
    #[must_use]
    pub fn destination(&self, entry: &ModelEntry) -> PathBuf {
        self.layout.models_dir().join(entry.relative_destination())
    }

    /// Download every valid `externalModels` entry in manifest order
    pub fn acquire_all(&mut self, manifest: &Manifest) -> BatchReport {
        match &manifest.external_models {
            None => {
                tracing::info!("Manifest has no externalModels");
                BatchReport::empty()
            }
            Some(entries) => self.acquire_entries(entries),
        }
    }

    /// Try each strategy in order until one succeeds
    pub fn acquire(
        &mut self,
        strategies: &[AcquisitionStrategy],
        runner: &dyn CommandRunner,
    ) -> BatchReport {
        let mut script_failure = None;

        for strategy in strategies {
            match strategy {
                AcquisitionStrategy::EmbeddedScript(script) => {
                    match self.run_script(script, runner) {
                        Ok(()) => {
                            return BatchReport {
                                strategy: StrategyUsed::EmbeddedScript(script.clone()),
                                outcomes: Vec::new(),
                                script_failure: None,
                            };
                        }
                        Err(reason) => {
                            tracing::warn!(
                                "Embedded script {} failed: {reason}; falling back",
                                script.display()
                            );
                            script_failure = Some(reason);
                        }
                    }
                }
                AcquisitionStrategy::DeclarativeEntries(entries) => {
                    let mut report = self.acquire_entries(entries);
                    report.script_failure = script_failure;
                    return report;
                }
            }
        }

        BatchReport {
            script_failure,
            ..BatchReport::empty()
        }
    }

    fn run_script(
        &self,
        script: &std::path::Path,
        runner: &dyn CommandRunner,
    ) -> std::result::Result<(), String> {
        let root = self.layout.root();
        let command = format!(
            "{} {} --comfyui-dir {}",
            self.python,
            shell_quote(&script.to_string_lossy()),
            shell_quote(&root.to_string_lossy())
        );
        let env = vec![(
            "COMFYUI_DIR".to_string(),
            root.to_string_lossy().into_owned(),
        )];

        tracing::info!("Running package download script {}", script.display());
        match runner.run(&command, root, &env) {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(format!("exit code {:?}", status.code)),
            Err(e) => Err(format!("could not start: {e}")),
        }
    }

    fn acquire_entries(&mut self, entries: &[EntryResult]) -> BatchReport {
        if let Err(e) = self.layout.ensure_model_dirs() {
            tracing::warn!("Failed to create model directories: {e}");
        }

        let parents: BTreeSet<PathBuf> = entries
            .iter()
            .filter_map(|e| e.as_ref().ok())
            .filter_map(|e| self.destination(e).parent().map(PathBuf::from))
            .collect();
        for dir in &parents {
            let removed = sweep_partial_downloads(dir);
            if removed > 0 {
                tracing::info!("Removed {removed} stale partial download(s) in {}", dir.display());
            }
        }

        let total = entries.len();
        tracing::info!("Found {total} external models to download");

        let outcomes = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                println!("\n[{}/{total}] Processing {}", index + 1, entry_label(index, entry));
                match entry {
                    Ok(entry) => self.acquire_one(index, entry),
                    Err(err) => invalid_outcome(index, err),
                }
            })
            .collect();

        BatchReport {
            strategy: StrategyUsed::DeclarativeEntries,
            outcomes,
            script_failure: None,
        }
    }

    fn acquire_one(&mut self, index: usize, entry: &ModelEntry) -> EntryOutcome {
        if CategoryInfo::find(&entry.category).is_none() {
            match CategoryInfo::suggest(&entry.category) {
                Some(known) => tracing::warn!(
                    "Unrecognized model type '{}' (did you mean '{known}'?), using it verbatim",
                    entry.category
                ),
                None => tracing::info!("Using custom model type '{}'", entry.category),
            }
        }

        let destination = self.destination(entry);
        let source = source_for_url(&entry.url, &self.sources).cloned();
        let credential = source
            .as_ref()
            .and_then(|s| self.credential_for(&s.name));

        if let (Some(source), None) = (&source, &credential) {
            tracing::warn!(
                "No API key for {}; downloading {} unauthenticated",
                source.name,
                entry.name
            );
        }

        let max_attempts = self.retries + 1;
        let mut attempt = 1;
        let result = loop {
            match self.downloader.fetch_sized(
                &entry.url,
                &destination,
                entry.hash.as_deref(),
                entry.size,
                credential.as_ref(),
            ) {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        "Attempt {attempt}/{max_attempts} for {} failed: {e}; retrying",
                        entry.name
                    );
                    std::thread::sleep(self.retry_delay);
                    attempt += 1;
                }
                other => break other,
            }
        };

        let status = match result {
            Ok(fetched) => {
                println!("Download complete: {}", entry.name);
                EntryStatus::Downloaded {
                    bytes: fetched.bytes,
                    md5: fetched.md5,
                    attempts: attempt,
                    completed_at: chrono::Utc::now().to_rfc3339(),
                }
            }
            Err(e) => {
                tracing::error!("Failed to download {}: {e}", entry.name);
                let hint = match (&e, &source) {
                    (DownloadError::AuthRequired { .. }, Some(source)) => Some(format!(
                        "Credential: set {} or create {} with an \"apiKey\" field",
                        CredentialResolver::env_var(&source.name),
                        self.resolver.file_path(&source.name).display()
                    )),
                    (DownloadError::AuthRequired { .. }, None) => {
                        Some("The server requires authentication for this URL".to_string())
                    }
                    _ => None,
                };
                EntryStatus::Failed {
                    kind: FailureKind::from_error(&e),
                    message: first_line(&e.to_string()),
                    hint,
                }
            }
        };

        EntryOutcome {
            index,
            name: Some(entry.name.clone()),
            url: Some(entry.url.to_string()),
            destination: Some(destination),
            status,
        }
    }

    fn credential_for(&mut self, source: &str) -> Option<Credential> {
        if let Some(cached) = self.credential_cache.get(source) {
            return cached.clone();
        }
        let credential = self.resolver.resolve(source);
        self.credential_cache
            .insert(source.to_string(), credential.clone());
        credential
    }
}

fn entry_label(index: usize, entry: &EntryResult) -> String {
    match entry {
        Ok(entry) => entry.name.clone(),
        Err(_) => format!("externalModels[{index}]"),
    }
}

fn invalid_outcome(index: usize, err: &ManifestError) -> EntryOutcome {
    tracing::error!("Skipping invalid manifest entry: {err}");
    EntryOutcome {
        index,
        name: None,
        url: None,
        destination: None,
        status: EntryStatus::Failed {
            kind: FailureKind::Manifest,
            message: err.to_string(),
            hint: None,
        },
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::download::TransportResponse;
    use reqwest::Url;
    use std::io::Cursor;
    use tempfile::TempDir;

    struct StaticTransport;

    impl Transport for StaticTransport {
        fn get(
            &self,
            url: &Url,
            _credential: Option<&Credential>,
        ) -> std::result::Result<TransportResponse, DownloadError> {
            if url.path().ends_with("missing.bin") {
                return Err(DownloadError::Transport {
                    status: Some(404),
                    message: "Not Found".to_string(),
                });
            }
            let body = url.path().as_bytes().to_vec();
            Ok(TransportResponse {
                content_length: Some(body.len() as u64),
                body: Box::new(Cursor::new(body)),
            })
        }
    }

    fn fixture() -> (TempDir, Layout, Config) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::default();
        let layout = Layout::new(temp_dir.path().join("ComfyUI"), &config.layout);
        (temp_dir, layout, config)
    }

    #[test]
    fn test_destination_resolution() {
        let (temp_dir, layout, config) = fixture();
        let downloader = Downloader::new(StaticTransport);
        let resolver = CredentialResolver::new(temp_dir.path(), &config.credentials);
        let manager = ModelManager::new(&layout, &downloader, resolver, &config);

        let manifest = Manifest::parse(
            r#"{"externalModels": [
                {"name": "a.safetensors", "type": "loras", "url": "https://x/a", "path": "sdxl/a.safetensors"}
            ]}"#,
        )
        .unwrap();
        let entry = manifest.entries().next().unwrap();
        assert_eq!(
            manager.destination(entry),
            layout.models_dir().join("loras/sdxl/a.safetensors")
        );
    }

    #[test]
    fn test_failure_does_not_stop_batch() {
        let (temp_dir, layout, config) = fixture();
        let downloader = Downloader::new(StaticTransport);
        let resolver = CredentialResolver::new(temp_dir.path(), &config.credentials);
        let mut manager = ModelManager::new(&layout, &downloader, resolver, &config);

        let manifest = Manifest::parse(
            r#"{"externalModels": [
                {"name": "missing.bin", "type": "vae", "url": "https://x/missing.bin"},
                {"name": "broken.bin", "type": "vae"},
                {"name": "ok.bin", "type": "vae", "url": "https://x/ok.bin"}
            ]}"#,
        )
        .unwrap();

        let report = manager.acquire_all(&manifest);
        assert_eq!(report.strategy, StrategyUsed::DeclarativeEntries);
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 2);
        assert_eq!(report.outcomes[0].failure_kind(), Some(FailureKind::Transport));
        assert_eq!(report.outcomes[1].failure_kind(), Some(FailureKind::Manifest));
        assert!(report.outcomes[2].is_success());
        assert!(layout.category_dir("vae").join("ok.bin").is_file());

        let hint = report.outcomes[0].manual_hint().unwrap();
        assert!(hint.contains("URL: https://x/missing.bin"));
        assert!(hint.contains("Save to: "));
        assert!(report.outcomes[2].manual_hint().is_none());
    }

    #[test]
    fn test_absent_model_list_yields_empty_report() {
        let (temp_dir, layout, config) = fixture();
        let downloader = Downloader::new(StaticTransport);
        let resolver = CredentialResolver::new(temp_dir.path(), &config.credentials);
        let mut manager = ModelManager::new(&layout, &downloader, resolver, &config);

        let report = manager.acquire_all(&Manifest::default());
        assert_eq!(report, BatchReport::empty());
        assert!(!layout.models_dir().exists());
    }

    #[test]
    fn test_declared_size_exceeding_free_space() {
        let (temp_dir, layout, config) = fixture();
        let downloader = Downloader::new(StaticTransport).with_disk_space_check(true);
        let resolver = CredentialResolver::new(temp_dir.path(), &config.credentials);
        let mut manager = ModelManager::new(&layout, &downloader, resolver, &config);

        let manifest = Manifest::parse(
            r#"{"externalModels": [
                {"name": "huge.bin", "type": "checkpoints", "url": "https://x/huge.bin", "size": 9000000000000000000},
                {"name": "small.bin", "type": "checkpoints", "url": "https://x/small.bin", "size": 15}
            ]}"#,
        )
        .unwrap();
        let report = manager.acquire_all(&manifest);

        assert_eq!(
            report.outcomes[0].failure_kind(),
            Some(FailureKind::InsufficientSpace)
        );
        assert!(!layout.category_dir("checkpoints").join("huge.bin").exists());
        assert!(report.outcomes[1].is_success());
    }

    #[test]
    fn test_retries_transport_errors_only() {
        let (temp_dir, layout, mut config) = fixture();
        config.download.retries = 2;
        config.download.retry_delay_ms = 0;
        let downloader = Downloader::new(StaticTransport);
        let resolver = CredentialResolver::new(temp_dir.path(), &config.credentials);
        let mut manager = ModelManager::new(&layout, &downloader, resolver, &config);

        let manifest = Manifest::parse(
            r#"{"externalModels": [{"name": "missing.bin", "type": "vae", "url": "https://x/missing.bin"}]}"#,
        )
        .unwrap();
        let report = manager.acquire_all(&manifest);
        assert_eq!(report.failed(), 1);
        assert!(report.outcomes[0]
            .manual_hint()
            .unwrap()
            .contains("HTTP 404"));
    }
}
