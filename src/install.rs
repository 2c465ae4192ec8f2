//! End-to-end package installation
//!
//! Merge the archive, acquire external models, then provision. The
//! acquisition strategy choice is independent of provisioning: dependencies
//! and post-install commands run whichever strategy acquired the models.

use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::error::{ProvisionError, Result};
use crate::layout::Layout;
use crate::models::download::{Downloader, HttpTransport, Transport};
use crate::models::manager::{AcquisitionStrategy, BatchReport, ModelManager};
use crate::models::manifest::Manifest;
use crate::package::{MergeReport, StagedPackage};
use crate::provision::runner::CommandRunner;
use crate::provision::{ProvisionReport, Provisioner};
use std::fs;
use std::path::{Path, PathBuf};

/// Everything an installation run did
#[derive(Debug)]
pub struct InstallReport {
    pub merge: MergeReport,
    pub manifest_found: bool,
    pub batch: BatchReport,
    pub provision: Option<ProvisionReport>,
}

impl InstallReport {
    pub fn print_summary(&self) {
        println!("\n=== Package contents ===");
        self.merge.print_summary();
        if !self.manifest_found {
            println!("No package manifest found; skipped model downloads and provisioning");
            return;
        }
        println!("\n=== External models ===");
        self.batch.print_summary();
        if let Some(provision) = &self.provision {
            println!("\n=== Provisioning ===");
            provision.print_summary();
        }
    }
}

/// Runs the install pipeline against one target installation
pub struct Installer<'a, T: Transport = HttpTransport> {
    config: &'a Config,
    layout: &'a Layout,
    downloader: &'a Downloader<T>,
    runner: &'a dyn CommandRunner,
    context_dir: PathBuf,
}

impl<'a, T: Transport> Installer<'a, T> {
    /// `context_dir` is where credential files are looked up
    pub fn new(
        config: &'a Config,
        layout: &'a Layout,
        downloader: &'a Downloader<T>,
        runner: &'a dyn CommandRunner,
        context_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            layout,
            downloader,
            runner,
            context_dir: context_dir.into(),
        }
    }

    /// Install a package archive
    ///
    /// Extraction, merge and post-install failures are returned as errors.
    /// Individual model download failures are only recorded in the report.
    pub fn install(&self, archive: &Path) -> Result<InstallReport> {
        let package = StagedPackage::extract(archive, &self.config.package)?;
        let report = self.install_staged(&package)?;

        if let Err(e) = package.close() {
            tracing::warn!("Failed to remove staging directory: {e}");
        }
        Ok(report)
    }

    fn install_staged(&self, package: &StagedPackage) -> Result<InstallReport> {
        let merge = package.merge_into(self.layout)?;
        fs::create_dir_all(self.layout.root())?;
        let manifest = package.manifest(&self.config.package)?;
        let script = package.acquisition_script(manifest.as_ref(), &self.config.package);

        let mut strategies = Vec::new();
        if let Some(script) = script {
            tracing::info!("Package ships a download script: {}", script.display());
            strategies.push(AcquisitionStrategy::EmbeddedScript(script));
        }
        if let Some(manifest) = &manifest {
            strategies.push(AcquisitionStrategy::DeclarativeEntries(
                manifest.external_models.clone().unwrap_or_default(),
            ));
        }

        let batch = if strategies.is_empty() {
            BatchReport::empty()
        } else {
            self.model_manager().acquire(&strategies, self.runner)
        };

        let provision = match &manifest {
            Some(manifest) => Some(self.provision(manifest)?),
            None => None,
        };

        Ok(InstallReport {
            merge,
            manifest_found: manifest.is_some(),
            batch,
            provision,
        })
    }

    /// Download a manifest's external models
    pub fn download(&self, manifest: &Manifest) -> BatchReport {
        self.model_manager().acquire_all(manifest)
    }

    /// Install dependencies and run post-install commands
    pub fn provision(&self, manifest: &Manifest) -> Result<ProvisionReport> {
        Provisioner::new(self.layout, &self.config.provision, self.runner).apply(manifest)
    }

    fn model_manager(&self) -> ModelManager<'_, T> {
        let resolver = CredentialResolver::new(&self.context_dir, &self.config.credentials);
        ModelManager::new(self.layout, self.downloader, resolver, self.config)
    }
}

/// Find the manifest for a standalone download or provision run
///
/// An explicit path must exist. Otherwise the configured manifest names are
/// tried in the installation root, then `config.json` in `cwd`.
pub fn discover_manifest(
    explicit: Option<&Path>,
    layout: &Layout,
    config: &Config,
    cwd: &Path,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(ProvisionError::Other(format!(
            "Manifest not found: {}",
            path.display()
        )));
    }

    let candidates: Vec<PathBuf> = config
        .package
        .manifest_names
        .iter()
        .map(|name| layout.root().join(name))
        .chain(std::iter::once(cwd.join("config.json")))
        .collect();

    candidates
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .ok_or_else(|| {
            let tried = candidates
                .iter()
                .map(|p| format!("- {}", p.display()))
                .collect::<Vec<_>>()
                .join("\n");
            ProvisionError::Other(format!(
                "No manifest found. Tried:\n{tried}\n\nPass one explicitly with --manifest <FILE>"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discover_prefers_installation_root() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::default();
        let layout = Layout::new(temp_dir.path().join("ComfyUI"), &config.layout);
        let cwd = temp_dir.path().join("cwd");
        fs::create_dir_all(layout.root()).unwrap();
        fs::create_dir_all(&cwd).unwrap();
        fs::write(layout.root().join("package_config.json"), "{}").unwrap();
        fs::write(cwd.join("config.json"), "{}").unwrap();

        let found = discover_manifest(None, &layout, &config, &cwd).unwrap();
        assert_eq!(found, layout.root().join("package_config.json"));

        fs::write(layout.root().join("config.json"), "{}").unwrap();
        let found = discover_manifest(None, &layout, &config, &cwd).unwrap();
        assert_eq!(found, layout.root().join("config.json"));
    }

    #[test]
    fn test_discover_falls_back_to_cwd() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::default();
        let layout = Layout::new(temp_dir.path().join("ComfyUI"), &config.layout);
        fs::write(temp_dir.path().join("config.json"), "{}").unwrap();

        let found = discover_manifest(None, &layout, &config, temp_dir.path()).unwrap();
        assert_eq!(found, temp_dir.path().join("config.json"));
    }

    #[test]
    fn test_discover_missing() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::default();
        let layout = Layout::new(temp_dir.path().join("ComfyUI"), &config.layout);

        assert!(discover_manifest(None, &layout, &config, temp_dir.path()).is_err());
        let explicit = temp_dir.path().join("mine.json");
        assert!(discover_manifest(Some(&explicit), &layout, &config, temp_dir.path()).is_err());
    }
}
