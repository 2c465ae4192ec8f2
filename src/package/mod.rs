//! Package archives: staging extraction and merge into an installation
//!
//! A package is a zip archive with any of these top-level entries:
//!
//! - `custom_nodes/` merged into the installation's extensions directory
//! - `workflows/` merged into the workflows directory
//! - `models/<category>/` merged into `models/<category>/`
//! - a manifest (`config.json` by default) and an optional download script
//!
//! Archives that wrap all of this in a single top-level directory are
//! unwrapped. The staging directory is removed when the [`StagedPackage`]
//! is dropped, whatever happened in between.

pub mod create;
pub mod extract;
pub mod merge;
pub mod workflow;

use crate::config::schema::PackageConfig;
use crate::error::{ProvisionError, Result};
use crate::layout::Layout;
use crate::models::manifest::Manifest;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CUSTOM_NODES_DIR: &str = "custom_nodes";
const WORKFLOWS_DIR: &str = "workflows";
const MODELS_DIR: &str = "models";

/// What a merge copied into the installation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Files copied from `custom_nodes/`, `None` when the subtree is absent
    pub extensions: Option<usize>,
    pub workflows: Option<usize>,
    /// Files copied per model category, in directory order
    pub model_categories: Vec<(String, usize)>,
}

impl MergeReport {
    #[must_use]
    pub fn total_files(&self) -> usize {
        self.extensions.unwrap_or(0)
            + self.workflows.unwrap_or(0)
            + self.model_categories.iter().map(|(_, n)| n).sum::<usize>()
    }

    pub fn print_summary(&self) {
        if let Some(n) = self.extensions {
            println!("Custom nodes: {n} files");
        }
        if let Some(n) = self.workflows {
            println!("Workflows: {n} files");
        }
        for (category, n) in &self.model_categories {
            println!("Models ({category}): {n} files");
        }
        if self.total_files() == 0 {
            println!("Package contained no custom nodes, workflows or bundled models");
        }
    }
}

/// A package archive extracted into a private staging directory
#[derive(Debug)]
pub struct StagedPackage {
    staging: TempDir,
    root: PathBuf,
}

impl StagedPackage {
    /// Extract `archive` into a fresh staging directory
    pub fn extract(archive: &Path, config: &PackageConfig) -> Result<Self> {
        if !archive.is_file() {
            return Err(ProvisionError::Extraction(format!(
                "archive not found: {}",
                archive.display()
            )));
        }

        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("comfypack-staging-");
            b
        };
        let staging = match &config.staging_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };

        tracing::info!(
            "Extracting {} into {}",
            archive.display(),
            staging.path().display()
        );
        extract::extract_zip(archive, staging.path())?;

        let root = package_root(staging.path(), &config.manifest_names)?;
        if root != staging.path() {
            tracing::debug!("Archive wraps its content in {}", root.display());
        }

        Ok(Self { staging, root })
    }

    /// Directory holding the package's top-level entries
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    /// First configured manifest name present at the package root
    #[must_use]
    pub fn manifest_path(&self, config: &PackageConfig) -> Option<PathBuf> {
        config
            .manifest_names
            .iter()
            .map(|name| self.root.join(name))
            .find(|path| path.is_file())
    }

    /// Load the package manifest, if it ships one
    pub fn manifest(&self, config: &PackageConfig) -> Result<Option<Manifest>> {
        self.manifest_path(config)
            .map(|path| {
                tracing::info!("Using manifest {}", path.display());
                Manifest::load(&path)
            })
            .transpose()
    }

    /// Download script shipped with the package
    ///
    /// A manifest's `downloadScript` overrides the configured default name.
    /// Script paths that leave the package root are ignored.
    #[must_use]
    pub fn acquisition_script(
        &self,
        manifest: Option<&Manifest>,
        config: &PackageConfig,
    ) -> Option<PathBuf> {
        let name = manifest
            .and_then(|m| m.download_script.as_deref())
            .unwrap_or(&config.acquisition_script);
        let relative = Path::new(name);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            tracing::warn!("Ignoring download script outside the package: {name}");
            return None;
        }
        let path = self.root.join(relative);
        path.is_file().then_some(path)
    }

    /// Copy the package's content subtrees into an installation
    ///
    /// Same-named files are overwritten; nothing is deleted. A failure
    /// partway leaves the subtrees copied so far in place.
    pub fn merge_into(&self, layout: &Layout) -> Result<MergeReport> {
        let mut report = MergeReport::default();

        let nodes = self.root.join(CUSTOM_NODES_DIR);
        if nodes.is_dir() {
            let copied = merge::copy_tree(&nodes, layout.extensions_dir())?;
            tracing::info!("Merged {copied} custom node files");
            report.extensions = Some(copied);
        }

        let workflows = self.root.join(WORKFLOWS_DIR);
        if workflows.is_dir() {
            let copied = merge::copy_tree(&workflows, layout.workflows_dir())?;
            tracing::info!("Merged {copied} workflow files");
            report.workflows = Some(copied);
        }

        let models = self.root.join(MODELS_DIR);
        if models.is_dir() {
            let mut categories: Vec<_> = fs::read_dir(&models)?.collect::<std::io::Result<_>>()?;
            categories.sort_by_key(fs::DirEntry::file_name);

            for entry in categories {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !entry.file_type()?.is_dir() {
                    tracing::warn!("Ignoring loose file models/{name}; models must sit in a category directory");
                    continue;
                }
                let copied = merge::copy_tree(&entry.path(), &layout.category_dir(&name))?;
                tracing::info!("Merged {copied} bundled files into models/{name}");
                report.model_categories.push((name, copied));
            }
        }

        Ok(report)
    }

    /// Remove the staging directory, reporting any failure
    pub fn close(self) -> Result<()> {
        let path = self.staging.path().to_path_buf();
        self.staging.close()?;
        tracing::debug!("Removed staging directory {}", path.display());
        Ok(())
    }
}

/// Locate the package root inside the staging directory
///
/// When the staging directory has no recognized entry and exactly one
/// subdirectory, that subdirectory is the root.
fn package_root(staging: &Path, manifest_names: &[String]) -> Result<PathBuf> {
    let recognized = |dir: &Path| {
        [CUSTOM_NODES_DIR, WORKFLOWS_DIR, MODELS_DIR]
            .iter()
            .any(|name| dir.join(name).is_dir())
            || manifest_names.iter().any(|name| dir.join(name).is_file())
    };
    if recognized(staging) {
        return Ok(staging.to_path_buf());
    }

    let mut dirs = Vec::new();
    for entry in fs::read_dir(staging)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == "__MACOSX" {
            continue;
        }
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        } else {
            return Ok(staging.to_path_buf());
        }
    }

    match dirs.as_slice() {
        [single] if recognized(single) => Ok(single.clone()),
        _ => Ok(staging.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LayoutConfig;
    use std::fs::File;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn config(temp_dir: &TempDir) -> PackageConfig {
        PackageConfig {
            staging_dir: Some(temp_dir.path().join("staging")),
            ..PackageConfig::default()
        }
    }

    #[test]
    fn test_merge_all_subtrees() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("pkg.zip");
        write_zip(
            &archive,
            &[
                ("custom_nodes/NodePack/__init__.py", b"nodes"),
                ("workflows/portrait.json", b"{}"),
                ("models/loras/style.safetensors", b"lora"),
                ("models/upscale_models/x4.pth", b"up"),
                ("models/stray.txt", b"stray"),
                ("config.json", b"{}"),
            ],
        );
        let layout = Layout::new(temp_dir.path().join("ComfyUI"), &LayoutConfig::default());

        let package = StagedPackage::extract(&archive, &config(&temp_dir)).unwrap();
        let report = package.merge_into(&layout).unwrap();

        assert_eq!(report.extensions, Some(1));
        assert_eq!(report.workflows, Some(1));
        assert_eq!(
            report.model_categories,
            vec![("loras".to_string(), 1), ("upscale_models".to_string(), 1)]
        );
        let root = layout.root();
        assert!(root.join("custom_nodes/NodePack/__init__.py").is_file());
        assert!(root.join("user/default/workflows/portrait.json").is_file());
        assert!(root.join("models/loras/style.safetensors").is_file());
        assert!(root.join("models/upscale_models/x4.pth").is_file());
        assert!(!root.join("models/stray.txt").exists());
    }

    #[test]
    fn test_staging_removed_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("pkg.zip");
        write_zip(&archive, &[("workflows/a.json", b"{}")]);

        let staging = {
            let package = StagedPackage::extract(&archive, &config(&temp_dir)).unwrap();
            let path = package.staging_dir().to_path_buf();
            assert!(path.is_dir());
            path
        };
        assert!(!staging.exists());
    }

    #[test]
    fn test_wrapped_archive_unwrapped() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("pkg.zip");
        write_zip(
            &archive,
            &[
                ("MyPack/config.json", br#"{"postInstallCommands": []}"#),
                ("MyPack/workflows/a.json", b"{}"),
            ],
        );

        let config = config(&temp_dir);
        let package = StagedPackage::extract(&archive, &config).unwrap();
        assert!(package.root().ends_with("MyPack"));
        assert!(package.manifest(&config).unwrap().is_some());
    }

    #[test]
    fn test_manifest_name_priority() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("pkg.zip");
        write_zip(
            &archive,
            &[
                ("package_config.json", b"{}"),
                ("config.json", br#"{"downloadScript": "fetch.py"}"#),
                ("fetch.py", b"print('hi')"),
            ],
        );

        let config = config(&temp_dir);
        let package = StagedPackage::extract(&archive, &config).unwrap();
        assert_eq!(
            package.manifest_path(&config).unwrap(),
            package.root().join("config.json")
        );
        let manifest = package.manifest(&config).unwrap().unwrap();
        assert_eq!(
            package.acquisition_script(Some(&manifest), &config),
            Some(package.root().join("fetch.py"))
        );
        assert_eq!(package.acquisition_script(None, &config), None);
    }

    #[test]
    fn test_missing_archive() {
        let temp_dir = TempDir::new().unwrap();
        let result = StagedPackage::extract(&temp_dir.path().join("nope.zip"), &config(&temp_dir));
        assert!(matches!(result, Err(ProvisionError::Extraction(_))));
    }

    #[test]
    fn test_merge_overwrites_existing_files() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("pkg.zip");
        write_zip(&archive, &[("workflows/a.json", b"new")]);
        let layout = Layout::new(temp_dir.path().join("ComfyUI"), &LayoutConfig::default());
        fs::create_dir_all(layout.workflows_dir()).unwrap();
        fs::write(layout.workflows_dir().join("a.json"), b"old").unwrap();
        fs::write(layout.workflows_dir().join("b.json"), b"mine").unwrap();

        let package = StagedPackage::extract(&archive, &config(&temp_dir)).unwrap();
        package.merge_into(&layout).unwrap();

        assert_eq!(fs::read(layout.workflows_dir().join("a.json")).unwrap(), b"new");
        assert_eq!(fs::read(layout.workflows_dir().join("b.json")).unwrap(), b"mine");
    }
}
