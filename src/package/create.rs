//! Build a package archive from a workflow and a local installation
//!
//! The archive gets the workflow, the custom node packs it uses and its model
//! files. Models above the size threshold are not bundled: with a download
//! URL they become `externalModels` entries (MD5 and size recorded), without
//! one they are skipped with a warning.

use super::workflow::{ModelReference, WorkflowDependencies};
use super::{CUSTOM_NODES_DIR, MODELS_DIR, WORKFLOWS_DIR};
use crate::config::schema::PackageConfig;
use crate::error::{ProvisionError, Result};
use crate::layout::Layout;
use crate::models::download::{file_md5, format_bytes};
use reqwest::Url;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Directory names never copied out of a custom node pack
const SKIPPED_DIRS: &[&str] = &[".git", ".github", "__pycache__", ".venv", "venv"];

const PACKAGE_VERSION: &str = "1.0.0";

fn packaging(context: &str, err: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::Packaging(format!("{context}: {err}"))
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Package name; defaults to `<workflow stem>-package`
    pub name: Option<String>,
    /// Directory the `<name>.zip` archive is written to
    pub output_dir: PathBuf,
    pub manifest_name: String,
    pub large_model_threshold_bytes: u64,
    /// Download URLs keyed by model file name. A model with a URL is always
    /// published as an external entry, whatever its size.
    pub external_urls: BTreeMap<String, Url>,
    /// Bundle large models without a URL instead of skipping them
    pub bundle_large: bool,
}

impl CreateOptions {
    #[must_use]
    pub fn from_config(config: &PackageConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: None,
            output_dir: output_dir.into(),
            manifest_name: config
                .manifest_names
                .first()
                .cloned()
                .unwrap_or_else(|| "config.json".to_string()),
            large_model_threshold_bytes: config
                .large_model_threshold_mb
                .saturating_mul(1_024 * 1_024),
            external_urls: BTreeMap::new(),
            bundle_large: false,
        }
    }
}

/// What `create` put into the archive
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CreateReport {
    pub archive: PathBuf,
    /// Custom node directories bundled
    pub node_packs: Vec<String>,
    /// Node pack ids with no matching directory in the installation
    pub unmatched_node_packs: Vec<String>,
    pub bundled_models: Vec<String>,
    pub external_models: Vec<String>,
    /// Models the workflow references that are not in the installation
    pub missing_models: Vec<String>,
    /// Large models left out for lack of a download URL
    pub skipped_models: Vec<String>,
}

impl CreateReport {
    pub fn print_summary(&self) {
        println!("Package written to {}", self.archive.display());
        println!("Custom nodes: {}", self.node_packs.len());
        println!("Bundled models: {}", self.bundled_models.len());
        println!("External models: {}", self.external_models.len());
        for id in &self.unmatched_node_packs {
            println!("  Node pack not found in the installation: {id}");
        }
        for name in &self.missing_models {
            println!("  Model not found in the installation: {name}");
        }
        for name in &self.skipped_models {
            println!("  Skipped large model (pass --external {name}=<URL> to publish it): {name}");
        }
    }
}

/// `config.json` of a created package
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PackageManifest {
    name: String,
    description: String,
    version: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    external_models: Vec<ExternalModel>,
}

#[derive(Serialize)]
struct ExternalModel {
    name: String,
    #[serde(rename = "type")]
    category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    url: String,
    hash: String,
    size: u64,
}

/// Create a package archive for `workflow` from the installation at `layout`
///
/// The archive is written to a temp file in the output directory and renamed
/// into place once complete.
pub fn create_package(
    workflow: &Path,
    layout: &Layout,
    options: &CreateOptions,
) -> Result<CreateReport> {
    let deps = WorkflowDependencies::load(workflow)?;
    let workflow_file = workflow
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ProvisionError::Packaging(format!("not a file: {}", workflow.display())))?;
    let name = options.name.clone().unwrap_or_else(|| {
        let stem = workflow
            .file_stem()
            .map_or_else(|| "workflow".into(), |s| s.to_string_lossy().into_owned());
        format!("{stem}-package")
    });

    fs::create_dir_all(&options.output_dir)?;
    let archive = options.output_dir.join(format!("{name}.zip"));
    let tmp = tempfile::Builder::new()
        .prefix(".comfypack-")
        .suffix(".zip.part")
        .tempfile_in(&options.output_dir)?;

    let mut report = CreateReport {
        archive: archive.clone(),
        ..CreateReport::default()
    };
    let mut writer = PackageWriter::new(tmp);

    writer.add_file(workflow, &format!("{WORKFLOWS_DIR}/{workflow_file}"))?;

    for dir in resolve_node_packs(layout.extensions_dir(), &deps.node_packs, &mut report)? {
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::info!("Bundling custom nodes {dir_name}");
        writer.add_tree(&dir, &format!("{CUSTOM_NODES_DIR}/{dir_name}"))?;
        report.node_packs.push(dir_name);
    }

    let mut external_models = Vec::new();
    for model in &deps.models {
        let Some(relative) = safe_relative(&model.name) else {
            tracing::warn!("Ignoring model reference with an unsafe path: {}", model.name);
            report.missing_models.push(model.name.clone());
            continue;
        };
        let Some(source) = find_model(layout, model, &relative) else {
            tracing::warn!(
                "Model {} not found under {}",
                model.name,
                layout.category_dir(&model.category).display()
            );
            report.missing_models.push(model.name.clone());
            continue;
        };

        let size = fs::metadata(&source)?.len();
        let file_name = relative.last().cloned().unwrap_or_default();
        if let Some(url) = options.external_urls.get(&file_name) {
            tracing::info!("Hashing {} ({})", source.display(), format_bytes(size));
            external_models.push(ExternalModel {
                name: file_name.clone(),
                category: model.category.clone(),
                path: (relative.len() > 1).then(|| relative.join("/")),
                url: url.to_string(),
                hash: file_md5(&source)?,
                size,
            });
            report.external_models.push(model.name.clone());
        } else if size <= options.large_model_threshold_bytes || options.bundle_large {
            tracing::info!("Bundling {} ({})", model.name, format_bytes(size));
            writer.add_file(
                &source,
                &format!("{MODELS_DIR}/{}/{}", model.category, relative.join("/")),
            )?;
            report.bundled_models.push(model.name.clone());
        } else {
            tracing::warn!(
                "Skipping {} ({}): larger than the bundling threshold and no download URL given",
                model.name,
                format_bytes(size)
            );
            report.skipped_models.push(model.name.clone());
        }
    }

    let manifest = PackageManifest {
        name,
        description: format!("Generated from {workflow_file}"),
        version: PACKAGE_VERSION,
        external_models,
    };
    let json = serde_json::to_vec_pretty(&manifest).map_err(|e| packaging("write manifest", e))?;
    writer.add_bytes(&options.manifest_name, &json)?;

    let tmp = writer.finish()?;
    tmp.persist(&archive)
        .map_err(|e| packaging(&format!("write {}", archive.display()), e.error))?;

    tracing::info!("Created {}", archive.display());
    Ok(report)
}

/// Split a workflow model name on either separator, rejecting escapes
fn safe_relative(name: &str) -> Option<Vec<String>> {
    if name.starts_with('/') || name.starts_with('\\') {
        return None;
    }
    let parts: Vec<String> = name
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .map(str::to_string)
        .collect();
    if parts.is_empty() || parts.iter().any(|p| p == ".." || p.contains(':')) {
        return None;
    }
    Some(parts)
}

/// Locate a referenced model: exact relative path, then the bare file name,
/// then anywhere below the category directory
fn find_model(layout: &Layout, model: &ModelReference, relative: &[String]) -> Option<PathBuf> {
    let category_dir = layout.category_dir(&model.category);
    let exact = relative.iter().fold(category_dir.clone(), |p, part| p.join(part));
    if exact.is_file() {
        return Some(exact);
    }
    let file_name = relative.last()?;
    let flat = category_dir.join(file_name);
    if flat.is_file() {
        return Some(flat);
    }
    search_dir(&category_dir, file_name)
}

fn search_dir(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let mut subdirs = Vec::new();
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if entry.file_name().to_string_lossy() == file_name {
            return Some(path);
        }
    }
    subdirs.sort();
    subdirs.iter().find_map(|sub| search_dir(sub, file_name))
}

/// Match node pack ids to directories under `custom_nodes/`
///
/// An id matches a directory whose lowercased name equals the id or its last
/// `/` segment, or failing that, contains it (or is contained in it).
fn resolve_node_packs(
    extensions_dir: &Path,
    ids: &BTreeSet<String>,
    report: &mut CreateReport,
) -> Result<BTreeSet<PathBuf>> {
    let mut dirs: Vec<(String, PathBuf)> = Vec::new();
    if extensions_dir.is_dir() {
        for entry in fs::read_dir(extensions_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push((entry.file_name().to_string_lossy().to_lowercase(), entry.path()));
            }
        }
    }
    dirs.sort();

    let mut matched = BTreeSet::new();
    for id in ids {
        let short = id.rsplit('/').next().unwrap_or(id);
        let found = dirs
            .iter()
            .find(|(name, _)| name == id || name == short)
            .or_else(|| {
                dirs.iter()
                    .find(|(name, _)| name.contains(short) || short.contains(name.as_str()))
            });
        match found {
            Some((_, path)) => {
                matched.insert(path.clone());
            }
            None => {
                tracing::warn!("No custom node directory matches node pack {id}");
                report.unmatched_node_packs.push(id.clone());
            }
        }
    }
    Ok(matched)
}

struct PackageWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    options: FileOptions,
}

impl<W: Write + Seek> PackageWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            zip: ZipWriter::new(inner),
            options: FileOptions::default().compression_method(CompressionMethod::Deflated),
        }
    }

    fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.zip
            .start_file(name, self.options)
            .map_err(|e| packaging(&format!("add {name}"), e))?;
        self.zip.write_all(data)?;
        Ok(())
    }

    fn add_file(&mut self, source: &Path, name: &str) -> Result<()> {
        self.zip
            .start_file(name, self.options)
            .map_err(|e| packaging(&format!("add {name}"), e))?;
        let mut file = File::open(source)?;
        io::copy(&mut file, &mut self.zip)?;
        Ok(())
    }

    fn add_tree(&mut self, dir: &Path, prefix: &str) -> Result<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
        entries.sort_by_key(fs::DirEntry::file_name);

        for entry in entries {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = format!("{prefix}/{file_name}");
            if entry.file_type()?.is_dir() {
                if SKIPPED_DIRS.contains(&file_name.as_str()) || file_name.ends_with(".egg-info") {
                    continue;
                }
                self.add_tree(&entry.path(), &name)?;
            } else {
                self.add_file(&entry.path(), &name)?;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<W> {
        self.zip
            .finish()
            .map_err(|e| packaging("finish archive", e))
    }
}
