use crate::error::{ManifestError, ProvisionError, Result};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// One external artifact to acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    /// Destination file name
    pub name: String,
    /// Category key, mapped to a subdirectory of the models dir
    pub category: String,
    pub url: Url,
    /// Lowercase hex MD5 digest
    pub hash: Option<String>,
    /// Relative path whose directory portion nests the file under the category
    pub path: Option<String>,
    /// Expected size in bytes, if the package author recorded it
    pub size: Option<u64>,
}

impl ModelEntry {
    /// Directory portion of `path`, if any
    #[must_use]
    pub fn subdir(&self) -> Option<PathBuf> {
        let path = self.path.as_deref()?;
        let normalized = path.replace('\\', "/");
        let parent = Path::new(&normalized).parent()?;
        if parent.as_os_str().is_empty() {
            None
        } else {
            Some(parent.to_path_buf())
        }
    }

    /// `<type>/[<dirname(path)>/]<name>`, relative to the models dir
    #[must_use]
    pub fn relative_destination(&self) -> PathBuf {
        let mut dest = PathBuf::from(&self.category);
        if let Some(subdir) = self.subdir() {
            dest.push(subdir);
        }
        dest.push(&self.name);
        dest
    }
}

/// A dependency tagged by installer prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencySpec {
    Pip(String),
    Apt(String),
    /// No known prefix: handled by the default installer
    Untagged(String),
}

impl DependencySpec {
    /// Classify by literal prefix; anything else is untagged, colons included
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some(spec) = raw.strip_prefix("pip:") {
            Self::Pip(spec.to_string())
        } else if let Some(spec) = raw.strip_prefix("apt:") {
            Self::Apt(spec.to_string())
        } else {
            Self::Untagged(raw.to_string())
        }
    }

    #[must_use]
    pub fn package(&self) -> &str {
        match self {
            Self::Pip(spec) | Self::Apt(spec) | Self::Untagged(spec) => spec,
        }
    }
}

impl std::fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pip(spec) => write!(f, "pip:{spec}"),
            Self::Apt(spec) => write!(f, "apt:{spec}"),
            Self::Untagged(spec) => write!(f, "{spec}"),
        }
    }
}

/// Parse outcome of a single `externalModels` entry
pub type EntryResult = std::result::Result<ModelEntry, ManifestError>;

/// Package manifest (`config.json` at the package root)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Manifest {
    /// `None` when the key is absent, which is distinct from an empty list
    pub external_models: Option<Vec<EntryResult>>,
    pub dependencies: Vec<DependencySpec>,
    pub post_install_commands: Vec<String>,
    pub gpu_settings: BTreeMap<String, Value>,
    /// Name of the embedded acquisition script, if the package declares one
    pub download_script: Option<String>,
}

/// Manifest document as written by package authors
///
/// `externalModels` items stay raw so that one malformed entry is reported
/// on its own instead of failing the whole document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default, alias = "external_models")]
    external_models: Option<Vec<Value>>,
    #[serde(default)]
    dependencies: Option<Vec<String>>,
    #[serde(default, alias = "post_install_commands")]
    post_install_commands: Option<Vec<String>>,
    #[serde(default, alias = "gpu_settings")]
    gpu_settings: Option<BTreeMap<String, Value>>,
    #[serde(default, alias = "download_script")]
    download_script: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    name: Option<String>,
    #[serde(rename = "type")]
    category: Option<String>,
    url: Option<String>,
    hash: Option<String>,
    path: Option<String>,
    size: Option<u64>,
}

impl Manifest {
    /// Load manifest from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content).map_err(ProvisionError::from)
    }

    /// Parse a manifest document
    ///
    /// Errors scoped to one `externalModels[i]` are kept in place of that
    /// entry instead of failing the document.
    pub fn parse(content: &str) -> std::result::Result<Self, ManifestError> {
        let value: Value =
            serde_json::from_str(content).map_err(|e| ManifestError::Syntax(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> std::result::Result<Self, ManifestError> {
        if !value.is_object() {
            return Err(ManifestError::NotAnObject);
        }
        let raw = RawManifest::deserialize(value)
            .map_err(|e| invalid_field("manifest", &e.to_string()))?;

        let external_models = raw.external_models.map(|items| {
            items
                .iter()
                .enumerate()
                .map(|(index, item)| parse_entry(index, item))
                .collect()
        });

        let dependencies = raw
            .dependencies
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                let spec = DependencySpec::parse(raw);
                if spec.package().trim().is_empty() {
                    Err(invalid_field(
                        &format!("dependencies[{i}]"),
                        "has an empty package spec",
                    ))
                } else {
                    Ok(spec)
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let gpu_settings = raw.gpu_settings.unwrap_or_default();
        if let Some(key) = gpu_settings
            .iter()
            .find_map(|(key, value)| (value.is_object() || value.is_array()).then_some(key))
        {
            return Err(invalid_field(
                &format!("gpuSettings.{key}"),
                "must be a string, number or boolean",
            ));
        }

        let download_script = match raw.download_script {
            Some(name) if !is_bare_name(&name) => {
                return Err(invalid_field("downloadScript", "must be a bare file name"))
            }
            other => other,
        };

        Ok(Self {
            external_models,
            dependencies,
            post_install_commands: raw.post_install_commands.unwrap_or_default(),
            gpu_settings,
            download_script,
        })
    }

    /// Valid entries, in manifest order
    pub fn entries(&self) -> impl Iterator<Item = &ModelEntry> {
        self.external_models
            .iter()
            .flatten()
            .filter_map(|entry| entry.as_ref().ok())
    }

    /// Number of `externalModels` items, valid or not
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.external_models.as_ref().map_or(0, Vec::len)
    }
}

fn invalid_field(field: &str, reason: &str) -> ManifestError {
    ManifestError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_entry(index: usize, item: &Value) -> EntryResult {
    let entry_error = |field: &'static str, reason: &str| ManifestError::InvalidEntry {
        index,
        field,
        reason: reason.to_string(),
    };

    let Some(obj) = item.as_object() else {
        return Err(entry_error("entry", "must be an object"));
    };
    let raw = RawEntry::deserialize(item)
        .map_err(|e| entry_error(mistyped_field(obj), &e.to_string()))?;

    let required = |field: &'static str, value: Option<String>| match value {
        None => Err(entry_error(field, "is missing")),
        Some(s) if s.trim().is_empty() => Err(entry_error(field, "must not be empty")),
        Some(s) => Ok(s),
    };

    let name = required("name", raw.name)?;
    if !is_bare_name(&name) {
        return Err(entry_error("name", "must be a bare file name"));
    }

    let category = required("type", raw.category)?;
    if !is_bare_name(&category) {
        return Err(entry_error("type", "must be a single directory name"));
    }

    let url = Url::parse(&required("url", raw.url)?)
        .map_err(|e| entry_error("url", &format!("is not a valid absolute URL: {e}")))?;

    let hash = match raw.hash.filter(|h| !h.is_empty()) {
        None => None,
        Some(h) if h.len() == 32 && h.chars().all(|c| c.is_ascii_hexdigit()) => {
            Some(h.to_ascii_lowercase())
        }
        Some(_) => return Err(entry_error("hash", "must be a 32-character hex MD5 digest")),
    };

    let path = raw.path.filter(|p| !p.is_empty());
    if let Some(path) = &path {
        let normalized = path.replace('\\', "/");
        let safe = Path::new(&normalized)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(entry_error("path", "must be relative and stay inside the category"));
        }
    }

    Ok(ModelEntry {
        name,
        category,
        url,
        hash,
        path,
        size: raw.size,
    })
}

/// First entry field whose JSON type does not match
fn mistyped_field(obj: &Map<String, Value>) -> &'static str {
    const TEXT_FIELDS: [&str; 5] = ["name", "type", "url", "hash", "path"];
    let wrong = |field: &str, ok: fn(&Value) -> bool| {
        obj.get(field).is_some_and(|v| !v.is_null() && !ok(v))
    };
    TEXT_FIELDS
        .into_iter()
        .find(|field| wrong(*field, Value::is_string))
        .or_else(|| wrong("size", Value::is_u64).then_some("size"))
        .unwrap_or("entry")
}

fn is_bare_name(name: &str) -> bool {
    !name.contains('/') && !name.contains('\\') && name != "." && name != ".."
}
