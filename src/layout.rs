use crate::config::schema::LayoutConfig;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout of a target installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    models: PathBuf,
    extensions: PathBuf,
    workflows: PathBuf,
    standard_categories: Vec<String>,
}

impl Layout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, config: &LayoutConfig) -> Self {
        let root = root.into();
        Self {
            models: root.join(&config.models_dir),
            extensions: root.join(&config.extensions_dir),
            workflows: root.join(&config.workflows_dir),
            standard_categories: config.standard_categories.clone(),
            root,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models
    }

    #[must_use]
    pub fn extensions_dir(&self) -> &Path {
        &self.extensions
    }

    #[must_use]
    pub fn workflows_dir(&self) -> &Path {
        &self.workflows
    }

    /// Directory for a model category; unknown categories are used verbatim
    #[must_use]
    pub fn category_dir(&self, category: &str) -> PathBuf {
        self.models.join(category)
    }

    /// Create the models dir and the standard category directories
    pub fn ensure_model_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.models)?;
        for category in &self.standard_categories {
            fs::create_dir_all(self.category_dir(category))?;
        }
        Ok(())
    }
}
