//! Dependency installation, GPU settings and post-install commands
//!
//! Dependencies soft-fail: a failing installer is logged and the next
//! dependency still runs. Post-install commands hard-fail: the first
//! non-zero exit stops the run and is returned as an error.

pub mod runner;

use crate::config::schema::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::layout::Layout;
use crate::models::manifest::{DependencySpec, Manifest};
use runner::{shell_quote, CommandRunner};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;

pub use runner::{CommandStatus, ShellRunner};

/// Result of one dependency installation
#[derive(Debug)]
pub struct DependencyOutcome {
    pub spec: DependencySpec,
    pub command: String,
    pub failure: Option<ProvisionError>,
}

/// Summary of a provisioning run that completed
#[derive(Debug, Default)]
pub struct ProvisionReport {
    pub dependencies: Vec<DependencyOutcome>,
    pub gpu_env: Vec<(String, String)>,
    pub commands_run: usize,
}

impl ProvisionReport {
    #[must_use]
    pub fn failed_dependencies(&self) -> usize {
        self.dependencies
            .iter()
            .filter(|d| d.failure.is_some())
            .count()
    }

    pub fn print_summary(&self) {
        if !self.dependencies.is_empty() {
            println!(
                "Dependencies: {} installed, {} failed",
                self.dependencies.len() - self.failed_dependencies(),
                self.failed_dependencies()
            );
            for dep in self.dependencies.iter().filter(|d| d.failure.is_some()) {
                println!("  Install manually: {}", dep.command);
            }
        }
        if self.commands_run > 0 {
            println!("Post-install commands completed: {}", self.commands_run);
        }
    }
}

/// Applies a manifest's dependencies and post-install steps
pub struct Provisioner<'a> {
    layout: &'a Layout,
    config: &'a ProvisionConfig,
    runner: &'a dyn CommandRunner,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        layout: &'a Layout,
        config: &'a ProvisionConfig,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            layout,
            config,
            runner,
        }
    }

    /// Install dependencies, export GPU settings, then run post-install commands
    pub fn apply(&self, manifest: &Manifest) -> Result<ProvisionReport> {
        let root = self.layout.root();
        fs::create_dir_all(root)?;

        for tool in self.missing_tools(manifest) {
            tracing::warn!("{tool} not found in PATH; related dependencies will likely fail");
        }

        let mut report = ProvisionReport::default();

        for spec in &manifest.dependencies {
            let command = self.installer_command(spec);
            tracing::info!("Installing dependency {spec}");

            let failure = match self.runner.run(&command, root, &[]) {
                Ok(status) if status.success() => None,
                Ok(status) => Some(ProvisionError::Dependency {
                    spec: spec.to_string(),
                    code: status.code,
                }),
                Err(e) => {
                    tracing::debug!("Failed to start `{command}`: {e}");
                    Some(ProvisionError::Dependency {
                        spec: spec.to_string(),
                        code: None,
                    })
                }
            };
            if let Some(err) = &failure {
                tracing::warn!("{err}; continuing");
            }

            report.dependencies.push(DependencyOutcome {
                spec: spec.clone(),
                command,
                failure,
            });
        }

        report.gpu_env = gpu_env(&manifest.gpu_settings, &self.config.gpu_env_prefix);
        for (key, value) in &report.gpu_env {
            tracing::debug!("GPU setting {key}={value}");
        }

        for command in &manifest.post_install_commands {
            tracing::info!("Running post-install command: {command}");
            let status = self
                .runner
                .run(command, root, &report.gpu_env)
                .map_err(|e| {
                    tracing::error!("Failed to start `{command}`: {e}");
                    ProvisionError::Command {
                        command: command.clone(),
                        code: None,
                    }
                })?;

            if !status.success() {
                tracing::error!("Post-install command failed: {command}");
                return Err(ProvisionError::Command {
                    command: command.clone(),
                    code: status.code,
                });
            }
            report.commands_run += 1;
        }

        Ok(report)
    }

    /// Shell command line installing one dependency
    #[must_use]
    pub fn installer_command(&self, spec: &DependencySpec) -> String {
        let pip = || self.config.pip_install.replace("{python}", &self.config.python);
        let installer = match spec {
            DependencySpec::Pip(_) => pip(),
            DependencySpec::Apt(_) => self.config.apt_install.clone(),
            DependencySpec::Untagged(_) if self.config.default_installer == "apt" => {
                self.config.apt_install.clone()
            }
            DependencySpec::Untagged(_) => pip(),
        };
        format!("{installer} {}", shell_quote(spec.package()))
    }

    fn missing_tools(&self, manifest: &Manifest) -> Vec<String> {
        let mut tools = Vec::new();
        for spec in &manifest.dependencies {
            let command = self.installer_command(spec);
            if let Some(program) = command.split_whitespace().next() {
                if !tools.iter().any(|t| t == program) {
                    tools.push(program.to_string());
                }
            }
        }
        tools.retain(|tool| which::which(tool).is_err());
        tools
    }
}

/// Environment variables exported for post-install commands
///
/// `vramOptimize: true` becomes `COMFYUI_VRAM_OPTIMIZE=true` with the
/// default prefix.
#[must_use]
pub fn gpu_env(settings: &BTreeMap<String, Value>, prefix: &str) -> Vec<(String, String)> {
    settings
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some((format!("{prefix}{}", env_key(key)), value))
        })
        .collect()
}

fn env_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            key.push('_');
        }
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_uppercase());
        } else {
            key.push('_');
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
    }
    key
}
