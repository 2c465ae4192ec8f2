#![allow(clippy::multiple_crate_versions)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use comfypack::config::{schema, Config};
use comfypack::credentials::{CredentialOrigin, CredentialResolver};
use comfypack::install::{discover_manifest, Installer};
use comfypack::layout::Layout;
use comfypack::models::{Downloader, Manifest, Transport};
use comfypack::package::create::{create_package, CreateOptions};
use comfypack::provision::runner::CommandRunner;
use comfypack::provision::ShellRunner;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "comfypack")]
#[command(about = "Install ComfyUI workflow packages and their external models", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/comfypack/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge a package archive, download its models and provision it
    Install {
        /// Package zip archive
        archive: PathBuf,
        /// ComfyUI installation directory
        #[arg(long)]
        target: PathBuf,
    },
    /// Download a manifest's external models
    Download {
        #[arg(long)]
        target: PathBuf,
        /// Manifest file (default: config.json in the target, then the current directory)
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Exit non-zero when any model failed to download
        #[arg(long)]
        strict: bool,
    },
    /// Install dependencies and run post-install commands
    Provision {
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Build a package archive from a workflow and the installation it runs in
    Create {
        /// Workflow JSON exported from the ComfyUI UI
        workflow: PathBuf,
        /// ComfyUI installation providing custom nodes and models
        #[arg(long)]
        source: PathBuf,
        /// Package name (default: <workflow>-package)
        #[arg(long)]
        name: Option<String>,
        /// Directory for the archive (default: current directory)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Publish a model as a download instead of bundling it
        #[arg(long, value_name = "FILE=URL", value_parser = parse_external)]
        external: Vec<(String, Url)>,
        /// Bundle large models that have no --external URL
        #[arg(long)]
        bundle_large: bool,
        /// Models above this many MB are not bundled (default from config)
        #[arg(long)]
        threshold_mb: Option<u64>,
    },
    /// Show where the API key for a source would be read from
    Credentials {
        /// Source name, e.g. civitai
        source: String,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    let cwd = std::env::current_dir().context("Failed to read current directory")?;

    let downloader = Downloader::from_config(&config.download)?;
    let runner = ShellRunner::from_config(&config.provision);
    run(cli.command, &config, &cwd, &downloader, &runner)
}

/// Execute one subcommand
///
/// Exit-code policy: failed model downloads alone exit 0 unless `--strict`.
/// Extraction, manifest, packaging and post-install failures are errors.
fn run<T: Transport>(
    command: Commands,
    config: &Config,
    cwd: &Path,
    downloader: &Downloader<T>,
    runner: &dyn CommandRunner,
) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Install { archive, target } => {
            let layout = Layout::new(target, &config.layout);
            let installer = Installer::new(config, &layout, downloader, runner, cwd);

            tracing::info!(
                "Installing {} into {}",
                archive.display(),
                layout.root().display()
            );
            let report = installer
                .install(&archive)
                .with_context(|| format!("Failed to install {}", archive.display()))?;
            report.print_summary();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Download {
            target,
            manifest,
            strict,
        } => {
            let layout = Layout::new(target, &config.layout);
            let manifest = load_manifest(manifest.as_deref(), &layout, config, cwd)?;
            let installer = Installer::new(config, &layout, downloader, runner, cwd);

            let report = installer.download(&manifest);
            report.print_summary();
            if strict && report.failed() > 0 {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Provision { target, manifest } => {
            let layout = Layout::new(target, &config.layout);
            let manifest = load_manifest(manifest.as_deref(), &layout, config, cwd)?;
            let installer = Installer::new(config, &layout, downloader, runner, cwd);

            let report = installer
                .provision(&manifest)
                .context("Provisioning failed")?;
            report.print_summary();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Create {
            workflow,
            source,
            name,
            output,
            external,
            bundle_large,
            threshold_mb,
        } => {
            let layout = Layout::new(source, &config.layout);
            let output = output.unwrap_or_else(|| cwd.to_path_buf());
            let mut options = CreateOptions::from_config(&config.package, output);
            options.name = name;
            options.external_urls = external.into_iter().collect();
            options.bundle_large = bundle_large;
            if let Some(mb) = threshold_mb {
                options.large_model_threshold_bytes = mb.saturating_mul(1_024 * 1_024);
            }

            let report = create_package(&workflow, &layout, &options).with_context(|| {
                format!("Failed to create a package from {}", workflow.display())
            })?;
            report.print_summary();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Credentials { source } => {
            print_credential_origin(&source, cwd, &config.credentials);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `FILE=URL` for `create --external`
fn parse_external(value: &str) -> Result<(String, Url), String> {
    let (file, url) = value
        .split_once('=')
        .ok_or_else(|| format!("expected FILE=URL, got '{value}'"))?;
    if file.is_empty() {
        return Err("file name must not be empty".to_string());
    }
    let url = Url::parse(url).map_err(|e| format!("invalid URL '{url}': {e}"))?;
    Ok((file.to_string(), url))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_manifest(
    explicit: Option<&Path>,
    layout: &Layout,
    config: &Config,
    cwd: &Path,
) -> anyhow::Result<Manifest> {
    let path = discover_manifest(explicit, layout, config, cwd)?;
    tracing::info!("Using manifest {}", path.display());
    Manifest::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

fn print_credential_origin(source: &str, cwd: &Path, config: &schema::CredentialsConfig) {
    let resolver = CredentialResolver::new(cwd, config);
    match resolver.resolve_with_origin(source) {
        Some((_, CredentialOrigin::Environment(var))) => {
            println!("{source}: API key from environment variable {var}");
        }
        Some((_, CredentialOrigin::File(path))) => {
            println!("{source}: API key from {}", path.display());
        }
        None => {
            println!("{source}: no API key configured, downloads will be unauthenticated");
            println!(
                "  Set {} or create {} with an \"apiKey\" field",
                CredentialResolver::env_var(source),
                resolver.file_path(source).display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comfypack::error::DownloadError;
    use comfypack::models::TransportResponse;
    use comfypack::provision::CommandStatus;
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    /// Every request fails with HTTP 404
    struct Unreachable;

    impl Transport for Unreachable {
        fn get(
            &self,
            _url: &Url,
            _credential: Option<&comfypack::credentials::Credential>,
        ) -> std::result::Result<TransportResponse, DownloadError> {
            Err(DownloadError::Transport {
                status: Some(404),
                message: "Not Found".to_string(),
            })
        }
    }

    /// Fails every command containing "false"
    struct FakeRunner;

    impl CommandRunner for FakeRunner {
        fn run(
            &self,
            command: &str,
            _working_dir: &Path,
            _env: &[(String, String)],
        ) -> io::Result<CommandStatus> {
            Ok(CommandStatus {
                code: Some(i32::from(command.contains("false"))),
            })
        }
    }

    fn command(args: &[&str]) -> Commands {
        let argv = std::iter::once("comfypack").chain(args.iter().copied());
        Cli::try_parse_from(argv).unwrap().command
    }

    fn run_in(temp_dir: &TempDir, args: &[&str]) -> anyhow::Result<ExitCode> {
        let config = Config::default();
        let downloader = Downloader::new(Unreachable);
        run(command(args), &config, temp_dir.path(), &downloader, &FakeRunner)
    }

    fn path(temp_dir: &TempDir, name: &str) -> String {
        temp_dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_failed_downloads_exit_zero_unless_strict() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("config.json"),
            r#"{"externalModels": [{"name": "a.bin", "type": "vae", "url": "https://example.org/a.bin"}]}"#,
        )
        .unwrap();
        let target = path(&temp_dir, "ComfyUI");

        let code = run_in(&temp_dir, &["download", "--target", &target]).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);

        let code = run_in(&temp_dir, &["download", "--target", &target, "--strict"]).unwrap();
        assert_eq!(code, ExitCode::FAILURE);
    }

    #[test]
    fn test_corrupt_archive_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("pkg.zip"), b"not a zip").unwrap();
        let archive = path(&temp_dir, "pkg.zip");
        let target = path(&temp_dir, "ComfyUI");

        let err = run_in(&temp_dir, &["install", &archive, "--target", &target]).unwrap_err();
        assert!(format!("{err:#}").contains("Extraction error"));
    }

    #[test]
    fn test_post_install_failure_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("config.json"),
            r#"{"postInstallCommands": ["true", "false", "echo never"]}"#,
        )
        .unwrap();
        let target = path(&temp_dir, "ComfyUI");

        let err = run_in(&temp_dir, &["provision", "--target", &target]).unwrap_err();
        assert!(err.to_string().contains("Provisioning failed"));
    }

    #[test]
    fn test_missing_manifest_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let target = path(&temp_dir, "ComfyUI");
        assert!(run_in(&temp_dir, &["download", "--target", &target]).is_err());
    }

    #[test]
    fn test_create_writes_archive() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("flow.json"),
            r#"{"nodes": [{"type": "KSampler", "widgets_values": [1, "euler"]}]}"#,
        )
        .unwrap();
        let workflow = path(&temp_dir, "flow.json");
        let source = path(&temp_dir, "ComfyUI");

        let code = run_in(&temp_dir, &["create", &workflow, "--source", &source]).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        assert!(temp_dir.path().join("flow-package.zip").is_file());
    }

    #[test]
    fn test_parse_external() {
        let (file, url) = parse_external("base.safetensors=https://example.org/base").unwrap();
        assert_eq!(file, "base.safetensors");
        assert_eq!(url.as_str(), "https://example.org/base");
        assert!(parse_external("no-separator").is_err());
        assert!(parse_external("=https://example.org").is_err());
        assert!(parse_external("a.bin=not a url").is_err());
    }
}
