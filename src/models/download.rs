use crate::config::schema::DownloadConfig;
use crate::credentials::Credential;
use crate::error::{DownloadError, ProvisionError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use md5::{Digest, Md5};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Temp files are `.comfypack-XXXXXX.part` next to their destination
pub const PARTIAL_PREFIX: &str = ".comfypack-";
pub const PARTIAL_SUFFIX: &str = ".part";

const CHUNK_SIZE: usize = 64 * 1024;

/// Free space kept in reserve beyond the artifact itself
const DISK_HEADROOM_BYTES: u64 = 100 * 1_024 * 1_024;

/// Open response body of a transfer
pub struct TransportResponse {
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

/// Source of artifact bytes
///
/// Implementations map authentication failures to `AuthRequired` and any
/// other non-2xx status or connection failure to `Transport`.
pub trait Transport {
    fn get(
        &self,
        url: &Url,
        credential: Option<&Credential>,
    ) -> std::result::Result<TransportResponse, DownloadError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn get(
        &self,
        url: &Url,
        credential: Option<&Credential>,
    ) -> std::result::Result<TransportResponse, DownloadError> {
        (**self).get(url, credential)
    }
}

/// Blocking HTTP transport
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ProvisionError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(
        &self,
        url: &Url,
        credential: Option<&Credential>,
    ) -> std::result::Result<TransportResponse, DownloadError> {
        let mut request = self.client.get(url.clone());
        if let Some(credential) = credential {
            request = request.bearer_auth(credential.secret());
        }

        let response = request.send().map_err(|e| DownloadError::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        })?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(DownloadError::AuthRequired {
                    status: status.as_u16(),
                })
            }
            s if !s.is_success() => Err(DownloadError::Transport {
                status: Some(s.as_u16()),
                message: s.canonical_reason().unwrap_or("request failed").to_string(),
            }),
            _ => Ok(TransportResponse {
                content_length: response.content_length(),
                body: Box::new(response),
            }),
        }
    }
}

/// Result of a successful fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub path: PathBuf,
    pub bytes: u64,
    pub md5: String,
}

/// Single-artifact downloader with integrity check and atomic placement
pub struct Downloader<T: Transport = HttpTransport> {
    transport: T,
    progress: bool,
    check_disk_space: bool,
}

impl Downloader<HttpTransport> {
    /// Create an HTTP downloader from config
    pub fn from_config(config: &DownloadConfig) -> Result<Self> {
        Ok(Self::new(HttpTransport::new(config)?)
            .with_progress(config.progress)
            .with_disk_space_check(config.check_disk_space))
    }
}

impl<T: Transport> Downloader<T> {
    /// Downloader over any transport, without progress output or disk checks
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            progress: false,
            check_disk_space: false,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    #[must_use]
    pub fn with_disk_space_check(mut self, enabled: bool) -> Self {
        self.check_disk_space = enabled;
        self
    }

    /// Download `url` to `destination`
    ///
    /// Bytes go to a temp file in the destination directory and are renamed
    /// into place only after the transfer (and hash check, if any) succeeds.
    /// On any error the destination is left untouched.
    pub fn fetch(
        &self,
        url: &Url,
        destination: &Path,
        expected_hash: Option<&str>,
        credential: Option<&Credential>,
    ) -> std::result::Result<Fetched, DownloadError> {
        self.fetch_sized(url, destination, expected_hash, None, credential)
    }

    /// Like [`fetch`](Self::fetch), with the size the manifest declares
    ///
    /// A declared size is checked against free space before connecting. The
    /// server's Content-Length, when present, is checked again afterwards.
    pub fn fetch_sized(
        &self,
        url: &Url,
        destination: &Path,
        expected_hash: Option<&str>,
        expected_size: Option<u64>,
        credential: Option<&Credential>,
    ) -> std::result::Result<Fetched, DownloadError> {
        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        if self.check_disk_space {
            if let Some(size) = expected_size {
                check_disk_space(parent, size)?;
            }
        }

        tracing::info!("Downloading {url} -> {}", destination.display());
        let mut response = self.transport.get(url, credential)?;

        if self.check_disk_space {
            if let Some(len) = response.content_length {
                check_disk_space(parent, len)?;
            }
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(parent)?;

        let display_name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let pb = self.progress_bar(response.content_length, &display_name);

        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            let read = match response.body.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    pb.abandon();
                    return Err(DownloadError::Transport {
                        status: None,
                        message: format!("transfer interrupted after {written} bytes: {e}"),
                    });
                }
            };
            tmp.write_all(&buffer[..read])?;
            hasher.update(&buffer[..read]);
            written += read as u64;
            pb.set_position(written);
        }
        pb.finish_and_clear();

        if let Some(expected_len) = response.content_length {
            if written != expected_len {
                return Err(DownloadError::Transport {
                    status: None,
                    message: format!("truncated transfer: expected {expected_len} bytes, got {written}"),
                });
            }
        }

        tmp.flush()?;
        tmp.as_file().sync_all()?;

        let actual = format!("{:x}", hasher.finalize());
        if let Some(expected) = expected_hash {
            if !expected.eq_ignore_ascii_case(&actual) {
                tracing::warn!(
                    "Hash mismatch for {}: expected {expected}, got {actual}",
                    destination.display()
                );
                return Err(DownloadError::HashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
            tracing::debug!("Hash verified for {}", destination.display());
        }

        tmp.persist(destination).map_err(|e| DownloadError::Io(e.error))?;

        tracing::info!(
            "Downloaded {} ({})",
            destination.display(),
            format_bytes(written)
        );

        Ok(Fetched {
            path: destination.to_path_buf(),
            bytes: written,
            md5: actual,
        })
    }

    fn progress_bar(&self, len: Option<u64>, name: &str) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }

        let pb = match len {
            Some(len) => {
                let pb = ProgressBar::new(len);
                if let Ok(style) = ProgressStyle::default_bar()
                    .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                {
                    pb.set_style(style.progress_chars("=> "));
                }
                pb
            }
            None => {
                let pb = ProgressBar::new_spinner();
                if let Ok(style) =
                    ProgressStyle::default_spinner().template("{spinner:.green} {msg} {bytes}")
                {
                    pb.set_style(style);
                }
                pb
            }
        };
        pb.set_message(name.to_string());
        pb
    }
}

/// Check if enough disk space is available in `dir` for `required_bytes`
fn check_disk_space(dir: &Path, required_bytes: u64) -> std::result::Result<(), DownloadError> {
    let stats = match nix::sys::statvfs::statvfs(dir) {
        Ok(stats) => stats,
        Err(e) => {
            tracing::debug!("Skipping disk space check for {}: {e}", dir.display());
            return Ok(());
        }
    };

    #[allow(clippy::useless_conversion)]
    let available_bytes = u64::from(stats.blocks_available()) * u64::from(stats.block_size());

    let required_with_buffer = required_bytes.saturating_add(DISK_HEADROOM_BYTES);

    if available_bytes < required_with_buffer {
        return Err(DownloadError::InsufficientSpace {
            required_mb: required_with_buffer / (1_024 * 1_024),
            available_mb: available_bytes / (1_024 * 1_024),
        });
    }

    Ok(())
}

/// MD5 of a local file as lowercase hex
pub fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Remove temp files orphaned by interrupted downloads in `dir`
///
/// Only safe while no other download targets the same directory.
pub fn sweep_partial_downloads(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(PARTIAL_PREFIX)
            && name.ends_with(PARTIAL_SUFFIX)
            && entry.path().is_file()
        {
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    tracing::debug!("Removed stale partial download {name}");
                    removed += 1;
                }
                Err(e) => tracing::warn!("Failed to remove {name}: {e}"),
            }
        }
    }
    removed
}

/// Format bytes as human-readable string
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
