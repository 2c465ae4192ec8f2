#![allow(dead_code)]

use comfypack::credentials::Credential;
use comfypack::error::DownloadError;
use comfypack::models::{Transport, TransportResponse};
use comfypack::provision::CommandStatus;
use comfypack::provision::runner::CommandRunner;
use reqwest::Url;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use zip::write::FileOptions;

pub const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// Canned responses keyed by URL; unknown URLs fail with HTTP 404
#[derive(Default)]
pub struct MapTransport {
    bodies: HashMap<String, Vec<u8>>,
    statuses: HashMap<String, u16>,
    /// (url, credential secret) per request
    pub requests: RefCell<Vec<(String, Option<String>)>>,
}

impl MapTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(mut self, url: &str, data: &[u8]) -> Self {
        self.bodies.insert(url.to_string(), data.to_vec());
        self
    }

    pub fn status(mut self, url: &str, status: u16) -> Self {
        self.statuses.insert(url.to_string(), status);
        self
    }
}

impl Transport for MapTransport {
    fn get(
        &self,
        url: &Url,
        credential: Option<&Credential>,
    ) -> Result<TransportResponse, DownloadError> {
        self.requests
            .borrow_mut()
            .push((url.to_string(), credential.map(|c| c.secret().to_string())));

        if let Some(data) = self.bodies.get(url.as_str()) {
            return Ok(TransportResponse {
                content_length: Some(data.len() as u64),
                body: Box::new(io::Cursor::new(data.clone())),
            });
        }
        match self.statuses.get(url.as_str()).copied().unwrap_or(404) {
            status @ (401 | 403) => Err(DownloadError::AuthRequired { status }),
            status => Err(DownloadError::Transport {
                status: Some(status),
                message: "canned failure".to_string(),
            }),
        }
    }
}

/// Records commands and fails those containing any of `fail_on`
#[derive(Default)]
pub struct RecordingRunner {
    fail_on: Vec<String>,
    pub commands: RefCell<Vec<String>>,
}

impl RecordingRunner {
    pub fn failing_on(patterns: &[&str]) -> Self {
        Self {
            fail_on: patterns.iter().map(|p| (*p).to_string()).collect(),
            commands: RefCell::new(Vec::new()),
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn run(
        &self,
        command: &str,
        _working_dir: &Path,
        _env: &[(String, String)],
    ) -> io::Result<CommandStatus> {
        self.commands.borrow_mut().push(command.to_string());
        let failed = self.fail_on.iter().any(|p| command.contains(p.as_str()));
        Ok(CommandStatus {
            code: Some(i32::from(failed)),
        })
    }
}

pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, data) in entries {
        zip.start_file(*name, FileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}
