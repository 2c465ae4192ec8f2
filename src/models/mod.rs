pub mod download;
pub mod manager;
pub mod manifest;
pub mod registry;

pub use download::{Downloader, Fetched, HttpTransport, Transport, TransportResponse};
pub use manager::{AcquisitionStrategy, BatchReport, EntryOutcome, FailureKind, ModelManager};
pub use manifest::{DependencySpec, Manifest, ModelEntry};
pub use registry::CategoryInfo;
