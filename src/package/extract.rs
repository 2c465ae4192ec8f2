use crate::error::{ProvisionError, Result};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use zip::read::ZipArchive;

fn extraction(context: &str, err: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::Extraction(format!("{context}: {err}"))
}

/// Extract a zip archive into `destination`, returning the number of files written
///
/// Entries whose paths would escape `destination` fail the whole extraction.
pub fn extract_zip(archive_path: &Path, destination: &Path) -> Result<usize> {
    let file = File::open(archive_path)
        .map_err(|e| extraction(&format!("open {}", archive_path.display()), e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| extraction("open zip archive", e))?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| extraction("read zip entry", e))?;
        let relative = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            ProvisionError::Extraction(format!("unsafe path in archive: {}", entry.name()))
        })?;
        let dest = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&dest).map_err(|e| extraction("create zip dir", e))?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| extraction("create zip file parent", e))?;
        }
        let mut outfile = File::create(&dest).map_err(|e| extraction("create zip file", e))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|e| extraction(&format!("write {}", entry.name()), e))?;

        // Owner write is always kept so a later merge can overwrite the file
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dest, fs::Permissions::from_mode((mode & 0o777) | 0o200))
                .map_err(|e| extraction("set permissions", e))?;
        }

        files += 1;
    }

    tracing::debug!(
        "Extracted {files} files from {} into {}",
        archive_path.display(),
        destination.display()
    );
    Ok(files)
}
