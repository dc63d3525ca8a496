//! Size-bounded eviction of preloaded piece files.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use tracing::{debug, warn};

/// Prefix of files still being written.
pub const TEMP_PREFIX: char = '_';

/// Outcome of one sweep over the preload directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Bytes under the directory before the sweep
    pub total_bytes: u64,
    /// Bytes left after the sweep
    pub remaining_bytes: u64,
    pub removed: Vec<PathBuf>,
}

struct CachedFile {
    path: PathBuf,
    name: String,
    length: u64,
    modified: SystemTime,
}

/// Deletes the least recently touched files until the directory holds less
/// than `max_size` bytes.
///
/// Files whose name `is_active` reports as in use are never removed, and
/// neither are temp files of in-flight writes. Does nothing while the
/// directory is below the cap.
///
/// # Errors
///
/// - `io::Error` - If the directory cannot be listed
pub async fn sweep<F>(dir: &Path, max_size: u64, is_active: F) -> io::Result<SweepReport>
where
    F: Fn(&str) -> bool,
{
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            // Removed by someone else since listing.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        files.push(CachedFile {
            path: entry.path(),
            name: entry.file_name().to_string_lossy().into_owned(),
            length: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    let total_bytes: u64 = files.iter().map(|file| file.length).sum();
    let mut report = SweepReport {
        total_bytes,
        remaining_bytes: total_bytes,
        removed: Vec::new(),
    };
    if total_bytes < max_size {
        return Ok(report);
    }

    files.sort_by_key(|file| file.modified);
    for file in files {
        if report.remaining_bytes < max_size {
            break;
        }
        if file.name.starts_with(TEMP_PREFIX) || is_active(&file.name) {
            continue;
        }

        match fs::remove_file(&file.path).await {
            Ok(()) => {
                debug!("Evicted preloaded piece {}", file.name);
                report.remaining_bytes -= file.length;
                report.removed.push(file.path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.remaining_bytes -= file.length;
            }
            Err(e) => warn!("Failed to evict {}: {}", file.path.display(), e),
        }
    }

    Ok(report)
}
