//! Build context augmentation.
//!
//! Appends the build descriptor to a job's archive. The original bytes up to
//! the end-of-archive marker are copied verbatim into `<id>.tar.partial`, the
//! new entry is written after them, and the partial file is renamed over the
//! original once it is synced. A crash at any point leaves either the old or
//! the new archive in place, never a torn one.

use async_trait::async_trait;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use trainbuilder_core::processor::StageProcessor;
use trainbuilder_core::{Error, Job, Result};

/// Entry name of the build descriptor inside an augmented archive.
pub const DESCRIPTOR_ENTRY: &str = "Dockerfile";

const BLOCK_SIZE: u64 = 512;

/// Inserts the configured Dockerfile into every archive it processes.
pub struct DockerfileAugmenter {
    dockerfile: PathBuf,
}

impl DockerfileAugmenter {
    pub fn new(dockerfile: impl Into<PathBuf>) -> Self {
        Self {
            dockerfile: dockerfile.into(),
        }
    }
}

#[async_trait]
impl StageProcessor for DockerfileAugmenter {
    fn name(&self) -> &'static str {
        "augment"
    }

    async fn process(&self, job: &Job) -> Result<()> {
        let descriptor = tokio::fs::read(&self.dockerfile).await.map_err(|e| {
            Error::Archive(format!(
                "build descriptor {} unavailable: {}",
                self.dockerfile.display(),
                e
            ))
        })?;

        let archive = job.archive_path();
        info!(job_id = %job.id, archive = %archive.display(), "Adding Dockerfile to archive");

        tokio::task::spawn_blocking(move || append_entry(&archive, DESCRIPTOR_ENTRY, &descriptor))
            .await
            .map_err(|e| Error::Internal(format!("augment task failed: {}", e)))??;

        info!(job_id = %job.id, "Dockerfile added to archive");
        Ok(())
    }
}

/// Append one regular-file entry to the tar archive at `archive_path`,
/// replacing the file atomically.
pub fn append_entry(archive_path: &Path, entry_name: &str, data: &[u8]) -> Result<()> {
    let data_end = archive_data_end(archive_path)?;
    let partial = partial_path(archive_path);

    if let Err(e) = write_augmented(archive_path, &partial, data_end, entry_name, data) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }

    commit_partial(&partial, archive_path)?;
    if let Some(dir) = archive_path.parent() {
        File::open(dir)?.sync_all()?;
    }
    debug!(archive = %archive_path.display(), entry = entry_name, "Archive replaced");
    Ok(())
}

/// Rename `partial` over `target`. The partial file is removed if the rename
/// fails.
fn commit_partial(partial: &Path, target: &Path) -> Result<()> {
    if let Err(e) = std::fs::rename(partial, target) {
        let _ = std::fs::remove_file(partial);
        return Err(e.into());
    }
    Ok(())
}

/// Path of the scratch file an archive is rewritten into.
pub fn partial_path(archive_path: &Path) -> PathBuf {
    let mut name = archive_path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Offset just past the last entry's data, i.e. where the end-of-archive
/// marker starts. Also validates that the whole archive parses.
fn archive_data_end(archive_path: &Path) -> Result<u64> {
    let file = File::open(archive_path).map_err(|e| {
        Error::Archive(format!("cannot open {}: {}", archive_path.display(), e))
    })?;
    let mut archive = tar::Archive::new(BufReader::new(file));

    let corrupt =
        |e: io::Error| Error::Archive(format!("corrupt archive {}: {}", archive_path.display(), e));

    let mut end = 0;
    for entry in archive.entries().map_err(corrupt)? {
        let entry = entry.map_err(corrupt)?;
        let size = entry.header().entry_size().map_err(corrupt)?;
        end = entry.raw_file_position() + size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    }
    Ok(end)
}

fn write_augmented(
    source_path: &Path,
    partial: &Path,
    data_end: u64,
    entry_name: &str,
    data: &[u8],
) -> Result<()> {
    let mut source = File::open(source_path)?;
    let mut target = File::create(partial)?;

    let copied = io::copy(&mut (&mut source).take(data_end), &mut target)?;
    if copied != data_end {
        return Err(Error::Archive(format!(
            "{} shrank while being copied",
            source_path.display()
        )));
    }

    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);

    let mut builder = tar::Builder::new(target);
    builder.append_data(&mut header, entry_name, data)?;
    let target = builder.into_inner()?;
    target.sync_all()?;
    Ok(())
}
