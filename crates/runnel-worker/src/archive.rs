//! Zip packing and unpacking of job directories.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{Result, WorkerError};

/// Zip every entry under `source` into `writer`, with paths relative to it.
///
/// Symlinks are stored as links; FIFOs, sockets, and devices are skipped. A
/// missing `source` produces an empty archive.
pub fn pack_dir<W: Write + Seek>(source: &Path, writer: W) -> Result<W> {
    let mut zip = ZipWriter::new(writer);
    let base = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    if source.exists() {
        let walker = WalkDir::new(source)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|e| WorkerError::artifact(format!("walk failed: {e}")))?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| WorkerError::artifact(e.to_string()))?;
            let name = archive_name(rel);
            let file_type = entry.file_type();
            let meta = entry.path().symlink_metadata()?;
            let options = base.unix_permissions(mode_of(&meta));

            if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                zip.add_symlink(name, target.to_string_lossy(), options)
                    .map_err(zip_error)?;
            } else if file_type.is_dir() {
                zip.add_directory(name, options).map_err(zip_error)?;
            } else if file_type.is_file() {
                zip.start_file(name, options).map_err(zip_error)?;
                let mut file = File::open(entry.path())?;
                io::copy(&mut file, &mut zip)?;
            } else {
                debug!(path = %entry.path().display(), "Skipping special file");
            }
        }
    }

    zip.finish().map_err(zip_error)
}

/// Extract a zip archive into `dest`, merging with existing content.
pub fn unpack<R: Read + Seek>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(reader)
        .map_err(|e| WorkerError::protocol(format!("invalid archive: {e}")))?;
    fs::create_dir_all(dest)?;
    archive
        .extract(dest)
        .map_err(|e| WorkerError::protocol(format!("archive extraction failed: {e}")))?;
    debug!(entries = archive.len(), dest = %dest.display(), "Archive extracted");
    Ok(())
}

fn archive_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() { 0o755 } else { 0o644 }
}

fn zip_error(e: zip::result::ZipError) -> WorkerError {
    WorkerError::artifact(format!("zip error: {e}"))
}
