use crate::error::{ExtractError, describe};
use crate::events::{Event, EventSink, Stage};
use crate::platform::PlatformOps;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReport {
    pub bytes: u64,
    /// Lowercase hex SHA-256 of the copied content.
    pub sha256: String,
}

/// An entry left out of a directory copy.
#[derive(Debug)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub error: ExtractError,
}

#[derive(Debug, Default)]
pub struct DirCopySummary {
    pub files_copied: usize,
    pub dirs_created: usize,
    pub bytes: u64,
    pub skipped: Vec<SkippedEntry>,
}

/// Stream `source` into a newly created `destination` and verify the result.
///
/// The destination must not exist yet. On failure a partially written
/// destination is left in place.
pub fn copy_file(
    ops: &dyn PlatformOps,
    source: &Path,
    destination: &Path,
) -> Result<CopyReport, ExtractError> {
    let mut src = ops
        .open_source(source)
        .map_err(|e| ExtractError::from_io(source, e))?;
    let mut dst = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .map_err(|e| ExtractError::from_io(destination, e))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut hasher = Sha256::new();
    let mut read = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExtractError::from_io(source, e)),
        };
        hasher.update(&buf[..n]);
        dst.write_all(&buf[..n])
            .map_err(|e| ExtractError::from_io(destination, e))?;
        read += n as u64;
    }
    dst.sync_all()
        .map_err(|e| ExtractError::from_io(destination, e))?;
    drop(dst);

    let sha256 = format!("{:x}", hasher.finalize());
    let (written, written_sha) = digest_file(destination)?;
    if written != read || written_sha != sha256 {
        return Err(ExtractError::CopyMismatch {
            path: destination.to_path_buf(),
            read,
            written,
        });
    }

    Ok(CopyReport {
        bytes: read,
        sha256,
    })
}

/// Length and SHA-256 of a file, read in chunks.
pub fn digest_file(path: &Path) -> Result<(u64, String), ExtractError> {
    let mut file = File::open(path).map_err(|e| ExtractError::from_io(path, e))?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut hasher = Sha256::new();
    let mut len = 0u64;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExtractError::from_io(path, e)),
        };
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((len, format!("{:x}", hasher.finalize())))
}

/// Recreate the tree under `source` at `destination`, best effort.
///
/// Only failing to create `destination` itself is an error. Unreadable
/// descendants are skipped, reported to `sink`, and listed in the summary.
pub fn copy_directory(
    ops: &dyn PlatformOps,
    source: &Path,
    destination: &Path,
    sink: &mut dyn EventSink,
) -> Result<DirCopySummary, ExtractError> {
    fs::create_dir_all(destination).map_err(|e| ExtractError::from_io(destination, e))?;

    let mut summary = DirCopySummary::default();
    let walker = WalkDir::new(source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e.path().unwrap_or(source).to_path_buf();
                let io_err = e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::other("filesystem loop"));
                let err = ExtractError::from_io(&path, io_err);
                skip(&mut summary, sink, path, err);
                continue;
            }
        };

        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            match fs::create_dir_all(&target) {
                Ok(()) => summary.dirs_created += 1,
                Err(e) => {
                    let err = ExtractError::from_io(&target, e);
                    skip(&mut summary, sink, entry.path().to_path_buf(), err);
                }
            }
        } else if file_type.is_file() {
            copy_entry(ops, &mut summary, sink, entry.path(), &target);
        } else {
            // Links are copied as what they point at, when that is a file.
            match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_file() => {
                    copy_entry(ops, &mut summary, sink, entry.path(), &target)
                }
                Ok(_) => {
                    let err = ExtractError::Io {
                        path: entry.path().to_path_buf(),
                        source: io::Error::new(
                            io::ErrorKind::Unsupported,
                            "not a regular file or directory",
                        ),
                    };
                    skip(&mut summary, sink, entry.path().to_path_buf(), err);
                }
                Err(e) => {
                    let err = ExtractError::from_io(entry.path(), e);
                    skip(&mut summary, sink, entry.path().to_path_buf(), err);
                }
            }
        }
    }

    Ok(summary)
}

fn copy_entry(
    ops: &dyn PlatformOps,
    summary: &mut DirCopySummary,
    sink: &mut dyn EventSink,
    source: &Path,
    target: &Path,
) {
    match copy_file(ops, source, target) {
        Ok(report) => {
            summary.files_copied += 1;
            summary.bytes += report.bytes;
        }
        Err(err) => skip(summary, sink, source.to_path_buf(), err),
    }
}

fn skip(
    summary: &mut DirCopySummary,
    sink: &mut dyn EventSink,
    path: PathBuf,
    error: ExtractError,
) {
    sink.emit(Event::warn(
        Stage::Copy,
        format!("skipped: {}", describe(&error)),
        Some(&path),
    ));
    summary.skipped.push(SkippedEntry { path, error });
}
