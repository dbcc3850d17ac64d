use crate::copier::SkippedEntry;
use crate::error::{ExtractError, describe};
use crate::events::{Event, EventSink, Stage};
use std::fs;
use std::io;
use std::path::Path;

pub const IMAGE_MARKER: &str = ".jpg";

/// How a file name is judged to already carry the image marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MarkerMatch {
    /// `.jpg` anywhere in the name, so `shot.jpg.bak` counts. Matches the
    /// names produced by earlier extractions.
    #[default]
    Contains,
    /// Name must end in `.jpg` (ASCII case-insensitive).
    Suffix,
}

impl MarkerMatch {
    pub fn is_marked(self, name: &str) -> bool {
        match self {
            MarkerMatch::Contains => name.contains(IMAGE_MARKER),
            MarkerMatch::Suffix => {
                name.len() >= IMAGE_MARKER.len()
                    && name.as_bytes()[name.len() - IMAGE_MARKER.len()..]
                        .eq_ignore_ascii_case(IMAGE_MARKER.as_bytes())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct NormalizeSummary {
    pub renamed: usize,
    pub untouched: usize,
    /// Renamed files whose content does not look like a JPEG.
    pub not_jpeg: usize,
    pub failed: Vec<SkippedEntry>,
}

/// Append `.jpg` to every file directly inside `dir` that lacks the marker.
///
/// Only names change; content is never touched and nothing is overwritten.
/// A rename that fails is reported and the rest carry on.
pub fn normalize_images(
    dir: &Path,
    mode: MarkerMatch,
    sink: &mut dyn EventSink,
) -> Result<NormalizeSummary, ExtractError> {
    let entries = fs::read_dir(dir).map_err(|e| ExtractError::from_io(dir, e))?;
    let mut summary = NormalizeSummary::default();

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                fail(&mut summary, sink, ExtractError::from_io(dir, e));
                continue;
            }
        };
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => continue,
            Ok(_) => {}
            Err(e) => {
                fail(&mut summary, sink, ExtractError::from_io(&path, e));
                continue;
            }
        }

        let name = entry.file_name();
        if mode.is_marked(&name.to_string_lossy()) {
            summary.untouched += 1;
            continue;
        }

        let mut new_name = name.clone();
        new_name.push(IMAGE_MARKER);
        let target = dir.join(&new_name);
        if target.exists() {
            let err = io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", target.display()),
            );
            fail(&mut summary, sink, ExtractError::from_io(&path, err));
            continue;
        }

        if let Err(e) = fs::rename(&path, &target) {
            fail(&mut summary, sink, ExtractError::from_io(&path, e));
            continue;
        }
        summary.renamed += 1;

        match infer::get_from_path(&target) {
            Ok(Some(kind)) if kind.mime_type() == "image/jpeg" => {}
            Ok(Some(kind)) => {
                summary.not_jpeg += 1;
                sink.emit(Event::warn(
                    Stage::Normalize,
                    format!("renamed, but content looks like {}", kind.mime_type()),
                    Some(&target),
                ));
            }
            Ok(None) => {
                summary.not_jpeg += 1;
                sink.emit(Event::warn(
                    Stage::Normalize,
                    "renamed, but content type is unrecognized",
                    Some(&target),
                ));
            }
            Err(e) => {
                sink.emit(Event::warn(
                    Stage::Normalize,
                    format!("renamed, but could not sniff content: {}", e),
                    Some(&target),
                ));
            }
        }
    }

    Ok(summary)
}

fn fail(summary: &mut NormalizeSummary, sink: &mut dyn EventSink, error: ExtractError) {
    let path = error.path().unwrap_or(Path::new("")).to_path_buf();
    sink.emit(Event::warn(
        Stage::Normalize,
        format!("rename skipped: {}", describe(&error)),
        Some(&path),
    ));
    summary.failed.push(SkippedEntry { path, error });
}
