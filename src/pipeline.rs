use crate::copier::{self, CopyReport, DirCopySummary};
use crate::error::{ExtractError, OutcomeTag, describe};
use crate::events::{Event, EventSink, Level, Stage};
use crate::normalize::{self, MarkerMatch, NormalizeSummary};
use crate::paths::{self, DATABASE_FILE, IMAGE_STORE_DIR, StoreLocator, StorePaths, UserIdentity};
use crate::platform::{AccessOutcome, PlatformOps};
use crate::records::{CaptureRecord, RecordFilter, RecordReader};
use chrono::NaiveDateTime;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const FOLDER_SUFFIX: &str = "_Extraction";
const MAX_FOLDER_ATTEMPTS: u32 = 1000;
/// SQLite write-ahead log holding not-yet-checkpointed pages. The `-shm`
/// index is left behind; SQLite rebuilds it from the log.
const DATABASE_JOURNALS: [&str; 1] = ["-wal"];

/// Everything a run needs, independent of how it was gathered.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Profile whose store is extracted.
    pub user: UserIdentity,
    /// Account running the extraction, which the permission change is for.
    /// `None` skips the change.
    pub grantee: Option<UserIdentity>,
    pub locator: StoreLocator,
    /// Directory the extraction folder is created in.
    pub output_dir: PathBuf,
    pub filter: RecordFilter,
    pub marker: MarkerMatch,
    /// Local wall clock, read once the run is confirmed to name the
    /// extraction folder.
    pub clock: fn() -> NaiveDateTime,
}

#[derive(Debug)]
pub enum Completion {
    Extracted(ExtractionReport),
    Declined,
}

impl Completion {
    pub fn tag(&self) -> OutcomeTag {
        match self {
            Completion::Extracted(report) => report.tag(),
            Completion::Declined => OutcomeTag::Declined,
        }
    }
}

#[derive(Debug)]
pub struct ExtractionReport {
    /// Absolute path of the extraction folder.
    pub folder: PathBuf,
    pub store: StorePaths,
    pub database: CopyReport,
    /// `None` when the image store could not be copied at all.
    pub images: Option<DirCopySummary>,
    pub normalized: Option<NormalizeSummary>,
    pub records: usize,
    pub warnings: usize,
}

impl ExtractionReport {
    pub fn tag(&self) -> OutcomeTag {
        if self.warnings == 0 {
            OutcomeTag::Success
        } else {
            OutcomeTag::SuccessWithWarnings
        }
    }
}

/// A run that stopped early. `folder` is set once the extraction folder
/// exists, and whatever was copied into it is left there.
#[derive(Debug)]
pub struct PipelineFailure {
    pub error: ExtractError,
    pub folder: Option<PathBuf>,
}

impl PipelineFailure {
    pub fn tag(&self) -> OutcomeTag {
        self.error.tag()
    }
}

/// Counts warnings on their way to the real sink.
struct Tally<'a> {
    inner: &'a mut dyn EventSink,
    warnings: usize,
}

impl EventSink for Tally<'_> {
    fn emit(&mut self, event: Event) {
        if event.level >= Level::Warn {
            self.warnings += 1;
        }
        self.inner.emit(event);
    }
}

/// Locate, gate, snapshot, normalize and list one capture store.
///
/// `confirm` is asked once the store is known to be complete; returning
/// `false` ends the run before anything is written. Every record read from
/// the copied database is handed to `on_record` in table order.
pub fn run(
    config: &ExtractConfig,
    ops: &dyn PlatformOps,
    sink: &mut dyn EventSink,
    confirm: &mut dyn FnMut(&StorePaths) -> bool,
    on_record: &mut dyn FnMut(&CaptureRecord),
) -> Result<Completion, PipelineFailure> {
    let mut sink = Tally {
        inner: sink,
        warnings: 0,
    };
    let sink = &mut sink;

    let store = match locate(config, ops, sink) {
        Ok(store) => store,
        Err(error) => return Err(abort(sink, Stage::Gate, error, None)),
    };

    if !confirm(&store) {
        sink.emit(Event::info(Stage::Gate, "extraction declined", None));
        return Ok(Completion::Declined);
    }

    let started_at = (config.clock)();
    let folder = match create_extraction_folder(&config.output_dir, started_at) {
        Ok(folder) => folder,
        Err(error) => return Err(abort(sink, Stage::Copy, error, None)),
    };
    sink.emit(Event::info(
        Stage::Copy,
        "extraction folder created",
        Some(&folder),
    ));

    let (database, images, normalized, records) =
        match populate(config, ops, sink, &store, &folder, on_record) {
            Ok(populated) => populated,
            Err((stage, error)) => return Err(abort(sink, stage, error, Some(folder))),
        };
    Ok(Completion::Extracted(ExtractionReport {
        folder,
        store,
        database,
        images,
        normalized,
        records,
        warnings: sink.warnings,
    }))
}

type Populated = (
    CopyReport,
    Option<DirCopySummary>,
    Option<NormalizeSummary>,
    usize,
);

fn populate(
    config: &ExtractConfig,
    ops: &dyn PlatformOps,
    sink: &mut dyn EventSink,
    store: &StorePaths,
    folder: &Path,
    on_record: &mut dyn FnMut(&CaptureRecord),
) -> Result<Populated, (Stage, ExtractError)> {
    let db_copy = folder.join(DATABASE_FILE);
    let database = copier::copy_file(ops, &store.database_path, &db_copy)
        .map_err(|e| (Stage::Copy, e))?;
    sink.emit(Event::info(
        Stage::Copy,
        format!("database copied, {} bytes, sha256 {}", database.bytes, database.sha256),
        Some(&db_copy),
    ));
    copy_journals(ops, sink, &store.database_path, &db_copy);

    let image_copy = folder.join(IMAGE_STORE_DIR);
    let images = match copier::copy_directory(ops, &store.image_store_path, &image_copy, sink) {
        Ok(summary) => {
            sink.emit(Event::info(
                Stage::Copy,
                format!(
                    "image store copied, {} files, {} skipped",
                    summary.files_copied,
                    summary.skipped.len()
                ),
                Some(&image_copy),
            ));
            Some(summary)
        }
        Err(e) => {
            sink.emit(Event::warn(
                Stage::Copy,
                format!("image store not copied: {}", describe(&e)),
                Some(&store.image_store_path),
            ));
            None
        }
    };

    let normalized = if images.is_some() {
        match normalize::normalize_images(&image_copy, config.marker, sink) {
            Ok(summary) => {
                sink.emit(Event::info(
                    Stage::Normalize,
                    format!(
                        "{} renamed, {} already named, {} failed",
                        summary.renamed,
                        summary.untouched,
                        summary.failed.len()
                    ),
                    Some(&image_copy),
                ));
                Some(summary)
            }
            Err(e) => {
                sink.emit(Event::warn(
                    Stage::Normalize,
                    format!("image names not normalized: {}", describe(&e)),
                    Some(&image_copy),
                ));
                None
            }
        }
    } else {
        None
    };

    let records =
        list_records(&db_copy, &config.filter, on_record).map_err(|e| (Stage::Records, e))?;
    sink.emit(Event::info(
        Stage::Records,
        format!("{} records read", records),
        Some(&db_copy),
    ));

    Ok((database, images, normalized, records))
}

/// Resolve the store, run the existence gate and try to open up access.
fn locate(
    config: &ExtractConfig,
    ops: &dyn PlatformOps,
    sink: &mut dyn EventSink,
) -> Result<StorePaths, ExtractError> {
    let mut store = config.locator.resolve(&config.user);
    sink.emit(Event::info(
        Stage::Resolve,
        format!("store root for {}", config.user),
        Some(&store.root),
    ));

    // The root is checked first: without it the feature was never enabled,
    // which is a different story from a damaged install.
    match fs::metadata(&store.root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(ExtractError::StoreNotPresent { path: store.root }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ExtractError::StoreNotPresent { path: store.root });
        }
        Err(e) => return Err(ExtractError::from_io(&store.root, e)),
    }

    match &config.grantee {
        Some(grantee) => report_access(ops, sink, &store.root, grantee),
        None => sink.emit(Event::warn(
            Stage::Elevate,
            "current account unknown, permission change skipped",
            Some(&store.root),
        )),
    }

    if !store.database_path.is_file() {
        let folder = paths::discover_store_folder(&store.root)
            .map_err(|e| ExtractError::from_io(&store.root, e))?;
        if let Some(folder) = folder {
            store = store.rebased(&folder);
            sink.emit(Event::info(
                Stage::Gate,
                "store folder found",
                Some(&store.root.join(&folder)),
            ));
        }
    }

    if !store.database_path.is_file() {
        return Err(ExtractError::StoreIncomplete {
            path: store.database_path,
        });
    }
    if !store.image_store_path.is_dir() {
        return Err(ExtractError::StoreIncomplete {
            path: store.image_store_path,
        });
    }

    sink.emit(Event::info(Stage::Gate, "capture store found", Some(&store.root)));
    Ok(store)
}

fn report_access(
    ops: &dyn PlatformOps,
    sink: &mut dyn EventSink,
    root: &Path,
    grantee: &UserIdentity,
) {
    match ops.grant_access(root, grantee) {
        AccessOutcome::Granted => sink.emit(Event::info(
            Stage::Elevate,
            format!("access granted to {}", grantee),
            Some(root),
        )),
        AccessOutcome::Failed { code, detail } => sink.emit(Event::warn(
            Stage::Elevate,
            match code {
                Some(code) => format!("permission change exited with {}: {}", code, detail),
                None => format!("permission change failed: {}", detail),
            },
            Some(root),
        )),
        AccessOutcome::Unsupported => sink.emit(Event::info(
            Stage::Elevate,
            format!("permission change not supported on {}", ops.name()),
            Some(root),
        )),
    }
}

/// Copy the database's journal files alongside it, when there are any.
fn copy_journals(ops: &dyn PlatformOps, sink: &mut dyn EventSink, database: &Path, copy: &Path) {
    for suffix in DATABASE_JOURNALS {
        let source = with_suffix(database, suffix);
        if !source.is_file() {
            continue;
        }
        let destination = with_suffix(copy, suffix);
        match copier::copy_file(ops, &source, &destination) {
            Ok(_) => sink.emit(Event::info(Stage::Copy, "journal copied", Some(&destination))),
            Err(e) => sink.emit(Event::warn(
                Stage::Copy,
                format!("journal not copied, recent captures may be missing: {}", describe(&e)),
                Some(&source),
            )),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn list_records(
    database: &Path,
    filter: &RecordFilter,
    on_record: &mut dyn FnMut(&CaptureRecord),
) -> Result<usize, ExtractError> {
    let reader = RecordReader::open(database)?;
    let mut query = reader.query(filter)?;
    let mut count = 0;
    for record in query.records()? {
        on_record(&record?);
        count += 1;
    }
    Ok(count)
}

/// `YYYY-MM-DD-HH-MM_Extraction`, then `-2`, `-3`, ... if that minute is taken.
pub fn extraction_folder_name(started_at: NaiveDateTime, attempt: u32) -> String {
    let base = format!("{}{}", started_at.format("%Y-%m-%d-%H-%M"), FOLDER_SUFFIX);
    if attempt <= 1 {
        base
    } else {
        format!("{}-{}", base, attempt)
    }
}

/// Create a fresh, never-before-used extraction folder under `output_dir`.
pub fn create_extraction_folder(
    output_dir: &Path,
    started_at: NaiveDateTime,
) -> Result<PathBuf, ExtractError> {
    fs::create_dir_all(output_dir).map_err(|e| ExtractError::from_io(output_dir, e))?;
    let output_dir =
        std::path::absolute(output_dir).map_err(|e| ExtractError::from_io(output_dir, e))?;

    for attempt in 1..=MAX_FOLDER_ATTEMPTS {
        let folder = output_dir.join(extraction_folder_name(started_at, attempt));
        match fs::create_dir(&folder) {
            Ok(()) => return Ok(folder),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(ExtractError::from_io(&folder, e)),
        }
    }

    let last = output_dir.join(extraction_folder_name(started_at, MAX_FOLDER_ATTEMPTS));
    Err(ExtractError::Io {
        path: last,
        source: io::Error::new(
            io::ErrorKind::AlreadyExists,
            "no free extraction folder name left for this minute",
        ),
    })
}

fn abort(
    sink: &mut dyn EventSink,
    stage: Stage,
    error: ExtractError,
    folder: Option<PathBuf>,
) -> PipelineFailure {
    sink.emit(Event::error(stage, describe(&error), error.path()));
    PipelineFailure { error, folder }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .and_then(|d| d.and_hms_opt(h, m, 42))
            .expect("valid time")
    }

    #[test]
    fn folder_name_uses_minute_granularity() {
        assert_eq!(extraction_folder_name(at(8, 5), 1), "2026-10-19-08-05_Extraction");
        assert_eq!(extraction_folder_name(at(8, 5), 3), "2026-10-19-08-05_Extraction-3");
    }

    #[test]
    fn same_minute_runs_get_distinct_folders() {
        let dir = TempDir::new().expect("tempdir");
        let first = create_extraction_folder(dir.path(), at(9, 0)).expect("first");
        let second = create_extraction_folder(dir.path(), at(9, 0)).expect("second");
        let third = create_extraction_folder(dir.path(), at(9, 1)).expect("third");

        assert_ne!(first, second);
        assert!(first.ends_with("2026-10-19-09-00_Extraction"));
        assert!(second.ends_with("2026-10-19-09-00_Extraction-2"));
        assert!(third.ends_with("2026-10-19-09-01_Extraction"));
        assert!(first.is_absolute());
        assert!(first.is_dir() && second.is_dir() && third.is_dir());
    }

    #[test]
    fn output_dir_is_created_when_missing() {
        let dir = TempDir::new().expect("tempdir");
        let out = dir.path().join("cases/0042");
        let folder = create_extraction_folder(&out, at(10, 10)).expect("create");
        assert_eq!(folder.parent(), Some(out.as_path()));
    }

    #[test]
    fn journal_names_append_to_full_file_name() {
        assert_eq!(
            with_suffix(Path::new("/x/ukg.db"), "-wal"),
            Path::new("/x/ukg.db-wal")
        );
    }
}
