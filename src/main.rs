use chrono::{Local, NaiveDateTime};
use clap::Parser;
use env_logger::Builder;
use eyre::{Context, Result, eyre};
use log::LevelFilter;
use recall_dump::error::describe;
use recall_dump::events::{Event, EventSink, Level};
use recall_dump::normalize::MarkerMatch;
use recall_dump::paths::{StoreLocator, StorePaths, UserIdentity};
use recall_dump::platform::NativePlatform;
use recall_dump::records::{CaptureRecord, RecordFilter};
use recall_dump::{Completion, ExtractConfig, ExtractError, OutcomeTag, pipeline};
use std::io::{self, BufRead, BufWriter, IsTerminal, Write};
use std::path::PathBuf;

/// Extract the Windows Recall capture store (ukg.db + ImageStore) into a
/// timestamped folder and list the captured windows.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Only list captures from this date on (YYYY-MM-DD, local time).
    #[arg(short, long, value_name = "DATE")]
    from: Option<String>,

    /// Only list captures up to and including this date (YYYY-MM-DD, local time).
    #[arg(short, long, value_name = "DATE")]
    to: Option<String>,

    /// Only list captures whose window title contains this text.
    #[arg(short, long, value_name = "TEXT")]
    search: Option<String>,

    /// Account whose store to extract.
    /// Defaults to USERNAME (or USER).
    #[arg(long, value_name = "NAME")]
    user: Option<String>,

    /// Directory holding user profiles, e.g. the Users folder of a mounted image.
    /// Defaults to the parent of your home directory.
    #[arg(long, value_name = "PATH")]
    profiles_dir: Option<PathBuf>,

    /// Where to create the extraction folder.
    #[arg(short, long, value_name = "PATH", default_value = ".")]
    output_dir: PathBuf,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    yes: bool,

    /// Only treat names ending in .jpg as already renamed
    /// (default: .jpg anywhere in the name).
    #[arg(long)]
    strict_ext: bool,

    /// Print records as JSON lines.
    #[arg(long)]
    json: bool,

    /// Show every step, with paths.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only show warnings and errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Sends pipeline events to the `log` facade.
struct LogSink {
    with_paths: bool,
}

impl EventSink for LogSink {
    fn emit(&mut self, event: Event) {
        let level = match event.level {
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
        };
        match &event.path {
            Some(path) if self.with_paths || event.level > Level::Info => log::log!(
                level,
                "[{}] {} ({})",
                event.stage.as_str(),
                event.message,
                path.display()
            ),
            _ => log::log!(level, "[{}] {}", event.stage.as_str(), event.message),
        }
    }
}

fn init_logger(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn ask_to_proceed(store: &StorePaths) -> bool {
    let stderr = io::stderr();
    let mut err = stderr.lock();
    let _ = write!(
        err,
        "Recall store found at {}. Proceed with the extraction? (yes/no): ",
        store.root.display()
    );
    let _ = err.flush();

    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    is_affirmative(&answer)
}

/// `yes`, or its usual short form `y`, in any case.
fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "yes" | "y")
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn format_record(record: &CaptureRecord) -> String {
    format!(
        "Window Title: {}, Timestamp: {}, Image Token: {}",
        record.window_title.as_deref().unwrap_or(""),
        record.timestamp.map(|t| t.to_string()).unwrap_or_default(),
        record.image_token.as_deref().unwrap_or("")
    )
}

fn resolve_user(cli: &Cli) -> Result<UserIdentity, ExtractError> {
    match &cli.user {
        Some(name) => UserIdentity::new(name.as_str()),
        None => UserIdentity::from_env(),
    }
}

fn build_config(cli: &Cli, user: UserIdentity) -> Result<ExtractConfig> {
    let locator = cli
        .profiles_dir
        .clone()
        .map(StoreLocator::new)
        .or_else(StoreLocator::from_home)
        .ok_or_else(|| {
            eyre!("Could not determine the profiles directory.\nUse --profiles-dir to specify it manually.")
        })?;

    let filter = RecordFilter::from_args(
        cli.from.as_deref(),
        cli.to.as_deref(),
        cli.search.as_deref(),
        &Local,
    )
    .wrap_err("Invalid record filter")?;

    Ok(ExtractConfig {
        user,
        // Access is opened up for whoever runs the tool, not the profile read.
        grantee: UserIdentity::from_env().ok(),
        locator,
        output_dir: cli.output_dir.clone(),
        filter,
        marker: if cli.strict_ext {
            MarkerMatch::Suffix
        } else {
            MarkerMatch::Contains
        },
        clock: local_now,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli);

    // 1. Resolve configuration (CLI > environment > defaults)
    let user = match resolve_user(&cli) {
        Ok(user) => user,
        Err(e) => {
            log::error!("{}\nUse --user to name the account explicitly.", e);
            log::info!("Outcome: {}", e.tag());
            std::process::exit(e.tag().exit_code());
        }
    };
    let config = build_config(&cli, user)?;

    // 2. Refuse to block on a prompt nobody can answer
    let interactive = io::stdin().is_terminal();
    if !cli.yes && !interactive {
        log::warn!("stdin is not a terminal; pass --yes to extract without confirmation");
    }

    // 3. Run the pipeline, streaming records to stdout
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut write_error: Option<io::Error> = None;
    let mut on_record = |record: &CaptureRecord| {
        if write_error.is_some() {
            return;
        }
        let line = if cli.json {
            serde_json::to_string(record).map_err(io::Error::other)
        } else {
            Ok(format_record(record))
        };
        if let Err(e) = line.and_then(|l| writeln!(out, "{}", l)) {
            write_error = Some(e);
        }
    };
    let mut confirm = |store: &StorePaths| cli.yes || (interactive && ask_to_proceed(store));
    let mut sink = LogSink {
        with_paths: cli.verbose,
    };

    let result = pipeline::run(
        &config,
        &NativePlatform,
        &mut sink,
        &mut confirm,
        &mut on_record,
    );
    out.flush().wrap_err("Failed to write records")?;
    drop(out);
    if let Some(e) = write_error {
        return Err(e).wrap_err("Failed to write records");
    }

    // 4. Report how it ended
    let tag = match result {
        Ok(Completion::Extracted(report)) => {
            let (copied, skipped) = report
                .images
                .as_ref()
                .map(|i| (i.files_copied, i.skipped.len()))
                .unwrap_or((0, 0));
            let renamed = report.normalized.as_ref().map(|n| n.renamed).unwrap_or(0);
            log::info!(
                "Done. {} records, {} images copied ({} skipped, {} renamed), ukg.db sha256 {}",
                report.records,
                copied,
                skipped,
                renamed,
                report.database.sha256
            );
            eprintln!("Full extraction folder path: {}", report.folder.display());
            report.tag()
        }
        Ok(Completion::Declined) => {
            log::warn!("Extraction aborted.");
            OutcomeTag::Declined
        }
        Err(failure) => {
            log::error!("{}", describe(&failure.error));
            if let Some(folder) = &failure.folder {
                eprintln!("Partial extraction folder path: {}", folder.display());
            }
            failure.tag()
        }
    };

    log::info!("Outcome: {}", tag);
    if tag.exit_code() != 0 {
        std::process::exit(tag.exit_code());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_print_absent_fields_as_empty() {
        let record = CaptureRecord {
            window_title: None,
            timestamp: Some(1001),
            image_token: Some("tok2".into()),
        };
        assert_eq!(
            format_record(&record),
            "Window Title: , Timestamp: 1001, Image Token: tok2"
        );
    }

    #[test]
    fn short_flags_match_the_classic_interface() {
        let cli = Cli::try_parse_from([
            "recall-dump",
            "-f",
            "2024-06-01",
            "-t",
            "2024-06-02",
            "-s",
            "Bank",
            "--user",
            "alice",
            "--profiles-dir",
            "/mnt/Users",
            "-y",
        ])
        .expect("parse");
        let user = resolve_user(&cli).expect("user");
        let config = build_config(&cli, user).expect("config");
        assert_eq!(config.user.as_str(), "alice");
        assert_eq!(config.filter.search.as_deref(), Some("Bank"));
        assert!(config.filter.from_ms.is_some() && config.filter.to_ms.is_some());
        assert_eq!(config.marker, MarkerMatch::Contains);
        assert!(cli.yes);
    }

    #[test]
    fn bad_dates_are_rejected_before_anything_runs() {
        let cli = Cli::try_parse_from(["recall-dump", "-f", "yesterday", "--user", "alice"])
            .expect("parse");
        let user = resolve_user(&cli).expect("user");
        assert!(build_config(&cli, user).is_err());
    }

    #[test]
    fn unusable_user_names_are_identity_failures() {
        let cli = Cli::try_parse_from(["recall-dump", "--user", "../bob"]).expect("parse");
        let err = resolve_user(&cli).expect_err("accepted");
        assert_eq!(err.tag(), OutcomeTag::IdentityUnavailable);
    }

    #[test]
    fn prompt_accepts_yes_and_y_only() {
        for answer in ["yes\n", "YES\r\n", " y ", "Y"] {
            assert!(is_affirmative(answer), "{answer:?}");
        }
        for answer in ["", "\n", "no", "n", "yess", "sure"] {
            assert!(!is_affirmative(answer), "{answer:?}");
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
