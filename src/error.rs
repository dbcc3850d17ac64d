use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Everything that can stop an extraction run.
///
/// Per-item failures in the best-effort stages (image copy, image rename) are
/// reported through events instead and never surface here.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("could not determine the current user: {reason}")]
    IdentityUnavailable { reason: String },

    #[error("capture store not present at {}", path.display())]
    StoreNotPresent { path: PathBuf },

    #[error("capture store is incomplete, missing {}", path.display())]
    StoreIncomplete { path: PathBuf },

    #[error("access denied: {}", path.display())]
    AccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("path too long: {}", path.display())]
    PathTooLong {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O failure on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "copy of {} does not match its source (read {read} bytes, wrote {written})",
        path.display()
    )]
    CopyMismatch {
        path: PathBuf,
        read: u64,
        written: u64,
    },

    #[error("failed to open database {}: {message}", path.display())]
    Database { path: PathBuf, message: String },

    #[error("capture table unreadable in {}: {message}", path.display())]
    Schema { path: PathBuf, message: String },
}

impl ExtractError {
    /// Classify an OS error against the path it happened on.
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        if source.kind() == io::ErrorKind::PermissionDenied {
            ExtractError::AccessDenied { path, source }
        } else if is_name_too_long(&source) {
            ExtractError::PathTooLong { path, source }
        } else {
            ExtractError::Io { path, source }
        }
    }

    pub fn tag(&self) -> OutcomeTag {
        match self {
            ExtractError::IdentityUnavailable { .. } => OutcomeTag::IdentityUnavailable,
            ExtractError::StoreNotPresent { .. } => OutcomeTag::StoreNotPresent,
            ExtractError::StoreIncomplete { .. } => OutcomeTag::StoreIncomplete,
            ExtractError::AccessDenied { .. } => OutcomeTag::AccessDenied,
            ExtractError::PathTooLong { .. } => OutcomeTag::PathTooLong,
            ExtractError::Io { .. } | ExtractError::CopyMismatch { .. } => OutcomeTag::IoFailure,
            ExtractError::Database { .. } => OutcomeTag::DatabaseUnavailable,
            ExtractError::Schema { .. } => OutcomeTag::SchemaMismatch,
        }
    }

    /// The path the failure is about, when there is one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ExtractError::IdentityUnavailable { .. } => None,
            ExtractError::StoreNotPresent { path }
            | ExtractError::StoreIncomplete { path }
            | ExtractError::AccessDenied { path, .. }
            | ExtractError::PathTooLong { path, .. }
            | ExtractError::Io { path, .. }
            | ExtractError::CopyMismatch { path, .. }
            | ExtractError::Database { path, .. }
            | ExtractError::Schema { path, .. } => Some(path),
        }
    }
}

/// An error followed by its chain of causes, `outer: inner: root`.
pub fn describe(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut cause = err.source();
    while let Some(c) = cause {
        out.push_str(": ");
        out.push_str(&c.to_string());
        cause = c.source();
    }
    out
}

fn is_name_too_long(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::InvalidFilename {
        return true;
    }
    // ENAMETOOLONG on Linux / macOS, ERROR_FILENAME_EXCED_RANGE on Windows.
    #[cfg(target_os = "linux")]
    const NAME_TOO_LONG: i32 = 36;
    #[cfg(target_os = "macos")]
    const NAME_TOO_LONG: i32 = 63;
    #[cfg(windows)]
    const NAME_TOO_LONG: i32 = 206;
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    const NAME_TOO_LONG: i32 = -1;
    err.raw_os_error() == Some(NAME_TOO_LONG)
}

/// Stable, script-friendly label for how a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeTag {
    Success,
    SuccessWithWarnings,
    Declined,
    IdentityUnavailable,
    StoreNotPresent,
    StoreIncomplete,
    AccessDenied,
    PathTooLong,
    IoFailure,
    DatabaseUnavailable,
    SchemaMismatch,
}

impl OutcomeTag {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeTag::Success => "success",
            OutcomeTag::SuccessWithWarnings => "success-with-warnings",
            OutcomeTag::Declined => "declined",
            OutcomeTag::IdentityUnavailable => "identity-unavailable",
            OutcomeTag::StoreNotPresent => "store-not-present",
            OutcomeTag::StoreIncomplete => "store-incomplete",
            OutcomeTag::AccessDenied => "access-denied",
            OutcomeTag::PathTooLong => "path-too-long",
            OutcomeTag::IoFailure => "io-failure",
            OutcomeTag::DatabaseUnavailable => "database-unavailable",
            OutcomeTag::SchemaMismatch => "schema-mismatch",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            OutcomeTag::Success | OutcomeTag::Declined => 0,
            OutcomeTag::SuccessWithWarnings => 3,
            OutcomeTag::StoreNotPresent => 10,
            OutcomeTag::StoreIncomplete => 11,
            OutcomeTag::AccessDenied => 12,
            OutcomeTag::PathTooLong => 13,
            OutcomeTag::IoFailure => 14,
            OutcomeTag::DatabaseUnavailable => 15,
            OutcomeTag::SchemaMismatch => 16,
            OutcomeTag::IdentityUnavailable => 17,
        }
    }

    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            OutcomeTag::Success | OutcomeTag::SuccessWithWarnings | OutcomeTag::Declined
        )
    }
}

impl std::fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
