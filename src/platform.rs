use crate::paths::UserIdentity;
use std::fs::File;
use std::io;
use std::path::Path;

/// Result of trying to broaden access to the store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    Granted,
    /// The facility ran and reported failure. The store may still be readable.
    Failed { code: Option<i32>, detail: String },
    /// This platform has no way to do it.
    Unsupported,
}

/// Operating-system capabilities the pipeline relies on.
pub trait PlatformOps {
    fn name(&self) -> &'static str;

    /// Recursively grant `user` full access under `root`. Advisory only: a
    /// later read failure is what actually decides the run.
    fn grant_access(&self, root: &Path, user: &UserIdentity) -> AccessOutcome;

    /// Open a store file for reading.
    fn open_source(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NativePlatform;

#[cfg(windows)]
impl PlatformOps for NativePlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn grant_access(&self, root: &Path, user: &UserIdentity) -> AccessOutcome {
        use std::process::Command;

        // (OI)(CI)F: full control, inherited by files and subfolders.
        // /T recurse, /C continue past errors, /Q quiet.
        let output = Command::new("icacls")
            .arg(root)
            .arg("/grant")
            .arg(format!("{}:(OI)(CI)F", user))
            .args(["/T", "/C", "/Q"])
            .output();

        match output {
            Ok(out) if out.status.success() => AccessOutcome::Granted,
            Ok(out) => AccessOutcome::Failed {
                code: out.status.code(),
                detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            },
            Err(e) => AccessOutcome::Failed {
                code: None,
                detail: format!("failed to run icacls: {}", e),
            },
        }
    }
}

#[cfg(not(windows))]
impl PlatformOps for NativePlatform {
    fn name(&self) -> &'static str {
        std::env::consts::OS
    }

    fn grant_access(&self, _root: &Path, _user: &UserIdentity) -> AccessOutcome {
        AccessOutcome::Unsupported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    #[test]
    fn elevation_is_reported_unsupported_off_windows() {
        let user = UserIdentity::new("alice").expect("user");
        assert_eq!(
            NativePlatform.grant_access(Path::new("/nowhere"), &user),
            AccessOutcome::Unsupported
        );
    }

    #[test]
    fn default_open_reports_missing_files() {
        let err = NativePlatform
            .open_source(Path::new("/definitely/not/here/ukg.db"))
            .expect_err("missing file opened");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
