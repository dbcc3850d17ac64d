use crate::error::ExtractError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DATABASE_FILE: &str = "ukg.db";
pub const IMAGE_STORE_DIR: &str = "ImageStore";

/// Location of the store root relative to a user profile directory.
const STORE_ROOT: [&str; 4] = ["AppData", "Local", "CoreAIPlatform.00", "UKP"];

/// Name of the account whose capture store is being extracted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserIdentity(String);

impl UserIdentity {
    pub fn new(name: impl Into<String>) -> Result<Self, ExtractError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(ExtractError::IdentityUnavailable {
                reason: "user name is empty".to_string(),
            });
        }
        // The name becomes a single path component.
        if trimmed == "."
            || trimmed == ".."
            || trimmed.contains(['/', '\\', '\0'])
        {
            return Err(ExtractError::IdentityUnavailable {
                reason: format!("{:?} is not a valid user name", trimmed),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// `USERNAME` (Windows), falling back to `USER`.
    pub fn from_env() -> Result<Self, ExtractError> {
        let name = std::env::var("USERNAME")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| ExtractError::IdentityUnavailable {
                reason: "neither USERNAME nor USER is set".to_string(),
            })?;
        Self::new(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where user profiles live (`C:\Users` on a normal install, or a mounted
/// image's `Users` directory for offline work).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocator {
    profiles_dir: PathBuf,
}

impl StoreLocator {
    pub fn new(profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            profiles_dir: profiles_dir.into(),
        }
    }

    /// The parent of the current home directory.
    pub fn from_home() -> Option<Self> {
        dirs::home_dir()
            .and_then(|home| home.parent().map(Path::to_path_buf))
            .map(Self::new)
    }

    pub fn profiles_dir(&self) -> &Path {
        &self.profiles_dir
    }

    /// Compute the store locations for `user`. Touches no filesystem.
    pub fn resolve(&self, user: &UserIdentity) -> StorePaths {
        let mut root = self.profiles_dir.join(user.as_str());
        root.extend(STORE_ROOT);
        StorePaths::at_root(root)
    }
}

/// Expected on-disk locations of the capture store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub root: PathBuf,
    pub database_path: PathBuf,
    pub image_store_path: PathBuf,
}

impl StorePaths {
    /// Database and image store directly under `root`.
    pub fn at_root(root: PathBuf) -> Self {
        Self {
            database_path: root.join(DATABASE_FILE),
            image_store_path: root.join(IMAGE_STORE_DIR),
            root,
        }
    }

    /// Same root, with the database and image store inside `folder`.
    pub fn rebased(&self, folder: &Path) -> Self {
        let dir = self.root.join(folder);
        Self {
            root: self.root.clone(),
            database_path: dir.join(DATABASE_FILE),
            image_store_path: dir.join(IMAGE_STORE_DIR),
        }
    }
}

/// Find the per-install subfolder of `root` that holds the database.
///
/// Installs keep everything in one GUID-named folder below the root. When
/// several candidates exist the lexicographically first wins so repeated runs
/// agree.
pub fn discover_store_folder(root: &Path) -> io::Result<Option<PathBuf>> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(root)?
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| e.path().join(DATABASE_FILE).is_file())
        .map(|e| PathBuf::from(e.file_name()))
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}
