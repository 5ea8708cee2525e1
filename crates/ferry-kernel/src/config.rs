//! Server configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! [transfers]
//! upload_mode = "atomic"
//! quota_tracking = true
//! disconnect_grace_secs = 120
//!
//! [[users]]
//! username = "amy"
//! uid = 1000
//! gid = 1000
//! quota_size = 1073741824
//!
//! [users.permissions]
//! "/" = ["*"]
//! "/readonly" = ["list", "download"]
//!
//! [users.filters."/photos"]
//! allowed_patterns = ["*.jpg", "*.png"]
//!
//! [[users.virtual_folders]]
//! name = "shared"
//! virtual_path = "/shared"
//! quota_size = 0
//! included_in_user_quota = false
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::constants::{DEFAULT_DISCONNECT_GRACE, ROOT_DIR};
use crate::permissions::{FileFilter, FileFilters, PatternFilter, Permission, PermissionRules};
use crate::planner::UploadMode;
use crate::user::{UserProfile, VirtualFolder};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("user {user:?}: no permissions configured for {ROOT_DIR:?}")]
    MissingRootPermissions { user: String },

    #[error("user {user:?}: path {path:?} must be absolute")]
    RelativePath { user: String, path: String },

    #[error("user {user:?}: virtual folder {name:?} cannot be mounted on {ROOT_DIR:?}")]
    FolderOnRoot { user: String, name: String },

    #[error("duplicate user {0:?}")]
    DuplicateUser(String),

    #[error("user {user:?}: invalid file pattern: {source}")]
    InvalidPattern {
        user: String,
        #[source]
        source: globset::Error,
    },
}

/// Transfer behavior shared by all sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// How overwrites are made visible.
    pub upload_mode: UploadMode,
    /// Whether usage is tracked and limits enforced.
    pub quota_tracking: bool,
    /// Grace period armed on the connection at disconnect.
    pub disconnect_grace_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            upload_mode: UploadMode::Standard,
            quota_tracking: true,
            disconnect_grace_secs: DEFAULT_DISCONNECT_GRACE.as_secs(),
        }
    }
}

impl TransferSettings {
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}

/// One configured user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub quota_size: u64,
    #[serde(default)]
    pub quota_files: u64,
    /// Virtual directory to permission names.
    #[serde(default)]
    pub permissions: BTreeMap<String, Vec<Permission>>,
    /// Virtual directory to file allow-list.
    #[serde(default)]
    pub filters: BTreeMap<String, FileFilter>,
    #[serde(default)]
    pub virtual_folders: Vec<VirtualFolder>,
}

impl UserConfig {
    /// Check the invariants a profile relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let user = || self.username.clone();

        if !self.permissions.contains_key(ROOT_DIR) {
            return Err(ConfigError::MissingRootPermissions { user: user() });
        }
        for path in self.permissions.keys().chain(self.filters.keys()) {
            if !path.starts_with('/') {
                return Err(ConfigError::RelativePath {
                    user: user(),
                    path: path.clone(),
                });
            }
        }
        for folder in &self.virtual_folders {
            if !folder.virtual_path.starts_with('/') {
                return Err(ConfigError::RelativePath {
                    user: user(),
                    path: folder.virtual_path.clone(),
                });
            }
            if crate::vpath::clean(&folder.virtual_path) == ROOT_DIR {
                return Err(ConfigError::FolderOnRoot {
                    user: user(),
                    name: folder.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Build the runtime profile.
    pub fn to_profile(&self) -> Result<UserProfile, ConfigError> {
        self.validate()?;

        let permissions = self
            .permissions
            .iter()
            .fold(PermissionRules::new(), |rules, (dir, perms)| {
                rules.with_dir(dir, perms.iter().copied())
            });

        let mut filters = FileFilters::new();
        for (dir, filter) in &self.filters {
            let compiled =
                PatternFilter::compile(filter).map_err(|source| ConfigError::InvalidPattern {
                    user: self.username.clone(),
                    source,
                })?;
            filters = filters.with_dir(dir, compiled);
        }

        let profile = self.virtual_folders.iter().fold(
            UserProfile::new(&self.username)
                .with_ids(self.uid, self.gid)
                .with_quota(self.quota_size, self.quota_files)
                .with_permissions(permissions)
                .with_filters(filters),
            |profile, folder| {
                profile.with_virtual_folder(VirtualFolder {
                    virtual_path: crate::vpath::clean(&folder.virtual_path),
                    ..folder.clone()
                })
            },
        );
        Ok(profile)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub transfers: TransferSettings,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl ServerConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("loading config {}", path.display()))?;
        tracing::info!(path = %path.display(), users = config.users.len(), "config loaded");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for user in &self.users {
            if !seen.insert(user.username.as_str()) {
                return Err(ConfigError::DuplicateUser(user.username.clone()));
            }
            user.validate()?;
        }
        Ok(())
    }

    /// Look up a user's configuration.
    pub fn user(&self, username: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Build the profile for `username`, if configured.
    pub fn profile(&self, username: &str) -> Option<Result<UserProfile, ConfigError>> {
        self.user(username).map(UserConfig::to_profile)
    }
}
