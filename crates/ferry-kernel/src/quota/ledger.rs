//! Usage ledgers.

use dashmap::DashMap;

use super::QuotaError;

/// Tracked usage for one user or folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub files: u64,
    pub size: u64,
}

impl Usage {
    pub fn new(files: u64, size: u64) -> Self {
        Self { files, size }
    }

    /// Apply signed deltas, clamping at zero.
    pub fn apply(&mut self, files_delta: i64, size_delta: i64) {
        self.files = self.files.saturating_add_signed(files_delta);
        self.size = self.size.saturating_add_signed(size_delta);
    }
}

/// Usage store consulted by quota checks and updated by transfers.
///
/// Implementations linearize concurrent updates; callers never lock.
pub trait QuotaLedger: Send + Sync {
    /// Current usage of a user.
    fn user_usage(&self, username: &str) -> Result<Usage, QuotaError>;

    /// Current usage of a virtual folder.
    fn folder_usage(&self, folder: &str) -> Result<Usage, QuotaError>;

    /// Apply signed deltas to a user's usage.
    fn update_user(&self, username: &str, files_delta: i64, size_delta: i64)
        -> Result<(), QuotaError>;

    /// Apply signed deltas to a folder's usage.
    fn update_folder(&self, folder: &str, files_delta: i64, size_delta: i64)
        -> Result<(), QuotaError>;
}

/// In-process ledger.
///
/// Thread-safe via DashMap; each update holds only its own key's shard.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    users: DashMap<String, Usage>,
    folders: DashMap<String, Usage>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a user's usage, e.g. after a rescan.
    pub fn set_user_usage(&self, username: &str, usage: Usage) {
        self.users.insert(username.to_string(), usage);
    }

    /// Overwrite a folder's usage.
    pub fn set_folder_usage(&self, folder: &str, usage: Usage) {
        self.folders.insert(folder.to_string(), usage);
    }
}

impl QuotaLedger for MemoryLedger {
    fn user_usage(&self, username: &str) -> Result<Usage, QuotaError> {
        Ok(self.users.get(username).map(|u| *u).unwrap_or_default())
    }

    fn folder_usage(&self, folder: &str) -> Result<Usage, QuotaError> {
        Ok(self.folders.get(folder).map(|u| *u).unwrap_or_default())
    }

    fn update_user(
        &self,
        username: &str,
        files_delta: i64,
        size_delta: i64,
    ) -> Result<(), QuotaError> {
        self.users
            .entry(username.to_string())
            .or_default()
            .apply(files_delta, size_delta);
        Ok(())
    }

    fn update_folder(
        &self,
        folder: &str,
        files_delta: i64,
        size_delta: i64,
    ) -> Result<(), QuotaError> {
        self.folders
            .entry(folder.to_string())
            .or_default()
            .apply(files_delta, size_delta);
        Ok(())
    }
}
