//! User profile: identity, quota limits, permissions and virtual folders.
//!
//! A profile is immutable once built and shared by `Arc` between a session
//! and every component that needs it.

use serde::{Deserialize, Serialize};

use crate::permissions::{FileFilters, Permission, PermissionRules};
use crate::vpath;

/// A mapped sub-tree with its own quota limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFolder {
    /// Ledger key for the folder.
    pub name: String,
    /// Virtual directory the folder is mounted on.
    pub virtual_path: String,
    /// Size limit in bytes, 0 for none.
    #[serde(default)]
    pub quota_size: u64,
    /// File count limit, 0 for none.
    #[serde(default)]
    pub quota_files: u64,
    /// Whether usage here also counts toward the owning user's quota.
    #[serde(default)]
    pub included_in_user_quota: bool,
}

impl VirtualFolder {
    /// Create a folder without limits that counts toward the user quota.
    pub fn new(name: impl Into<String>, virtual_path: &str) -> Self {
        Self {
            name: name.into(),
            virtual_path: vpath::clean(virtual_path),
            quota_size: 0,
            quota_files: 0,
            included_in_user_quota: true,
        }
    }

    /// Set own quota limits.
    pub fn with_quota(mut self, size: u64, files: u64) -> Self {
        self.quota_size = size;
        self.quota_files = files;
        self
    }

    /// Set whether the folder counts toward the user quota.
    pub fn included_in_user_quota(mut self, included: bool) -> Self {
        self.included_in_user_quota = included;
        self
    }

    /// True when neither limit applies. The file limit only matters when
    /// files are being counted.
    pub fn has_no_quota_restrictions(&self, check_files: bool) -> bool {
        self.quota_size == 0 && (!check_files || self.quota_files == 0)
    }
}

/// An authenticated user's profile.
#[derive(Debug, Clone)]
pub struct UserProfile {
    username: String,
    uid: u32,
    gid: u32,
    quota_size: u64,
    quota_files: u64,
    permissions: PermissionRules,
    filters: FileFilters,
    virtual_folders: Vec<VirtualFolder>,
}

impl UserProfile {
    /// Create a profile with no permissions, limits or folders.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            uid: 0,
            gid: 0,
            quota_size: 0,
            quota_files: 0,
            permissions: PermissionRules::new(),
            filters: FileFilters::new(),
            virtual_folders: Vec::new(),
        }
    }

    /// Set the ids propagated onto created paths.
    pub fn with_ids(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Set the user quota.
    pub fn with_quota(mut self, size: u64, files: u64) -> Self {
        self.quota_size = size;
        self.quota_files = files;
        self
    }

    /// Set permission rules.
    pub fn with_permissions(mut self, permissions: PermissionRules) -> Self {
        self.permissions = permissions;
        self
    }

    /// Set file allow-lists.
    pub fn with_filters(mut self, filters: FileFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Add a virtual folder.
    pub fn with_virtual_folder(mut self, folder: VirtualFolder) -> Self {
        self.virtual_folders.push(folder);
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn quota_size(&self) -> u64 {
        self.quota_size
    }

    pub fn quota_files(&self) -> u64 {
        self.quota_files
    }

    pub fn permissions(&self) -> &PermissionRules {
        &self.permissions
    }

    pub fn filters(&self) -> &FileFilters {
        &self.filters
    }

    pub fn virtual_folders(&self) -> &[VirtualFolder] {
        &self.virtual_folders
    }

    /// Shortcut for [`PermissionRules::allows`].
    pub fn has_perm(&self, perm: Permission, virtual_dir: &str) -> bool {
        self.permissions.allows(perm, virtual_dir)
    }

    /// True when neither user limit applies.
    pub fn has_no_quota_restrictions(&self, check_files: bool) -> bool {
        self.quota_size == 0 && (!check_files || self.quota_files == 0)
    }

    /// The virtual folder containing `virtual_dir`, longest mount first.
    pub fn virtual_folder_for(&self, virtual_dir: &str) -> Option<&VirtualFolder> {
        let dir = vpath::clean(virtual_dir);
        self.virtual_folders
            .iter()
            .filter(|f| vpath::is_within(&dir, &f.virtual_path))
            .max_by_key(|f| f.virtual_path.len())
    }
}
