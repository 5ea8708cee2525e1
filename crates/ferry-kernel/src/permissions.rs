//! Permission rules, file allow-lists and the gate that evaluates them.
//!
//! Rules are keyed by virtual directory. The effective rule for a directory
//! is the one configured on its closest ancestor, so `/` acts as the default.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::constants::ROOT_DIR;
use crate::user::UserProfile;
use crate::vpath;

/// A single grantable permission.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Permission {
    /// Everything.
    #[serde(rename = "*")]
    #[strum(to_string = "*")]
    Any,
    /// List directory contents and stat entries.
    #[serde(rename = "list")]
    #[strum(to_string = "list")]
    ListItems,
    Download,
    Upload,
    Overwrite,
    Delete,
    Rename,
    CreateDirs,
    CreateSymlinks,
    Chmod,
    Chown,
    Chtimes,
}

/// Per-directory permission sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionRules {
    dirs: BTreeMap<String, HashSet<Permission>>,
}

impl PermissionRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules granting `perms` everywhere.
    pub fn root(perms: impl IntoIterator<Item = Permission>) -> Self {
        Self::new().with_dir(ROOT_DIR, perms)
    }

    /// Grant `perms` on `dir` and everything below it that has no rule of
    /// its own.
    pub fn with_dir(mut self, dir: &str, perms: impl IntoIterator<Item = Permission>) -> Self {
        self.dirs.insert(vpath::clean(dir), perms.into_iter().collect());
        self
    }

    /// True if the root directory has a rule.
    pub fn has_root(&self) -> bool {
        self.dirs.contains_key(ROOT_DIR)
    }

    /// The effective permission set for `dir`.
    pub fn effective(&self, dir: &str) -> Option<&HashSet<Permission>> {
        let mut current = vpath::clean(dir);
        loop {
            if let Some(perms) = self.dirs.get(&current) {
                return Some(perms);
            }
            if current == ROOT_DIR {
                return None;
            }
            current = vpath::parent(&current);
        }
    }

    /// Whether `perm` is granted on `dir`.
    pub fn allows(&self, perm: Permission, dir: &str) -> bool {
        self.effective(dir)
            .is_some_and(|perms| perms.contains(&Permission::Any) || perms.contains(&perm))
    }
}

/// Allow/deny shell patterns for one directory, as configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFilter {
    /// When non-empty, only names matching one of these are allowed.
    #[serde(default)]
    pub allowed_patterns: Vec<String>,
    /// Names matching any of these are rejected.
    #[serde(default)]
    pub denied_patterns: Vec<String>,
}

/// A compiled [`FileFilter`]. Matching ignores case.
#[derive(Debug, Clone)]
pub struct PatternFilter {
    allowed: GlobSet,
    denied: GlobSet,
}

fn compile_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut set = GlobSetBuilder::new();
    for pattern in patterns {
        set.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    set.build()
}

impl PatternFilter {
    /// Compile the shell patterns of a filter.
    pub fn compile(filter: &FileFilter) -> Result<Self, globset::Error> {
        Ok(Self {
            allowed: compile_set(&filter.allowed_patterns)?,
            denied: compile_set(&filter.denied_patterns)?,
        })
    }

    /// Whether a file name passes this filter.
    pub fn allows(&self, name: &str) -> bool {
        if self.denied.is_match(name) {
            return false;
        }
        self.allowed.is_empty() || self.allowed.is_match(name)
    }
}

/// Per-directory file allow-lists.
#[derive(Debug, Clone, Default)]
pub struct FileFilters {
    dirs: BTreeMap<String, PatternFilter>,
}

impl FileFilters {
    /// Create an empty filter set that allows everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a compiled filter to `dir`.
    pub fn with_dir(mut self, dir: &str, filter: PatternFilter) -> Self {
        self.dirs.insert(vpath::clean(dir), filter);
        self
    }

    /// Whether the file at `virtual_path` is allowed, judged by the filter
    /// of its closest configured ancestor directory.
    pub fn allows(&self, virtual_path: &str) -> bool {
        if self.dirs.is_empty() {
            return true;
        }
        let name = vpath::base_name(virtual_path);
        let mut current = vpath::parent(virtual_path);
        loop {
            if let Some(filter) = self.dirs.get(&current) {
                return filter.allows(&name);
            }
            if current == ROOT_DIR {
                return true;
            }
            current = vpath::parent(&current);
        }
    }
}

/// Authorization checks for a user profile.
///
/// Everything here is a pure function of the profile and its arguments.
pub struct PermissionGate;

impl PermissionGate {
    /// Whether `user` holds `perm` on `virtual_dir`.
    pub fn authorize(user: &UserProfile, perm: Permission, virtual_dir: &str) -> bool {
        user.permissions().allows(perm, virtual_dir)
    }

    /// Whether the file name at `virtual_path` passes the user's allow-list.
    pub fn is_file_allowed(user: &UserProfile, virtual_path: &str) -> bool {
        user.filters().allows(virtual_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn filter(allowed: &[&str], denied: &[&str]) -> PatternFilter {
        PatternFilter::compile(&FileFilter {
            allowed_patterns: allowed.iter().map(|s| s.to_string()).collect(),
            denied_patterns: denied.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_permission_names() {
        assert_eq!(Permission::from_str("*").unwrap(), Permission::Any);
        assert_eq!(Permission::from_str("list").unwrap(), Permission::ListItems);
        assert_eq!(
            Permission::from_str("create_dirs").unwrap(),
            Permission::CreateDirs
        );
        assert_eq!(Permission::CreateSymlinks.to_string(), "create_symlinks");
        assert!(Permission::from_str("fly").is_err());
    }

    #[test]
    fn test_closest_ancestor_wins() {
        let rules = PermissionRules::root([Permission::Any]).with_dir(
            "/readonly",
            [Permission::ListItems, Permission::Download],
        );

        assert!(rules.allows(Permission::Upload, "/"));
        assert!(rules.allows(Permission::Upload, "/other/dir"));
        assert!(!rules.allows(Permission::Upload, "/readonly"));
        assert!(!rules.allows(Permission::Upload, "/readonly/deep/er"));
        assert!(rules.allows(Permission::Download, "/readonly/deep"));
        // sibling with a shared prefix is not a child
        assert!(rules.allows(Permission::Upload, "/readonly2"));
    }

    #[test]
    fn test_no_root_rule_denies() {
        let rules = PermissionRules::new().with_dir("/only", [Permission::Any]);
        assert!(!rules.has_root());
        assert!(!rules.allows(Permission::ListItems, "/"));
        assert!(rules.allows(Permission::ListItems, "/only"));
    }

    #[test]
    fn test_shell_patterns() {
        let f = filter(&["*.jpg", "report-??.pdf"], &[]);
        assert!(f.allows("photo.JPG"));
        assert!(f.allows("report-01.pdf"));
        assert!(!f.allows("report-1.pdf"));
        assert!(!f.allows("notes.txt"));
    }

    #[test]
    fn test_denied_beats_allowed() {
        let f = filter(&["*"], &["*.exe"]);
        assert!(f.allows("a.txt"));
        assert!(!f.allows("setup.EXE"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let f = filter(&["a+b.(txt)"], &[]);
        assert!(f.allows("a+b.(txt)"));
        assert!(!f.allows("aab.(txt)"));
    }

    #[test]
    fn test_character_classes() {
        let f = filter(&["log[0-9].txt", "[abc]*"], &["[!a]*.tmp"]);
        assert!(f.allows("log7.txt"));
        assert!(!f.allows("logx.txt"));
        assert!(f.allows("Beta.md"));
        assert!(!f.allows("delta.md"));
        assert!(f.allows("a.tmp"));
        assert!(!f.allows("c.tmp"));
    }

    #[test]
    fn test_malformed_pattern_rejected() {
        let result = PatternFilter::compile(&FileFilter {
            allowed_patterns: vec!["[abc".to_string()],
            denied_patterns: Vec::new(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_filters_by_directory() {
        let filters = FileFilters::new().with_dir("/uploads", filter(&["*.png"], &[]));
        assert!(filters.allows("/notes.txt"));
        assert!(filters.allows("/uploads/a.png"));
        assert!(!filters.allows("/uploads/a.txt"));
        assert!(!filters.allows("/uploads/sub/a.txt"));
    }
}
