//! Virtual path helpers.
//!
//! Virtual paths are what the client sends: `/`-separated and rooted at the
//! user's home. They never touch the host filesystem, so they are handled
//! as plain strings.

use crate::constants::ROOT_DIR;

/// Clean a virtual path: make it absolute and resolve `.`, `..` and
/// repeated separators. `..` never climbs above the root.
pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        ROOT_DIR.to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Parent directory of a virtual path. The parent of the root is the root.
pub fn parent(path: &str) -> String {
    let cleaned = clean(path);
    match cleaned.rfind('/') {
        Some(0) | None => ROOT_DIR.to_string(),
        Some(idx) => cleaned[..idx].to_string(),
    }
}

/// Last component of a virtual path, empty for the root.
pub fn base_name(path: &str) -> String {
    let cleaned = clean(path);
    cleaned
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// True when `path` is `dir` or lies below it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == ROOT_DIR {
        return true;
    }
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean(""), "/");
        assert_eq!(clean("a/b"), "/a/b");
        assert_eq!(clean("/a//b/./c/"), "/a/b/c");
        assert_eq!(clean("/a/../../b"), "/b");
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("/"), "/");
        assert_eq!(parent("/a.txt"), "/");
        assert_eq!(parent("/dir/a.txt"), "/dir");
        assert_eq!(parent("/dir/sub/"), "/dir");
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/dir/A.TXT"), "A.TXT");
        assert_eq!(base_name("/"), "");
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/vdir/a", "/vdir"));
        assert!(is_within("/vdir", "/vdir"));
        assert!(!is_within("/vdir2/a", "/vdir"));
        assert!(is_within("/anything", "/"));
    }
}
