//! Path normalization and validation.
//!
//! Paths are absolute `/`-separated byte strings. Normalization collapses
//! repeated separators and strips a trailing one (except on the root);
//! splitting interprets `.` and `..` literally, clamping `..` at the root.

use rsfs_types::MAX_FILENAME_LEN;

/// Collapse repeated `/`, force a leading `/`, strip a trailing `/`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut cleaned = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        cleaned.push('/');
    }
    let mut last_was_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if !last_was_slash {
                cleaned.push(ch);
                last_was_slash = true;
            }
        } else {
            cleaned.push(ch);
            last_was_slash = false;
        }
    }
    while cleaned.len() > 1 && cleaned.ends_with('/') {
        cleaned.pop();
    }
    cleaned
}

/// Normalized components of a path; `.` is dropped and `..` pops (clamped at
/// the root). The root itself yields no components.
#[must_use]
pub fn split_path(path: &str) -> Vec<String> {
    let normalized = normalize_path(path);
    let mut components = Vec::new();
    for token in normalized.split('/') {
        match token {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other.to_string()),
        }
    }
    components
}

/// User-creatable names: non-empty, ≤ 56 bytes, not `.`/`..`, and free of
/// `/` and NUL.
#[must_use]
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_LEN
        && name != "."
        && name != ".."
        && !name.bytes().any(|b| b == b'/' || b == 0)
}

/// Absolute path whose components all pass `is_valid_filename`.
#[must_use]
pub fn is_valid_path(path: &str) -> bool {
    if path.is_empty() || !path.starts_with('/') {
        return false;
    }
    split_path(path).iter().all(|c| is_valid_filename(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_and_strips() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("//a///b//"), "/a/b");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a/"), "/a");
    }

    #[test]
    fn split_resolves_dots() {
        assert!(split_path("/").is_empty());
        assert_eq!(split_path("/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(split_path("/a/./b"), vec!["a", "b"]);
        assert_eq!(split_path("/a/b/../c"), vec!["a", "c"]);
        // `..` clamps at root.
        assert_eq!(split_path("/../../a"), vec!["a"]);
    }

    #[test]
    fn filename_rules() {
        assert!(is_valid_filename("report.txt"));
        assert!(is_valid_filename(&"x".repeat(56)));
        assert!(!is_valid_filename(""));
        assert!(!is_valid_filename(&"x".repeat(57)));
        assert!(!is_valid_filename("."));
        assert!(!is_valid_filename(".."));
        assert!(!is_valid_filename("a/b"));
        assert!(!is_valid_filename("a\0b"));
    }

    #[test]
    fn path_rules() {
        assert!(is_valid_path("/a/b"));
        assert!(is_valid_path("/"));
        assert!(!is_valid_path(""));
        assert!(!is_valid_path("relative/path"));
    }
}
