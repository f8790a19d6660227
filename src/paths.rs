// Relative path helpers
// Stored paths use '\' between folders regardless of platform.

use std::path::{Path, PathBuf};

use crate::constants::PATH_SEPARATOR;

/// Put `prefix` in front of a stored relative path.
/// Empty prefix leaves the path alone; an empty path becomes the prefix.
pub fn prefix_path(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else if path.is_empty() {
        prefix.to_string()
    } else {
        format!("{}{}{}", prefix, PATH_SEPARATOR, path)
    }
}

/// Inverse of [`prefix_path`]. None when `path` is not at or under `prefix`.
pub fn strip_path_prefix(prefix: &str, path: &str) -> Option<String> {
    if prefix.is_empty() {
        return Some(path.to_string());
    }
    if path == prefix {
        return Some(String::new());
    }
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(PATH_SEPARATOR))
        .map(str::to_string)
}

/// Number of folders in a relative path; 0 for the root.
pub fn path_depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split(PATH_SEPARATOR).count()
    }
}

/// Normalize user input: forward slashes become the stored separator and
/// leading/trailing separators are dropped.
pub fn normalize_relative_path(path: &str) -> String {
    path.replace('/', &PATH_SEPARATOR.to_string())
        .trim_matches(PATH_SEPARATOR)
        .to_string()
}

/// Location on disk of a record's file below the store's root folder.
pub fn absolute_path(root: &Path, relative_path: &str, file: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in relative_path.split(PATH_SEPARATOR).filter(|p| !p.is_empty()) {
        path.push(part);
    }
    path.push(file);
    path
}

/// SQL expression that prefixes `column` with the `?N` parameter.
pub fn sql_prefix_expr(column: &str, param: usize) -> String {
    format!(
        "CASE WHEN ?{p} = '' THEN {c} WHEN {c} = '' THEN ?{p} ELSE ?{p} || '{sep}' || {c} END",
        p = param,
        c = column,
        sep = PATH_SEPARATOR
    )
}

/// SQL expression that strips the `?N` prefix from `column`. Only valid on
/// rows matched by [`sql_under_prefix`].
pub fn sql_strip_expr(column: &str, param: usize) -> String {
    format!(
        "CASE WHEN ?{p} = '' THEN {c} WHEN {c} = ?{p} THEN '' ELSE substr({c}, length(?{p}) + 2) END",
        p = param,
        c = column
    )
}

/// SQL condition: `column` equals the `?N` prefix or lies below it. An empty
/// prefix matches every row.
/// Uses substr rather than LIKE so '%' and '_' in folder names match literally.
pub fn sql_under_prefix(column: &str, param: usize) -> String {
    format!(
        "(?{p} = '' OR {c} = ?{p} OR substr({c}, 1, length(?{p}) + 1) = ?{p} || '{sep}')",
        p = param,
        c = column,
        sep = PATH_SEPARATOR
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_strip() {
        assert_eq!(prefix_path("X", ""), "X");
        assert_eq!(prefix_path("X", "a\\b"), "X\\a\\b");
        assert_eq!(prefix_path("", "a"), "a");
        assert_eq!(strip_path_prefix("X", "X"), Some(String::new()));
        assert_eq!(strip_path_prefix("X", "X\\a\\b"), Some("a\\b".to_string()));
        assert_eq!(strip_path_prefix("X", "XY\\a"), None);
        assert_eq!(strip_path_prefix("X", "a"), None);
    }

    #[test]
    fn test_depth_and_normalize() {
        assert_eq!(path_depth(""), 0);
        assert_eq!(path_depth("Site1\\Cam2"), 2);
        assert_eq!(normalize_relative_path("/Site1/Cam2/"), "Site1\\Cam2");
        assert_eq!(
            absolute_path(Path::new("/data"), "Site1\\Cam2", "img.jpg"),
            Path::new("/data").join("Site1").join("Cam2").join("img.jpg")
        );
    }

    #[test]
    fn test_sql_expressions_agree_with_rust() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        for (prefix, path) in [("X", ""), ("X", "a\\b"), ("", "a")] {
            let sql = format!("SELECT {}", sql_prefix_expr("?2", 1));
            let got: String = conn
                .query_row(&sql, rusqlite::params![prefix, path], |r| r.get(0))
                .unwrap();
            assert_eq!(got, prefix_path(prefix, path));
        }

        let under = format!("SELECT {}, {}", sql_under_prefix("?2", 1), sql_strip_expr("?2", 1));
        let (matched, stripped): (bool, String) = conn
            .query_row(&under, rusqlite::params!["X_1", "X_1\\cam"], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert!(matched);
        assert_eq!(stripped, "cam");
        let matched: bool = conn
            .query_row(&format!("SELECT {}", sql_under_prefix("?2", 1)), rusqlite::params!["X_1", "XA1\\cam"], |r| r.get(0))
            .unwrap();
        assert!(!matched);
        let matched: bool = conn
            .query_row(&format!("SELECT {}", sql_under_prefix("?2", 1)), rusqlite::params!["", "a\\b"], |r| r.get(0))
            .unwrap();
        assert!(matched);
    }
}
