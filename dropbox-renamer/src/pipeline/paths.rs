use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("remote path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Maps a `/`-separated folder relative to the source folder under `root`.
pub fn local_dir_for(root: &Path, relative_dir: &str) -> Result<PathBuf, PathError> {
    let mut out = root.to_path_buf();
    for component in Path::new(relative_dir).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(relative_dir.to_string()));
            }
        }
    }
    Ok(out)
}

/// Normalizes a folder given on the command line into a Dropbox API path.
///
/// Accepts web URLs (`https://www.dropbox.com/home/Customers`), `%20` escapes,
/// the `All files` prefix shown by the web UI, and stray slashes. The root folder
/// becomes the empty string, as the API expects.
pub fn normalize_source_folder(input: &str) -> String {
    let mut path = input.trim();
    if let Some((_, rest)) = path.split_once("dropbox.com/home") {
        path = rest;
    }
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let decoded = percent_decode_str(path).decode_utf8_lossy();

    let mut parts: Vec<&str> = decoded.split('/').filter(|p| !p.is_empty()).collect();
    if parts.first() == Some(&"All files") {
        parts.remove(0);
    }
    if parts.is_empty() {
        return String::new();
    }
    format!("/{}", parts.join("/"))
}

/// Folder of `path` relative to `folder`, compared case-insensitively as Dropbox does.
/// Returns `None` when `path` is not below `folder`.
pub fn relative_dir(folder: &str, path: &str) -> Option<String> {
    let folder = folder.trim_end_matches('/');
    let rest = if folder.is_empty() {
        path
    } else {
        let head = path.get(..folder.len())?;
        if head.to_lowercase() != folder.to_lowercase() {
            return None;
        }
        path.get(folder.len()..)?
    };
    let rest = rest.strip_prefix('/')?;
    Some(match rest.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    })
}

/// True when any folder in `relative_dir` is named in `excluded`.
pub fn is_excluded(relative_dir: &str, excluded: &[String]) -> bool {
    relative_dir
        .split('/')
        .any(|part| excluded.iter().any(|name| name == part))
}

/// Name of the per-run folder, e.g. `dropbox_download_20240301_101500`.
pub fn run_folder_name(started_at: OffsetDateTime) -> String {
    let stamp = started_at
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| started_at.unix_timestamp().to_string());
    format!("dropbox_download_{stamp}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn maps_relative_dir_under_root() {
        let root = PathBuf::from("/out");
        assert_eq!(
            local_dir_for(&root, "2023/Q4").unwrap(),
            PathBuf::from("/out/2023/Q4")
        );
        assert_eq!(local_dir_for(&root, "").unwrap(), root);
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/out");
        assert!(matches!(
            local_dir_for(&root, "../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
    }

    #[test]
    fn normalizes_web_urls_and_escapes() {
        assert_eq!(
            normalize_source_folder("https://www.dropbox.com/home/Customers/Acme%20Corp/"),
            "/Customers/Acme Corp"
        );
        assert_eq!(
            normalize_source_folder("/All files/Invoices"),
            "/Invoices"
        );
        assert_eq!(normalize_source_folder("Invoices//2024"), "/Invoices/2024");
        assert_eq!(normalize_source_folder("/"), "");
        assert_eq!(
            normalize_source_folder("https://www.dropbox.com/home/Docs?preview=a.pdf"),
            "/Docs"
        );
    }

    #[test]
    fn relative_dir_is_case_insensitive() {
        assert_eq!(
            relative_dir("/Invoices", "/invoices/a.pdf").as_deref(),
            Some("")
        );
        assert_eq!(
            relative_dir("/Invoices", "/Invoices/2023/Q4/b.pdf").as_deref(),
            Some("2023/Q4")
        );
        assert_eq!(relative_dir("", "/top.txt").as_deref(), Some(""));
        assert_eq!(relative_dir("/Invoices", "/Other/a.pdf"), None);
        assert_eq!(relative_dir("/Inv", "/Invoices/a.pdf"), None);
    }

    #[test]
    fn excluded_folder_matches_any_component() {
        let excluded = vec!["DEAD file".to_string()];
        assert!(is_excluded("2023/DEAD file", &excluded));
        assert!(is_excluded("DEAD file", &excluded));
        assert!(!is_excluded("2023/DEAD files", &excluded));
        assert!(!is_excluded("", &excluded));
    }

    #[test]
    fn run_folder_name_uses_compact_stamp() {
        assert_eq!(
            run_folder_name(datetime!(2024-03-01 10:15:00 UTC)),
            "dropbox_download_20240301_101500"
        );
    }
}
