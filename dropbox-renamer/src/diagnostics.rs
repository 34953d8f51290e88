//! `--debug` report of what the access token can see.
//!
//! Every section is best effort: a failing call is reported in place and the
//! rest of the report is still produced.

use std::fmt::Write as _;

use dropbox_core::{DropboxClient, Metadata};

const SHARED_FOLDER_LIMIT: u32 = 100;

/// Account, shared folders, root contents (one level deep) and mounted
/// folders. When the root looks empty, also space usage and a listing of each
/// component of `folder`, which usually shows where access stops.
pub async fn describe(client: &DropboxClient, folder: &str) -> String {
    let mut out = String::new();

    match client.current_account().await {
        Ok(account) => {
            let _ = writeln!(
                out,
                "Account: {} ({})",
                account.name.display_name, account.account_id
            );
        }
        Err(err) => {
            let _ = writeln!(out, "Account: unavailable ({err})");
        }
    }

    let _ = writeln!(out, "\nShared folders:");
    match client.list_shared_folders(SHARED_FOLDER_LIMIT).await {
        Ok(list) if list.entries.is_empty() => {
            let _ = writeln!(out, "  (none)");
        }
        Ok(list) => {
            for shared in &list.entries {
                let _ = writeln!(
                    out,
                    "- {} (shared_folder_id {}) at {}",
                    shared.name,
                    shared.shared_folder_id,
                    shared.path_lower.as_deref().unwrap_or("<not mounted>")
                );
            }
        }
        Err(err) => {
            let _ = writeln!(out, "  could not list shared folders: {err}");
        }
    }

    let _ = writeln!(out, "\nRoot contents:");
    let root = match client.list_folder("", false, None).await {
        Ok(page) => page.entries,
        Err(err) => {
            let _ = writeln!(out, "  could not list root: {err}");
            Vec::new()
        }
    };
    if root.is_empty() {
        let _ = writeln!(out, "  (empty)");
    }
    for entry in &root {
        let _ = writeln!(out, "- {}", entry_line(entry));
        if let Metadata::Folder(_) = entry {
            list_children(client, entry_path(entry), "    ", &mut out).await;
        }
    }

    let _ = writeln!(out, "\nMounted folders:");
    let mounted: Vec<&Metadata> = root.iter().filter(|entry| is_mounted(entry)).collect();
    if mounted.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for entry in mounted {
        let _ = writeln!(out, "- [MOUNTED] {}", entry_line(entry));
    }

    if root.is_empty() {
        let _ = writeln!(out, "\nRoot is empty, checking access:");
        match client.space_usage().await {
            Ok(usage) => {
                let allocated = usage
                    .allocation
                    .allocated()
                    .map_or_else(|| "?".to_string(), |bytes| bytes.to_string());
                let _ = writeln!(out, "Space used: {} of {allocated} bytes", usage.used);
            }
            Err(err) => {
                let _ = writeln!(out, "Space usage unavailable: {err}");
            }
        }
        for prefix in path_prefixes(folder) {
            let _ = writeln!(out, "{prefix}:");
            list_children(client, &prefix, "  ", &mut out).await;
        }
    }
    out
}

async fn list_children(client: &DropboxClient, path: &str, indent: &str, out: &mut String) {
    match client.list_folder(path, false, None).await {
        Ok(page) if page.entries.is_empty() => {
            let _ = writeln!(out, "{indent}(empty)");
        }
        Ok(page) => {
            for entry in &page.entries {
                let _ = writeln!(out, "{indent}- {}", entry_line(entry));
            }
        }
        Err(err) => {
            let _ = writeln!(out, "{indent}could not list {path}: {err}");
        }
    }
}

fn entry_line(entry: &Metadata) -> String {
    let (name, kind) = match entry {
        Metadata::File(file) => (&file.name, "file"),
        Metadata::Folder(folder) => (&folder.name, "folder"),
        Metadata::Deleted(deleted) => (&deleted.name, "deleted"),
    };
    format!("{name} ({}) [{kind}]", entry_path(entry))
}

fn entry_path(entry: &Metadata) -> &str {
    let (display, lower) = match entry {
        Metadata::File(file) => (&file.path_display, &file.path_lower),
        Metadata::Folder(folder) => (&folder.path_display, &folder.path_lower),
        Metadata::Deleted(deleted) => (&deleted.path_display, &deleted.path_lower),
    };
    display.as_deref().or(lower.as_deref()).unwrap_or_default()
}

fn is_mounted(entry: &Metadata) -> bool {
    match entry {
        Metadata::Folder(folder) => folder
            .sharing_info
            .as_ref()
            .is_some_and(|info| info.shared_folder_id.is_some()),
        _ => false,
    }
}

/// `/a/b/c` gives `/a`, `/a/b`, `/a/b/c`.
fn path_prefixes(folder: &str) -> Vec<String> {
    let mut current = String::new();
    folder
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            current.push('/');
            current.push_str(part);
            current.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_walk_down_the_folder() {
        assert_eq!(
            path_prefixes("/Customers/2024/Invoices"),
            vec!["/Customers", "/Customers/2024", "/Customers/2024/Invoices"]
        );
        assert!(path_prefixes("").is_empty());
        assert_eq!(path_prefixes("//Customers/"), vec!["/Customers"]);
    }
}
