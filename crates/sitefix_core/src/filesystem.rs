use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

pub const BACKUP_SUFFIX: &str = ".backup";

/// Every `*.html` file under `root`, sorted by path. Backups (`*.html.backup`)
/// never match. Entries that cannot be read are logged and skipped.
pub fn collect_html_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!("skipping unreadable entry under {}: {error}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_str().is_some_and(|name| name.ends_with(".html")) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    files
}

/// Read a file as UTF-8, dropping byte sequences that do not decode.
pub fn read_lossy(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(decode_dropping_invalid(&bytes))
}

pub fn decode_dropping_invalid(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}

/// Overwrite `path` with `content`, first copying the original to
/// `<name>.backup` when `backup` is set. Returns the backup location.
pub fn write_with_backup(path: &Path, content: &str, backup: bool) -> Result<Option<PathBuf>> {
    let backup_path = if backup {
        let backup_path = backup_path_for(path);
        fs::copy(path, &backup_path).with_context(|| {
            format!(
                "failed to write backup {} for {}",
                backup_path.display(),
                path.display()
            )
        })?;
        Some(backup_path)
    } else {
        None
    };
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(backup_path)
}

/// `/`-separated path of `path` relative to `root`; falls back to the full path.
pub fn relative_display(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => display_path(rel),
        Err(_) => display_path(path),
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn file_hash(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(content_hash(&bytes))
}

pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

pub fn display_path(path: &Path) -> String {
    normalize_separators(&path.to_string_lossy())
}

/// Lexically resolve `.` and `..` without touching the filesystem. `..` at
/// the root stays at the root.
pub fn normalize_pathbuf(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{
        backup_path_for, collect_html_files, decode_dropping_invalid, normalize_pathbuf,
        read_lossy, relative_display, write_with_backup,
    };

    #[test]
    fn collect_html_files_skips_backups_and_other_files() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("blog").join("tag")).expect("dirs");
        fs::write(root.join("index.html"), "root").expect("write");
        fs::write(root.join("index.html.backup"), "old").expect("write");
        fs::write(root.join("style.css"), "body{}").expect("write");
        fs::write(root.join("blog").join("tag").join("index.html"), "tag").expect("write");

        let files: Vec<String> = collect_html_files(root)
            .iter()
            .map(|path| relative_display(root, path))
            .collect();
        assert_eq!(files, vec!["blog/tag/index.html", "index.html"]);
    }

    #[test]
    fn undecodable_bytes_are_dropped() {
        assert_eq!(decode_dropping_invalid(b"ab\xffcd\xc3"), "abcd");

        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("page.html");
        fs::write(&path, b"<a href=\"x\xfe.html\">").expect("write");
        assert_eq!(read_lossy(&path).expect("read"), "<a href=\"x.html\">");
    }

    #[test]
    fn write_with_backup_keeps_original_copy() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("page.html");
        fs::write(&path, "before").expect("write");

        let backup = write_with_backup(&path, "after", true).expect("write");
        assert_eq!(backup, Some(temp.path().join("page.html.backup")));
        assert_eq!(fs::read_to_string(&path).expect("read"), "after");
        assert_eq!(
            fs::read_to_string(temp.path().join("page.html.backup")).expect("read"),
            "before"
        );

        let none = write_with_backup(&path, "again", false).expect("write");
        assert!(none.is_none());
    }

    #[test]
    fn backup_path_appends_suffix() {
        assert_eq!(
            backup_path_for(Path::new("/site/blog/index.html")),
            PathBuf::from("/site/blog/index.html.backup")
        );
    }

    #[test]
    fn normalize_collapses_parent_segments() {
        assert_eq!(
            normalize_pathbuf(Path::new("/site/blog/../assets/./app.css")),
            PathBuf::from("/site/assets/app.css")
        );
    }
}
