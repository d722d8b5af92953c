//! Maps a link found in a page to the root-relative file it should refer to.
//!
//! Conventions of the exported WordPress tree:
//! - `/blog/` is stripped, so blog permalinks resolve from the site root
//! - a trailing `/` or an extensionless final segment means `<dir>/index.html`
//! - query strings and fragments never name a file

use std::path::Path;

use reqwest::Url;

use crate::filesystem::{display_path, normalize_pathbuf};
use crate::links::is_absolute_url;

pub const INDEX_FILE: &str = "index.html";

/// Resolve `link`, found in `source_file`, to a path relative to `site_root`.
///
/// Returns `None` when the link cannot be resolved: a malformed absolute
/// URL, or a path that climbs out of the site root. Callers skip such links
/// rather than report them as broken.
pub fn resolve_link(link: &str, source_file: &Path, site_root: &Path) -> Option<String> {
    let path = if is_absolute_url(link) {
        raw_url_path(link)?
    } else {
        link
    };
    let path = strip_query_and_fragment(path);
    if path.is_empty() {
        return Some(INDEX_FILE.to_string());
    }

    let rooted = if path.starts_with('/') {
        normalize_rooted(path)?
    } else {
        format!("/{}", relative_to_root(path, source_file, site_root)?)
    };

    let trimmed = rooted
        .strip_prefix("/blog/")
        .or_else(|| rooted.strip_prefix('/'))
        .unwrap_or(&rooted)
        .trim_start_matches('/');

    if trimmed.is_empty() {
        return Some(INDEX_FILE.to_string());
    }
    if trimmed.ends_with('/') {
        return Some(format!("{trimmed}{INDEX_FILE}"));
    }
    let file_name = trimmed.rsplit('/').next().unwrap_or(trimmed);
    if !file_name.contains('.') {
        return Some(format!("{trimmed}/{INDEX_FILE}"));
    }
    Some(trimmed.to_string())
}

/// True only when something exists at `site_root/resolved`. Errors while
/// checking count as missing.
pub fn target_exists(resolved: &str, site_root: &Path) -> bool {
    matches!(site_root.join(resolved).try_exists(), Ok(true))
}

/// Path of an absolute URL exactly as written. The URL must parse, but its
/// path is not percent-encoded, so it matches a relative link to the same file.
fn raw_url_path(link: &str) -> Option<&str> {
    Url::parse(link).ok()?;
    let (_, rest) = link.split_once("://")?;
    let tail = &rest[rest.find(['/', '?', '#']).unwrap_or(rest.len())..];
    Some(if tail.starts_with('/') { tail } else { "" })
}

/// Fold `.` and `..` out of a root-relative path. `None` when `..` would
/// climb above the root.
fn normalize_rooted(path: &str) -> Option<String> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    let mut rooted = format!("/{}", segments.join("/"));
    let directory = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    if directory && !segments.is_empty() {
        rooted.push('/');
    }
    Some(rooted)
}

fn strip_query_and_fragment(path: &str) -> &str {
    let path = path.split_once('?').map_or(path, |(head, _)| head);
    path.split_once('#').map_or(path, |(head, _)| head)
}

fn relative_to_root(path: &str, source_file: &Path, site_root: &Path) -> Option<String> {
    let directory = source_file.parent()?;
    let joined = normalize_pathbuf(&directory.join(path));
    let root = normalize_pathbuf(site_root);
    let relative = joined.strip_prefix(&root).ok()?;
    Some(display_path(relative))
}
