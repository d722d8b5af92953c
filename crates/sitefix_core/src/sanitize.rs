use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};

pub const DEFAULT_GIT_REF: &str = "origin/main";
pub const MAPPING_HEADER: &str = "Original -> Sanitized";
pub const MAPPING_SEPARATOR: &str = " -> ";
const MAX_FILENAME_CHARS: usize = 200;

/// Characters Windows refuses in file names, plus `=` and `&` from query
/// strings the mirror baked into names.
const FORBIDDEN_CHARS: [char; 9] = ['<', '>', ':', '"', '|', '?', '*', '=', '&'];

pub fn needs_sanitizing(path: &str) -> bool {
    path.contains(FORBIDDEN_CHARS)
}

/// Make a single path segment safe on Windows.
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized = replace_forbidden(name);

    if (sanitized.contains("%2F") || sanitized.contains("%3A"))
        && let Ok(decoded) = urlencoding::decode(&sanitized)
    {
        sanitized = replace_forbidden(&decoded);
    }

    let collapsed = collapse_underscores(&sanitized);
    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c == ' ');
    truncate_keeping_extension(trimmed, MAX_FILENAME_CHARS)
}

fn replace_forbidden(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '&' => out.push_str("_and_"),
            c if FORBIDDEN_CHARS.contains(&c) => out.push('_'),
            c => out.push(c),
        }
    }
    out
}

fn collapse_underscores(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Split `name` at the extension dot of its last segment. A leading dot is
/// not an extension.
fn split_extension(name: &str) -> (&str, &str) {
    let segment_start = name.rfind('/').map_or(0, |index| index + 1);
    match name[segment_start..].rfind('.') {
        Some(0) | None => (name, ""),
        Some(offset) => name.split_at(segment_start + offset),
    }
}

fn truncate_keeping_extension(name: &str, limit: usize) -> String {
    if name.chars().count() <= limit {
        return name.to_string();
    }
    let (stem, extension) = split_extension(name);
    let keep = limit.saturating_sub(extension.chars().count());
    let mut out: String = stem.chars().take(keep).collect();
    out.push_str(extension);
    out
}

/// Original path -> sanitized path, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameMapping {
    pub entries: Vec<(String, String)>,
}

impl RenameMapping {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, original: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(from, _)| from == original)
            .map(|(_, to)| to.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(MAPPING_HEADER);
        out.push('\n');
        out.push_str(&"=".repeat(50));
        out.push('\n');
        for (original, sanitized) in &self.entries {
            out.push_str(original);
            out.push_str(MAPPING_SEPARATOR);
            out.push_str(sanitized);
            out.push('\n');
        }
        out
    }

    /// Inverse of [`RenameMapping::render`]: two header lines, then
    /// `original -> sanitized` lines. Lines without the separator are ignored.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .skip(2)
            .filter_map(|line| {
                let (original, sanitized) = line.trim().split_once(MAPPING_SEPARATOR)?;
                Some((original.to_string(), sanitized.to_string()))
            })
            .collect();
        Self { entries }
    }
}

/// Sanitize every path containing a forbidden character, segment by segment.
/// A sanitized path already taken gets `_1`, `_2`, … before its extension.
pub fn build_rename_mapping<I, S>(paths: I) -> RenameMapping
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut mapping = RenameMapping::default();
    let mut taken: HashSet<String> = HashSet::new();
    let mut seen: HashSet<String> = HashSet::new();

    for path in paths {
        let original = path.as_ref().trim();
        if original.is_empty() || !needs_sanitizing(original) || !seen.insert(original.to_string())
        {
            continue;
        }
        let base = original
            .split('/')
            .map(sanitize_filename)
            .collect::<Vec<_>>()
            .join("/");

        let mut candidate = base.clone();
        let mut counter = 1;
        while taken.contains(&candidate) {
            let (stem, extension) = split_extension(&base);
            candidate = format!("{stem}_{counter}{extension}");
            counter += 1;
        }
        taken.insert(candidate.clone());
        mapping.entries.push((original.to_string(), candidate));
    }

    mapping
}

pub fn write_rename_mapping(mapping: &RenameMapping, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, mapping.render()).with_context(|| format!("failed to write {}", path.display()))
}

pub fn load_rename_mapping(path: &Path) -> Result<RenameMapping> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(RenameMapping::parse(&content))
}

/// Every file tracked at `git_ref` in the repository at `repo_root`.
pub fn list_tracked_files(repo_root: &Path, git_ref: &str) -> Result<Vec<String>> {
    let output = Command::new("git")
        .args(["ls-tree", "-r", "--name-only", git_ref])
        .current_dir(repo_root)
        .output()
        .context("failed to execute git")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git ls-tree {git_ref} failed: {}", stderr.trim());
    }
    Ok(parse_file_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Read a newline-separated list of repository paths.
pub fn read_file_list(path: &Path) -> Result<Vec<String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_file_list(&content))
}

fn parse_file_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
