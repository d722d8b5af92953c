use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Url;
use serde::Serialize;

use crate::filesystem::{display_path, file_hash, read_lossy, relative_display};
use crate::runtime::SitePaths;

/// Files the offline mirror saved for `index.html?p=<id>` permalinks.
const MIRRORED_POST_PREFIX: &str = "index.html_p_";
const MALFORMED_CANONICAL: &str = "index.html%3Fp=";

/// Finds the canonical URL a mirrored page declares for itself.
#[derive(Debug, Clone)]
pub struct CanonicalUrlExtractor {
    og_url: Regex,
    canonical: Regex,
}

impl CanonicalUrlExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            og_url: Regex::new(r#"<meta property=["']og:url["'] content=["']([^"']+)["']"#)
                .context("failed to compile og:url pattern")?,
            canonical: Regex::new(r#"<link rel=["']canonical["'] href=["']([^"']+)["']"#)
                .context("failed to compile canonical pattern")?,
        })
    }

    /// `og:url` wins over `<link rel="canonical">`. Values still carrying the
    /// percent-encoded `?p=` form are ignored.
    pub fn extract(&self, html: &str) -> Option<String> {
        [&self.og_url, &self.canonical]
            .into_iter()
            .filter_map(|pattern| pattern.captures(html))
            .filter_map(|captures| captures.get(1).map(|value| value.as_str()))
            .find(|value| !value.contains(MALFORMED_CANONICAL))
            .map(str::to_string)
    }
}

/// Blog-relative file a canonical URL should live at.
pub fn canonical_target(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) if url.starts_with('/') => url.to_string(),
        Err(_) => return None,
    };
    let path = path
        .strip_prefix("/blog/")
        .or_else(|| path.strip_prefix('/'))
        .unwrap_or(&path);

    if path.is_empty() || path == "/" {
        return Some("index.html".to_string());
    }
    if path.ends_with('/') {
        return Some(format!("{path}index.html"));
    }
    if !path.ends_with(".html") {
        return Some(format!("{path}/index.html"));
    }
    Some(path.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedMove {
    pub source: PathBuf,
    pub target: PathBuf,
    pub source_name: String,
    pub target_relative: String,
    pub canonical_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenameFailure {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenamePlan {
    pub candidates: usize,
    pub moves: Vec<PlannedMove>,
    /// Sources whose target already exists, or is claimed by an earlier move.
    pub duplicates: Vec<PlannedMove>,
    pub failures: Vec<RenameFailure>,
}

/// Plan moves of `blog/index.html_p_*.html` files to their canonical
/// permalink location. Nothing is touched on disk.
pub fn plan_blog_renames(paths: &SitePaths) -> Result<RenamePlan> {
    let extractor = CanonicalUrlExtractor::new()?;
    let mut plan = RenamePlan::default();
    let mut claimed: HashSet<PathBuf> = HashSet::new();

    for source in mirrored_post_files(&paths.blog_root)? {
        plan.candidates += 1;
        let source_name = source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let content = match read_lossy(&source) {
            Ok(content) => content,
            Err(error) => {
                plan.failures.push(RenameFailure {
                    file: source_name,
                    reason: format!("{error:#}"),
                });
                continue;
            }
        };
        let Some(canonical_url) = extractor.extract(&content) else {
            plan.failures.push(RenameFailure {
                file: source_name,
                reason: "no canonical URL".to_string(),
            });
            continue;
        };
        let Some(target_relative) = canonical_target(&canonical_url) else {
            plan.failures.push(RenameFailure {
                file: source_name,
                reason: format!("cannot map canonical URL {canonical_url}"),
            });
            continue;
        };

        let target = paths.blog_root.join(&target_relative);
        let planned = PlannedMove {
            source,
            target: target.clone(),
            source_name,
            target_relative,
            canonical_url,
        };
        if target.exists() || !claimed.insert(target) {
            plan.duplicates.push(planned);
        } else {
            plan.moves.push(planned);
        }
    }

    Ok(plan)
}

fn mirrored_post_files(blog_root: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(blog_root)
        .with_context(|| format!("failed to read {}", blog_root.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!("skipping entry under {}: {error}", blog_root.display());
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(MIRRORED_POST_PREFIX)
            && name.ends_with(".html")
            && entry.file_type().is_ok_and(|kind| kind.is_file())
        {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenameOutcome {
    pub renamed: Vec<String>,
    pub failures: Vec<RenameFailure>,
}

/// Carry out the planned moves, creating target directories. A failed move
/// is recorded and the rest continue.
pub fn execute_renames(plan: &RenamePlan) -> RenameOutcome {
    let mut outcome = RenameOutcome::default();
    for planned in &plan.moves {
        match move_file(&planned.source, &planned.target) {
            Ok(()) => outcome
                .renamed
                .push(format!("{} -> {}", planned.source_name, planned.target_relative)),
            Err(error) => {
                tracing::warn!("{error:#}");
                outcome.failures.push(RenameFailure {
                    file: planned.source_name.clone(),
                    reason: format!("{error:#}"),
                });
            }
        }
    }
    outcome
}

fn move_file(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::rename(source, target).with_context(|| {
        format!(
            "failed to move {} to {}",
            source.display(),
            target.display()
        )
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupeReport {
    pub dry_run: bool,
    /// Duplicates byte-identical to their target (removed unless dry run).
    pub identical: Vec<String>,
    /// Duplicates whose content differs from their target; always kept.
    pub differing: Vec<String>,
    pub failures: Vec<RenameFailure>,
}

/// Compare each duplicate from the rename plan against the file already at
/// its target and remove it when the two hash the same.
pub fn dedupe(paths: &SitePaths, execute: bool) -> Result<DedupeReport> {
    let plan = plan_blog_renames(paths)?;
    let mut report = DedupeReport {
        dry_run: !execute,
        ..DedupeReport::default()
    };

    for duplicate in &plan.duplicates {
        let label = format!("{} -> {}", duplicate.source_name, duplicate.target_relative);
        match same_content(&duplicate.source, &duplicate.target) {
            Ok(true) => {
                if execute && let Err(error) = fs::remove_file(&duplicate.source) {
                    report.failures.push(RenameFailure {
                        file: duplicate.source_name.clone(),
                        reason: format!(
                            "failed to remove {}: {error}",
                            display_path(&duplicate.source)
                        ),
                    });
                    continue;
                }
                report.identical.push(label);
            }
            Ok(false) => report.differing.push(label),
            Err(error) => {
                tracing::warn!("{error:#}");
                report.failures.push(RenameFailure {
                    file: duplicate.source_name.clone(),
                    reason: format!("{error:#}"),
                });
            }
        }
    }

    Ok(report)
}

/// A target claimed by an earlier move in the same plan does not exist yet;
/// such duplicates compare as differing.
fn same_content(left: &Path, right: &Path) -> Result<bool> {
    if !right.exists() {
        return Ok(false);
    }
    Ok(file_hash(left)? == file_hash(right)?)
}

pub fn describe_move(paths: &SitePaths, planned: &PlannedMove) -> String {
    format!(
        "{} -> {}",
        relative_display(&paths.site_root, &planned.source),
        relative_display(&paths.site_root, &planned.target)
    )
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        CanonicalUrlExtractor, canonical_target, dedupe, execute_renames, plan_blog_renames,
    };
    use crate::runtime::SitePaths;

    fn page(url: &str) -> String {
        format!(
            "<html><head><meta property=\"og:url\" content=\"{url}\" /></head><body>{url}</body></html>"
        )
    }

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
        fs::write(path, content).expect("write");
    }

    #[test]
    fn og_url_wins_and_encoded_values_fall_back() {
        let extractor = CanonicalUrlExtractor::new().expect("extractor");
        let both = r#"<link rel="canonical" href="https://x.com/blog/b/"><meta property="og:url" content="https://x.com/blog/a/">"#;
        assert_eq!(extractor.extract(both).as_deref(), Some("https://x.com/blog/a/"));

        let encoded = r#"<meta property="og:url" content="https://x.com/blog/index.html%3Fp=12"><link rel='canonical' href='https://x.com/blog/c/'>"#;
        assert_eq!(extractor.extract(encoded).as_deref(), Some("https://x.com/blog/c/"));

        assert_eq!(extractor.extract("<html></html>"), None);
    }

    #[test]
    fn canonical_targets_are_blog_relative() {
        assert_eq!(
            canonical_target("https://www.example.com/blog/heating/furnace-tips/").as_deref(),
            Some("heating/furnace-tips/index.html")
        );
        assert_eq!(
            canonical_target("https://www.example.com/blog/heating/tips").as_deref(),
            Some("heating/tips/index.html")
        );
        assert_eq!(
            canonical_target("https://www.example.com/blog/").as_deref(),
            Some("index.html")
        );
        assert_eq!(
            canonical_target("/blog/about.html").as_deref(),
            Some("about.html")
        );
        assert_eq!(canonical_target("not a url"), None);
    }

    #[test]
    fn plan_separates_moves_duplicates_and_failures() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write(root, "blog/index.html_p_1.html", &page("https://x.com/blog/new/post/"));
        write(root, "blog/index.html_p_2.html", &page("https://x.com/blog/old/post/"));
        write(root, "blog/index.html_p_3.html", "<html>no metadata</html>");
        write(root, "blog/index.html_p_4.html", &page("https://x.com/blog/new/post/"));
        write(root, "blog/old/post/index.html", "existing");
        write(root, "blog/other.html", "ignored");
        let paths = SitePaths::for_site_root(root);

        let plan = plan_blog_renames(&paths).expect("plan");
        assert_eq!(plan.candidates, 4);
        let moves: Vec<&str> = plan.moves.iter().map(|m| m.target_relative.as_str()).collect();
        assert_eq!(moves, vec!["new/post/index.html"]);
        let duplicates: Vec<&str> = plan.duplicates.iter().map(|m| m.source_name.as_str()).collect();
        assert_eq!(duplicates, vec!["index.html_p_2.html", "index.html_p_4.html"]);
        assert_eq!(plan.failures.len(), 1);
        assert_eq!(plan.failures[0].file, "index.html_p_3.html");

        assert!(!root.join("blog/new").exists());
    }

    #[test]
    fn execute_moves_files_into_place() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        let content = page("https://x.com/blog/heating/tips/");
        write(root, "blog/index.html_p_9.html", &content);
        let paths = SitePaths::for_site_root(root);

        let plan = plan_blog_renames(&paths).expect("plan");
        let outcome = execute_renames(&plan);
        assert_eq!(outcome.renamed, vec!["index.html_p_9.html -> heating/tips/index.html"]);
        assert!(outcome.failures.is_empty());
        assert!(!root.join("blog/index.html_p_9.html").exists());
        assert_eq!(
            fs::read_to_string(root.join("blog/heating/tips/index.html")).expect("read"),
            content
        );
    }

    #[test]
    fn dedupe_removes_only_identical_copies() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        let same = page("https://x.com/blog/same/");
        write(root, "blog/same/index.html", &same);
        write(root, "blog/index.html_p_1.html", &same);
        write(root, "blog/different/index.html", "newer content");
        write(root, "blog/index.html_p_2.html", &page("https://x.com/blog/different/"));
        let paths = SitePaths::for_site_root(root);

        let dry = dedupe(&paths, false).expect("dry run");
        assert!(dry.dry_run);
        assert_eq!(dry.identical, vec!["index.html_p_1.html -> same/index.html"]);
        assert_eq!(dry.differing, vec!["index.html_p_2.html -> different/index.html"]);
        assert!(root.join("blog/index.html_p_1.html").exists());

        let executed = dedupe(&paths, true).expect("execute");
        assert_eq!(executed.identical.len(), 1);
        assert!(!root.join("blog/index.html_p_1.html").exists());
        assert!(root.join("blog/index.html_p_2.html").exists());
        assert!(root.join("blog/same/index.html").exists());
    }
}
