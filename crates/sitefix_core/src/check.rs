use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::filesystem::{collect_html_files, display_path, relative_display};
use crate::links::{LinkExtractor, is_internal_link};
use crate::resolve::{resolve_link, target_exists};
use crate::runtime::SitePaths;

pub const DEFAULT_ANALYZE_LIMIT: usize = 50;
pub const CATEGORY_EXAMPLE_LIMIT: usize = 5;
pub const COMMON_LINK_LIMIT: usize = 10;
pub const SAMPLE_LINK_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenLinkRecord {
    pub source_file: String,
    pub original_link: String,
    pub resolved_path: String,
    pub expected_location: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FileBrokenLinks {
    pub file: String,
    pub links: Vec<BrokenLinkRecord>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub site_root: String,
    pub files_scanned: usize,
    pub internal_links_checked: usize,
    pub unresolvable_links: usize,
    pub broken_files: Vec<FileBrokenLinks>,
}

impl CheckReport {
    pub fn broken_link_count(&self) -> usize {
        self.broken_files.iter().map(|file| file.links.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.broken_files.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &BrokenLinkRecord> {
        self.broken_files.iter().flat_map(|file| file.links.iter())
    }

    /// The `limit` most frequent missing targets, by count then path.
    pub fn most_common(&self, limit: usize) -> Vec<(String, usize)> {
        rank_counts(self.records().map(|record| record.resolved_path.as_str()), limit)
    }
}

/// Scan every HTML file under the site root and record each internal link
/// whose resolved target is missing.
pub fn check_site(paths: &SitePaths, domain: Option<&str>) -> Result<CheckReport> {
    let extractor = LinkExtractor::new()?;
    let files = collect_html_files(&paths.site_root);
    let mut report = CheckReport {
        site_root: display_path(&paths.site_root),
        files_scanned: files.len(),
        ..CheckReport::default()
    };

    for file in &files {
        let relative = relative_display(&paths.site_root, file);
        tracing::debug!("scanning {relative}");

        let mut broken = Vec::new();
        for link in extractor.extract_from_file(file) {
            if !is_internal_link(&link, domain) {
                continue;
            }
            report.internal_links_checked += 1;
            let Some(resolved) = resolve_link(&link, file, &paths.site_root) else {
                report.unresolvable_links += 1;
                continue;
            };
            if target_exists(&resolved, &paths.site_root) {
                continue;
            }
            broken.push(BrokenLinkRecord {
                source_file: relative.clone(),
                expected_location: display_path(&paths.site_root.join(&resolved)),
                original_link: link,
                resolved_path: resolved,
            });
        }

        if !broken.is_empty() {
            report.broken_files.push(FileBrokenLinks {
                file: relative,
                links: broken,
            });
        }
    }

    Ok(report)
}

/// Persist the report as pretty JSON, creating parent directories.
pub fn write_report(report: &CheckReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let payload = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    fs::write(path, payload).with_context(|| format!("failed to write {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokenLinkCategory {
    UrlEncoded,
    WordpressSpecific,
    DeepRelativePath,
    StaticAsset,
    WordpressApi,
    RssFeed,
    Other,
}

impl BrokenLinkCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UrlEncoded => "url_encoded",
            Self::WordpressSpecific => "wordpress_specific",
            Self::DeepRelativePath => "deep_relative_path",
            Self::StaticAsset => "static_asset",
            Self::WordpressApi => "wordpress_api",
            Self::RssFeed => "rss_feed",
            Self::Other => "other",
        }
    }
}

/// First matching rule wins, so every link lands in exactly one category.
pub fn categorize_broken_link(link: &str) -> BrokenLinkCategory {
    let contains_any = |needles: &[&str]| needles.iter().any(|needle| link.contains(needle));

    if contains_any(&["%3F", "%3D", "%3A", "%2F"]) {
        BrokenLinkCategory::UrlEncoded
    } else if contains_any(&["wp-content", "wp-includes", "wp-json"]) {
        BrokenLinkCategory::WordpressSpecific
    } else if link.matches("../").count() >= 3 {
        BrokenLinkCategory::DeepRelativePath
    } else if link.ends_with(".css") || link.ends_with(".js") {
        BrokenLinkCategory::StaticAsset
    } else if contains_any(&["xmlrpc.php", "rsd"]) {
        BrokenLinkCategory::WordpressApi
    } else if link.contains("feed") {
        BrokenLinkCategory::RssFeed
    } else {
        BrokenLinkCategory::Other
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategorySummary {
    pub category: BrokenLinkCategory,
    pub count: usize,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub files_analyzed: usize,
    pub broken_links: usize,
    pub categories: Vec<CategorySummary>,
    pub most_common: Vec<(String, usize)>,
}

/// Categorize broken links found in the first `limit` HTML files.
pub fn analyze_site(
    paths: &SitePaths,
    domain: Option<&str>,
    limit: usize,
) -> Result<AnalysisReport> {
    let extractor = LinkExtractor::new()?;
    let files: Vec<_> = collect_html_files(&paths.site_root)
        .into_iter()
        .take(limit)
        .collect();

    let mut by_category: BTreeMap<BrokenLinkCategory, (usize, BTreeSet<String>)> =
        BTreeMap::new();
    let mut all_broken = Vec::new();

    for file in &files {
        for link in extractor.extract_from_file(file) {
            if !is_internal_link(&link, domain) {
                continue;
            }
            let Some(resolved) = resolve_link(&link, file, &paths.site_root) else {
                continue;
            };
            if target_exists(&resolved, &paths.site_root) {
                continue;
            }
            let entry = by_category
                .entry(categorize_broken_link(&link))
                .or_default();
            entry.0 += 1;
            entry.1.insert(link.clone());
            all_broken.push(link);
        }
    }

    let categories = by_category
        .into_iter()
        .map(|(category, (count, unique))| CategorySummary {
            category,
            count,
            examples: unique.into_iter().take(CATEGORY_EXAMPLE_LIMIT).collect(),
        })
        .collect();

    Ok(AnalysisReport {
        files_analyzed: files.len(),
        broken_links: all_broken.len(),
        categories,
        most_common: rank_counts(all_broken.iter().map(String::as_str), COMMON_LINK_LIMIT),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSample {
    pub file: String,
    pub total_links: usize,
    pub internal_links: usize,
    pub first_internal: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SampleReport {
    pub samples: Vec<LinkSample>,
    pub skipped: Vec<String>,
}

/// Link counts for a handful of site-relative files, for eyeballing the
/// extractor and classifier on real pages.
pub fn sample_links(
    paths: &SitePaths,
    domain: Option<&str>,
    files: &[String],
) -> Result<SampleReport> {
    let extractor = LinkExtractor::new()?;
    let mut report = SampleReport::default();

    for relative in files {
        let path = paths.site_root.join(relative);
        if !path.is_file() {
            report.skipped.push(relative.clone());
            continue;
        }
        let links = extractor.extract_from_file(&path);
        let internal: Vec<String> = links
            .iter()
            .filter(|link| is_internal_link(link, domain))
            .cloned()
            .collect();
        report.samples.push(LinkSample {
            file: relative.clone(),
            total_links: links.len(),
            internal_links: internal.len(),
            first_internal: internal.into_iter().take(SAMPLE_LINK_LIMIT).collect(),
        });
    }

    Ok(report)
}

fn rank_counts<'a, I>(items: I, limit: usize) -> Vec<(String, usize)>
where
    I: Iterator<Item = &'a str>,
{
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for item in items {
        *counts.entry(item).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(item, count)| (item.to_string(), count))
        .collect();
    ranked.sort_by(|left, right| right.1.cmp(&left.1).then_with(|| left.0.cmp(&right.0)));
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        BrokenLinkCategory, analyze_site, categorize_broken_link, check_site, sample_links,
        write_report,
    };
    use crate::runtime::SitePaths;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
        fs::write(path, content).expect("write");
    }

    fn fixture_site(root: &Path) {
        write(
            root,
            "index.html",
            r##"<a href="/about/">About</a>
<a href="/blog/tag/edmonton/">Tag</a>
<a href="missing.html">Missing</a>
<a href="#top">Top</a>
<a href="mailto:info@example.com">Mail</a>
<a href="https://other.org/x">Ext</a>
<a href="https://www.example.com/gone/">Gone</a>
<link href="/styles.css" rel="stylesheet">"##,
        );
        write(root, "about/index.html", r#"<a href="../missing.html">Up</a>"#);
        write(root, "tag/edmonton/index.html", "tag");
        write(root, "styles.css", "body{}");
    }

    #[test]
    fn check_reports_missing_targets_per_file() {
        let temp = tempdir().expect("tempdir");
        fixture_site(temp.path());
        let paths = SitePaths::for_site_root(temp.path());

        let report = check_site(&paths, Some("example.com")).expect("check");
        assert_eq!(report.files_scanned, 3);
        assert_eq!(report.internal_links_checked, 6);
        assert_eq!(report.broken_link_count(), 3);

        let files: Vec<&str> = report
            .broken_files
            .iter()
            .map(|file| file.file.as_str())
            .collect();
        assert_eq!(files, vec!["about/index.html", "index.html"]);

        let root_links: Vec<&str> = report.broken_files[1]
            .links
            .iter()
            .map(|record| record.resolved_path.as_str())
            .collect();
        assert_eq!(root_links, vec!["missing.html", "gone/index.html"]);

        assert_eq!(
            report.most_common(10),
            vec![
                ("missing.html".to_string(), 2),
                ("gone/index.html".to_string(), 1)
            ]
        );
    }

    #[test]
    fn without_domain_absolute_urls_are_not_checked() {
        let temp = tempdir().expect("tempdir");
        fixture_site(temp.path());
        let paths = SitePaths::for_site_root(temp.path());

        let report = check_site(&paths, None).expect("check");
        assert_eq!(report.internal_links_checked, 5);
        assert_eq!(report.broken_link_count(), 2);
    }

    #[test]
    fn clean_site_has_no_broken_files() {
        let temp = tempdir().expect("tempdir");
        write(temp.path(), "index.html", r#"<a href="/">Home</a>"#);
        let report = check_site(&SitePaths::for_site_root(temp.path()), None).expect("check");
        assert!(report.is_clean());
    }

    #[test]
    fn report_is_written_as_json() {
        let temp = tempdir().expect("tempdir");
        fixture_site(temp.path());
        let paths = SitePaths::for_site_root(temp.path());
        let report = check_site(&paths, None).expect("check");

        let output = temp.path().join("out").join("report.json");
        write_report(&report, &output).expect("write report");
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&output).expect("read")).expect("json");
        assert_eq!(parsed["files_scanned"], 3);
        assert_eq!(
            parsed["broken_files"][0]["links"][0]["original_link"],
            "../missing.html"
        );
    }

    #[test]
    fn categories_follow_rule_order() {
        let cases = [
            ("page.html?ver=6%3A1", BrokenLinkCategory::UrlEncoded),
            ("/wp-content/uploads/a%2Fb.png", BrokenLinkCategory::UrlEncoded),
            ("../../../wp-includes/x.js", BrokenLinkCategory::WordpressSpecific),
            ("../../../tag/x/", BrokenLinkCategory::DeepRelativePath),
            ("../../theme.css", BrokenLinkCategory::StaticAsset),
            ("../../tag/x/", BrokenLinkCategory::Other),
            ("/xmlrpc.php?rsd", BrokenLinkCategory::WordpressApi),
            ("/blog/comments/feed/", BrokenLinkCategory::RssFeed),
            ("/contact-us/", BrokenLinkCategory::Other),
        ];
        for (link, expected) in cases {
            assert_eq!(categorize_broken_link(link), expected, "link={link}");
        }
        assert_eq!(BrokenLinkCategory::DeepRelativePath.as_str(), "deep_relative_path");
    }

    #[test]
    fn analyze_groups_by_category_within_limit() {
        let temp = tempdir().expect("tempdir");
        write(
            temp.path(),
            "a.html",
            r#"<a href="/feed/">f</a><a href="/feed/">f</a><script src="app.js"></script>"#,
        );
        write(temp.path(), "b.html", r#"<a href="/gone/">g</a>"#);
        let paths = SitePaths::for_site_root(temp.path());

        let report = analyze_site(&paths, None, 1).expect("analyze");
        assert_eq!(report.files_analyzed, 1);
        assert_eq!(report.broken_links, 3);
        let categories: Vec<(&str, usize, usize)> = report
            .categories
            .iter()
            .map(|summary| (summary.category.as_str(), summary.count, summary.examples.len()))
            .collect();
        assert_eq!(categories, vec![("static_asset", 1, 1), ("rss_feed", 2, 1)]);
        assert_eq!(report.most_common[0], ("/feed/".to_string(), 2));
    }

    #[test]
    fn sample_counts_internal_links_and_skips_missing_files() {
        let temp = tempdir().expect("tempdir");
        write(
            temp.path(),
            "index.html",
            r##"<a href="/a/">a</a><a href="#x">x</a><img src="logo.png">"##,
        );
        let paths = SitePaths::for_site_root(temp.path());

        let report = sample_links(
            &paths,
            None,
            &["index.html".to_string(), "nope.html".to_string()],
        )
        .expect("sample");
        assert_eq!(report.samples.len(), 1);
        assert_eq!(report.samples[0].total_links, 3);
        assert_eq!(report.samples[0].internal_links, 2);
        assert_eq!(report.samples[0].first_internal, vec!["/a/", "logo.png"]);
        assert_eq!(report.skipped, vec!["nope.html"]);
    }
}
