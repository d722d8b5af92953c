use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use regex::{Captures, NoExpand, Regex};
use serde::Serialize;
use similar::TextDiff;

use crate::filesystem::{
    collect_html_files, display_path, read_lossy, relative_display, write_with_backup,
};
use crate::post_map::PostMap;
use crate::rules;
use crate::runtime::SitePaths;

const BLOG_PREFIX: &str = "blog/";
const BLOG_INDEX: &str = "blog/index.html";
const BLOG_SECOND_PAGE: &str = "blog/page/2/index.html";
const BLOG_PAGINATION_PREFIX: &str = "blog/page/";

/// Where a page sits in the tree. Depth-dependent stages read their
/// `../` prefixes from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContext {
    pub relative_path: String,
    pub root_depth: usize,
}

impl FileContext {
    /// `relative_path` is `/`-separated and relative to the site root.
    pub fn from_relative(relative_path: &str) -> Self {
        let relative_path = relative_path.trim_start_matches('/').to_string();
        let root_depth = relative_path.matches('/').count();
        Self {
            relative_path,
            root_depth,
        }
    }

    pub fn for_file(site_root: &Path, file: &Path) -> Self {
        Self::from_relative(&relative_display(site_root, file))
    }

    pub fn in_blog(&self) -> bool {
        self.relative_path.starts_with(BLOG_PREFIX)
    }

    pub fn is_index_file(&self) -> bool {
        self.file_name() == "index.html"
    }

    pub fn is_blog_index(&self) -> bool {
        self.relative_path == BLOG_INDEX
    }

    /// Blog index and its second page: the pages listing posts by title.
    pub fn is_listing_page(&self) -> bool {
        self.is_blog_index() || self.relative_path == BLOG_SECOND_PAGE
    }

    /// `blog/category/<slug>/index.html` or `blog/tag/<slug>/index.html`.
    pub fn is_taxonomy_index(&self) -> bool {
        let segments: Vec<&str> = self.relative_path.split('/').collect();
        matches!(
            segments.as_slice(),
            ["blog", "category" | "tag", _, "index.html"]
        )
    }

    /// Any `index.html` below the blog root other than the blog index.
    pub fn is_blog_subpage(&self) -> bool {
        self.in_blog() && self.is_index_file() && !self.is_blog_index()
    }

    /// `blog/page/<n>/...`: later pages of the blog listing.
    pub fn is_paginated(&self) -> bool {
        self.relative_path.starts_with(BLOG_PAGINATION_PREFIX)
    }

    /// `../` repeated once per directory between the page and the site root.
    pub fn root_prefix(&self) -> String {
        "../".repeat(self.root_depth)
    }

    /// `../` repeated once per directory between the page and the blog root.
    pub fn blog_prefix(&self) -> String {
        if self.in_blog() {
            "../".repeat(self.root_depth.saturating_sub(1))
        } else {
            String::new()
        }
    }

    fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}

type ComputedReplacement = Box<dyn Fn(&Captures<'_>, &FileContext) -> String + Send + Sync>;

pub enum Replacement {
    Literal(String),
    /// `$n`/`${n}` capture references are expanded.
    Template(String),
    Computed(ComputedReplacement),
}

pub type StageGuard = fn(&FileContext) -> bool;

/// One substitution of a pipeline.
pub struct Stage {
    name: &'static str,
    pattern: Regex,
    replacement: Replacement,
    guard: Option<StageGuard>,
    until_stable: bool,
}

impl Stage {
    /// Replace every occurrence of the exact text `needle`.
    pub fn literal(name: &'static str, needle: &str, replacement: &str) -> Result<Self> {
        Ok(Self {
            name,
            pattern: compile(name, &regex::escape(needle))?,
            replacement: Replacement::Literal(replacement.to_string()),
            guard: None,
            until_stable: false,
        })
    }

    pub fn template(name: &'static str, pattern: &str, template: &str) -> Result<Self> {
        Ok(Self {
            name,
            pattern: compile(name, pattern)?,
            replacement: Replacement::Template(template.to_string()),
            guard: None,
            until_stable: false,
        })
    }

    pub fn computed<F>(name: &'static str, pattern: &str, replace: F) -> Result<Self>
    where
        F: Fn(&Captures<'_>, &FileContext) -> String + Send + Sync + 'static,
    {
        Ok(Self {
            name,
            pattern: compile(name, pattern)?,
            replacement: Replacement::Computed(Box::new(replace)),
            guard: None,
            until_stable: false,
        })
    }

    /// Skip this stage for pages where `guard` is false.
    pub fn when(mut self, guard: StageGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Reapply the substitution to its own output until nothing changes.
    /// Still counts as a single fix.
    pub fn until_stable(mut self) -> Self {
        self.until_stable = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The rewritten text, or `None` when the stage left `content` unchanged.
    pub fn apply(&self, content: &str, context: &FileContext) -> Option<String> {
        if self.guard.is_some_and(|guard| !guard(context)) {
            return None;
        }
        let mut current = self.rewrite(content, context)?;
        if self.until_stable {
            while let Some(next) = self.rewrite(&current, context) {
                current = next;
            }
        }
        Some(current)
    }

    fn rewrite(&self, content: &str, context: &FileContext) -> Option<String> {
        let rewritten = match &self.replacement {
            Replacement::Literal(text) => {
                self.pattern.replace_all(content, NoExpand(text.as_str()))
            }
            Replacement::Template(template) => {
                self.pattern.replace_all(content, template.as_str())
            }
            Replacement::Computed(replace) => self
                .pattern
                .replace_all(content, |captures: &Captures<'_>| replace(captures, context)),
        };
        (rewritten != content).then(|| rewritten.into_owned())
    }
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid pattern for stage {name}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub content: String,
    /// Stages that changed the text, in application order.
    pub applied: Vec<&'static str>,
}

impl PipelineOutcome {
    pub fn fixes(&self) -> usize {
        self.applied.len()
    }
}

/// Ordered stages; each stage sees the previous stage's output.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn apply(&self, content: &str, context: &FileContext) -> PipelineOutcome {
        let mut current = content.to_string();
        let mut applied = Vec::new();
        for stage in &self.stages {
            if let Some(next) = stage.apply(&current, context) {
                current = next;
                applied.push(stage.name());
            }
        }
        PipelineOutcome {
            content: current,
            applied,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixerKind {
    BrokenLinks,
    RemainingLinks,
    WordpressFilenames,
    AbsolutePaths,
    BlogAssets,
    BlogIndex,
    BlogPosts,
}

impl FixerKind {
    pub const ALL: [FixerKind; 7] = [
        Self::BrokenLinks,
        Self::RemainingLinks,
        Self::WordpressFilenames,
        Self::AbsolutePaths,
        Self::BlogAssets,
        Self::BlogIndex,
        Self::BlogPosts,
    ];

    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        match Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
        {
            Some(kind) => Ok(kind),
            None => bail!(
                "unknown fixer: {value} (expected one of: {})",
                Self::ALL
                    .iter()
                    .map(|kind| kind.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BrokenLinks => "broken-links",
            Self::RemainingLinks => "remaining-links",
            Self::WordpressFilenames => "wordpress-filenames",
            Self::AbsolutePaths => "absolute-paths",
            Self::BlogAssets => "blog-assets",
            Self::BlogIndex => "blog-index",
            Self::BlogPosts => "blog-posts",
        }
    }

    /// Fixers that only ever touch pages under the blog root.
    pub fn requires_blog(self) -> bool {
        matches!(
            self,
            Self::AbsolutePaths | Self::BlogAssets | Self::BlogIndex | Self::BlogPosts
        )
    }

    pub fn selects(self, context: &FileContext) -> bool {
        match self {
            Self::BrokenLinks | Self::RemainingLinks | Self::WordpressFilenames => true,
            Self::AbsolutePaths => context.is_blog_subpage(),
            Self::BlogAssets => context.is_blog_subpage() && !context.is_paginated(),
            Self::BlogIndex => context.is_listing_page() || context.is_taxonomy_index(),
            Self::BlogPosts => context.in_blog() && context.is_index_file(),
        }
    }
}

/// Inputs some fixers need beyond the page itself.
#[derive(Debug, Clone, Default)]
pub struct FixSettings {
    pub domain: Option<String>,
    pub post_map: PostMap,
}

pub struct Fixer {
    kind: FixerKind,
    pipeline: Pipeline,
}

impl Fixer {
    pub fn build(kind: FixerKind, settings: &FixSettings) -> Result<Self> {
        let stages = rules::stages_for(kind, settings)
            .with_context(|| format!("failed to build fixer {}", kind.as_str()))?;
        Ok(Self {
            kind,
            pipeline: Pipeline::new(stages),
        })
    }

    pub fn kind(&self) -> FixerKind {
        self.kind
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn apply(&self, content: &str, context: &FileContext) -> PipelineOutcome {
        self.pipeline.apply(content, context)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixOptions {
    pub execute: bool,
    pub backup: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFixes {
    pub file: String,
    pub fixes: usize,
    pub backup_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixSummary {
    pub fixer: FixerKind,
    pub dry_run: bool,
    pub files_processed: usize,
    pub files_changed: usize,
    pub total_fixes: usize,
    pub failures: usize,
    pub changed: Vec<FileFixes>,
}

/// Run `fixer` over every page it selects under the site root. Content is
/// rewritten in memory and only written back, whole, when it changed and
/// `options.execute` is set. A failing page is logged and counted.
pub fn run_fixer(paths: &SitePaths, fixer: &Fixer, options: FixOptions) -> Result<FixSummary> {
    let mut summary = FixSummary {
        fixer: fixer.kind(),
        dry_run: !options.execute,
        files_processed: 0,
        files_changed: 0,
        total_fixes: 0,
        failures: 0,
        changed: Vec::new(),
    };

    for file in collect_html_files(&paths.site_root) {
        let context = FileContext::for_file(&paths.site_root, &file);
        if !fixer.kind().selects(&context) {
            continue;
        }
        summary.files_processed += 1;

        match fix_file(fixer, &file, &context, options) {
            Ok(Some(fixes)) => {
                summary.files_changed += 1;
                summary.total_fixes += fixes.fixes;
                summary.changed.push(fixes);
            }
            Ok(None) => {}
            Err(error) => {
                summary.failures += 1;
                tracing::warn!("{error:#}");
            }
        }

        if summary.files_processed % 50 == 0 {
            tracing::info!(
                "{}: {} files processed",
                fixer.kind().as_str(),
                summary.files_processed
            );
        }
    }

    Ok(summary)
}

fn fix_file(
    fixer: &Fixer,
    file: &Path,
    context: &FileContext,
    options: FixOptions,
) -> Result<Option<FileFixes>> {
    let original = read_lossy(file)?;
    let outcome = fixer.apply(&original, context);
    if outcome.content == original {
        return Ok(None);
    }
    tracing::debug!(
        "{}: {}",
        context.relative_path,
        outcome.applied.join(", ")
    );

    let backup_path: Option<PathBuf> = if options.execute {
        write_with_backup(file, &outcome.content, options.backup)?
    } else {
        None
    };

    Ok(Some(FileFixes {
        file: context.relative_path.clone(),
        fixes: outcome.fixes(),
        backup_path: backup_path.as_deref().map(display_path),
    }))
}

#[derive(Debug, Clone)]
pub struct FixPreview {
    pub file: String,
    pub applied: Vec<&'static str>,
    pub diff: String,
}

impl FixPreview {
    pub fn is_unchanged(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Run `fixer` on one page in memory and render a unified diff. Never writes.
pub fn preview_fix(paths: &SitePaths, fixer: &Fixer, relative: &str) -> Result<FixPreview> {
    let file = paths.site_root.join(relative);
    if !file.is_file() {
        bail!("file not found: {}", display_path(&file));
    }
    let context = FileContext::for_file(&paths.site_root, &file);
    let original = read_lossy(&file)?;
    let outcome = fixer.apply(&original, &context);

    let diff = TextDiff::from_lines(original.as_str(), outcome.content.as_str())
        .unified_diff()
        .context_radius(2)
        .header(
            &format!("a/{}", context.relative_path),
            &format!("b/{}", context.relative_path),
        )
        .to_string();

    Ok(FixPreview {
        file: context.relative_path,
        applied: outcome.applied,
        diff,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        FileContext, FixOptions, FixSettings, Fixer, FixerKind, Pipeline, Stage, preview_fix,
        run_fixer,
    };
    use crate::runtime::SitePaths;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
        fs::write(path, content).expect("write");
    }

    #[test]
    fn file_context_classifies_blog_pages() {
        let index = FileContext::from_relative("blog/index.html");
        assert!(index.is_blog_index());
        assert!(index.is_listing_page());
        assert!(!index.is_blog_subpage());
        assert_eq!(index.blog_prefix(), "");
        assert_eq!(index.root_prefix(), "../");

        let second = FileContext::from_relative("blog/page/2/index.html");
        assert!(second.is_listing_page());
        assert!(second.is_paginated());
        assert!(FileContext::from_relative("blog/page/3/index.html").is_paginated());

        let post_about_pages = FileContext::from_relative("blog/tips/page/layout/index.html");
        assert!(!post_about_pages.is_paginated());
        assert!(FixerKind::BlogAssets.selects(&post_about_pages));
        assert!(!FixerKind::BlogAssets.selects(&second));
        assert_eq!(second.blog_prefix(), "../../");

        let tag = FileContext::from_relative("blog/tag/edmonton/index.html");
        assert!(tag.is_taxonomy_index());
        assert!(tag.is_blog_subpage());
        assert_eq!(tag.root_prefix(), "../../../");

        let page = FileContext::from_relative("about/index.html");
        assert!(!page.in_blog());
        assert_eq!(page.blog_prefix(), "");
    }

    #[test]
    fn stage_counts_once_and_skips_unchanged_content() {
        let context = FileContext::from_relative("index.html");
        let pipeline = Pipeline::new(vec![
            Stage::literal("decode-question", "%3F", "?").expect("stage"),
            Stage::template("collapse", r#"href="(\.\./){3,}([^"]*)""#, r#"href="/${2}""#)
                .expect("stage"),
            Stage::literal("absent", "nothing-here", "x").expect("stage"),
        ]);
        let outcome = pipeline.apply(
            r#"<a href="a%3Fb"><a href="c%3Fd"><a href="../../../x.html">"#,
            &context,
        );
        assert_eq!(outcome.content, r#"<a href="a?b"><a href="c?d"><a href="/x.html">"#);
        assert_eq!(outcome.applied, vec!["decode-question", "collapse"]);
    }

    #[test]
    fn stable_stage_reapplies_to_its_own_output() {
        let context = FileContext::from_relative("index.html");
        let once = Stage::literal("decode-percent", "%25", "%").expect("stage");
        assert_eq!(once.apply("%2525", &context).as_deref(), Some("%25"));

        let pipeline = Pipeline::new(vec![once.until_stable()]);
        let outcome = pipeline.apply("%2525", &context);
        assert_eq!(outcome.content, "%");
        assert_eq!(outcome.fixes(), 1);
    }

    #[test]
    fn literal_replacement_is_not_expanded() {
        let context = FileContext::from_relative("index.html");
        let stage = Stage::literal("dollar", "x", "$1").expect("stage");
        assert_eq!(stage.apply("x", &context).as_deref(), Some("$1"));
    }

    #[test]
    fn guarded_stage_only_runs_where_allowed() {
        let stage = Stage::computed("prefix", r#"src="/assets/"#, |_, context| {
            format!(r#"src="{}assets/"#, context.root_prefix())
        })
        .expect("stage")
        .when(FileContext::is_blog_subpage);

        let post = FileContext::from_relative("blog/heating/tips/index.html");
        assert_eq!(
            stage.apply(r#"<img src="/assets/a.png">"#, &post).as_deref(),
            Some(r#"<img src="../../../assets/a.png">"#)
        );
        let root = FileContext::from_relative("index.html");
        assert_eq!(stage.apply(r#"<img src="/assets/a.png">"#, &root), None);
    }

    #[test]
    fn fixer_kinds_parse_by_name() {
        assert_eq!(
            FixerKind::parse("broken_links").expect("parse"),
            FixerKind::BrokenLinks
        );
        assert_eq!(FixerKind::parse("Blog-Posts").expect("parse"), FixerKind::BlogPosts);
        let error = FixerKind::parse("everything").expect_err("must fail");
        assert!(error.to_string().contains("unknown fixer"));
    }

    #[test]
    fn dry_run_never_writes_and_is_repeatable() {
        let temp = tempdir().expect("tempdir");
        let page = r#"<a href="/contact%3Fform=1">c</a>"#;
        write(temp.path(), "index.html", page);
        write(temp.path(), "clean.html", r#"<a href="/about.html">a</a>"#);
        let paths = SitePaths::for_site_root(temp.path());
        let fixer = Fixer::build(FixerKind::BrokenLinks, &FixSettings::default()).expect("fixer");
        let options = FixOptions {
            execute: false,
            backup: true,
        };

        let first = run_fixer(&paths, &fixer, options).expect("run");
        let second = run_fixer(&paths, &fixer, options).expect("run");
        assert_eq!(first.files_processed, 2);
        assert_eq!(first.files_changed, 1);
        assert_eq!(first.files_changed, second.files_changed);
        assert_eq!(first.total_fixes, second.total_fixes);
        assert!(first.dry_run);
        assert_eq!(
            fs::read_to_string(temp.path().join("index.html")).expect("read"),
            page
        );
        assert!(!temp.path().join("index.html.backup").exists());
    }

    #[test]
    fn execute_writes_backup_and_second_run_is_clean() {
        let temp = tempdir().expect("tempdir");
        let page = r#"<a href="/contact%3Fform=1">c</a><a href="../../../../tag/x/">t</a>"#;
        write(temp.path(), "blog/a/b/index.html", page);
        let paths = SitePaths::for_site_root(temp.path());
        let fixer = Fixer::build(FixerKind::BrokenLinks, &FixSettings::default()).expect("fixer");
        let options = FixOptions {
            execute: true,
            backup: true,
        };

        let first = run_fixer(&paths, &fixer, options).expect("run");
        assert_eq!(first.files_changed, 1);
        assert_eq!(first.changed[0].file, "blog/a/b/index.html");
        assert!(first.changed[0].backup_path.is_some());
        assert_eq!(
            fs::read_to_string(temp.path().join("blog/a/b/index.html.backup")).expect("read"),
            page
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("blog/a/b/index.html")).expect("read"),
            r#"<a href="/contact?form=1">c</a><a href="/tag/x/">t</a>"#
        );

        let second = run_fixer(&paths, &fixer, options).expect("run");
        assert_eq!(second.files_changed, 0);
        assert_eq!(second.total_fixes, 0);
    }

    #[test]
    fn backups_can_be_disabled() {
        let temp = tempdir().expect("tempdir");
        write(temp.path(), "index.html", r#"<a href="a%3Fb">x</a>"#);
        let paths = SitePaths::for_site_root(temp.path());
        let fixer = Fixer::build(FixerKind::BrokenLinks, &FixSettings::default()).expect("fixer");

        let summary = run_fixer(
            &paths,
            &fixer,
            FixOptions {
                execute: true,
                backup: false,
            },
        )
        .expect("run");
        assert_eq!(summary.files_changed, 1);
        assert!(summary.changed[0].backup_path.is_none());
        assert!(!temp.path().join("index.html.backup").exists());
    }

    #[test]
    fn preview_renders_diff_without_writing() {
        let temp = tempdir().expect("tempdir");
        let page = "<html>\n<a href=\"a%3Fb\">x</a>\n</html>\n";
        write(temp.path(), "index.html", page);
        let paths = SitePaths::for_site_root(temp.path());
        let fixer = Fixer::build(FixerKind::BrokenLinks, &FixSettings::default()).expect("fixer");

        let preview = preview_fix(&paths, &fixer, "index.html").expect("preview");
        assert!(!preview.is_unchanged());
        assert!(preview.diff.contains("-<a href=\"a%3Fb\">x</a>"));
        assert!(preview.diff.contains("+<a href=\"a?b\">x</a>"));
        assert_eq!(
            fs::read_to_string(temp.path().join("index.html")).expect("read"),
            page
        );

        assert!(preview_fix(&paths, &fixer, "missing.html").is_err());
    }
}
