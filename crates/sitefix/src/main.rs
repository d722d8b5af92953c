use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use sitefix_core::check::{
    COMMON_LINK_LIMIT, DEFAULT_ANALYZE_LIMIT, analyze_site, check_site, sample_links,
    write_report,
};
use sitefix_core::fetch::{GithubSource, fetch_missing_files};
use sitefix_core::fix::{FixOptions, FixSettings, Fixer, FixerKind, preview_fix, run_fixer};
use sitefix_core::logging::init_logging;
use sitefix_core::post_map::{PostMap, load_post_map};
use sitefix_core::rename::{dedupe, describe_move, execute_renames, plan_blog_renames};
use sitefix_core::runtime::{
    PathOverrides, ResolutionContext, Runtime, embedded_post_map, ensure_blog_root,
    ensure_site_root, init_layout, normalize_for_display, resolve_runtime,
};
use sitefix_core::sanitize::{
    DEFAULT_GIT_REF, build_rename_mapping, list_tracked_files, load_rename_mapping,
    read_file_list, write_rename_mapping,
};

const LISTING_LIMIT: usize = 20;

#[derive(Debug, Parser)]
#[command(
    name = "sitefix",
    version,
    about = "Find and repair broken internal links in a static WordPress export"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    site_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    site_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            site_root: cli.site_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Write .sitefix/config.toml and .sitefix/post-map.toml")]
    Init(InitArgs),
    #[command(about = "Report every internal link whose target file is missing")]
    Check(CheckArgs),
    #[command(about = "Group broken links from the first N pages by cause")]
    Analyze(AnalyzeArgs),
    #[command(about = "Show link counts for a few pages")]
    Sample(SampleArgs),
    #[command(about = "Run one fixer over the site (dry run unless --execute)")]
    Fix(FixArgs),
    #[command(about = "Show the diff a fixer would make to the given pages")]
    Preview(PreviewArgs),
    #[command(
        name = "rename-blog",
        about = "Move blog/index.html_p_*.html pages to their permalink paths"
    )]
    RenameBlog(ExecuteArgs),
    #[command(about = "Remove renamed blog pages identical to their permalink copy")]
    Dedupe(ExecuteArgs),
    #[command(about = "Write the Windows-safe rename mapping for tracked files")]
    Sanitize(SanitizeArgs),
    #[command(
        name = "fetch-missing",
        about = "Download mapped files missing from the site through the GitHub API"
    )]
    FetchMissing(ExecuteArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite existing config/post map files")]
    force: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(long, value_name = "PATH", help = "Write the full report as JSON")]
    report: Option<PathBuf>,
    #[arg(long, value_name = "N", default_value_t = COMMON_LINK_LIMIT)]
    top: usize,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    #[arg(long, value_name = "N", default_value_t = DEFAULT_ANALYZE_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
struct SampleArgs {
    #[arg(required = true, value_name = "FILE", help = "Paths relative to the site root")]
    files: Vec<String>,
}

#[derive(Debug, Args)]
struct FixArgs {
    #[arg(value_name = "KIND", value_parser = parse_fixer_kind)]
    kind: FixerKind,
    #[arg(long, help = "Write changes (default is a dry run)")]
    execute: bool,
    #[arg(long, help = "Do not keep .backup copies of changed files")]
    no_backup: bool,
}

#[derive(Debug, Args)]
struct PreviewArgs {
    #[arg(required = true, value_name = "FILE", help = "Paths relative to the site root")]
    files: Vec<String>,
    #[arg(
        long,
        value_name = "KIND",
        value_parser = parse_fixer_kind,
        default_value = "broken-links"
    )]
    fixer: FixerKind,
}

#[derive(Debug, Args)]
struct ExecuteArgs {
    #[arg(long, help = "Apply changes (default is a dry run)")]
    execute: bool,
}

#[derive(Debug, Args)]
struct SanitizeArgs {
    #[arg(long = "ref", value_name = "REF", default_value = DEFAULT_GIT_REF)]
    git_ref: String,
    #[arg(
        long,
        value_name = "PATH",
        help = "Read paths from a file instead of git ls-tree"
    )]
    from_list: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Mapping file to write")]
    output: Option<PathBuf>,
}

fn parse_fixer_kind(value: &str) -> Result<FixerKind, String> {
    FixerKind::parse(value).map_err(|error| error.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);
    init_logging()?;

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Check(args)) => run_check(&runtime, args),
        Some(Commands::Analyze(args)) => run_analyze(&runtime, args),
        Some(Commands::Sample(args)) => run_sample(&runtime, args),
        Some(Commands::Fix(args)) => run_fix(&runtime, args),
        Some(Commands::Preview(args)) => run_preview(&runtime, args),
        Some(Commands::RenameBlog(args)) => run_rename_blog(&runtime, args),
        Some(Commands::Dedupe(args)) => run_dedupe(&runtime, args),
        Some(Commands::Sanitize(args)) => run_sanitize(&runtime, args),
        Some(Commands::FetchMissing(args)) => run_fetch_missing(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let resolved = resolve_site(runtime)?;
    let paths = &resolved.paths;
    let report = init_layout(paths, args.force)?;

    println!("Initialized sitefix layout");
    println!("site_root: {}", normalize_for_display(&paths.site_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("post_map_path: {}", normalize_for_display(&paths.post_map_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("wrote_post_map: {}", report.wrote_post_map);
    print_diagnostics(runtime, &resolved);
    Ok(())
}

fn run_check(runtime: &RuntimeOptions, args: CheckArgs) -> Result<()> {
    let resolved = resolve_site(runtime)?;
    ensure_site_root(&resolved.paths)?;
    let domain = resolved.config.domain();
    let report = check_site(&resolved.paths, domain.as_deref())?;

    println!("link check");
    println!("site_root: {}", report.site_root);
    println!("domain: {}", domain.as_deref().unwrap_or("<none>"));
    println!("files_scanned: {}", report.files_scanned);
    println!("internal_links_checked: {}", report.internal_links_checked);
    println!("unresolvable_links: {}", report.unresolvable_links);
    println!("files_with_broken_links: {}", report.broken_files.len());
    println!("broken_links: {}", report.broken_link_count());
    if report.is_clean() {
        println!("status: no broken internal links");
    } else {
        println!("broken:");
        for file in &report.broken_files {
            println!("  {} ({})", file.file, file.links.len());
            for record in &file.links {
                println!(
                    "    - {} -> {}",
                    record.original_link, record.expected_location
                );
            }
        }
        println!("most_common:");
        for (path, count) in report.most_common(args.top) {
            println!("  {count:>5}  {path}");
        }
    }

    if let Some(path) = args.report.as_deref() {
        write_report(&report, path)?;
        println!("report: {}", normalize_for_display(path));
    }
    print_diagnostics(runtime, &resolved);
    Ok(())
}

fn run_analyze(runtime: &RuntimeOptions, args: AnalyzeArgs) -> Result<()> {
    let resolved = resolve_site(runtime)?;
    ensure_site_root(&resolved.paths)?;
    let domain = resolved.config.domain();
    let report = analyze_site(&resolved.paths, domain.as_deref(), args.limit)?;

    println!("broken link analysis");
    println!("files_analyzed: {}", report.files_analyzed);
    println!("broken_links: {}", report.broken_links);
    println!("categories:");
    for summary in &report.categories {
        println!("  {}: {}", summary.category.as_str(), summary.count);
        for example in &summary.examples {
            println!("    - {example}");
        }
    }
    if !report.most_common.is_empty() {
        println!("most_common:");
        for (link, count) in &report.most_common {
            println!("  {count:>5}  {link}");
        }
    }
    print_diagnostics(runtime, &resolved);
    Ok(())
}

fn run_sample(runtime: &RuntimeOptions, args: SampleArgs) -> Result<()> {
    let resolved = resolve_site(runtime)?;
    ensure_site_root(&resolved.paths)?;
    let domain = resolved.config.domain();
    let report = sample_links(&resolved.paths, domain.as_deref(), &args.files)?;

    println!("link sample");
    for sample in &report.samples {
        println!("file: {}", sample.file);
        println!("  total_links: {}", sample.total_links);
        println!("  internal_links: {}", sample.internal_links);
        for (index, link) in sample.first_internal.iter().enumerate() {
            println!("  {:>2}. {link}", index + 1);
        }
        let hidden = sample.internal_links.saturating_sub(sample.first_internal.len());
        if hidden > 0 {
            println!("  ... and {hidden} more");
        }
    }
    for skipped in &report.skipped {
        println!("skipped: {skipped} (not found)");
    }
    Ok(())
}

fn run_fix(runtime: &RuntimeOptions, args: FixArgs) -> Result<()> {
    let resolved = resolve_site(runtime)?;
    if args.kind.requires_blog() {
        ensure_blog_root(&resolved.paths)?;
    } else {
        ensure_site_root(&resolved.paths)?;
    }
    let fixer = Fixer::build(args.kind, &fix_settings(&resolved)?)?;
    let options = FixOptions {
        execute: args.execute,
        backup: resolved.config.backup_enabled() && !args.no_backup,
    };
    let summary = run_fixer(&resolved.paths, &fixer, options)?;

    println!("fix {}", summary.fixer.as_str());
    println!("mode: {}", mode_label(summary.dry_run));
    println!("stages: {}", fixer.pipeline().len());
    println!("files_processed: {}", summary.files_processed);
    println!("files_changed: {}", summary.files_changed);
    println!("total_fixes: {}", summary.total_fixes);
    println!("failures: {}", summary.failures);
    if !summary.changed.is_empty() {
        println!("changed:");
        for file in summary.changed.iter().take(LISTING_LIMIT) {
            println!("  - {} ({} fixes)", file.file, file.fixes);
        }
        print_overflow(summary.changed.len());
    }
    if summary.dry_run && summary.files_changed > 0 {
        println!("Run again with --execute to write these changes.");
    }
    print_diagnostics(runtime, &resolved);
    Ok(())
}

fn run_preview(runtime: &RuntimeOptions, args: PreviewArgs) -> Result<()> {
    let resolved = resolve_site(runtime)?;
    ensure_site_root(&resolved.paths)?;
    let fixer = Fixer::build(args.fixer, &fix_settings(&resolved)?)?;

    for file in &args.files {
        let preview = match preview_fix(&resolved.paths, &fixer, file) {
            Ok(preview) => preview,
            Err(error) => {
                println!("skipped: {file} ({error:#})");
                continue;
            }
        };
        println!("file: {}", preview.file);
        if preview.is_unchanged() {
            println!("fixes: none");
            continue;
        }
        println!("fixes: {}", preview.applied.join(", "));
        print!("{}", preview.diff);
    }
    Ok(())
}

fn run_rename_blog(runtime: &RuntimeOptions, args: ExecuteArgs) -> Result<()> {
    let resolved = resolve_site(runtime)?;
    ensure_blog_root(&resolved.paths)?;
    let paths = &resolved.paths;
    let plan = plan_blog_renames(paths)?;

    println!("rename blog pages");
    println!("mode: {}", mode_label(!args.execute));
    println!("candidates: {}", plan.candidates);
    println!("moves: {}", plan.moves.len());
    println!("duplicates: {}", plan.duplicates.len());
    println!("unmapped: {}", plan.failures.len());
    for failure in plan.failures.iter().take(LISTING_LIMIT) {
        println!("  ! {}: {}", failure.file, failure.reason);
    }

    if !args.execute {
        for planned in plan.moves.iter().take(LISTING_LIMIT) {
            println!("  {}", describe_move(paths, planned));
        }
        print_overflow(plan.moves.len());
        if !plan.duplicates.is_empty() {
            println!("Run `sitefix dedupe` to compare duplicates with their targets.");
        }
        return Ok(());
    }

    let outcome = execute_renames(&plan);
    println!("renamed: {}", outcome.renamed.len());
    println!("failed: {}", outcome.failures.len());
    for failure in &outcome.failures {
        println!("  ! {}: {}", failure.file, failure.reason);
    }
    print_diagnostics(runtime, &resolved);
    Ok(())
}

fn run_dedupe(runtime: &RuntimeOptions, args: ExecuteArgs) -> Result<()> {
    let resolved = resolve_site(runtime)?;
    ensure_blog_root(&resolved.paths)?;
    let report = dedupe(&resolved.paths, args.execute)?;

    println!("dedupe blog pages");
    println!("mode: {}", mode_label(report.dry_run));
    println!(
        "{}: {}",
        if report.dry_run { "identical" } else { "removed" },
        report.identical.len()
    );
    for entry in report.identical.iter().take(LISTING_LIMIT) {
        println!("  = {entry}");
    }
    print_overflow(report.identical.len());
    println!("differing: {}", report.differing.len());
    for entry in &report.differing {
        println!("  ~ {entry}");
    }
    println!("failures: {}", report.failures.len());
    for failure in &report.failures {
        println!("  ! {}: {}", failure.file, failure.reason);
    }
    Ok(())
}

fn run_sanitize(runtime: &RuntimeOptions, args: SanitizeArgs) -> Result<()> {
    let resolved = resolve_site(runtime)?;
    ensure_site_root(&resolved.paths)?;
    let files = match args.from_list.as_deref() {
        Some(list) => read_file_list(list)?,
        None => list_tracked_files(&resolved.paths.site_root, &args.git_ref)?,
    };
    let mapping = build_rename_mapping(&files);
    let output = args
        .output
        .unwrap_or_else(|| resolved.paths.rename_mapping_path.clone());
    write_rename_mapping(&mapping, &output)?;

    println!("sanitize filenames");
    println!(
        "source: {}",
        args.from_list
            .as_deref()
            .map(normalize_for_display)
            .unwrap_or_else(|| format!("git ls-tree {}", args.git_ref))
    );
    println!("files_listed: {}", files.len());
    println!("files_to_rename: {}", mapping.len());
    for (original, sanitized) in mapping.entries.iter().take(LISTING_LIMIT) {
        println!("  {original} -> {sanitized}");
    }
    print_overflow(mapping.len());
    println!("mapping: {}", normalize_for_display(&output));
    Ok(())
}

fn run_fetch_missing(runtime: &RuntimeOptions, args: ExecuteArgs) -> Result<()> {
    let resolved = resolve_site(runtime)?;
    ensure_site_root(&resolved.paths)?;
    let mapping_path = &resolved.paths.rename_mapping_path;
    if !mapping_path.exists() {
        bail!(
            "rename mapping not found: {}\nRun `sitefix sanitize` first",
            normalize_for_display(mapping_path)
        );
    }
    let mapping = load_rename_mapping(mapping_path)?;
    let source = GithubSource::from_config(&resolved.config)?;
    let summary = fetch_missing_files(&resolved.paths, &source, &mapping, args.execute)?;

    println!("fetch missing files");
    println!("mode: {}", mode_label(summary.dry_run));
    println!("repository: {}/{}@{}", source.owner, source.repo, source.branch);
    println!("mapped: {}", summary.mapped);
    println!("already_present: {}", summary.already_present);
    println!(
        "{}: {}",
        if summary.dry_run { "would_fetch" } else { "fetched" },
        summary.fetched.len()
    );
    for entry in summary.fetched.iter().take(LISTING_LIMIT) {
        println!("  {} -> {}", entry.original, entry.sanitized);
    }
    print_overflow(summary.fetched.len());
    println!("failed: {}", summary.failures.len());
    for failure in &summary.failures {
        println!("  ! {}: {}", failure.original, failure.reason);
    }
    print_diagnostics(runtime, &resolved);
    Ok(())
}

/// Post map from the configured file, or the bundled one when none exists.
fn fix_settings(resolved: &Runtime) -> Result<FixSettings> {
    let path = &resolved.paths.post_map_path;
    let post_map = if path.exists() {
        load_post_map(path)?
    } else {
        tracing::info!(
            "no post map at {}, using the bundled one",
            normalize_for_display(path)
        );
        PostMap::parse(embedded_post_map()).context("bundled post map is invalid")?
    };
    Ok(FixSettings {
        domain: resolved.config.domain(),
        post_map,
    })
}

fn resolve_site(runtime: &RuntimeOptions) -> Result<Runtime> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        site_root: runtime.site_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_runtime(&context, &overrides)?;
    let site_env = initial.paths.site_root.join(".env");
    if site_env.exists() {
        let _ = dotenvy::from_path_override(&site_env);
    }

    resolve_runtime(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, resolved: &Runtime) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", resolved.paths.diagnostics());
    }
}

fn print_overflow(total: usize) {
    if total > LISTING_LIMIT {
        println!("  ... and {} more", total - LISTING_LIMIT);
    }
}

fn mode_label(dry_run: bool) -> &'static str {
    if dry_run { "dry-run" } else { "execute" }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use sitefix_core::fix::FixerKind;

    use super::{Cli, Commands};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn fix_accepts_underscored_kind_names() {
        let cli = Cli::try_parse_from(["sitefix", "fix", "blog_index", "--execute"]).expect("parse");
        match cli.command {
            Some(Commands::Fix(args)) => {
                assert_eq!(args.kind, FixerKind::BlogIndex);
                assert!(args.execute);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn preview_defaults_to_broken_links() {
        let cli = Cli::try_parse_from(["sitefix", "preview", "index.html"]).expect("parse");
        match cli.command {
            Some(Commands::Preview(args)) => {
                assert_eq!(args.fixer, FixerKind::BrokenLinks);
                assert_eq!(args.files, vec!["index.html".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_fixer_is_rejected() {
        assert!(Cli::try_parse_from(["sitefix", "fix", "everything"]).is_err());
    }
}
