//! Substitution tables for each fixer kind.
//!
//! Tables are ordered: later stages see the output of earlier ones, and
//! every stage is written so a second pass over fixed text changes nothing.

use std::collections::HashMap;

use anyhow::Result;
use regex::Captures;

use crate::fix::{FileContext, FixSettings, FixerKind, Stage};
use crate::post_map::PostMap;

/// (escape, decoded text)
const PERCENT_ESCAPES: [(&str, &str); 9] = [
    ("%3F", "?"),
    ("%3D", "="),
    ("%3A", ":"),
    ("%2F", "/"),
    ("%26", "&"),
    ("%25", "%"),
    ("%20", " "),
    ("%22", "\""),
    ("%27", "'"),
];

/// Final path segments that are feeds or endpoints, never pages.
const NON_PAGE_SEGMENTS: [&str; 2] = ["feed", "trackback"];

pub fn stages_for(kind: FixerKind, settings: &FixSettings) -> Result<Vec<Stage>> {
    match kind {
        FixerKind::BrokenLinks => broken_links(settings.domain.as_deref()),
        FixerKind::RemainingLinks => remaining_links(),
        FixerKind::WordpressFilenames => wordpress_filenames(),
        FixerKind::AbsolutePaths => absolute_paths(),
        FixerKind::BlogAssets => blog_assets(),
        FixerKind::BlogIndex => blog_index(&settings.post_map),
        FixerKind::BlogPosts => blog_posts(&settings.post_map),
    }
}

fn group<'h>(captures: &Captures<'h>, index: usize) -> &'h str {
    captures.get(index).map_or("", |found| found.as_str())
}

fn broken_links(domain: Option<&str>) -> Result<Vec<Stage>> {
    let mut stages = Vec::new();
    let escapes = PERCENT_ESCAPES
        .iter()
        .map(|(escape, _)| regex::escape(escape))
        .collect::<Vec<_>>()
        .join("|");
    // Double-encoded escapes (`%253F`) decode fully in one run.
    stages.push(
        Stage::computed("decode-percent-escapes", &escapes, |captures, _| {
            let escape = group(captures, 0);
            PERCENT_ESCAPES
                .iter()
                .find(|(candidate, _)| *candidate == escape)
                .map_or(escape, |(_, decoded)| *decoded)
                .to_string()
        })?
        .until_stable(),
    );

    stages.push(Stage::template(
        "drop-edituri-link",
        r#"(?i)<link[^>]*rel=["']EditURI["'][^>]*>"#,
        "",
    )?);
    stages.push(Stage::template(
        "drop-xmlrpc-link",
        r#"(?i)<link[^>]*href=["'][^"']*xmlrpc\.php[^"']*["'][^>]*>"#,
        "",
    )?);
    stages.push(Stage::template(
        "local-uploads",
        r#"(?i)(href|src)=["']([^"']*)/wp-content/uploads/([^"']*)["']"#,
        r#"${1}="blog/wp-content/uploads/${3}""#,
    )?);
    stages.push(Stage::template(
        "local-includes",
        r#"(?i)(href|src)=["']([^"']*)/wp-includes/([^"']*)["']"#,
        r#"${1}="blog/wp-includes/${3}""#,
    )?);
    stages.push(Stage::template(
        "drop-wp-json-link",
        r#"(?i)<link[^>]*href=["'][^"']*wp-json[^"']*["'][^>]*>"#,
        "",
    )?);

    stages.push(Stage::template(
        "malformed-post-index",
        r#"href=["'][^"']*index\.html\?p=\d+\.html["']"#,
        r#"href="index.html""#,
    )?);

    stages.push(
        Stage::template(
            "collapse-deep-relative",
            r#"href=["'](\.\./){3,}([^"']*)["']"#,
            r#"href="/${2}""#,
        )?
        .when(|context| context.root_depth > 0),
    );

    if let Some(domain) = domain.map(str::trim).filter(|value| !value.is_empty()) {
        let host = regex::escape(domain.trim_start_matches("www."));
        stages.push(Stage::template(
            "site-absolute-to-root",
            &format!(r#"(href|src)=["']https?://(?:www\.)?{host}/([^"']*)["']"#),
            r#"${1}="/${2}""#,
        )?);
    }

    // Runs after absolute same-site URLs became root-relative, so both forms
    // get their extension in the same run.
    stages.push(Stage::computed(
        "append-html-extension",
        r#"href=["']([^"']*)/([^/."']*)["']"#,
        |captures, _| {
            let directory = group(captures, 1);
            let segment = group(captures, 2);
            let keep = segment.is_empty()
                || segment.contains(['?', '#'])
                || NON_PAGE_SEGMENTS.contains(&segment)
                || directory.contains("://");
            if keep {
                group(captures, 0).to_string()
            } else {
                format!(r#"href="{directory}/{segment}.html""#)
            }
        },
    )?);

    Ok(stages)
}

fn remaining_links() -> Result<Vec<Stage>> {
    Ok(vec![
        Stage::template(
            "blog-tag-links",
            r#"href=["'](\.\./)*tag/([^"']*)["']"#,
            r#"href="/blog/tag/${2}""#,
        )?
        .when(FileContext::in_blog),
        Stage::template(
            "blog-category-links",
            r#"href=["'](\.\./)*category/([^"']*)["']"#,
            r#"href="/blog/category/${2}""#,
        )?
        .when(FileContext::in_blog),
        Stage::template(
            "blog-comments-feed",
            r#"href=["'](\.\./)*comments/feed/["']"#,
            r#"href="/blog/comments/feed/""#,
        )?
        .when(FileContext::in_blog),
        Stage::template(
            "blog-feed",
            r#"href=["'](\.\./)*feed/["']"#,
            r#"href="/blog/feed/""#,
        )?
        .when(FileContext::in_blog),
        Stage::template(
            "blog-parent-index",
            r#"href=["'](\.\./)+index\.html["']"#,
            r#"href="/blog/""#,
        )?
        .when(FileContext::in_blog),
        Stage::template(
            "drop-ie-stylesheet",
            r#"(?is)<!--\[if[^>]*\]>.*?<link[^>]*ie\.css[^>]*>.*?<!\[endif\]-->"#,
            "",
        )?,
        Stage::template(
            "drop-html5shiv",
            r#"(?is)<!--\[if[^>]*\]>.*?html5shiv\.js.*?<!\[endif\]-->"#,
            "",
        )?,
        Stage::template(
            "responsive-stylesheet",
            r#"(?i)href=["']([^"']*)/assets/templates/main/css/master\.css["']"#,
            r#"href="/assets/templates/main/css/responsive.min.css""#,
        )?,
        Stage::template(
            "blog-uploads",
            r#"(href|src)=["']wp-content/uploads/([^"']*)["']"#,
            r#"${1}="/blog/wp-content/uploads/${2}""#,
        )?,
        Stage::template("drop-theme-link", r#"<link[^>]*wp-content/themes/[^>]*>"#, "")?,
        Stage::template(
            "bare-index-to-blog",
            r#"href=["']index\.html["']"#,
            r#"href="/blog/""#,
        )?
        .when(FileContext::in_blog),
        Stage::template(
            "feed-directory",
            r#"href=["']([^"']*)/feed/?\.html["']"#,
            r#"href="${1}/feed/""#,
        )?,
    ])
}

fn wordpress_filenames() -> Result<Vec<Stage>> {
    Ok(vec![
        Stage::template(
            "versioned-style-css",
            r"style\.min\.css\?ver=([0-9.]+)\.css",
            "style.min.css_ver_${1}.css",
        )?,
        Stage::template(
            "versioned-style",
            r"style\.min\.css\?ver=([0-9.]+)",
            "style.min.css_ver_${1}.css",
        )?,
        Stage::template(
            "versioned-comment-reply",
            r"comment-reply\.min\.js\?ver=([0-9.]+)",
            "comment-reply.min.js_ver_${1}",
        )?,
        Stage::template(
            "versioned-emoji",
            r"wp-emoji-release\.min\.js\?ver=([0-9.]+)",
            "wp-emoji-release.min.js_ver_${1}",
        )?,
        Stage::template(
            "versioned-jquery",
            r"jquery\.js\?ver=([0-9.]+)",
            "jquery.js_ver_${1}",
        )?,
        Stage::template(
            "versioned-jquery-migrate",
            r"jquery-migrate\.min\.js\?ver=([0-9.]+)",
            "jquery-migrate.min.js_ver_${1}",
        )?,
    ])
}

fn absolute_paths() -> Result<Vec<Stage>> {
    Ok(vec![
        Stage::template(
            "root-assets",
            r#"(href|src)="(\.\./)+assets/"#,
            r#"${1}="/assets/"#,
        )?,
        Stage::template(
            "root-icons",
            r#"href="(\.\./)+(apple-touch-icon|favicon)"#,
            r#"href="/${2}"#,
        )?,
        Stage::template(
            "root-static-files",
            r#"(href|src)="(\.\./)+([^"]*\.(?:css|js|ico|png|jpg|svg))""#,
            r#"${1}="/${3}""#,
        )?,
    ])
}

fn blog_assets() -> Result<Vec<Stage>> {
    Ok(vec![
        Stage::computed(
            "depth-blog-paths",
            r#"(href|src)="blog/([^"]*)""#,
            |captures, context| {
                format!(
                    r#"{}="{}blog/{}""#,
                    group(captures, 1),
                    context.root_prefix(),
                    group(captures, 2)
                )
            },
        )?
        .when(|context| context.root_depth > 0),
        Stage::computed(
            "depth-blog-paths-single-quoted",
            r"(href|src)='blog/([^']*)'",
            |captures, context| {
                format!(
                    "{}='{}blog/{}'",
                    group(captures, 1),
                    context.root_prefix(),
                    group(captures, 2)
                )
            },
        )?
        .when(|context| context.root_depth > 0),
    ])
}

fn blog_index(post_map: &PostMap) -> Result<Vec<Stage>> {
    let rewrites: HashMap<String, String> = post_map
        .legacy_link_rewrites()
        .into_iter()
        .map(|rewrite| (rewrite.from, rewrite.to))
        .collect();
    let single_quoted = rewrites.clone();

    let titles = post_map.clone();

    Ok(vec![
        Stage::computed(
            "legacy-post-links",
            r#"href="(index\.html\?p=\d+\.html(?:#more-\d+)?)""#,
            move |captures, context| match rewrites.get(group(captures, 1)) {
                Some(target) => format!(r#"href="{}{target}""#, context.blog_prefix()),
                None => group(captures, 0).to_string(),
            },
        )?,
        Stage::computed(
            "legacy-post-links-single-quoted",
            r"href='(index\.html\?p=\d+\.html(?:#more-\d+)?)'",
            move |captures, context| match single_quoted.get(group(captures, 1)) {
                Some(target) => format!("href='{}{target}'", context.blog_prefix()),
                None => group(captures, 0).to_string(),
            },
        )?,
        Stage::computed(
            "continue-reading-links",
            r#"<a href="/blog/" rel="bookmark" title="Permanent Link to ([^"]+)">Continue Reading</a>"#,
            move |captures, context| {
                let title = group(captures, 1);
                match titles.find_slug_by_title(title) {
                    Some(slug) => format!(
                        r#"<a href="{}{slug}index.html" rel="bookmark" title="Permanent Link to {title}">Continue Reading</a>"#,
                        context.blog_prefix()
                    ),
                    None => {
                        tracing::warn!(
                            "{}: no post matches title {title:?}",
                            context.relative_path
                        );
                        group(captures, 0).to_string()
                    }
                }
            },
        )?,
    ])
}

fn blog_posts(post_map: &PostMap) -> Result<Vec<Stage>> {
    let titles = post_map.clone();

    Ok(vec![
        Stage::computed(
            "h2-title-links",
            r#"<h2><a href="/blog/" rel="bookmark" title="Permanent Link to ([^"]+)">([^<]+)</a></h2>"#,
            move |captures, context| {
                let title = group(captures, 1);
                let text = group(captures, 2);
                match titles.find_slug_by_title(title) {
                    Some(slug) => format!(
                        r#"<h2><a href="{}{slug}index.html" rel="bookmark" title="Permanent Link to {title}">{text}</a></h2>"#,
                        context.blog_prefix()
                    ),
                    None => {
                        tracing::warn!(
                            "{}: no post matches title {title:?}",
                            context.relative_path
                        );
                        group(captures, 0).to_string()
                    }
                }
            },
        )?
        .when(FileContext::is_listing_page),
        Stage::computed(
            "relative-assets",
            r#"(href|src)="/assets/"#,
            |captures, context| {
                format!(r#"{}="{}assets/"#, group(captures, 1), context.root_prefix())
            },
        )?
        .when(FileContext::is_blog_subpage),
        Stage::computed(
            "relative-icons",
            r#"href="/(apple-touch-icon|favicon)"#,
            |captures, context| {
                format!(r#"href="{}{}"#, context.root_prefix(), group(captures, 1))
            },
        )?
        .when(FileContext::is_blog_subpage),
    ])
}
