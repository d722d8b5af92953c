use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// WordPress post ids mapped to permalink slugs (relative to the blog root,
/// with a trailing `/`), plus title fragments that identify a post.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PostMap {
    #[serde(default)]
    pub posts: BTreeMap<String, String>,
    #[serde(default)]
    pub titles: Vec<TitleRule>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TitleRule {
    /// Lowercase fragment looked for inside a post title.
    #[serde(rename = "match")]
    pub fragment: String,
    pub post: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRewrite {
    pub from: String,
    pub to: String,
}

impl PostMap {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse post map")
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty() && self.titles.is_empty()
    }

    pub fn slug_for_id(&self, id: &str) -> Option<&str> {
        self.posts.get(id).map(String::as_str)
    }

    /// Slug of the first title rule whose fragment occurs in `title`
    /// (compared lowercase). Rules are tried in file order. A rule that
    /// points at an unknown or empty slug counts as no match.
    pub fn find_slug_by_title(&self, title: &str) -> Option<&str> {
        let lowered = title.to_lowercase();
        let rule = self
            .titles
            .iter()
            .find(|rule| lowered.contains(&rule.fragment.to_lowercase()))?;
        self.slug_for_id(&rule.post).filter(|slug| !slug.is_empty())
    }

    /// Exact-text rewrites for the legacy `index.html?p=<id>.html` links the
    /// mirror left in listing pages. Posts with an empty slug are skipped.
    pub fn legacy_link_rewrites(&self) -> Vec<LinkRewrite> {
        let mut rewrites = Vec::new();
        for (id, slug) in &self.posts {
            if slug.is_empty() {
                continue;
            }
            let to = format!("{slug}index.html");
            rewrites.push(LinkRewrite {
                from: format!("index.html?p={id}.html#more-{id}"),
                to: to.clone(),
            });
            rewrites.push(LinkRewrite {
                from: format!("index.html?p={id}.html"),
                to,
            });
        }
        rewrites
    }
}

/// Load the post map at `path`. A missing file is an empty map.
pub fn load_post_map(path: &Path) -> Result<PostMap> {
    if !path.exists() {
        tracing::debug!("no post map at {}", path.display());
        return Ok(PostMap::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    PostMap::parse(&content).with_context(|| format!("invalid post map {}", path.display()))
}
