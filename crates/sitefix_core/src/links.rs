use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::Url;

use crate::filesystem::read_lossy;

const NON_NAVIGATIONAL_PREFIXES: &[&str] = &["#", "mailto:", "tel:", "javascript:"];

/// Pulls `href`/`src` attribute values out of raw HTML text. No DOM is built,
/// so broken markup can produce stray matches.
#[derive(Debug, Clone)]
pub struct LinkExtractor {
    href: Regex,
    src: Regex,
}

impl LinkExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            href: Regex::new(r#"(?i)href=["']([^"']+)["']"#)
                .context("failed to compile href pattern")?,
            src: Regex::new(r#"(?i)src=["']([^"']+)["']"#)
                .context("failed to compile src pattern")?,
        })
    }

    /// All `href` values in document order, followed by all `src` values.
    /// Duplicates are kept.
    pub fn extract(&self, content: &str) -> Vec<String> {
        let mut links = Vec::new();
        for pattern in [&self.href, &self.src] {
            for captures in pattern.captures_iter(content) {
                if let Some(value) = captures.get(1) {
                    links.push(value.as_str().to_string());
                }
            }
        }
        links
    }

    /// Like [`LinkExtractor::extract`] on a file; a read failure yields no links.
    pub fn extract_from_file(&self, path: &Path) -> Vec<String> {
        match read_lossy(path) {
            Ok(content) => self.extract(&content),
            Err(error) => {
                tracing::warn!("{error:#}");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkClass {
    NonNavigational,
    External,
    Internal,
}

/// Scheme checks run before the absolute-URL check so `#top` or `mailto:`
/// never fall through to the relative-path case.
pub fn classify_link(link: &str, domain: Option<&str>) -> LinkClass {
    if NON_NAVIGATIONAL_PREFIXES
        .iter()
        .any(|prefix| link.starts_with(prefix))
    {
        return LinkClass::NonNavigational;
    }

    if is_absolute_url(link) {
        let Some(domain) = domain.filter(|value| !value.is_empty()) else {
            return LinkClass::External;
        };
        let on_site = Url::parse(link)
            .ok()
            .and_then(|url| url.host_str().map(|host| host.contains(domain)))
            .unwrap_or(false);
        return if on_site {
            LinkClass::Internal
        } else {
            LinkClass::External
        };
    }

    LinkClass::Internal
}

pub fn is_internal_link(link: &str, domain: Option<&str>) -> bool {
    classify_link(link, domain) == LinkClass::Internal
}

pub fn is_absolute_url(link: &str) -> bool {
    link.starts_with("http://") || link.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{LinkClass, LinkExtractor, classify_link, is_internal_link};

    #[test]
    fn extracts_href_then_src_preserving_duplicates() {
        let extractor = LinkExtractor::new().expect("extractor");
        let html = r#"<img SRC="a.png"><a href="/one/">1</a><a HREF='two.html'>2</a><a href="/one/">1</a>"#;
        assert_eq!(
            extractor.extract(html),
            vec!["/one/", "two.html", "/one/", "a.png"]
        );
    }

    #[test]
    fn empty_attribute_values_are_not_links() {
        let extractor = LinkExtractor::new().expect("extractor");
        assert!(extractor.extract(r#"<a href="">x</a>"#).is_empty());
    }

    #[test]
    fn unreadable_file_yields_no_links() {
        let extractor = LinkExtractor::new().expect("extractor");
        assert!(
            extractor
                .extract_from_file(Path::new("/nonexistent/page.html"))
                .is_empty()
        );
    }

    #[test]
    fn non_navigational_schemes_are_not_internal() {
        for link in ["#top", "mailto:a@b.c", "tel:555", "javascript:void(0)"] {
            assert_eq!(
                classify_link(link, Some("example.com")),
                LinkClass::NonNavigational,
                "link={link}"
            );
        }
    }

    #[test]
    fn absolute_urls_are_internal_only_on_the_site_domain() {
        let domain = Some("example.com");
        assert!(is_internal_link("https://www.example.com/blog/", domain));
        assert!(is_internal_link("http://example.com", domain));
        assert!(!is_internal_link("https://cdn.other.org/x.js", domain));
        assert!(!is_internal_link("https://www.example.com/", None));
    }

    #[test]
    fn relative_and_root_paths_are_internal() {
        assert!(is_internal_link("/blog/tag/x/", None));
        assert!(is_internal_link("../styles.css", None));
        assert!(is_internal_link("page", None));
    }
}
