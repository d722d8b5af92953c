use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;

use crate::config::SiteConfig;
use crate::runtime::SitePaths;
use crate::sanitize::RenameMapping;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Repository the site was exported into, read through the contents API.
#[derive(Debug, Clone)]
pub struct GithubSource {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub api_url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl GithubSource {
    pub fn from_config(config: &SiteConfig) -> Result<Self> {
        let required = |value: &Option<String>, key: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| anyhow!("fetch-missing requires [github] {key} in config"))
        };
        let timeout_ms = env::var("SITEFIX_HTTP_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        Ok(Self {
            owner: required(&config.github.owner, "owner")?,
            repo: required(&config.github.repo, "repo")?,
            branch: config.github_branch(),
            api_url: config.github_api_url(),
            user_agent: config.user_agent(),
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    /// `{api}/repos/{owner}/{repo}/contents/{path}?ref={branch}` with each
    /// path segment percent-encoded.
    pub fn contents_url(&self, path: &str) -> Result<Url> {
        let mut url = Url::parse(&self.api_url)
            .with_context(|| format!("invalid GitHub API URL {}", self.api_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("GitHub API URL cannot take a path: {}", self.api_url))?
            .pop_if_empty()
            .extend(["repos", self.owner.as_str(), self.repo.as_str(), "contents"])
            .extend(path.split('/').filter(|segment| !segment.is_empty()));
        url.query_pairs_mut().append_pair("ref", &self.branch);
        Ok(url)
    }

    pub fn client(&self) -> Result<Client> {
        Client::builder()
            .timeout(self.timeout)
            .build()
            .context("failed to build GitHub HTTP client")
    }

    /// Fetch one file. Anonymous; a non-success status is an error.
    pub fn fetch_file(&self, client: &Client, path: &str) -> Result<Vec<u8>> {
        let url = self.contents_url(path)?;
        let response = client
            .get(url.clone())
            .header("User-Agent", self.user_agent.clone())
            .header("Accept", "application/vnd.github+json")
            .send()
            .with_context(|| format!("failed to fetch {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} while fetching {}", status.as_u16(), path);
        }
        let payload: Value = response
            .json()
            .with_context(|| format!("failed to decode contents response for {path}"))?;
        decode_contents_payload(&payload)
    }
}

/// Body of a contents API response. `encoding = "base64"` payloads are
/// decoded (GitHub wraps them with newlines); anything else is taken as text.
pub fn decode_contents_payload(payload: &Value) -> Result<Vec<u8>> {
    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("contents response has no content field"))?;
    match payload.get("encoding").and_then(Value::as_str) {
        Some("base64") => {
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD
                .decode(compact)
                .context("contents response has invalid base64")
        }
        _ => Ok(content.as_bytes().to_vec()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchEntry {
    pub original: String,
    pub sanitized: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchFailure {
    pub original: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchSummary {
    pub dry_run: bool,
    pub mapped: usize,
    pub already_present: usize,
    /// Fetched and written, or in a dry run, what would be.
    pub fetched: Vec<FetchEntry>,
    pub failures: Vec<FetchFailure>,
}

/// Download every mapped file whose sanitized path is missing under the site
/// root and store it under the sanitized name. A dry run lists them without
/// touching the network.
pub fn fetch_missing_files(
    paths: &SitePaths,
    source: &GithubSource,
    mapping: &RenameMapping,
    execute: bool,
) -> Result<FetchSummary> {
    let client = if execute { Some(source.client()?) } else { None };
    fetch_missing_with(paths, mapping, execute, |original| match &client {
        Some(client) => source.fetch_file(client, original),
        None => bail!("network access is disabled in dry run"),
    })
}

fn fetch_missing_with<F>(
    paths: &SitePaths,
    mapping: &RenameMapping,
    execute: bool,
    mut fetch: F,
) -> Result<FetchSummary>
where
    F: FnMut(&str) -> Result<Vec<u8>>,
{
    let mut summary = FetchSummary {
        dry_run: !execute,
        mapped: mapping.len(),
        ..FetchSummary::default()
    };

    for (original, sanitized) in &mapping.entries {
        let target = paths.site_root.join(sanitized);
        if target.exists() {
            summary.already_present += 1;
            continue;
        }
        let entry = FetchEntry {
            original: original.clone(),
            sanitized: sanitized.clone(),
        };
        if !execute {
            summary.fetched.push(entry);
            continue;
        }

        tracing::info!("fetching {original}");
        let written = fetch(original).and_then(|bytes| {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(&target, bytes)
                .with_context(|| format!("failed to write {}", target.display()))
        });
        match written {
            Ok(()) => summary.fetched.push(entry),
            Err(error) => {
                tracing::warn!("{original}: {error:#}");
                summary.failures.push(FetchFailure {
                    original: original.clone(),
                    reason: format!("{error:#}"),
                });
            }
        }
    }

    Ok(summary)
}
