use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "sitefix/0.2";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GITHUB_BRANCH: &str = "main";

pub const EMBEDDED_CONFIG_TEMPLATE: &str = include_str!("../../../config/default-config.toml");

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub fix: FixSection,
    #[serde(default)]
    pub github: GithubSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub root: Option<String>,
    pub domain: Option<String>,
    pub post_map: Option<String>,
    pub rename_mapping: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FixSection {
    pub backup: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct GithubSection {
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

impl SiteConfig {
    /// Resolve the site domain: env SITEFIX_DOMAIN > config > None.
    pub fn domain(&self) -> Option<String> {
        if let Some(value) = non_empty_env("SITEFIX_DOMAIN") {
            return Some(value);
        }
        self.site
            .domain
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    /// Fixers keep a `.backup` sibling unless the config turns it off.
    pub fn backup_enabled(&self) -> bool {
        self.fix.backup.unwrap_or(true)
    }

    pub fn github_branch(&self) -> String {
        self.github
            .branch
            .clone()
            .unwrap_or_else(|| DEFAULT_GITHUB_BRANCH.to_string())
    }

    pub fn github_api_url(&self) -> String {
        self.github
            .api_url
            .as_deref()
            .map(|value| value.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string())
    }

    /// Resolve user agent: env SITEFIX_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Some(value) = non_empty_env("SITEFIX_USER_AGENT") {
            return value;
        }
        self.github
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Load and parse a SiteConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<SiteConfig> {
    if !config_path.exists() {
        return Ok(SiteConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: SiteConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
