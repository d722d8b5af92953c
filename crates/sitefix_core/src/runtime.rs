use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{EMBEDDED_CONFIG_TEMPLATE, SiteConfig, load_config};
use crate::filesystem::normalize_pathbuf;

pub const STATE_DIR_NAME: &str = ".sitefix";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const POST_MAP_FILENAME: &str = "post-map.toml";
pub const RENAME_MAPPING_FILENAME: &str = "rename_mapping.txt";
pub const BLOG_DIR_NAME: &str = "blog";

const EMBEDDED_POST_MAP: &str = include_str!("../../../config/default-post-map.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub site_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

/// Every location a run touches. The site root is the coordinate origin for
/// link resolution and never changes during a run.
#[derive(Debug, Clone)]
pub struct SitePaths {
    pub site_root: PathBuf,
    pub blog_root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub post_map_path: PathBuf,
    pub rename_mapping_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl SitePaths {
    /// Layout rooted at `site_root` with state kept under `<site_root>/.sitefix`.
    pub fn for_site_root(site_root: &Path) -> Self {
        let site_root = normalize_pathbuf(site_root);
        let state_dir = site_root.join(STATE_DIR_NAME);
        Self {
            blog_root: site_root.join(BLOG_DIR_NAME),
            config_path: state_dir.join(CONFIG_FILENAME),
            post_map_path: state_dir.join(POST_MAP_FILENAME),
            rename_mapping_path: state_dir.join(RENAME_MAPPING_FILENAME),
            state_dir,
            site_root,
            root_source: ValueSource::Flag,
            config_source: ValueSource::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "site_root={} ({})\nblog_root={}\nstate_dir={}\nconfig_path={} ({})\npost_map_path={}\nrename_mapping_path={}",
            normalize_for_display(&self.site_root),
            self.root_source.as_str(),
            normalize_for_display(&self.blog_root),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.post_map_path),
            normalize_for_display(&self.rename_mapping_path),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Runtime {
    pub paths: SitePaths,
    pub config: SiteConfig,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
    pub wrote_post_map: bool,
}

pub fn resolve_runtime(context: &ResolutionContext, overrides: &PathOverrides) -> Result<Runtime> {
    resolve_runtime_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_runtime_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<Runtime>
where
    F: Fn(&str) -> Option<String>,
{
    let state_dir = context.cwd.join(STATE_DIR_NAME);

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_blank(lookup_env("SITEFIX_CONFIG")) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };
    let config = load_config(&config_path)?;

    let (site_root, root_source) = if let Some(path) = overrides.site_root.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_blank(lookup_env("SITEFIX_SITE_ROOT")) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else if let Some(value) = non_blank(config.site.root.clone()) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Config)
    } else {
        (context.cwd.clone(), ValueSource::Default)
    };
    let site_root = normalize_pathbuf(&site_root);

    let post_map_path = config
        .site
        .post_map
        .as_deref()
        .map(|value| absolutize(Path::new(value), &context.cwd))
        .unwrap_or_else(|| state_dir.join(POST_MAP_FILENAME));
    let rename_mapping_path = config
        .site
        .rename_mapping
        .as_deref()
        .map(|value| absolutize(Path::new(value), &context.cwd))
        .unwrap_or_else(|| state_dir.join(RENAME_MAPPING_FILENAME));

    Ok(Runtime {
        paths: SitePaths {
            blog_root: site_root.join(BLOG_DIR_NAME),
            site_root,
            state_dir,
            config_path,
            post_map_path,
            rename_mapping_path,
            root_source,
            config_source,
        },
        config,
    })
}

/// Abort the run when the site directory is missing; nothing is processed.
pub fn ensure_site_root(paths: &SitePaths) -> Result<()> {
    if !paths.site_root.is_dir() {
        bail!(
            "Site directory not found: {}\nPass --site-root, set SITEFIX_SITE_ROOT, or set [site] root in {}",
            normalize_for_display(&paths.site_root),
            normalize_for_display(&paths.config_path)
        );
    }
    Ok(())
}

pub fn ensure_blog_root(paths: &SitePaths) -> Result<()> {
    ensure_site_root(paths)?;
    if !paths.blog_root.is_dir() {
        bail!(
            "Blog directory not found: {}",
            normalize_for_display(&paths.blog_root)
        );
    }
    Ok(())
}

pub fn init_layout(paths: &SitePaths, force: bool) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    let mut required_dirs = vec![paths.state_dir.clone()];
    for file in [&paths.config_path, &paths.post_map_path] {
        if let Some(parent) = file.parent() {
            required_dirs.push(parent.to_path_buf());
        }
    }

    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(&paths.config_path, EMBEDDED_CONFIG_TEMPLATE, force)?;
    let wrote_post_map = write_text_file(&paths.post_map_path, EMBEDDED_POST_MAP, force)?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
        wrote_post_map,
    })
}

pub fn embedded_post_map() -> &'static str {
    EMBEDDED_POST_MAP
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
