//! TOML configuration.
//!
//! Every section and key is optional. A missing config file falls back to
//! [`Config::default`], so `mailbind serve` works out of the box.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//! max_upload_bytes = 52428800
//!
//! [batch]
//! on_error = "skip"
//! concurrency = 4
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use mailbind_core::identifier::{
    sanitize_stem, IdentifierExtractor, DEFAULT_FALLBACK_PREFIX, DEFAULT_PATTERN,
};
use mailbind_core::segment::{Segmenter, DEFAULT_MARKER};

use crate::batch::OUTPUT_DIR;
use crate::render::{PAGE_HEIGHT, PAGE_WIDTH};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub thread: ThreadConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_upload_field")]
    pub upload_field: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
            upload_field: default_upload_field(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}
fn default_upload_field() -> String {
    "msgfile".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    /// Mail-container extension, without the dot.
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            extension: default_extension(),
        }
    }
}

fn default_extension() -> String {
    "msg".to_string()
}

/// Whether `name` ends with `.<ext>`, ignoring ASCII case.
pub fn has_extension(name: &str, ext: &str) -> bool {
    let suffix = format!(".{}", ext.trim_start_matches('.'));
    name.len() > suffix.len()
        && name
            .get(name.len() - suffix.len()..)
            .map(|tail| tail.eq_ignore_ascii_case(&suffix))
            .unwrap_or(false)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThreadConfig {
    /// Field name that starts each message in a thread.
    #[serde(default = "default_marker")]
    pub marker: String,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
        }
    }
}

fn default_marker() -> String {
    DEFAULT_MARKER.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct NamingConfig {
    #[serde(default = "default_identifier_pattern")]
    pub identifier_pattern: String,
    #[serde(default = "default_fallback_prefix")]
    pub fallback_prefix: String,
    #[serde(default = "default_true")]
    pub search_subject: bool,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            identifier_pattern: default_identifier_pattern(),
            fallback_prefix: default_fallback_prefix(),
            search_subject: true,
        }
    }
}

fn default_identifier_pattern() -> String {
    DEFAULT_PATTERN.to_string()
}
fn default_fallback_prefix() -> String {
    DEFAULT_FALLBACK_PREFIX.to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RenderEngine {
    /// Native PDF layout, no external tools.
    #[default]
    Builtin,
    /// External HTML-to-PDF command.
    Command,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    #[serde(default)]
    pub engine: RenderEngine,
    /// Argument vector; `{input}` and `{output}` are substituted.
    #[serde(default = "default_render_command")]
    pub command: Vec<String>,
    /// Seconds before an external render is killed. 0 disables the timeout.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default = "default_margin")]
    pub margin: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            engine: RenderEngine::Builtin,
            command: default_render_command(),
            timeout_secs: 0,
            font_size: default_font_size(),
            margin: default_margin(),
        }
    }
}

fn default_render_command() -> Vec<String> {
    vec![
        "weasyprint".to_string(),
        "{input}".to_string(),
        "{output}".to_string(),
    ]
}
fn default_font_size() -> f32 {
    10.0
}
fn default_margin() -> f32 {
    50.0
}

/// What the batch does when one container fails.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Drop the failed container and keep going.
    #[default]
    Skip,
    /// Fail the whole request on the first container error.
    Abort,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            other => Err(format!("unknown failure policy '{}': use skip or abort", other)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default)]
    pub on_error: FailurePolicy,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            on_error: FailurePolicy::Skip,
            concurrency: default_concurrency(),
            archive_name: default_archive_name(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}
fn default_archive_name() -> String {
    "documents.zip".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Parent directory of per-request workspaces.
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("mailbind")
}

/// Reads and validates a config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        let config = Config::default();
        validate(&config)?;
        return Ok(config);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config = parse_config(&content)?;
    Ok(config)
}

/// Parses and validates TOML config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.server.max_upload_bytes == 0 {
        anyhow::bail!("server.max_upload_bytes must be > 0");
    }
    if config.server.upload_field.trim().is_empty() {
        anyhow::bail!("server.upload_field must not be empty");
    }

    let ext = config.input.extension.trim_start_matches('.');
    if ext.is_empty() || ext.contains(&['/', '\\'][..]) {
        anyhow::bail!("input.extension must be a bare extension such as 'msg'");
    }

    Segmenter::new(&config.thread.marker)
        .map_err(|e| anyhow::anyhow!("thread.marker: {}", e))?;

    IdentifierExtractor::new(&config.naming.identifier_pattern)
        .with_context(|| "naming.identifier_pattern is not a valid regex")?;
    let prefix = config.naming.fallback_prefix.trim();
    if prefix.is_empty() || sanitize_stem(prefix) != prefix {
        anyhow::bail!("naming.fallback_prefix may only use letters, digits, '-', '_' and inner '.'");
    }

    if config.render.engine == RenderEngine::Command {
        let cmd = &config.render.command;
        if cmd.is_empty() {
            anyhow::bail!("render.command must not be empty when engine is 'command'");
        }
        if !cmd.iter().any(|a| a.contains("{output}")) {
            anyhow::bail!("render.command must contain an {{output}} placeholder");
        }
    }
    let (font_size, margin) = (config.render.font_size, config.render.margin);
    if !font_size.is_finite() || font_size <= 0.0 {
        anyhow::bail!("render.font_size must be a number > 0");
    }
    if !margin.is_finite() || margin < 0.0 {
        anyhow::bail!("render.margin must be a number >= 0");
    }
    if 2.0 * margin >= PAGE_WIDTH.min(PAGE_HEIGHT) {
        anyhow::bail!("render.margin leaves no room on an A4 page");
    }

    if config.batch.concurrency == 0 {
        anyhow::bail!("batch.concurrency must be >= 1");
    }
    let archive = config.batch.archive_name.trim();
    if archive.is_empty()
        || archive.contains(&['/', '\\'][..])
        || archive.chars().all(|c| c == '.')
    {
        anyhow::bail!("batch.archive_name must be a plain file name");
    }
    if archive.eq_ignore_ascii_case(OUTPUT_DIR) {
        anyhow::bail!("batch.archive_name must not be '{}'", OUTPUT_DIR);
    }

    Ok(())
}
