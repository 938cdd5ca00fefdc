//! Configuration: CLI flags (§6) layered over `config.yaml`, plus the
//! plugin configuration file and the build-info record produced by the
//! hermetic runner (§4.H).

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::site::SiteConfig;

/// CLI surface (§6).
#[derive(Debug, Parser)]
#[command(name = "secureblog", version, about = "Hermetic static-site generator with a signed integrity manifest")]
pub struct Cli {
    /// Content directory path.
    #[arg(long, default_value = "content")]
    pub content: PathBuf,

    /// Output directory path.
    #[arg(long, default_value = "dist")]
    pub output: PathBuf,

    /// Template directory path.
    #[arg(long, default_value = "templates")]
    pub templates: PathBuf,

    /// Path to `config.yaml`.
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Path to the plugin configuration file.
    #[arg(long)]
    pub plugin_config: Option<PathBuf>,

    /// Reads an existing output directory and its manifest, reports
    /// mismatches, exits non-zero on any divergence.
    #[arg(long)]
    pub verify_only: bool,

    /// Prints registered plugin names, versions, capabilities and exits.
    #[arg(long)]
    pub list_plugins: bool,

    /// Produce a signed manifest envelope.
    #[arg(long)]
    pub sign: bool,
}

/// `config.yaml` contents.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Site title.
    pub title: String,
    /// Site base URL, no trailing slash.
    pub url: String,
    /// Author name.
    pub author: String,
    /// Worker count policy.
    #[serde(default)]
    pub workers: WorkersConfig,
    /// Enable Markdown autolinking of bare URLs.
    #[serde(default = "default_true")]
    pub autolink: bool,
    /// Whole-build cancellation ceiling, in seconds. Default 600 (10 min).
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    /// Path to an Ed25519 signing key file (32 raw bytes), used only when
    /// `--sign` is passed. Never read from an environment variable: §6
    /// only allows a presence *indicator* in the environment, never key
    /// material.
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WorkersConfig {
    /// `workers: 8`
    Fixed(usize),
    /// `workers: derived`
    Derived(String),
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self::Fixed(4)
    }
}

impl WorkersConfig {
    /// Resolve to a worker count, recording whether it was derived.
    #[must_use]
    pub fn resolve(&self) -> (usize, bool) {
        match self {
            Self::Fixed(n) => (*n, false),
            Self::Derived(_) => (std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get), true),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_build_timeout() -> u64 {
    600
}

/// Load `config.yaml` from `path`, or fall back to conservative defaults
/// if the file does not exist — matching the teacher's "no config file is
/// a valid starting point" behaviour.
///
/// # Errors
///
/// Returns [`BuildError::Configuration`] if the file exists but fails to
/// parse, and [`BuildError::Io`] on a read failure.
pub fn load_config(path: &Path) -> Result<Config, BuildError> {
    if !path.exists() {
        return Ok(Config {
            title: "SecureBlog".to_string(),
            url: "https://example.com".to_string(),
            author: "Anonymous".to_string(),
            workers: WorkersConfig::default(),
            autolink: true,
            build_timeout_secs: default_build_timeout(),
            signing_key_path: None,
        });
    }
    let text = std::fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
    serde_yaml::from_str(&text).map_err(|e| BuildError::Configuration(format!("invalid config.yaml: {e}")))
}

impl Config {
    /// Project to the narrower [`SiteConfig`] surfaced to templates/feeds.
    #[must_use]
    pub fn site_config(&self) -> SiteConfig {
        SiteConfig { title: self.title.clone(), url: self.url.clone(), author: self.author.clone() }
    }
}

/// One external, sandboxed plugin entry from the plugin configuration file
/// (§6 "plugin configuration file path").
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalPluginSpec {
    /// Unique plugin name.
    pub name: String,
    /// Path to the plugin executable.
    pub binary: PathBuf,
    /// Priority; lower runs first within a stage.
    #[serde(default)]
    pub priority: i32,
    /// Capability names: any of `content`, `render`, `security`, `build`,
    /// `output`, `assetfs`.
    pub capabilities: Vec<String>,
    /// Unprivileged uid to run the child as. Defaults to `nobody` (65534).
    #[serde(default = "default_uid")]
    pub uid: u32,
    /// Unprivileged gid to run the child as. Defaults to `nogroup` (65534).
    #[serde(default = "default_uid")]
    pub gid: u32,
    /// Wall-clock timeout, in seconds. Defaults to 30 per §4.D.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// CPU time limit, seconds.
    #[serde(default = "default_cpu_seconds")]
    pub cpu_seconds: u64,
    /// Address-space limit, bytes.
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,
    /// Open file descriptor limit.
    #[serde(default = "default_max_fds")]
    pub max_fds: u64,
    /// Opaque configuration forwarded to the plugin in the request envelope.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_uid() -> u32 {
    65534
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cpu_seconds() -> u64 {
    10
}

fn default_memory_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_max_fds() -> u64 {
    64
}

/// The plugin configuration file's top-level shape: a flat list of
/// sandboxed plugins to register alongside the built-ins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginFileConfig {
    /// External plugins to register.
    #[serde(default)]
    pub plugins: Vec<ExternalPluginSpec>,
}

/// Load the plugin configuration file, if one was given.
///
/// # Errors
///
/// Returns [`BuildError::Configuration`] if the file exists but fails to
/// parse, and [`BuildError::Io`] on a read failure.
pub fn load_plugin_config(path: Option<&Path>) -> Result<PluginFileConfig, BuildError> {
    let Some(path) = path else {
        return Ok(PluginFileConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
    serde_yaml::from_str(&text)
        .map_err(|e| BuildError::Configuration(format!("invalid plugin configuration: {e}")))
}

/// Record produced alongside the output: the build's declared environment.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    /// Fixed build epoch (seconds since Unix epoch).
    pub timestamp: i64,
    /// Source commit identifier.
    pub commit: String,
    /// `secureblog-rs` version that produced this build.
    pub runner_version: String,
    /// Coarse fingerprint of the build environment (OS + arch), never a
    /// hostname or other host-identifying value.
    pub environment_fingerprint: String,
    /// Whether network isolation was asserted by the kernel (`unshare`
    /// succeeded) rather than merely requested.
    pub network_isolation_asserted: bool,
    /// Resolved rayon worker count.
    pub workers: usize,
    /// Whether `workers` was derived from the host CPU count rather than
    /// pinned in configuration.
    pub workers_derived: bool,
    /// Whether the Markdown content plugin enabled autolinking (§9 Open
    /// Questions).
    pub autolink_enabled: bool,
}
