//! Configuration loading and resolution.
//!
//! Each setting is taken from the first source that provides it:
//! command-line flag, environment variable, JSON config file, built-in
//! default.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use portal_orchestrator::registry::DEFAULT_HISTORY_LIMIT;
use portal_orchestrator::{ConfigOverrides, ExecutionConfig};

pub const DEFAULT_ADDR: &str = "127.0.0.1:7878";
pub const DEFAULT_USER_AGENT: &str = concat!("portal-orchestrator/", env!("CARGO_PKG_VERSION"));

/// Fully resolved server settings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub history_limit: usize,
    /// Baseline for every execution; request fields override it.
    pub defaults: ExecutionConfig,
    pub user_agent: String,
    /// Drop targets that leave the origin of the page they were found on.
    pub same_origin: bool,
    /// Where the file layer came from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            history_limit: DEFAULT_HISTORY_LIMIT,
            defaults: ExecutionConfig::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            same_origin: true,
            source: None,
        }
    }
}

/// The on-disk layer. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    pub addr: Option<String>,
    pub history_limit: Option<usize>,
    pub defaults: ConfigOverrides,
    pub user_agent: Option<String>,
    pub same_origin: Option<bool>,
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub addr: Option<String>,
    pub history_limit: Option<usize>,
    pub concurrency: Option<usize>,
}

/// Resolve the config file path.
///
/// Explicit path, then `PORTAL_CONFIG`, then `./.portal/config.json`, then
/// `~/.portal-orchestrator/config.json`. Only the explicit path is returned
/// when it does not exist, so a typo there is reported instead of ignored.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(env_path) = std::env::var("PORTAL_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    let cwd_config = PathBuf::from(".portal/config.json");
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    dirs::home_dir()
        .map(|home| home.join(".portal-orchestrator").join("config.json"))
        .filter(|path| path.exists())
}

pub fn load_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

fn parse_addr(raw: &str, origin: &str) -> Result<SocketAddr> {
    raw.parse()
        .with_context(|| format!("invalid listen address {raw:?} from {origin}"))
}

impl ServerConfig {
    /// Resolve from every layer using the process environment.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let path = resolve_config_path(cli.config.as_deref());
        let file = match &path {
            Some(path) => Some(load_file(path)?),
            None => None,
        };
        let mut config = Self::layered(file, |key| std::env::var(key).ok(), cli)?;
        config.source = path;
        Ok(config)
    }

    /// Layer `file`, then the variables visible through `env`, then `cli`
    /// over the defaults.
    pub fn layered(
        file: Option<FileConfig>,
        env: impl Fn(&str) -> Option<String>,
        cli: &CliOverrides,
    ) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file) = file {
            if let Some(addr) = &file.addr {
                config.addr = parse_addr(addr, "config file")?;
            }
            if let Some(limit) = file.history_limit {
                config.history_limit = limit;
            }
            config.defaults = file
                .defaults
                .resolve(&config.defaults)
                .context("invalid execution defaults in config file")?;
            if let Some(agent) = file.user_agent {
                config.user_agent = agent;
            }
            if let Some(same_origin) = file.same_origin {
                config.same_origin = same_origin;
            }
        }

        if let Some(addr) = env("PORTAL_ADDR") {
            config.addr = parse_addr(&addr, "PORTAL_ADDR")?;
        }
        if let Some(limit) = env("PORTAL_HISTORY_LIMIT") {
            config.history_limit = limit
                .trim()
                .parse()
                .with_context(|| format!("invalid PORTAL_HISTORY_LIMIT {limit:?}"))?;
        }
        if let Some(agent) = env("PORTAL_USER_AGENT") {
            config.user_agent = agent;
        }

        if let Some(addr) = &cli.addr {
            config.addr = parse_addr(addr, "--addr")?;
        }
        if let Some(limit) = cli.history_limit {
            config.history_limit = limit;
        }
        if let Some(concurrency) = cli.concurrency {
            config.defaults.concurrency = concurrency;
        }

        config.defaults.validate()?;
        if config.history_limit == 0 {
            anyhow::bail!("history limit must be at least 1");
        }
        Ok(config)
    }
}
