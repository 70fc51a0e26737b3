//! Herald configuration.
//!
//! Loaded from a YAML file (`herald.yaml` by default). Every section is
//! optional and falls back to defaults, so an empty or missing file yields a
//! runnable local setup. `${NAME}` references anywhere in the file are
//! substituted from the environment before parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub execution: ExecutionConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub notify: NotifyConfig,
    pub projects: HashMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    /// Parsed as a wide integer so out-of-range values produce a clear
    /// validation error instead of a serde overflow message.
    pub port: u32,
    pub public_url: String,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8420,
            public_url: String::new(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Path to the agent CLI binary.
    pub claude_path: String,
    /// Scratch directory for per-task prompt files.
    pub work_dir: String,
    #[serde(with = "duration_str")]
    pub default_timeout: Duration,
    /// Global cap on simultaneously running tasks across all projects.
    pub max_concurrent: usize,
    /// Extra environment passed to every agent process.
    pub env: HashMap<String, String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            claude_path: "claude".to_string(),
            work_dir: "~/.herald".to_string(),
            default_timeout: Duration::from_secs(30 * 60),
            max_concurrent: 3,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub enabled: bool,
    pub client_id: String,
    /// Empty means a public client; the token endpoint will not require a
    /// secret.
    pub client_secret: String,
    /// HMAC key for JWT signing. Empty means a random ephemeral key is
    /// generated at startup (tokens then do not survive a restart).
    pub jwt_secret: String,
    #[serde(with = "duration_str")]
    pub access_token_ttl: Duration,
    #[serde(with = "duration_str")]
    pub refresh_token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client_id: "herald".to_string(),
            client_secret: String::new(),
            jwt_secret: String::new(),
            access_token_ttl: Duration::from_secs(60 * 60),
            refresh_token_ttl: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// `<= 0` disables rate limiting entirely.
    pub requests_per_minute: i64,
    pub burst: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    /// Minimum spacing between delivered progress notifications per task.
    #[serde(with = "duration_str")]
    pub debounce_window: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub path: String,
    pub description: String,
    pub default: bool,
    pub allowed_tools: Vec<String>,
    pub max_concurrent_tasks: usize,
    pub git: ProjectGitConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectGitConfig {
    pub auto_branch: bool,
    pub auto_stash: bool,
    pub branch_prefix: String,
}

impl Config {
    /// Load configuration from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config {}", path.display()))
            }
        };

        let expanded = expand_env(&raw);
        let cfg: Config = serde_yaml::from_str(&expanded)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.server.host == "0.0.0.0" {
            bail!(
                "server.host 0.0.0.0 binds to all interfaces, refusing to start; \
                 use a tunnel or reverse proxy for public exposure"
            );
        }
        if self.server.port == 0 || self.server.port > 65535 {
            bail!("server.port {} is out of range [1, 65535]", self.server.port);
        }
        Ok(())
    }

    /// Work directory with `~` expanded.
    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.execution.work_dir))
    }
}

/// Replace every `${NAME}` with the value of the environment variable
/// `NAME`, or the empty string when unset.
pub fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated reference: keep the literal text.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return home;
        }
    }
    path.to_string()
}

/// Parse durations written as `500ms`, `90s`, `15m`, `1h`, or compounds
/// like `1h30m`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            bail!("invalid duration {s:?}");
        }
        let value: u64 = rest[..digits].parse()?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => bail!("invalid duration unit {unit:?} in {s:?}"),
        };
    }
    Ok(total)
}

mod duration_str {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(de: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(de)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
