//! Launcher configuration: serde schema, TOML loading, validation.
//!
//! Precedence: `.devsandbox.toml` in the project directory, else
//! `~/.config/devsandbox/config.toml`, else built-in defaults. Validation
//! reports every violation by path and message and happens before any side
//! effect.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::LauncherError;
use crate::model::MountRule;

/// Default HTTPS intercepting proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 17080;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-tool configuration tables, opaque to the launcher core. Typed
    /// views for `docker` and `git` are provided below; everything else is
    /// handed to the owning tool's `Configure` hook as-is.
    pub tools: BTreeMap<String, toml::Table>,
    pub sandbox: SandboxSection,
    pub proxy: ProxySection,
    pub port_forwarding: PortForwardingSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub mounts: MountsSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MountsSection {
    pub rules: Vec<MountRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_PROXY_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PortForwardingSection {
    pub enabled: bool,
    pub rules: Vec<PortForwardRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortForwardRule {
    pub name: String,
    pub direction: ForwardDirection,
    pub protocol: ForwardProtocol,
    pub host_port: u16,
    pub sandbox_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProtocol {
    Tcp,
    Udp,
}

impl Config {
    /// Load the effective configuration for a project directory.
    pub fn load(project_dir: &Path) -> Result<Self, LauncherError> {
        let project_file = project_dir.join(".devsandbox.toml");
        if project_file.exists() {
            tracing::debug!(file = %project_file.display(), "loading project configuration");
            return Self::from_file(&project_file);
        }
        if let Some(config_dir) = dirs::config_dir() {
            let user_file = config_dir.join("devsandbox/config.toml");
            if user_file.exists() {
                tracing::debug!(file = %user_file.display(), "loading user configuration");
                return Self::from_file(&user_file);
            }
        }
        tracing::debug!("no configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, LauncherError> {
        let raw = std::fs::read_to_string(path).map_err(|e| LauncherError::ConfigInvalid {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&raw, &path.display().to_string())
    }

    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, LauncherError> {
        toml::from_str(raw).map_err(|e| LauncherError::ConfigInvalid {
            path: origin.to_string(),
            message: e.message().to_string(),
        })
    }

    /// Validate the configuration. Every violation is reported; the first
    /// one becomes the error path/message, the rest are appended.
    pub fn validate(&self) -> Result<(), LauncherError> {
        let mut problems: Vec<(String, String)> = Vec::new();

        if self.proxy.enabled && self.proxy.port == 0 {
            problems.push(("proxy.port".into(), "must be in 1..65535".into()));
        }

        if self.port_forwarding.enabled && !self.proxy.enabled {
            problems.push((
                "port_forwarding.enabled".into(),
                "port forwarding requires network isolation (pasta), which is only \
                 active in proxy mode; enable it with --proxy or proxy.enabled = true"
                    .into(),
            ));
        }

        for (i, rule) in self.port_forwarding.rules.iter().enumerate() {
            if rule.name.is_empty() {
                problems.push((
                    format!("port_forwarding.rules[{i}].name"),
                    "must not be empty".into(),
                ));
            }
            if rule.host_port == 0 {
                problems.push((
                    format!("port_forwarding.rules[{i}].host_port"),
                    "must be in 1..65535".into(),
                ));
            }
            if rule.sandbox_port == 0 {
                problems.push((
                    format!("port_forwarding.rules[{i}].sandbox_port"),
                    "must be in 1..65535".into(),
                ));
            }
        }

        for (i, rule) in self.sandbox.mounts.rules.iter().enumerate() {
            if rule.pattern.is_empty() {
                problems.push((
                    format!("sandbox.mounts.rules[{i}].pattern"),
                    "must not be empty".into(),
                ));
            } else if !rule.pattern.starts_with('/') && !rule.pattern.starts_with('~') {
                problems.push((
                    format!("sandbox.mounts.rules[{i}].pattern"),
                    "must be an absolute or ~-prefixed path".into(),
                ));
            }
        }

        match problems.len() {
            0 => Ok(()),
            _ => {
                let (path, mut message) = problems.remove(0);
                for (p, m) in problems {
                    let _ = write!(message, "; {p}: {m}");
                }
                Err(LauncherError::ConfigInvalid { path, message })
            }
        }
    }

    /// Typed view of `tools.docker`.
    pub fn docker(&self) -> DockerConfig {
        let table = self.tools.get("docker");
        DockerConfig {
            enabled: table
                .and_then(|t| t.get("enabled"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            socket: table
                .and_then(|t| t.get("socket"))
                .and_then(|v| v.as_str())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/run/docker.sock")),
        }
    }

    /// Typed view of `tools.git`.
    pub fn git_mode(&self) -> Result<GitMode, LauncherError> {
        let raw = self
            .tools
            .get("git")
            .and_then(|t| t.get("mode"))
            .and_then(|v| v.as_str())
            .unwrap_or("readonly");
        GitMode::parse(raw).ok_or_else(|| LauncherError::ConfigInvalid {
            path: "tools.git.mode".into(),
            message: format!("unknown mode `{raw}` (expected readonly, readwrite or disabled)"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub enabled: bool,
    pub socket: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GitMode {
    #[default]
    ReadOnly,
    ReadWrite,
    Disabled,
}

impl GitMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "readonly" => Some(GitMode::ReadOnly),
            "readwrite" => Some(GitMode::ReadWrite),
            "disabled" => Some(GitMode::Disabled),
            _ => None,
        }
    }
}
