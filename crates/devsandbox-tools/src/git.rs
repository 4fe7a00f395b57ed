//! Git inside the sandbox.
//!
//! Default mode is `readonly`: a minimal `.gitconfig` carrying only the
//! host identity is generated into the sandbox home, so commits keep the
//! right author while host aliases, credential helpers and hooks stay
//! invisible. `readwrite` binds the host `~/.gitconfig` through;
//! `disabled` contributes nothing at all.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

use devsandbox_core::config::GitMode;
use devsandbox_core::{Binding, EnvVar, Shell};

use crate::{ConfigureTool, SetupTool, Tool};

pub struct GitTool {
    mode: GitMode,
}

impl GitTool {
    pub fn new() -> Self {
        Self {
            mode: GitMode::default(),
        }
    }

    pub fn with_mode(mode: GitMode) -> Self {
        Self { mode }
    }
}

impl Default for GitTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for GitTool {
    fn name(&self) -> &'static str {
        "git"
    }

    fn available(&self, _home: &Path) -> bool {
        self.mode != GitMode::Disabled && which::which("git").is_ok()
    }

    fn bindings(&self, home: &Path, _sandbox_home: &Path) -> Vec<Binding> {
        match self.mode {
            GitMode::ReadWrite => vec![Binding::rw(home.join(".gitconfig")).optional()],
            GitMode::ReadOnly | GitMode::Disabled => Vec::new(),
        }
    }

    fn environment(&self, _home: &Path, _sandbox_home: &Path) -> Vec<EnvVar> {
        Vec::new()
    }

    fn shell_init(&self, _shell: Shell) -> Option<String> {
        None
    }

    fn as_setup(&self) -> Option<&dyn SetupTool> {
        match self.mode {
            GitMode::ReadOnly => Some(self),
            _ => None,
        }
    }

    fn as_configure_mut(&mut self) -> Option<&mut dyn ConfigureTool> {
        Some(self)
    }
}

impl SetupTool for GitTool {
    fn setup(&self, _home: &Path, sandbox_home: &Path) -> Result<()> {
        let config = safe_gitconfig(&host_git_value("user.name"), &host_git_value("user.email"));
        let path = sandbox_home.join(".gitconfig");
        std::fs::write(&path, config)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

impl ConfigureTool for GitTool {
    fn configure(&mut self, table: &toml::Table) -> Result<()> {
        if let Some(value) = table.get("mode") {
            let raw = value
                .as_str()
                .context("tools.git.mode: expected a string")?;
            self.mode = GitMode::parse(raw).with_context(|| {
                format!("tools.git.mode: unknown mode `{raw}` (expected readonly, readwrite or disabled)")
            })?;
        }
        Ok(())
    }
}

/// `git config --get <key>` on the host, empty when unset.
fn host_git_value(key: &str) -> String {
    Command::new("git")
        .args(["config", "--get", key])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .unwrap_or_default()
}

/// Render the identity-only gitconfig. Keys with no host value are omitted;
/// an empty identity yields an empty file rather than an empty section.
fn safe_gitconfig(name: &str, email: &str) -> String {
    if name.is_empty() && email.is_empty() {
        return String::new();
    }
    let mut out = String::from("[user]\n");
    if !name.is_empty() {
        out.push_str(&format!("\tname = {name}\n"));
    }
    if !email.is_empty() {
        out.push_str(&format!("\temail = {email}\n"));
    }
    out
}
