//! Data model shared by the tool registry and the mount policy compiler.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// How a binding is materialized inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    /// Changes are visible on the host and persist.
    ReadWrite,
    /// Writes fail with "read-only filesystem".
    ReadOnly,
    /// Writes go to an in-memory upper layer discarded on sandbox exit.
    TmpOverlay,
    /// As `TmpOverlay`, but the upper layer persists under the project's
    /// data directory across invocations.
    Overlay,
    /// The destination is replaced by `/dev/null` (file) or an empty
    /// tmpfs (directory).
    Hidden,
}

impl MountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountMode::ReadWrite => "readwrite",
            MountMode::ReadOnly => "readonly",
            MountMode::TmpOverlay => "tmpoverlay",
            MountMode::Overlay => "overlay",
            MountMode::Hidden => "hidden",
        }
    }
}

/// A single host-path-to-sandbox-path binding contributed by a tool or
/// materialized from a user mount rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Absolute host path.
    pub source: PathBuf,
    /// In-sandbox path; defaults to `source` when absent.
    pub dest: Option<PathBuf>,
    pub mode: MountMode,
    /// Skip silently when `source` does not exist on the host.
    pub optional: bool,
}

impl Binding {
    pub fn new(source: impl Into<PathBuf>, mode: MountMode) -> Self {
        Self {
            source: source.into(),
            dest: None,
            mode,
            optional: false,
        }
    }

    pub fn rw(source: impl Into<PathBuf>) -> Self {
        Self::new(source, MountMode::ReadWrite)
    }

    pub fn ro(source: impl Into<PathBuf>) -> Self {
        Self::new(source, MountMode::ReadOnly)
    }

    pub fn hidden(source: impl Into<PathBuf>) -> Self {
        Self::new(source, MountMode::Hidden)
    }

    pub fn at(mut self, dest: impl Into<PathBuf>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Effective in-sandbox destination.
    pub fn dest_path(&self) -> &Path {
        self.dest.as_deref().unwrap_or(&self.source)
    }
}

/// User-defined mount rule from `sandbox.mounts.rules`. The pattern is an
/// absolute path, a `~`-prefixed path, or a glob (`*` within one component,
/// `**` across components).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRule {
    pub pattern: String,
    pub mode: MountMode,
}

impl MountRule {
    /// Whether the pattern contains glob metacharacters.
    pub fn is_glob(&self) -> bool {
        self.pattern.contains('*') || self.pattern.contains('?') || self.pattern.contains('[')
    }
}

/// An environment variable injected into the target. Exactly one of a
/// literal value or "copy the launcher-process value through" is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: Option<String>,
    pub from_host: bool,
}

impl EnvVar {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            from_host: false,
        }
    }

    pub fn from_host(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            from_host: true,
        }
    }
}

/// Shell family, used by tools contributing shell-init lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
}

impl Shell {
    /// Detect the shell family from a `$SHELL`-style path. Defaults to bash.
    pub fn from_program(path: &Path) -> Self {
        match path.file_name().and_then(|n| n.to_str()) {
            Some("zsh") => Shell::Zsh,
            Some("fish") => Shell::Fish,
            _ => Shell::Bash,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Shell::Bash => "bash",
            Shell::Zsh => "zsh",
            Shell::Fish => "fish",
        }
    }
}
