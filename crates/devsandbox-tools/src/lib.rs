//! Tool plugins: small units that expose curated slices of the host to the
//! sandbox (bindings + env vars) and optionally hook into the launcher
//! lifecycle.
//!
//! Capabilities are orthogonal. Every tool implements [`Tool`]; a tool that
//! also prepares files, consumes configuration, or runs a helper process
//! additionally implements [`SetupTool`], [`ConfigureTool`] or
//! [`ActiveTool`] and surfaces that through the `as_*` accessors. A tool
//! with no extra capability contributes only bindings and env vars and is
//! free of side effects.

use std::path::Path;

use anyhow::Result;

use devsandbox_core::{Binding, CancelToken, EnvVar, SandboxIdentity, Shell};

pub mod docker;
pub mod git;
pub mod mise;
pub mod portal;
pub mod registry;
pub mod supervise;

pub use registry::Registry;

/// Base capability every tool provides.
pub trait Tool: Send {
    fn name(&self) -> &'static str;

    /// Probe whether the tool applies on this host (binary in PATH, config
    /// directory present, feature enabled).
    fn available(&self, home: &Path) -> bool;

    /// Host paths this tool exposes inside the sandbox.
    fn bindings(&self, home: &Path, sandbox_home: &Path) -> Vec<Binding>;

    /// Environment variables this tool injects into the target.
    fn environment(&self, home: &Path, sandbox_home: &Path) -> Vec<EnvVar>;

    /// Optional line for the generated shell init file.
    fn shell_init(&self, shell: Shell) -> Option<String>;

    fn as_setup(&self) -> Option<&dyn SetupTool> {
        None
    }

    fn as_configure_mut(&mut self) -> Option<&mut dyn ConfigureTool> {
        None
    }

    fn as_active_mut(&mut self) -> Option<&mut dyn ActiveTool> {
        None
    }
}

/// Generates files under `sandbox_home` before mount compilation.
pub trait SetupTool {
    fn setup(&self, home: &Path, sandbox_home: &Path) -> Result<()>;
}

/// Receives the tool's configuration table and adjusts its own behavior.
pub trait ConfigureTool {
    fn configure(&mut self, table: &toml::Table) -> Result<()>;
}

/// Context handed to `ActiveTool::start`.
pub struct StartContext<'a> {
    pub home: &'a Path,
    pub identity: &'a SandboxIdentity,
    pub cancel: &'a CancelToken,
}

/// Runs a helper for the duration of the sandbox.
pub trait ActiveTool {
    /// Must block until the tool is externally observable (socket
    /// connectable, file present).
    fn start(&mut self, ctx: &StartContext<'_>) -> Result<()>;

    /// Must be idempotent.
    fn stop(&mut self) -> Result<()>;
}
