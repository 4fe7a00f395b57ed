//! Launcher error kinds and their exit-code mapping.
//!
//! Every fallible operation in the launcher resolves to one of these kinds
//! before it reaches `main`. Tool `Stop` errors are never turned into a
//! `LauncherError` — teardown must not hide the target's own failure.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the launcher, mapped to process exit codes.
#[derive(Debug, Error)]
pub enum LauncherError {
    /// Configuration validation failed. Reported by path and message,
    /// before any side effect.
    #[error("invalid configuration at `{path}`: {message}")]
    ConfigInvalid { path: String, message: String },

    /// A required external binary (bwrap, pasta, ...) is not installed.
    #[error("required binary `{binary}` not found: {hint}")]
    PreconditionMissing { binary: String, hint: String },

    /// A tool's `Setup` hook failed; nothing has been started yet.
    #[error("tool `{tool}` setup failed")]
    SetupFailed {
        tool: String,
        #[source]
        source: anyhow::Error,
    },

    /// A helper process did not become ready within its deadline.
    #[error("helper `{helper}` failed to start")]
    HelperFailed {
        helper: String,
        #[source]
        source: anyhow::Error,
    },

    /// The mount compiler hit a conflict it may not resolve by dropping an
    /// operation (only raised when a security-default hide is involved;
    /// ordinary conflicts are downgraded to compile warnings).
    #[error("mount conflict on `{dest}`: {detail}")]
    MountConflict { dest: PathBuf, detail: String },

    /// The target process exited non-zero; the launcher mirrors its status.
    #[error("target exited with status {status}")]
    TargetFailed { status: i32 },

    /// A helper exceeded its stop deadline. Logged, never propagated as the
    /// launcher's own exit status.
    #[error("helper `{helper}` did not stop within the drain deadline")]
    StopDrain { helper: String },
}

impl LauncherError {
    /// Process exit code for this error. The target's status passes through
    /// unchanged; every launcher-internal failure exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            LauncherError::TargetFailed { status } => *status,
            _ => 1,
        }
    }
}
