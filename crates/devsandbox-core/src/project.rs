//! Per-project identity and persistent data layout.
//!
//! Everything the launcher persists for a project lives under a single
//! directory derived from the resolved project path:
//!
//! ```text
//! <XDG_DATA_HOME>/devsandbox/<project_name>/
//!   sandbox_home/     per-project $HOME bound into the sandbox
//!   logs/proxy/       HTTPS proxy request logs (JSON lines)
//!   logs/internal/    orchestrator & helper logs
//!   overlays/<hash>/  persistent overlay upper layers
//!   dbus-proxy/bus    filtered D-Bus socket during a run
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Identity of one sandboxed project. Created at orchestrator start,
/// read-only thereafter.
#[derive(Debug, Clone)]
pub struct SandboxIdentity {
    /// Absolute, resolved project directory.
    pub project_dir: PathBuf,
    /// Directory name plus a truncated hash of the canonical path, so two
    /// same-named projects in different locations never share state.
    pub project_name: String,
    /// Host directory bound at the in-sandbox `$HOME`.
    pub sandbox_home: PathBuf,
    /// Root of the launcher's own persistent state for this project.
    pub data_dir: PathBuf,
}

impl SandboxIdentity {
    /// Resolve the identity for a project directory. The directory must
    /// exist; symlinks are resolved so the same project always maps to the
    /// same state no matter how it was reached.
    pub fn resolve(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("resolving project directory {}", project_dir.display()))?;
        let base = data_root()?;
        Ok(Self::resolve_in(&project_dir, &base))
    }

    /// Identity rooted at an explicit data directory (tests, DEVSANDBOX_DATA_DIR).
    pub fn resolve_in(project_dir: &Path, data_root: &Path) -> Self {
        let stem = project_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project");
        let project_name = format!("{stem}-{}", short_hash(&project_dir.to_string_lossy(), 8));
        let data_dir = data_root.join(&project_name);
        let sandbox_home = data_dir.join("sandbox_home");
        Self {
            project_dir: project_dir.to_path_buf(),
            project_name,
            sandbox_home,
            data_dir,
        }
    }

    /// Create the on-disk layout. Idempotent.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            &self.sandbox_home,
            &self.proxy_log_dir(),
            &self.internal_log_dir(),
            &self.overlays_dir(),
            &self.dbus_proxy_dir(),
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn proxy_log_dir(&self) -> PathBuf {
        self.data_dir.join("logs/proxy")
    }

    pub fn internal_log_dir(&self) -> PathBuf {
        self.data_dir.join("logs/internal")
    }

    pub fn overlays_dir(&self) -> PathBuf {
        self.data_dir.join("overlays")
    }

    /// Upper-layer directory for a persistent overlay at `dest`. Stable
    /// across invocations for the same destination path.
    pub fn overlay_upper_dir(&self, dest: &Path) -> PathBuf {
        self.overlays_dir()
            .join(short_hash(&dest.to_string_lossy(), 16))
    }

    pub fn dbus_proxy_dir(&self) -> PathBuf {
        self.data_dir.join("dbus-proxy")
    }

    pub fn dbus_socket_path(&self) -> PathBuf {
        self.dbus_proxy_dir().join("bus")
    }

    /// Where the HTTPS proxy controller drops the root CA certificate.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.data_dir.join("ca.crt")
    }

    /// Unix socket the Docker filtering proxy listens on. Lives inside
    /// `sandbox_home`, so it is visible at `$HOME/docker.sock` in the
    /// sandbox without an extra bind.
    pub fn docker_socket_path(&self) -> PathBuf {
        self.sandbox_home.join("docker.sock")
    }
}

/// Root of all per-project data directories.
fn data_root() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("DEVSANDBOX_DATA_DIR") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::data_dir()
        .map(|d| d.join("devsandbox"))
        .context("cannot determine XDG data directory")
}

/// First `len` hex chars of the SHA-256 of `input`.
pub fn short_hash(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(len);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_and_collision_safe() {
        let root = Path::new("/data");
        let a = SandboxIdentity::resolve_in(Path::new("/home/dev/api"), root);
        let b = SandboxIdentity::resolve_in(Path::new("/home/dev/api"), root);
        let c = SandboxIdentity::resolve_in(Path::new("/srv/api"), root);

        assert_eq!(a.project_name, b.project_name);
        assert_ne!(a.project_name, c.project_name);
        assert!(a.project_name.starts_with("api-"));
        assert_eq!(a.sandbox_home, a.data_dir.join("sandbox_home"));
    }

    #[test]
    fn overlay_dirs_are_per_dest() {
        let id = SandboxIdentity::resolve_in(Path::new("/home/dev/api"), Path::new("/data"));
        let a = id.overlay_upper_dir(Path::new("/home/dev/api/node_modules"));
        let b = id.overlay_upper_dir(Path::new("/home/dev/api/target"));
        assert_ne!(a, b);
        assert_eq!(a, id.overlay_upper_dir(Path::new("/home/dev/api/node_modules")));
        assert!(a.starts_with(id.overlays_dir()));
    }

    #[test]
    fn layout_creation_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let id = SandboxIdentity::resolve_in(Path::new("/home/dev/api"), tmp.path());
        id.ensure_layout().unwrap();
        id.ensure_layout().unwrap();
        assert!(id.sandbox_home.is_dir());
        assert!(id.proxy_log_dir().is_dir());
        assert!(id.dbus_proxy_dir().is_dir());
    }

    #[test]
    fn short_hash_length() {
        assert_eq!(short_hash("/home/dev/api", 8).len(), 8);
        assert_ne!(short_hash("a", 16), short_hash("b", 16));
    }
}
