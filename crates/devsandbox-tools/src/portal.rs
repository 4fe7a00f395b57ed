//! Desktop portal access over a filtered D-Bus session bus.
//!
//! Runs `xdg-dbus-proxy` against the host session bus with only the portal
//! desktop and notification names allowed, so the sandboxed process can
//! post notifications without seeing the rest of the bus. The portal
//! service refuses clients without a `.flatpak-info`, so Setup drops one
//! into the sandbox home.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use devsandbox_core::{Binding, EnvVar, Shell};

use crate::supervise;
use crate::{ActiveTool, SetupTool, StartContext, Tool};

/// Bus names the proxy lets through.
const PORTAL_TALK_NAMES: &[&str] = &[
    "org.freedesktop.portal.Desktop",
    "org.freedesktop.portal.Notification",
];

const SOCKET_WAIT: Duration = Duration::from_secs(3);
const STOP_DEADLINE: Duration = Duration::from_secs(5);

const FLATPAK_INFO: &str = "\
[Application]
name=dev.devsandbox.Sandbox

[Context]
sockets=session-bus;
";

pub struct PortalTool {
    child: Option<Child>,
    /// Host directory holding the filtered bus socket; set at start.
    socket_dir: Option<PathBuf>,
}

impl PortalTool {
    pub fn new() -> Self {
        Self {
            child: None,
            socket_dir: None,
        }
    }

    /// In-sandbox runtime dir; the bus socket is exposed underneath it.
    fn runtime_dir() -> PathBuf {
        PathBuf::from(format!("/run/user/{}", nix::unistd::Uid::current().as_raw()))
    }

    fn sandbox_bus_path() -> PathBuf {
        Self::runtime_dir().join(".dbus-proxy/bus")
    }
}

impl Default for PortalTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for PortalTool {
    fn name(&self) -> &'static str {
        "portal"
    }

    fn available(&self, _home: &Path) -> bool {
        which::which("xdg-dbus-proxy").is_ok()
            && std::env::var("DBUS_SESSION_BUS_ADDRESS").is_ok()
    }

    fn bindings(&self, _home: &Path, _sandbox_home: &Path) -> Vec<Binding> {
        match &self.socket_dir {
            Some(dir) => vec![
                Binding::rw(dir.clone()).at(Self::runtime_dir().join(".dbus-proxy"))
            ],
            None => Vec::new(),
        }
    }

    fn environment(&self, _home: &Path, _sandbox_home: &Path) -> Vec<EnvVar> {
        if self.socket_dir.is_none() {
            return Vec::new();
        }
        vec![
            EnvVar::set("XDG_RUNTIME_DIR", Self::runtime_dir().display().to_string()),
            EnvVar::set(
                "DBUS_SESSION_BUS_ADDRESS",
                format!("unix:path={}", Self::sandbox_bus_path().display()),
            ),
        ]
    }

    fn shell_init(&self, _shell: Shell) -> Option<String> {
        None
    }

    fn as_setup(&self) -> Option<&dyn SetupTool> {
        Some(self)
    }

    fn as_active_mut(&mut self) -> Option<&mut dyn ActiveTool> {
        Some(self)
    }
}

impl SetupTool for PortalTool {
    fn setup(&self, _home: &Path, sandbox_home: &Path) -> Result<()> {
        let path = sandbox_home.join(".flatpak-info");
        std::fs::write(&path, FLATPAK_INFO)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

impl ActiveTool for PortalTool {
    fn start(&mut self, ctx: &StartContext<'_>) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let host_bus = std::env::var("DBUS_SESSION_BUS_ADDRESS")
            .context("DBUS_SESSION_BUS_ADDRESS is not set")?;
        let socket_dir = ctx.identity.dbus_proxy_dir();
        std::fs::create_dir_all(&socket_dir)
            .with_context(|| format!("creating {}", socket_dir.display()))?;
        let socket = ctx.identity.dbus_socket_path();
        let _ = std::fs::remove_file(&socket);

        let mut command = Command::new("xdg-dbus-proxy");
        command
            .arg(&host_bus)
            .arg(&socket)
            .arg("--filter")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for name in PORTAL_TALK_NAMES {
            command.arg(format!("--talk={name}"));
        }

        let mut child = command.spawn().context("spawning xdg-dbus-proxy")?;
        let ready = supervise::wait_until(SOCKET_WAIT, Duration::from_millis(50), || {
            socket.exists()
        });
        if !ready {
            supervise::terminate(&mut child, "xdg-dbus-proxy", Duration::from_secs(1));
            bail!(
                "xdg-dbus-proxy socket {} did not appear within {:?}",
                socket.display(),
                SOCKET_WAIT
            );
        }

        tracing::info!(socket = %socket.display(), "d-bus portal proxy started");
        self.child = Some(child);
        self.socket_dir = Some(socket_dir);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            if !supervise::terminate(&mut child, "xdg-dbus-proxy", STOP_DEADLINE) {
                tracing::warn!("xdg-dbus-proxy exceeded its stop deadline");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_writes_flatpak_info() {
        let tmp = tempfile::TempDir::new().unwrap();
        let tool = PortalTool::new();
        tool.setup(Path::new("/home/u"), tmp.path()).unwrap();
        let content = std::fs::read_to_string(tmp.path().join(".flatpak-info")).unwrap();
        assert!(content.contains("[Application]"));
        assert!(content.contains("session-bus"));
    }

    #[test]
    fn contributes_nothing_before_start() {
        let tool = PortalTool::new();
        assert!(tool.bindings(Path::new("/h"), Path::new("/s")).is_empty());
        assert!(tool.environment(Path::new("/h"), Path::new("/s")).is_empty());
    }

    #[test]
    fn stop_without_start_is_fine() {
        let mut tool = PortalTool::new();
        tool.stop().unwrap();
        tool.stop().unwrap();
    }
}
