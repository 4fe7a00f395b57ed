//! Docker access through the filtering proxy.
//!
//! Disabled by default. When enabled, `start` brings up the
//! HTTP-over-Unix-socket filter at `$HOME/docker.sock` inside the sandbox
//! home and the target talks to it via `DOCKER_HOST`; the host daemon
//! socket itself is never exposed.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use devsandbox_core::{Binding, EnvVar, Shell};
use devsandbox_proxy::{DockerProxy, DockerProxyConfig};

use crate::{ActiveTool, ConfigureTool, StartContext, Tool};

const DEFAULT_DAEMON_SOCKET: &str = "/var/run/docker.sock";

pub struct DockerTool {
    enabled: bool,
    daemon_socket: PathBuf,
    proxy: Option<DockerProxy>,
}

impl DockerTool {
    pub fn new() -> Self {
        Self {
            enabled: false,
            daemon_socket: PathBuf::from(DEFAULT_DAEMON_SOCKET),
            proxy: None,
        }
    }
}

impl Default for DockerTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for DockerTool {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn available(&self, _home: &Path) -> bool {
        self.enabled
    }

    fn bindings(&self, _home: &Path, _sandbox_home: &Path) -> Vec<Binding> {
        // The proxy socket lives inside sandbox_home, which is already
        // bound at $HOME; no extra binding needed.
        Vec::new()
    }

    fn environment(&self, home: &Path, _sandbox_home: &Path) -> Vec<EnvVar> {
        vec![EnvVar::set(
            "DOCKER_HOST",
            format!("unix://{}/docker.sock", home.display()),
        )]
    }

    fn shell_init(&self, _shell: Shell) -> Option<String> {
        None
    }

    fn as_configure_mut(&mut self) -> Option<&mut dyn ConfigureTool> {
        Some(self)
    }

    fn as_active_mut(&mut self) -> Option<&mut dyn ActiveTool> {
        Some(self)
    }
}

impl ConfigureTool for DockerTool {
    fn configure(&mut self, table: &toml::Table) -> Result<()> {
        if let Some(value) = table.get("enabled") {
            self.enabled = value
                .as_bool()
                .context("tools.docker.enabled: expected a boolean")?;
        }
        if let Some(value) = table.get("socket") {
            let raw = value
                .as_str()
                .context("tools.docker.socket: expected a string")?;
            self.daemon_socket = PathBuf::from(raw);
        }
        Ok(())
    }
}

impl ActiveTool for DockerTool {
    fn start(&mut self, ctx: &StartContext<'_>) -> Result<()> {
        if self.proxy.is_some() {
            return Ok(());
        }
        if !self.daemon_socket.exists() {
            bail!(
                "docker daemon socket {} not found (is the daemon running, or set tools.docker.socket?)",
                self.daemon_socket.display()
            );
        }
        let mut proxy = DockerProxy::bind(DockerProxyConfig {
            listen_path: ctx.identity.docker_socket_path(),
            daemon_socket: self.daemon_socket.clone(),
        })
        .context("binding docker proxy socket")?;
        proxy.start().context("starting docker proxy")?;
        tracing::info!(
            socket = %proxy.listen_path().display(),
            daemon = %self.daemon_socket.display(),
            "docker filtering proxy started"
        );
        self.proxy = Some(proxy);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut proxy) = self.proxy.take() {
            proxy.stop();
        }
        Ok(())
    }
}
