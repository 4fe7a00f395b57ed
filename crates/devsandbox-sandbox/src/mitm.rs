//! HTTPS intercepting proxy controller.
//!
//! The proxy itself (CA handling, request logging, policy engine) is a
//! separate on-disk binary; this controller spawns it, waits for the CA
//! certificate and listen port to become usable, and exposes what the
//! mount compiler and env builder need: the port, the CA path on the host,
//! and the CA path inside the sandbox.

use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context};

use devsandbox_core::{Binding, EnvVar, LauncherError, SandboxIdentity};
use devsandbox_tools::supervise;

/// Where the CA certificate is bind-mounted inside the sandbox.
pub const SANDBOX_CA_PATH: &str = "/tmp/devsandbox-ca.crt";

const PROXY_BINARY: &str = "devsandbox-proxy";
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_DEADLINE: Duration = Duration::from_secs(5);

pub struct HttpsProxyController {
    port: u16,
    child: Option<Child>,
    ca_path: Option<PathBuf>,
}

impl HttpsProxyController {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            child: None,
            ca_path: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Environment injected into the target when proxy mode is active.
    /// Static so `--info` can render the plan without starting anything.
    pub fn proxy_env(port: u16) -> Vec<EnvVar> {
        let url = format!("http://127.0.0.1:{port}");
        vec![
            EnvVar::set("HTTP_PROXY", url.clone()),
            EnvVar::set("HTTPS_PROXY", url),
            EnvVar::set("NO_PROXY", "localhost,127.0.0.1"),
            EnvVar::set("DEVSANDBOX_PROXY", "1"),
            EnvVar::set("NODE_EXTRA_CA_CERTS", SANDBOX_CA_PATH),
            EnvVar::set("REQUESTS_CA_BUNDLE", SANDBOX_CA_PATH),
        ]
    }

    /// Read-only bind of the CA certificate into the sandbox. Optional so a
    /// plan compiled before the proxy ran does not warn.
    pub fn ca_binding(identity: &SandboxIdentity) -> Binding {
        Binding::ro(identity.ca_cert_path())
            .at(SANDBOX_CA_PATH)
            .optional()
    }

    pub fn start(&mut self, identity: &SandboxIdentity) -> Result<(), LauncherError> {
        if self.child.is_some() {
            return Ok(());
        }
        let binary = match std::env::var("DEVSANDBOX_PROXY_BIN") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => which::which(PROXY_BINARY).map_err(|_| LauncherError::PreconditionMissing {
                binary: PROXY_BINARY.into(),
                hint: "proxy mode needs the devsandbox-proxy helper on PATH \
                       (or set DEVSANDBOX_PROXY_BIN)"
                    .into(),
            })?,
        };

        let ca_path = identity.ca_cert_path();
        let mut child = Command::new(&binary)
            .arg("--listen")
            .arg(format!("127.0.0.1:{}", self.port))
            .arg("--ca-out")
            .arg(&ca_path)
            .arg("--log-dir")
            .arg(identity.proxy_log_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning devsandbox-proxy")
            .map_err(helper_failed)?;

        let addr: SocketAddr = ([127, 0, 0, 1], self.port).into();
        let ready = supervise::wait_until(READY_TIMEOUT, Duration::from_millis(100), || {
            ca_path.exists()
                && TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
        });
        if !ready {
            supervise::terminate(&mut child, PROXY_BINARY, Duration::from_secs(1));
            return Err(helper_failed(anyhow!(
                "proxy did not become ready on port {} within {READY_TIMEOUT:?}",
                self.port
            )));
        }

        tracing::info!(port = self.port, ca = %ca_path.display(), "https proxy started");
        self.child = Some(child);
        self.ca_path = Some(ca_path);
        Ok(())
    }

    /// SIGTERM, bounded wait, SIGKILL. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if !supervise::terminate(&mut child, PROXY_BINARY, STOP_DEADLINE) {
                tracing::warn!("{PROXY_BINARY} exceeded its stop deadline");
            }
        }
    }
}

impl Drop for HttpsProxyController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn helper_failed(source: anyhow::Error) -> LauncherError {
    LauncherError::HelperFailed {
        helper: PROXY_BINARY.into(),
        source,
    }
}
