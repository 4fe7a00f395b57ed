//! User-mode network helper (pasta) controller.
//!
//! Network isolation is only active in proxy mode. Because an unprivileged
//! runner cannot join a namespace that does not exist yet, the controller
//! owns a tiny *holder* process — `unshare --user --map-current-user --net
//! sleep infinity` — whose namespaces pasta attaches to and the runner
//! later enters with `setns`. That keeps the observable helper start order
//! fixed: network helper first, target last.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context};

use devsandbox_core::config::{ForwardDirection, ForwardProtocol, PortForwardRule};
use devsandbox_core::{LauncherError, SandboxIdentity};
use devsandbox_tools::supervise;

const READY_TIMEOUT: Duration = Duration::from_secs(3);
const STOP_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct NetworkController {
    holder: Option<Child>,
    pasta: Option<Child>,
}

impl NetworkController {
    pub fn new() -> Self {
        Self::default()
    }

    /// PID of the namespace holder; the runner joins these namespaces.
    pub fn holder_pid(&self) -> Option<u32> {
        self.holder.as_ref().map(Child::id)
    }

    pub fn start(
        &mut self,
        identity: &SandboxIdentity,
        rules: &[PortForwardRule],
    ) -> Result<(), LauncherError> {
        if self.pasta.is_some() {
            return Ok(());
        }
        let pasta_bin = which::which("pasta").map_err(|_| LauncherError::PreconditionMissing {
            binary: "pasta".into(),
            hint: "install passt (e.g. `apt install passt` or `dnf install passt`)".into(),
        })?;
        let unshare_bin =
            which::which("unshare").map_err(|_| LauncherError::PreconditionMissing {
                binary: "unshare".into(),
                hint: "util-linux with user-namespace support is required".into(),
            })?;

        let holder = Command::new(&unshare_bin)
            .args(["--user", "--map-current-user", "--net", "--", "sleep", "infinity"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning namespace holder")
            .map_err(|e| helper_failed(e))?;
        let holder_pid = holder.id();
        self.holder = Some(holder);

        // The holder unshares shortly after exec; wait until its network
        // namespace actually differs from ours.
        let own_netns = std::fs::read_link("/proc/self/ns/net").ok();
        let holder_ns = PathBuf::from(format!("/proc/{holder_pid}/ns/net"));
        let unshared = supervise::wait_until(READY_TIMEOUT, Duration::from_millis(20), || {
            match std::fs::read_link(&holder_ns) {
                Ok(link) => Some(link) != own_netns,
                Err(_) => false,
            }
        });
        if !unshared {
            self.stop();
            return Err(helper_failed(anyhow!(
                "namespace holder did not unshare its network namespace within {READY_TIMEOUT:?}"
            )));
        }

        let pid_file = identity.data_dir.join("pasta.pid");
        let _ = std::fs::remove_file(&pid_file);
        let mut command = Command::new(&pasta_bin);
        command
            .arg("--config-net")
            .arg("--quiet")
            .arg("--foreground")
            .arg("--pid")
            .arg(&pid_file)
            .arg("--log-file")
            .arg(identity.internal_log_dir().join("pasta.log"))
            .arg("--netns")
            .arg(format!("/proc/{holder_pid}/ns/net"))
            .arg("--userns")
            .arg(format!("/proc/{holder_pid}/ns/user"));
        for arg in forward_args(rules) {
            command.arg(arg);
        }

        let mut pasta = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning pasta")
            .map_err(|e| {
                self.stop();
                helper_failed(e)
            })?;

        let ready = supervise::wait_until(READY_TIMEOUT, Duration::from_millis(50), || {
            pid_file.exists()
        });
        if !ready {
            supervise::terminate(&mut pasta, "pasta", Duration::from_secs(1));
            self.stop();
            return Err(helper_failed(anyhow!(
                "pasta did not become ready within {READY_TIMEOUT:?}"
            )));
        }

        tracing::info!(holder_pid, forwards = rules.len(), "network helper started");
        self.pasta = Some(pasta);
        Ok(())
    }

    /// Tear down pasta, then the namespace holder. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut pasta) = self.pasta.take() {
            if !supervise::terminate(&mut pasta, "pasta", STOP_DEADLINE) {
                tracing::warn!("pasta exceeded its stop deadline");
            }
        }
        if let Some(mut holder) = self.holder.take() {
            let _ = holder.kill();
            let _ = holder.wait();
        }
    }
}

impl Drop for NetworkController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// pasta port-forward arguments: `-t`/`-u` map a host port to a sandbox
/// port (inbound), `-T`/`-U` the reverse (outbound).
pub fn forward_args(rules: &[PortForwardRule]) -> Vec<String> {
    let mut args = Vec::with_capacity(rules.len() * 2);
    for rule in rules {
        let flag = match (rule.direction, rule.protocol) {
            (ForwardDirection::Inbound, ForwardProtocol::Tcp) => "-t",
            (ForwardDirection::Inbound, ForwardProtocol::Udp) => "-u",
            (ForwardDirection::Outbound, ForwardProtocol::Tcp) => "-T",
            (ForwardDirection::Outbound, ForwardProtocol::Udp) => "-U",
        };
        let spec = match rule.direction {
            ForwardDirection::Inbound => format!("{}:{}", rule.host_port, rule.sandbox_port),
            ForwardDirection::Outbound => format!("{}:{}", rule.sandbox_port, rule.host_port),
        };
        args.push(flag.to_string());
        args.push(spec);
    }
    args
}

fn helper_failed(source: anyhow::Error) -> LauncherError {
    LauncherError::HelperFailed {
        helper: "pasta".into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(
        direction: ForwardDirection,
        protocol: ForwardProtocol,
        host_port: u16,
        sandbox_port: u16,
    ) -> PortForwardRule {
        PortForwardRule {
            name: "test".into(),
            direction,
            protocol,
            host_port,
            sandbox_port,
        }
    }

    #[test]
    fn forward_args_cover_all_combinations() {
        let rules = vec![
            rule(ForwardDirection::Inbound, ForwardProtocol::Tcp, 3000, 3000),
            rule(ForwardDirection::Inbound, ForwardProtocol::Udp, 5353, 53),
            rule(ForwardDirection::Outbound, ForwardProtocol::Tcp, 5432, 15432),
            rule(ForwardDirection::Outbound, ForwardProtocol::Udp, 514, 1514),
        ];
        assert_eq!(
            forward_args(&rules),
            vec![
                "-t", "3000:3000", "-u", "5353:53", "-T", "15432:5432", "-U", "1514:514",
            ]
        );
    }

    #[test]
    fn no_rules_no_args() {
        assert!(forward_args(&[]).is_empty());
    }

    #[test]
    fn stop_without_start_is_fine() {
        let mut controller = NetworkController::new();
        controller.stop();
        controller.stop();
    }
}
