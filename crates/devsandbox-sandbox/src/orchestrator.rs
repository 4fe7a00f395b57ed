//! Sandbox orchestrator: the top-level lifecycle state machine.
//!
//! `Init → Configured → Prepared → HelpersRunning → Running → Stopping →
//! Stopped`, never re-entering a state. Helpers start in a fixed order
//! (network helper, HTTPS proxy, then active tools by name — docker before
//! portal); teardown is the exact reverse of what actually started. Tool
//! stop errors are logged, never propagated, so teardown cannot mask the
//! target's own exit status.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};

use anyhow::Context;

use devsandbox_core::config::Config;
use devsandbox_core::{Binding, CancelToken, EnvVar, LauncherError, SandboxIdentity, Shell};
use devsandbox_tools::{Registry, StartContext, Tool};

use crate::audit;
use crate::bwrap::{BwrapRunner, NetworkMode};
use crate::compiler::{compile, CompileOutput, CompileRequest, MountOp};
use crate::mitm::HttpsProxyController;
use crate::pasta::NetworkController;
use crate::signal;

/// Variables never copied into the sandbox: agent sockets would punch
/// holes through the credential hides.
const ALWAYS_UNSET: &[&str] = &["SSH_AUTH_SOCK", "GPG_AGENT_INFO"];

const SHELL_INIT_REL: &str = ".config/devsandbox/shell-init.sh";

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Command to run inside the sandbox; empty means an interactive shell.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Init,
    Configured,
    Prepared,
    HelpersRunning,
    Running,
    Stopping,
    Stopped,
}

pub struct Orchestrator {
    config: Config,
    identity: SandboxIdentity,
    home: PathBuf,
    tools: Vec<Box<dyn Tool>>,
    /// Tool indices in completed-start order; stops consume it in reverse.
    started: Vec<usize>,
    network: NetworkController,
    https: Option<HttpsProxyController>,
    cancel: CancelToken,
    shell_init: bool,
    state: State,
}

impl Orchestrator {
    pub fn new(config: Config, project_dir: &Path) -> Result<Self, LauncherError> {
        Self::with_registry(config, project_dir, &Registry::builtin())
    }

    pub fn with_registry(
        config: Config,
        project_dir: &Path,
        registry: &Registry,
    ) -> Result<Self, LauncherError> {
        config.validate()?;

        let identity =
            SandboxIdentity::resolve(project_dir).map_err(|e| LauncherError::ConfigInvalid {
                path: project_dir.display().to_string(),
                message: format!("{e:#}"),
            })?;
        let home = dirs::home_dir().ok_or_else(|| LauncherError::ConfigInvalid {
            path: "HOME".into(),
            message: "cannot determine the host home directory".into(),
        })?;

        let mut tools = registry.all();
        for tool in &mut tools {
            let name = tool.name();
            if let Some(table) = config.tools.get(name) {
                if let Some(configurable) = tool.as_configure_mut() {
                    configurable
                        .configure(table)
                        .map_err(|e| LauncherError::ConfigInvalid {
                            path: format!("tools.{name}"),
                            message: format!("{e:#}"),
                        })?;
                }
            }
        }
        tools.retain(|tool| tool.available(&home));
        tracing::debug!(
            tools = ?tools.iter().map(|t| t.name()).collect::<Vec<_>>(),
            project = %identity.project_dir.display(),
            "orchestrator configured"
        );

        identity
            .ensure_layout()
            .map_err(|e| LauncherError::HelperFailed {
                helper: "data-dir".into(),
                source: e,
            })?;

        let mut orchestrator = Self {
            config,
            identity,
            home,
            tools,
            started: Vec::new(),
            network: NetworkController::new(),
            https: None,
            cancel: CancelToken::new(),
            shell_init: false,
            state: State::Init,
        };
        orchestrator.advance(State::Configured);
        Ok(orchestrator)
    }

    pub fn identity(&self) -> &SandboxIdentity {
        &self.identity
    }

    /// Run the full lifecycle and return the target's exit code.
    pub fn run(&mut self, opts: &LaunchOptions) -> Result<i32, LauncherError> {
        self.prepare()?;
        self.start_helpers()?;

        let output = match self.compile_policy() {
            Ok(output) => output,
            Err(e) => {
                self.shutdown();
                return Err(e);
            }
        };
        for warning in &output.warnings {
            tracing::warn!("{warning}");
        }

        let code = match self.execute(&output, opts) {
            Ok(code) => code,
            Err(e) => {
                self.advance(State::Stopping);
                self.shutdown();
                self.advance(State::Stopped);
                return Err(e);
            }
        };

        self.advance(State::Stopping);
        self.shutdown();
        self.advance(State::Stopped);
        audit::run_finished(&self.identity, code);
        Ok(code)
    }

    /// Compile the policy without touching helpers (`--info`).
    pub fn plan(&self) -> Result<CompileOutput, LauncherError> {
        self.compile_policy()
    }

    /// Configured → Prepared: run every tool's Setup in name order, then
    /// drop the aggregated shell init file into the sandbox home.
    fn prepare(&mut self) -> Result<(), LauncherError> {
        for tool in &self.tools {
            if let Some(setup) = tool.as_setup() {
                setup
                    .setup(&self.home, &self.identity.sandbox_home)
                    .map_err(|e| LauncherError::SetupFailed {
                        tool: tool.name().into(),
                        source: e,
                    })?;
            }
        }
        self.write_shell_init().map_err(|e| LauncherError::SetupFailed {
            tool: "shell-init".into(),
            source: e,
        })?;
        self.advance(State::Prepared);
        Ok(())
    }

    fn write_shell_init(&mut self) -> anyhow::Result<()> {
        let shell = std::env::var("SHELL")
            .map(|s| Shell::from_program(Path::new(&s)))
            .unwrap_or(Shell::Bash);
        let lines: Vec<String> = self
            .tools
            .iter()
            .filter_map(|tool| tool.shell_init(shell))
            .collect();
        if lines.is_empty() {
            return Ok(());
        }
        let path = self.identity.sandbox_home.join(SHELL_INIT_REL);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, lines.join("\n") + "\n")
            .with_context(|| format!("writing {}", path.display()))?;
        self.shell_init = true;
        Ok(())
    }

    /// Prepared → HelpersRunning: network helper, HTTPS proxy, then active
    /// tools in name order. On any failure everything already started is
    /// stopped in reverse before the error propagates.
    fn start_helpers(&mut self) -> Result<(), LauncherError> {
        if self.config.proxy.enabled {
            self.network
                .start(&self.identity, &self.config.port_forwarding.rules)?;

            let mut https = HttpsProxyController::new(self.config.proxy.port);
            if let Err(e) = https.start(&self.identity) {
                self.network.stop();
                return Err(e);
            }
            self.https = Some(https);
        }

        let home = self.home.clone();
        let identity = self.identity.clone();
        let cancel = self.cancel.clone();
        for index in 0..self.tools.len() {
            let name = self.tools[index].name();
            let result = {
                let Some(active) = self.tools[index].as_active_mut() else {
                    continue;
                };
                let ctx = StartContext {
                    home: &home,
                    identity: &identity,
                    cancel: &cancel,
                };
                active.start(&ctx)
            };
            match result {
                Ok(()) => self.started.push(index),
                Err(e) => {
                    let err = LauncherError::HelperFailed {
                        helper: name.into(),
                        source: e,
                    };
                    self.shutdown();
                    return Err(err);
                }
            }
        }
        self.advance(State::HelpersRunning);
        Ok(())
    }

    /// Reverse-order teardown. Safe to call at any point after
    /// `Configured`; tool stop errors are logged and swallowed.
    fn shutdown(&mut self) {
        self.cancel.cancel();
        while let Some(index) = self.started.pop() {
            let name = self.tools[index].name();
            let result = match self.tools[index].as_active_mut() {
                Some(active) => active.stop(),
                None => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!("tool `{name}` stop failed: {e:#}");
            }
        }
        if let Some(mut https) = self.https.take() {
            https.stop();
        }
        self.network.stop();
    }

    fn compile_policy(&self) -> Result<CompileOutput, LauncherError> {
        let mut tool_bindings: Vec<(String, Vec<Binding>)> = self
            .tools
            .iter()
            .map(|tool| {
                (
                    tool.name().to_string(),
                    tool.bindings(&self.home, &self.identity.sandbox_home),
                )
            })
            .collect();
        if self.config.proxy.enabled {
            tool_bindings.push((
                "proxy".to_string(),
                vec![HttpsProxyController::ca_binding(&self.identity)],
            ));
        }

        let mut env: Vec<EnvVar> = Vec::new();
        if self.config.proxy.enabled {
            env.extend(HttpsProxyController::proxy_env(self.config.proxy.port));
        }
        for tool in &self.tools {
            env.extend(tool.environment(&self.home, &self.identity.sandbox_home));
        }
        if self.shell_init {
            env.push(EnvVar::set(
                "DEVSANDBOX_SHELL_INIT",
                self.home.join(SHELL_INIT_REL).display().to_string(),
            ));
        }

        let unset_env: Vec<String> = ALWAYS_UNSET.iter().map(|s| s.to_string()).collect();
        compile(&CompileRequest {
            identity: &self.identity,
            home: &self.home,
            tool_bindings: &tool_bindings,
            user_rules: &self.config.sandbox.mounts.rules,
            env: &env,
            unset_env: &unset_env,
        })
    }

    /// HelpersRunning → Running → (target exits). Returns the exit code,
    /// mapping a signal death to the conventional 128+N.
    fn execute(&mut self, output: &CompileOutput, opts: &LaunchOptions) -> Result<i32, LauncherError> {
        let runner = BwrapRunner::locate()?;

        // Persistent overlays need their upper/work directories on the host.
        for op in &output.ops {
            if let MountOp::PersistentOverlay { upper, .. } = op {
                for sub in ["upper", "work"] {
                    std::fs::create_dir_all(upper.join(sub)).map_err(|e| {
                        LauncherError::HelperFailed {
                            helper: "overlays".into(),
                            source: anyhow::Error::new(e),
                        }
                    })?;
                }
            }
        }

        let command = if opts.command.is_empty() {
            vec![std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())]
        } else {
            opts.command.clone()
        };
        let net = if self.config.proxy.enabled {
            let holder_pid =
                self.network
                    .holder_pid()
                    .ok_or_else(|| LauncherError::HelperFailed {
                        helper: "pasta".into(),
                        source: anyhow::anyhow!("network helper is not running"),
                    })?;
            NetworkMode::Join { holder_pid }
        } else {
            NetworkMode::Shared
        };

        audit::run_started(&self.identity, &command, &output.fingerprint);
        let mut child = runner.spawn(output, net, &self.identity.project_dir, &command)?;
        signal::forward_to(child.id() as i32);
        self.advance(State::Running);

        let status = child
            .wait()
            .context("waiting for the sandboxed target")
            .map_err(|e| LauncherError::HelperFailed {
                helper: "bwrap".into(),
                source: e,
            })?;
        signal::clear();

        Ok(status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(1)))
    }

    fn advance(&mut self, next: State) {
        assert!(
            next > self.state,
            "lifecycle state {next:?} cannot be re-entered from {:?}",
            self.state
        );
        self.state = next;
    }
}
