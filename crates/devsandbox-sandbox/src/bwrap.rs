//! Translation of the compiled op sequence into a bubblewrap invocation,
//! and the actual target spawn.
//!
//! The runner owns the conventions the compiler leaves open: namespace
//! unsharing, `/dev`, `/proc` and `/sys`, `--die-with-parent`, a cleared
//! environment, and the working directory. Everything else is a 1:1
//! mapping from [`MountOp`].

use std::ffi::OsString;
use std::fs::File;
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use anyhow::Context;
use nix::sched::CloneFlags;

use devsandbox_core::LauncherError;

use crate::compiler::{CompileOutput, MountOp};

/// How the sandbox gets its network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Share the host network namespace (no isolation, no proxy).
    Shared,
    /// Join the namespaces held by the network helper before exec'ing the
    /// runner. The holder's user namespace must be entered first.
    Join { holder_pid: u32 },
}

pub struct BwrapRunner {
    binary: PathBuf,
}

impl BwrapRunner {
    /// Locate bwrap on the host.
    pub fn locate() -> Result<Self, LauncherError> {
        let binary = which::which("bwrap").map_err(|_| LauncherError::PreconditionMissing {
            binary: "bwrap".into(),
            hint: "install bubblewrap (e.g. `apt install bubblewrap` or `dnf install bubblewrap`)"
                .into(),
        })?;
        Ok(Self { binary })
    }

    /// Use an explicit binary path (tests).
    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Build the full bwrap argument vector for a compiled policy.
    pub fn argv(
        &self,
        output: &CompileOutput,
        net: NetworkMode,
        workdir: &Path,
        command: &[String],
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |items: &[&str]| {
            for item in items {
                args.push(OsString::from(item));
            }
        };

        push(&[
            "--unshare-user",
            "--unshare-pid",
            "--unshare-ipc",
            "--unshare-uts",
            "--unshare-cgroup",
        ]);
        if net == NetworkMode::Shared {
            push(&["--share-net"]);
        }
        push(&["--die-with-parent", "--clearenv"]);
        push(&["--proc", "/proc", "--dev", "/dev"]);
        if Path::new("/sys").exists() {
            push(&["--ro-bind", "/sys", "/sys"]);
        }

        for op in &output.ops {
            match op {
                MountOp::BindRw { src, dst } => {
                    args.push("--bind".into());
                    args.push(src.into());
                    args.push(dst.into());
                }
                MountOp::BindRo { src, dst } => {
                    args.push("--ro-bind".into());
                    args.push(src.into());
                    args.push(dst.into());
                }
                MountOp::Tmpfs { dst } => {
                    args.push("--tmpfs".into());
                    args.push(dst.into());
                }
                MountOp::TmpfsOverlay { src, dst } => {
                    args.push("--overlay-src".into());
                    args.push(src.into());
                    args.push("--tmp-overlay".into());
                    args.push(dst.into());
                }
                MountOp::PersistentOverlay { src, dst, upper } => {
                    args.push("--overlay-src".into());
                    args.push(src.into());
                    args.push("--overlay".into());
                    args.push(upper.join("upper").into());
                    args.push(upper.join("work").into());
                    args.push(dst.into());
                }
                MountOp::DevNullOver { dst } => {
                    args.push("--ro-bind".into());
                    args.push("/dev/null".into());
                    args.push(dst.into());
                }
                MountOp::Mkdir { dst } => {
                    args.push("--dir".into());
                    args.push(dst.into());
                }
                MountOp::Symlink { target, dst } => {
                    args.push("--symlink".into());
                    args.push(target.into());
                    args.push(dst.into());
                }
                MountOp::SetEnv { name, value } => {
                    args.push("--setenv".into());
                    args.push(name.into());
                    args.push(value.into());
                }
                MountOp::UnsetEnv { name } => {
                    args.push("--unsetenv".into());
                    args.push(name.into());
                }
            }
        }

        args.push("--chdir".into());
        args.push(workdir.into());
        args.push("--".into());
        for part in command {
            args.push(part.into());
        }
        args
    }

    /// Spawn the target inside the sandbox. The child is placed in its own
    /// process group so signals can be forwarded to the whole tree; in
    /// `Join` mode the helper's user and network namespaces are entered
    /// before bwrap executes.
    pub fn spawn(
        &self,
        output: &CompileOutput,
        net: NetworkMode,
        workdir: &Path,
        command: &[String],
    ) -> Result<Child, LauncherError> {
        let argv = self.argv(output, net, workdir, command);
        let mut cmd = Command::new(&self.binary);
        cmd.args(&argv);

        // Opened before fork: pre_exec runs in a context where only
        // async-signal-safe operations are allowed.
        let ns_files = match net {
            NetworkMode::Shared => None,
            NetworkMode::Join { holder_pid } => {
                let user = File::open(format!("/proc/{holder_pid}/ns/user"))
                    .context("opening helper user namespace")
                    .map_err(|e| spawn_error(e))?;
                let netns = File::open(format!("/proc/{holder_pid}/ns/net"))
                    .context("opening helper network namespace")
                    .map_err(|e| spawn_error(e))?;
                Some((user, netns))
            }
        };

        unsafe {
            cmd.pre_exec(move || {
                // Own process group for signal forwarding.
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some((user, netns)) = &ns_files {
                    nix::sched::setns(user.as_fd(), CloneFlags::CLONE_NEWUSER)
                        .map_err(std::io::Error::from)?;
                    nix::sched::setns(netns.as_fd(), CloneFlags::CLONE_NEWNET)
                        .map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }

        cmd.spawn()
            .context("spawning bwrap")
            .map_err(spawn_error)
    }
}

fn spawn_error(source: anyhow::Error) -> LauncherError {
    LauncherError::HelperFailed {
        helper: "bwrap".into(),
        source,
    }
}
