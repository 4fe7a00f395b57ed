//! Shared helper-process supervision: readiness polling and bounded
//! termination, used by every controller that owns a child process.

use std::process::Child;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Poll `ready` every `interval` until it returns true or `deadline`
/// elapses. Returns whether readiness was observed.
pub fn wait_until(deadline: Duration, interval: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    loop {
        if ready() {
            return true;
        }
        if Instant::now() >= end {
            return false;
        }
        std::thread::sleep(interval);
    }
}

/// Ask `child` to terminate: SIGTERM, wait up to `deadline`, then SIGKILL.
/// Returns true when the child exited within the deadline (the caller logs
/// a stop-drain diagnostic otherwise). Safe to call on an already-dead
/// child.
pub fn terminate(child: &mut Child, name: &str, deadline: Duration) -> bool {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return true;
    }
    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);

    let graceful = wait_until(deadline, Duration::from_millis(50), || {
        matches!(child.try_wait(), Ok(Some(_)))
    });
    if graceful {
        return true;
    }

    tracing::warn!("{name}: did not exit after SIGTERM, sending SIGKILL");
    let _ = child.kill();
    let _ = child.wait();
    false
}
