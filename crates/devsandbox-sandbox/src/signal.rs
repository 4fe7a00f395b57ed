//! SIGINT/SIGTERM forwarding to the target process group.
//!
//! While the target runs, the launcher does not initiate shutdown on its
//! own — interactive ^C belongs to the sandboxed process tree. The handler
//! only relays the signal; teardown happens when the target exits.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static TARGET_PGID: AtomicI32 = AtomicI32::new(0);
static INSTALL: Once = Once::new();

extern "C" fn relay(signum: libc::c_int) {
    let pgid = TARGET_PGID.load(Ordering::SeqCst);
    if pgid > 0 {
        // Negative pid addresses the whole process group.
        unsafe {
            libc::kill(-pgid, signum);
        }
    }
}

/// Begin forwarding SIGINT/SIGTERM to `pgid`. Handlers are installed once
/// per process; subsequent calls only retarget the group.
pub fn forward_to(pgid: i32) {
    TARGET_PGID.store(pgid, Ordering::SeqCst);
    INSTALL.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(relay),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe {
            let _ = sigaction(Signal::SIGINT, &action);
            let _ = sigaction(Signal::SIGTERM, &action);
        }
    });
}

/// Stop forwarding (the target has exited).
pub fn clear() {
    TARGET_PGID.store(0, Ordering::SeqCst);
}
