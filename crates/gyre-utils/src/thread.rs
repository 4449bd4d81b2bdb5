use core_affinity::CoreId;
use tracing::warn;

fn set_thread_affinity(core: usize) {
    if !core_affinity::set_for_current(CoreId { id: core }) {
        warn!(?core, "couldn't set core affinity");
    }
}

/// Per-thread setup run at the top of every loop thread.
///
/// Pinning is best-effort; failure logs and continues on the OS default.
pub fn thread_boot(core: Option<usize>) {
    if let Some(core) = core {
        set_thread_affinity(core);
    }
}
