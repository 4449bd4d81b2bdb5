use std::sync::Once;

static SIGPIPE: Once = Once::new();

/// Ignores SIGPIPE process-wide so a peer resetting mid-write surfaces as an
/// `EPIPE` write error instead of killing the process.
///
/// Call once from main before starting any server.
pub fn ignore_sigpipe() {
    SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}
