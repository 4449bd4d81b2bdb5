use std::{io, process};

use tracing::error;

/// Infrastructure failures the reactor cannot recover from.
///
/// Per-connection I/O errors tear down one connection; these tear down the
/// process, each with its own exit code so supervisors can tell them apart.
#[derive(Clone, Copy, Debug)]
#[repr(i32)]
pub enum FatalKind {
    PollCreate = 41,
    PollCtl = 42,
    PollWait = 43,
    WakeupCreate = 44,
    WakeupRead = 45,
    WakeupWrite = 46,
    TimerCreate = 47,
    TimerRead = 48,
}

pub fn die(kind: FatalKind, err: &io::Error) -> ! {
    error!(?kind, %err, "fatal reactor failure");
    process::exit(kind as i32)
}

/// Recoverable setup errors surfaced to the embedding application.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("couldn't bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}
