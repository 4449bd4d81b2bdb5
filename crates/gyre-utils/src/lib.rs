mod assert;
mod id;
mod log;
mod signal;
mod thread;

pub use id::mint_id;
pub use log::init_tracing;
pub use signal::ignore_sigpipe;
pub use thread::thread_boot;
