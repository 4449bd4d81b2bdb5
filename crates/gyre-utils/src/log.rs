use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber for binaries.
///
/// `RUST_LOG` wins when set, otherwise `info`. Library code only emits
/// events and never installs a subscriber.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
