/// Panics in debug builds; logs an error via `tracing::error!` in release
/// builds. For invariant breaches that should be loud in development but
/// survivable in production.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => (if cfg!(debug_assertions) { panic!($($arg)*); } else {tracing::error!($($arg)*)})
}
