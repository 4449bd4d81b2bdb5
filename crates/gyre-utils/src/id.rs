/// Mints an opaque unique identifier for connections and timer tasks.
///
/// 128 random bits rendered as 32 hex chars. Uniqueness is probabilistic,
/// which is enough for a per-process registry key.
pub fn mint_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
