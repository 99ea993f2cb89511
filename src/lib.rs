pub mod config;
pub mod consensus;
pub mod crypto;
pub mod miner;
pub mod net;
pub mod node;
pub mod primitives;
pub mod rpc;
pub mod wallet;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
