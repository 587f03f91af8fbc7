//! Default values for intervals, timeouts and reconciliation floors.

use std::time::Duration;

pub const HEALTH_POLL_INTERVAL_MS: u64 = 2_000;
pub const RPC_TIMEOUT_SECS: u64 = 5;
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 600;

pub const NODE_STOP_TIMEOUT_SECS: u64 = 60;
pub const WALLET_STOP_TIMEOUT_SECS: u64 = 10;
pub const KILL_WAIT_SECS: u64 = 5;
pub const STARTUP_TIMEOUT_SECS: u64 = 10;

pub const MAX_RETRIES: u32 = 3;
pub const RETRY_FIRST_DELAY_MS: u64 = 500;
pub const RETRY_MAX_DELAY_MS: u64 = 8_000;

pub const CREDENTIAL_LEN: usize = 32;
pub const LOOPBACK: &str = "127.0.0.1";
/// Node RPC port used when neither the local conf nor the template names one.
pub const NODE_RPC_PORT: &str = "41414";

/// Minimum values enforced on the node's RPC server tuning keys.
pub const RPC_FLOORS: &[(&str, u64)] = &[
    ("rpcthreads", 32),
    ("rpcworkqueue", 64),
    ("rpcservertimeout", 120),
];

pub fn health_poll_interval() -> Duration { Duration::from_millis(HEALTH_POLL_INTERVAL_MS) }
pub fn rpc_timeout() -> Duration { Duration::from_secs(RPC_TIMEOUT_SECS) }
pub fn request_timeout() -> Duration { Duration::from_secs(REQUEST_TIMEOUT_SECS) }
pub fn download_timeout() -> Duration { Duration::from_secs(DOWNLOAD_TIMEOUT_SECS) }
pub fn kill_wait() -> Duration { Duration::from_secs(KILL_WAIT_SECS) }
pub fn startup_timeout() -> Duration { Duration::from_secs(STARTUP_TIMEOUT_SECS) }
