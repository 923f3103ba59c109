//! Blocking poll loops used to gate tests on cluster progress.
//!
//! All waiters sleep on the calling thread. The status pollers are generic
//! over [`StatusSource`] so they work against a live node or a scripted
//! source in tests.

use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::client::{ClientError, StatusSource};

/// Interval between TCP connection attempts.
pub const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between status queries.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default budget for a node's RPC port to start accepting connections.
pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(40);

/// Default budget, in seconds, for a node to reach a target height.
pub const DEFAULT_BLOCK_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("waited too long for port {port} on host {host} to start accepting connections")]
    PortTimeout { host: String, port: u16 },

    #[error("wait for block {0} timeout")]
    BlockTimeout(u64),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Block until `port` on the loopback interface accepts TCP connections.
pub fn wait_for_port(port: u16, timeout: Duration) -> Result<(), WaitError> {
    wait_for_port_on("127.0.0.1", port, timeout)
}

/// Block until `port` on `host` accepts TCP connections.
///
/// Each attempted connection is closed as soon as it succeeds. Name
/// resolution failures count the same as refused connections. The error
/// fires no earlier than `timeout` after the first attempt.
pub fn wait_for_port_on(host: &str, port: u16, timeout: Duration) -> Result<(), WaitError> {
    let start = Instant::now();

    loop {
        if try_connect(host, port, timeout).is_ok() {
            return Ok(());
        }

        thread::sleep(PORT_POLL_INTERVAL);

        if start.elapsed() >= timeout {
            return Err(WaitError::PortTimeout {
                host: host.to_string(),
                port,
            });
        }
    }
}

fn try_connect(host: &str, port: u16, timeout: Duration) -> std::io::Result<()> {
    for addr in (host, port).to_socket_addrs()? {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return Ok(());
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "no address accepted the connection",
    ))
}

/// Block until the node reports a height of at least `height`.
///
/// The source is queried exactly `timeout_secs * 2` times at half-second
/// spacing. Query errors are logged and treated as not-there-yet; a node that
/// is still booting answers eventually or runs out the budget.
pub fn wait_for_block(
    source: &impl StatusSource,
    height: u64,
    timeout_secs: u64,
) -> Result<(), WaitError> {
    for _ in 0..timeout_secs * 2 {
        match source.status() {
            Ok(status) => {
                if status.sync_info.latest_block_height >= height {
                    return Ok(());
                }
            }
            Err(err) => warn!(%err, "get sync status failed"),
        }

        thread::sleep(STATUS_POLL_INTERVAL);
    }

    Err(WaitError::BlockTimeout(height))
}

/// Block until the node has produced `n` blocks beyond its current height.
///
/// There is no internal timeout; callers bound the wait themselves when they
/// need one. Status errors propagate.
pub fn wait_for_new_blocks(source: &impl StatusSource, n: u64) -> Result<(), WaitError> {
    let begin = source.status()?.sync_info.latest_block_height;

    loop {
        thread::sleep(STATUS_POLL_INTERVAL);

        let current = source.status()?.sync_info.latest_block_height;

        if current.saturating_sub(begin) >= n {
            return Ok(());
        }
    }
}

/// Block until the node reports a block time of at least `target`.
///
/// There is no internal timeout. Status errors propagate.
pub fn wait_for_block_time(
    source: &impl StatusSource,
    target: DateTime<Utc>,
) -> Result<(), WaitError> {
    info!(%target, "waiting for block time");

    loop {
        let now = source.status()?.sync_info.latest_block_time;
        info!(%now, "current block time");

        if now >= target {
            return Ok(());
        }

        thread::sleep(STATUS_POLL_INTERVAL);
    }
}
