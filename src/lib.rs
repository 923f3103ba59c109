//! Test harness for local chain-maind clusters.
//!
//! The heavy lifting stays with external programs: the cluster manager that
//! provisions node homes, the process supervisor that keeps the nodes alive,
//! and the nodes themselves. This crate drives them and gives integration
//! tests a synchronous API to wait on cluster progress.

pub mod client;
pub mod config;
pub mod events;
pub mod fixture;
pub mod ports;
pub mod supervisor;
pub mod tailer;
pub mod waiters;

pub use client::{ClientError, NodeClient, NodeStatus, StatusSource, SyncInfo};
pub use config::{ClusterConfig, ConfigError, ValidatorConfig};
pub use events::{parse_events, EventError, EventTable, TxLog};
pub use fixture::{
    with_cluster, Cluster, ClusterHandle, FixtureError, FixtureOptions, WorkDirFactory,
    COVERAGE_MIN_UPTIME,
};
pub use supervisor::{ClusterBackend, ProgramBackend, SupervisorProcess, SUPERVISOR_CONFIG};
pub use waiters::{
    wait_for_block, wait_for_block_time, wait_for_new_blocks, wait_for_port, wait_for_port_on,
    WaitError,
};
