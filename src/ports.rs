//! Deterministic port assignments for cluster nodes.
//!
//! Each validator claims a block of ten consecutive ports starting at its
//! configured base port. Individual node services live at fixed offsets
//! inside that block, so knowing a validator's base port is enough to reach
//! any of its endpoints.

pub const fn grpc_port(base_port: u16) -> u16 {
    base_port
}

pub const fn api_port(base_port: u16) -> u16 {
    base_port + 1
}

pub const fn grpc_web_port(base_port: u16) -> u16 {
    base_port + 2
}

pub const fn pprof_port(base_port: u16) -> u16 {
    base_port + 3
}

pub const fn p2p_port(base_port: u16) -> u16 {
    base_port + 6
}

pub const fn rpc_port(base_port: u16) -> u16 {
    base_port + 7
}
