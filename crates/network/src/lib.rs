//! Validator-to-validator transport.
//!
//! [`TcpMesh`] keeps one TCP connection per peer validator and implements
//! the consensus [`Network`](dbft_consensus::Network) trait on top of it.

pub mod tcp_mesh;

pub use tcp_mesh::{read_frame, write_frame, TcpMesh};
