//! Network layer: UDP ingestion (C6), the TCP server and session gate (C7),
//! the agent connection pool (C8), and MTU fragment reassembly.

pub mod agent_pool;
pub mod mtu;
pub mod session;
pub mod tcp;
pub mod udp;
