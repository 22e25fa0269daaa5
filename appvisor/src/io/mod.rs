//! Side-effecting adapters: filesystem, processes, sockets, the agent backend.

pub mod agent;
pub mod config;
pub mod deps;
pub mod edits;
pub mod ports;
pub mod process;
pub mod proxy;
