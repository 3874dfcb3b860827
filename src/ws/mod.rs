//! WebSocket side of the hub.
//!
//! - [`protocol`]: the JSON frames on the wire.
//! - [`types`]: per-connection handles and their bounded outbound queues.
//! - [`registry`]: the user id to connection map.
//! - [`pipeline`]: the [`Hub`](pipeline::Hub) and each connection's reader/writer loops.
//! - [`upgrade`]: the Axum upgrade handler.

pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod types;
pub mod upgrade;
