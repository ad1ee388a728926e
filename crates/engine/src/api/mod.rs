//! HTTP entry points for the engine
//!
//! Chat intake, the queue's segment-execution target, service-mesh resume,
//! DLQ administration, and liveness.

pub mod middleware;
pub mod routes;
pub mod server;
pub mod types;

pub use server::{build_router, serve};
