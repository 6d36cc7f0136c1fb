//! Wire types for the mesh gateway admin API
//!
//! Instances register, heartbeat and deregister through these payloads;
//! operators use them to drain instances and inspect registry state.

pub mod v1;

pub use v1::*;
