//! Shared wire types for the node hub and the proxy node agents.
//!
//! Keep frame vocabulary, command envelopes, and HTTP DTOs here so the hub and
//! the agents agree on one definition.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
