//! meterboard-types - Node protocol wire types for meterboard
//!
//! This crate contains pure data structures without heavy dependencies.
//! No tokio, no storage - just serde-serializable types.
//!
//! Used by:
//! - meterboard-core (eligibility, runtime config, usage snapshots)
//! - meterboard-web (node-facing HTTP responses)

pub mod node;
pub mod usage;

pub use node::{
    Acknowledgement, AliveList, BaseConfig, NodeRuntimeConfig, NodeStatusReport, NodeUser, NodeUsersResponse,
    ResourceUsage,
};
pub use usage::{NodeUsageSnapshot, UsageSnapshot};
