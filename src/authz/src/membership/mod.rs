//! Group membership resolver
//!
//! Keeps the raw `group -> user` and `group -> group` edges together with
//! each user's flattened (transitive, cycle-safe) group closure.

pub mod graph;

pub use graph::{MembershipGraph, MembershipPatch};
