//! In-memory entity tree and ACL store
//!
//! Holds every securable entity with its parent link, owner, break flag and
//! the id of its nearest ACL holder, plus the stored ACLs themselves. All
//! mutations keep `first_acl_id` up to date so permission checks never have
//! to search the tree.

pub mod store;

pub use store::{EntityStore, StorePatch};
