//! Offline reconstruction of service responses.
//!
//! This module owns everything that answers calls without the network:
//! - flattening a fetched application snapshot into store rows
//! - per-entity-type resolvers that rebuild queries and objects from rows
//! - the separate static-asset cache used for offline application boot

pub mod assets;
pub mod flattener;
pub mod registry;
pub mod resolver;
