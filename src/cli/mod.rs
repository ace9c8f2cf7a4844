//! CLI command implementations

pub mod connect;
pub mod list_regions;
pub mod status;
