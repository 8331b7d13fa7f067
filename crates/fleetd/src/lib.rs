//! Fleet daemon: HTTP surface and configuration loading around
//! [`fleet_core::FleetController`]

pub mod api;
pub mod config;
