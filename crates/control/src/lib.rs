//! netmesh control plane
//!
//! Manages peers, groups, policies and gateway routes of isolated mesh
//! networks and pushes compiled per-peer configuration to connected agents.

pub mod config;
pub mod meshnet;
pub mod server;

pub use config::ControlConfig;
pub use server::{AppState, ControlServer};
