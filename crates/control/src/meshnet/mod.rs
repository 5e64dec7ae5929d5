//! Mesh control plane
//!
//! - `service`: validated mutations of the domain model
//! - `distribution`: connection registry and configuration pushes
//! - `agent`: the agent WebSocket channel and captive endpoints
//! - `incident`: heartbeat-driven incident detection
//! - `captive`: one-time captive-portal tokens and client admission
//! - `auth`: user sessions
//! - `routes`: admin HTTP API

pub mod agent;
pub mod auth;
pub mod captive;
pub mod distribution;
pub mod incident;
pub mod routes;
pub mod service;

pub use auth::{SessionStore, SqliteSessionStore};
pub use captive::{CaptivePortal, CaptiveTokens};
pub use distribution::{ConnectionRegistry, DistributionManager, PeerKey};
pub use incident::{IncidentDetector, IncidentDispatcher, ThresholdDetector};
pub use routes::ApiError;
pub use service::{ChangeNotifier, NetworkService, ServiceOptions};
