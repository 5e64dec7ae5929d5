//! netmesh Common Library
//!
//! Domain model, consistency rules, configuration compiler and persistence
//! shared by the netmesh control plane.

pub mod cidr;
pub mod compiler;
pub mod crypto;
pub mod db;
pub mod error;
pub mod invariants;
pub mod names;
pub mod types;

// Re-export commonly used types
pub use cidr::CidrSuggestion;
pub use compiler::{compile, CompileOptions, NetworkSnapshot, PeerConfig};
pub use crypto::WgKeyPair;
pub use db::{Database, Store};
pub use error::{Error, Result};
pub use types::*;

/// netmesh version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".netmesh")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
