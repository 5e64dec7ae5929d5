//! Control plane configuration

use anyhow::{bail, Context};
use ipnetwork::IpNetwork;
use netmesh_common::compiler::CompileOptions;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// HTTP listen address
    pub listen: String,

    /// Store directory path
    pub store_path: PathBuf,

    /// Database file, defaults to `<store_path>/control.db`
    pub db_path: Option<PathBuf>,

    /// Bearer token required on admin routes. Unset disables the check.
    pub admin_token: Option<String>,

    pub auth: AuthConfig,
    pub agent: AgentConfig,
    pub captive: CaptiveConfig,
    pub cidr: CidrConfig,
    pub incidents: IncidentConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            store_path: netmesh_common::default_store_path(),
            db_path: None,
            admin_token: None,
            auth: AuthConfig::default(),
            agent: AgentConfig::default(),
            captive: CaptiveConfig::default(),
            cidr: CidrConfig::default(),
            incidents: IncidentConfig::default(),
        }
    }
}

/// Network-wide user authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require a user session for captive-portal admission
    pub enabled: bool,

    /// OAuth issuer handed to agents for the captive login redirect
    pub issuer_url: Option<String>,

    pub session_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer_url: None,
            session_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Agent channel tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Connections silent for this long are dropped
    pub idle_timeout_secs: u64,

    /// Give up on a single websocket write after this long
    pub push_timeout_ms: u64,

    /// Persistent keepalive written into compiled topology
    pub keepalive_secs: Option<u16>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 90,
            push_timeout_ms: 2000,
            keepalive_secs: Some(25),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptiveConfig {
    pub token_ttl_secs: u64,
}

impl Default for CaptiveConfig {
    fn default() -> Self {
        Self { token_ttl_secs: 300 }
    }
}

/// CIDR suggestion inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CidrConfig {
    /// Blocks never suggested
    pub reserved: Vec<String>,

    /// Also avoid the CIDRs of existing networks
    pub reserve_existing_networks: bool,
}

impl Default for CidrConfig {
    fn default() -> Self {
        Self {
            reserved: Vec::new(),
            reserve_existing_networks: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    /// Heartbeats buffered per network before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

impl ControlConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the server cannot start with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;
        self.reserved_cidrs()?;
        if self.agent.idle_timeout_secs == 0 {
            bail!("agent.idle_timeout_secs must be positive");
        }
        if self.agent.push_timeout_ms == 0 {
            bail!("agent.push_timeout_ms must be positive");
        }
        if self.incidents.queue_capacity == 0 {
            bail!("incidents.queue_capacity must be positive");
        }
        if self.auth.enabled && self.auth.issuer_url.is_none() {
            bail!("auth.issuer_url is required when auth is enabled");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.listen))
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(path) => expand_tilde(path),
            None => expand_tilde(&self.store_path).join("control.db"),
        }
    }

    pub fn reserved_cidrs(&self) -> anyhow::Result<Vec<IpNetwork>> {
        self.cidr
            .reserved
            .iter()
            .map(|c| {
                c.parse::<IpNetwork>()
                    .with_context(|| format!("invalid reserved CIDR '{}'", c))
            })
            .collect()
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            oauth_issuer: if self.auth.enabled {
                self.auth.issuer_url.clone()
            } else {
                None
            },
            keepalive_secs: self.agent.keepalive_secs,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.idle_timeout_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.push_timeout_ms)
    }

    pub fn captive_token_ttl(&self) -> Duration {
        Duration::from_secs(self.captive.token_ttl_secs)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
