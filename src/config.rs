//! Configuration types and persistence
//!
//! Per-proxy configuration mirrors the on-disk JSON schema: stable id,
//! listen/target endpoints, intent flags (`enabled`, `paused`), timeout and
//! retry budgets, and the read-split threshold. The [`ConfigStore`] trait is
//! the seam the lifecycle manager persists through; the JSON file store is
//! the production implementation and the memory store serves tests and
//! embedded use.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ProxyError, ProxyResult};
use crate::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RETRIES, DEFAULT_READ_TIMEOUT_SECS};

/// Inclusive bounds for the configurable timeouts, in seconds
pub const TIMEOUT_RANGE_SECS: (u64, u64) = (1, 300);

/// Upper bound on the retry budget
pub const MAX_RETRIES_LIMIT: u32 = 10;

fn default_connection_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_read_timeout() -> u64 {
    DEFAULT_READ_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Configuration of a single proxy instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Stable identifier, unique within the registry
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Listen endpoint; host optional (`":502"` binds all interfaces)
    pub listen_addr: String,
    /// Upstream endpoint; host and port both mandatory
    pub target_addr: String,
    /// Intent to be running
    #[serde(default)]
    pub enabled: bool,
    /// Suspended while still enabled
    #[serde(default)]
    pub paused: bool,
    /// Upstream connect/write deadline in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Frame read deadline in seconds, both sides
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Retry budget for one forward exchange
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Register-read split threshold; 0 disables splitting
    #[serde(default)]
    pub max_read_size: u16,
    /// Operator description
    #[serde(default)]
    pub description: String,
}

impl ProxyConfig {
    /// Construct a configuration with defaulted tunables
    pub fn new(id: &str, name: &str, listen_addr: &str, target_addr: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            listen_addr: listen_addr.to_string(),
            target_addr: target_addr.to_string(),
            enabled: false,
            paused: false,
            connection_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            read_timeout: DEFAULT_READ_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_read_size: 0,
            description: String::new(),
        }
    }

    /// Validate the configuration against its declared ranges
    pub fn validate(&self) -> ProxyResult<()> {
        if self.id.is_empty() {
            return Err(ProxyError::configuration("proxy id must not be empty"));
        }
        for (label, raw, addr) in [
            ("listen_addr", &self.listen_addr, self.listen_socket()?),
            ("target_addr", &self.target_addr, self.target_socket()?),
        ] {
            if addr.port() == 0 {
                return Err(ProxyError::configuration(format!(
                    "{} '{}' must carry a port in [1, 65535]",
                    label, raw
                )));
            }
        }

        let (lo, hi) = TIMEOUT_RANGE_SECS;
        for (label, value) in [
            ("connection_timeout", self.connection_timeout),
            ("read_timeout", self.read_timeout),
        ] {
            if value < lo || value > hi {
                return Err(ProxyError::configuration(format!(
                    "{} of {}s outside [{}, {}]",
                    label, value, lo, hi
                )));
            }
        }

        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ProxyError::configuration(format!(
                "max_retries of {} exceeds {}",
                self.max_retries, MAX_RETRIES_LIMIT
            )));
        }

        Ok(())
    }

    /// Resolve the listen endpoint, defaulting the host to all interfaces
    pub fn listen_socket(&self) -> ProxyResult<SocketAddr> {
        let addr = if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        };
        resolve_endpoint(&addr, "listen_addr")
    }

    /// Resolve the upstream endpoint; the host is mandatory here
    pub fn target_socket(&self) -> ProxyResult<SocketAddr> {
        if self.target_addr.starts_with(':') {
            return Err(ProxyError::configuration(format!(
                "target_addr '{}' is missing a host",
                self.target_addr
            )));
        }
        resolve_endpoint(&self.target_addr, "target_addr")
    }

    /// Connection timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    /// Read timeout as a [`Duration`]
    pub fn frame_read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }
}

fn resolve_endpoint(addr: &str, label: &str) -> ProxyResult<SocketAddr> {
    use std::net::ToSocketAddrs;

    addr.to_socket_addrs()
        .map_err(|e| ProxyError::configuration(format!("invalid {} '{}': {}", label, addr, e)))?
        .next()
        .ok_or_else(|| {
            ProxyError::configuration(format!("{} '{}' resolved to no address", label, addr))
        })
}

/// Process-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Admin web endpoint, consumed by the external HTTP layer
    #[serde(default = "default_web_port")]
    pub web_port: String,
    /// Admin credential hash; empty means first run
    #[serde(default)]
    pub admin_pass_hash: String,
    /// Forces a credential change on next login
    #[serde(default)]
    pub force_password_change: bool,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

fn default_web_port() -> String {
    ":8080".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web_port: default_web_port(),
            admin_pass_hash: String::new(),
            force_password_change: false,
            proxies: Vec::new(),
        }
    }
}

/// One-shot mutation applied under the store's write lock
pub type ConfigMutation = Box<dyn FnOnce(&mut Config) -> ProxyResult<()> + Send>;

/// Persistence seam for the lifecycle manager
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current configuration snapshot
    async fn get(&self) -> Config;

    /// Apply a mutation and persist the result atomically
    ///
    /// A mutation returning an error leaves the stored configuration
    /// untouched.
    async fn update(&self, mutate: ConfigMutation) -> ProxyResult<()>;
}

/// JSON-file-backed configuration store
///
/// The file is rewritten on every successful update, via a sibling
/// temporary file and rename so readers never observe a torn write.
pub struct JsonConfigStore {
    path: PathBuf,
    state: RwLock<Config>,
}

impl JsonConfigStore {
    /// Open a store, tolerating a missing file (defaults apply)
    pub async fn load(path: impl Into<PathBuf>) -> ProxyResult<Self> {
        let path = path.into();
        let config = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(ProxyError::from(e)),
        };
        Ok(Self {
            path,
            state: RwLock::new(config),
        })
    }

    async fn persist(&self, config: &Config) -> ProxyResult<()> {
        let raw = serde_json::to_vec_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn get(&self) -> Config {
        self.state.read().await.clone()
    }

    async fn update(&self, mutate: ConfigMutation) -> ProxyResult<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        mutate(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }
}

/// In-memory configuration store for tests and embedded use
#[derive(Default)]
pub struct MemoryConfigStore {
    state: RwLock<Config>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            state: RwLock::new(config),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self) -> Config {
        self.state.read().await.clone()
    }

    async fn update(&self, mutate: ConfigMutation) -> ProxyResult<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        mutate(&mut next)?;
        *state = next;
        Ok(())
    }
}
