//! # Voltage Modbus Proxy - Multi-Tenant Modbus TCP Proxy
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! A multi-tenant TCP-level proxy for Modbus TCP, designed for industrial
//! automation sites where many masters talk to many field devices through
//! one hardened middle box.
//!
//! ## Features
//!
//! - **🔀 Multi-Tenant**: one process hosts many independent proxy instances,
//!   each with its own listener, upstream device, and lifecycle
//! - **🚀 Async Throughout**: Tokio-based accept loops, per-client sessions,
//!   and pooled upstream connections
//! - **✂️ Transparent Read Splitting**: oversize register reads are split
//!   into bounded sub-reads and stitched back together, invisible to the
//!   client
//! - **🔁 Bounded Retry**: upstream exchanges retry with exponential backoff
//!   under strict deadlines
//! - **🛡️ Pairing Safety**: per-instance serialization of upstream traffic,
//!   because field devices rarely honor overlapping transactions
//! - **📊 Operational Surface**: runtime snapshots, device tracking, and a
//!   non-blocking lifecycle event stream for admin frontends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_proxy::{JsonConfigStore, ProxyConfig, ProxyManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(JsonConfigStore::load("proxies.json").await?);
//!     let manager = ProxyManager::new(store);
//!     manager.initialize().await;
//!
//!     // add a tenant at runtime
//!     let mut cfg = ProxyConfig::new("plc-7", "Boiler PLC", ":1502", "10.0.0.7:502");
//!     cfg.enabled = true;
//!     cfg.max_read_size = 100;
//!     manager.add_proxy(cfg, true).await?;
//!     manager.start_proxy("plc-7").await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.stop_all().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────────────┐   ┌──────────┐
//! │  Modbus  │   │ ProxyInstance                        │   │  Modbus  │
//! │  master  ├──►│  session loop ─ frame codec          ├──►│  device  │
//! └──────────┘   │  split planner ─ forward engine      │   └──────────┘
//! ┌──────────┐   │  upstream mutex ─ connection pool    │
//! │  Modbus  ├──►│                                      │
//! │  master  │   └──────────────▲───────────────────────┘
//! └──────────┘                  │
//!                ┌──────────────┴───────────────────────┐
//!                │ ProxyManager                         │
//!                │  registry ─ config store ─ events    │
//!                └──────────────────────────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus/TCP frame codec and read splitting primitives
pub mod frame;

/// Pooled connections to upstream devices
pub mod pool;

/// Proxy instances: listeners, sessions, forwarding
pub mod proxy;

/// Configuration types and persistence
pub mod config;

/// Client device tracking
pub mod devices;

/// Lifecycle events and fan-out
pub mod events;

/// Proxy lifecycle management
pub mod manager;

/// Utility functions
pub mod utils;

// Re-export main types for convenience
pub use config::{Config, ConfigStore, JsonConfigStore, MemoryConfigStore, ProxyConfig};
pub use devices::{ConnectionRecord, Device, DeviceTracker};
pub use error::{ProxyError, ProxyResult};
pub use events::{EventBroadcaster, EventSubscription, ProxyEvent};
pub use frame::{ReadFunction, ReadPayload, ReadRequest};
pub use manager::{ProxyManager, ProxySnapshot};
pub use pool::{ConnectionPool, Dialer, PoolConfig, PoolStats, PooledConn};
pub use proxy::{ProxyInstance, ProxyStatus};

/// Default upstream connect/write deadline in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default frame read deadline in seconds
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;

/// Default retry budget for one forward exchange
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Maximum number of coils a conformant read request may ask for
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers a conformant read request may ask for
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Modbus Proxy v{} - Multi-tenant Modbus TCP proxy by Evan Liu",
        VERSION
    )
}
