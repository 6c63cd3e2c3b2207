//! Proxy lifecycle manager
//!
//! The manager owns the registry of proxy instances keyed by stable id and
//! is the only component that mutates it. Every admin operation runs under
//! the registry write lock, persists intent through the injected
//! [`ConfigStore`], and emits a [`ProxyEvent`] before the lock releases, so
//! subscribers observe one consistent total order. Instances never call
//! back into the manager; they only mutate their own counters and status.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::{Config, ConfigStore, ProxyConfig};
use crate::devices::{ConnectionRecord, Device, DeviceTracker};
use crate::error::{ProxyError, ProxyResult};
use crate::events::{EventBroadcaster, EventSubscription, ProxyEvent};
use crate::proxy::{ProxyInstance, ProxyStatus};

/// Serializable status of one proxy instance
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub id: String,
    pub name: String,
    pub listen_addr: String,
    pub target_addr: String,
    pub status: ProxyStatus,
    pub paused: bool,
    pub enabled: bool,
    pub uptime_s: u64,
    pub requests: u64,
    pub errors: u64,
    pub description: String,
    pub connection_timeout: u64,
    pub read_timeout: u64,
    pub max_retries: u32,
}

/// Registry of proxy instances plus the admin operations over them
pub struct ProxyManager {
    registry: RwLock<HashMap<String, Arc<ProxyInstance>>>,
    store: Arc<dyn ConfigStore>,
    tracker: Arc<DeviceTracker>,
    broadcaster: EventBroadcaster,
}

impl ProxyManager {
    /// Create a manager over a configuration store
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            store,
            tracker: Arc::new(DeviceTracker::new()),
            broadcaster: EventBroadcaster::new(),
        }
    }

    /// Load configured proxies and start those enabled and not paused
    ///
    /// A proxy that fails validation or start is logged and skipped; one
    /// broken entry must not keep the rest down.
    pub async fn initialize(&self) {
        let config = self.store.get().await;
        info!("initializing {} configured proxies", config.proxies.len());

        for proxy_cfg in config.proxies {
            let id = proxy_cfg.id.clone();
            let autostart = proxy_cfg.enabled && !proxy_cfg.paused;
            if let Err(e) = self.add_proxy(proxy_cfg, false).await {
                warn!("skipping configured proxy {}: {}", id, e);
                continue;
            }
            if autostart {
                if let Err(e) = self.start_proxy(&id).await {
                    error!("autostart of proxy {} failed: {}", id, e);
                }
            }
        }
    }

    /// Add a proxy, replacing (and stopping) any existing one with the id
    pub async fn add_proxy(&self, cfg: ProxyConfig, persist: bool) -> ProxyResult<()> {
        cfg.validate()?;

        let mut registry = self.registry.write().await;
        if let Some(old) = registry.remove(&cfg.id) {
            old.stop().await;
        }

        let instance = Arc::new(ProxyInstance::new(cfg.clone(), Some(self.tracker.clone())));
        registry.insert(cfg.id.clone(), Arc::clone(&instance));

        self.broadcaster.broadcast(ProxyEvent::ProxyAdded {
            timestamp: Utc::now(),
            proxy_id: cfg.id.clone(),
            proxy: build_snapshot(&instance, Some(&cfg)),
        });

        if persist {
            let upsert = cfg.clone();
            self.store
                .update(Box::new(move |c: &mut Config| {
                    match c.proxies.iter().position(|p| p.id == upsert.id) {
                        Some(i) => c.proxies[i] = upsert,
                        None => c.proxies.push(upsert),
                    }
                    Ok(())
                }))
                .await?;
        }
        Ok(())
    }

    /// Replace an existing proxy's configuration, restarting it if enabled
    pub async fn update_proxy(&self, cfg: ProxyConfig) -> ProxyResult<()> {
        cfg.validate()?;

        let mut registry = self.registry.write().await;
        let old = registry
            .remove(&cfg.id)
            .ok_or_else(|| ProxyError::configuration(format!("proxy {} not found", cfg.id)))?;
        old.stop().await;

        let instance = Arc::new(ProxyInstance::new(cfg.clone(), Some(self.tracker.clone())));
        registry.insert(cfg.id.clone(), Arc::clone(&instance));

        if cfg.enabled && !cfg.paused {
            if let Err(e) = instance.start().await {
                error!("restart of updated proxy {} failed: {}", cfg.id, e);
            }
        }

        self.broadcaster.broadcast(ProxyEvent::ProxyUpdated {
            timestamp: Utc::now(),
            proxy_id: cfg.id.clone(),
            proxy: build_snapshot(&instance, Some(&cfg)),
        });

        let replace = cfg.clone();
        self.store
            .update(Box::new(move |c: &mut Config| {
                if let Some(i) = c.proxies.iter().position(|p| p.id == replace.id) {
                    c.proxies[i] = replace;
                }
                Ok(())
            }))
            .await
    }

    /// Stop and delete a proxy, removing it from persisted configuration
    pub async fn remove_proxy(&self, id: &str) -> ProxyResult<()> {
        let mut registry = self.registry.write().await;
        if let Some(instance) = registry.remove(id) {
            instance.stop().await;
        }

        self.broadcaster.broadcast(ProxyEvent::ProxyRemoved {
            timestamp: Utc::now(),
            proxy_id: id.to_string(),
        });

        let id = id.to_string();
        self.store
            .update(Box::new(move |c: &mut Config| {
                c.proxies.retain(|p| p.id != id);
                Ok(())
            }))
            .await
    }

    /// Start a proxy and persist `enabled = true`
    pub async fn start_proxy(&self, id: &str) -> ProxyResult<()> {
        let registry = self.registry.write().await;
        let instance = registry
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::configuration(format!("proxy {} not found", id)))?;

        instance.start().await?;

        let target = id.to_string();
        self.store
            .update(Box::new(move |c: &mut Config| {
                if let Some(p) = c.proxies.iter_mut().find(|p| p.id == target) {
                    p.enabled = true;
                }
                Ok(())
            }))
            .await?;

        self.broadcaster.broadcast(ProxyEvent::ProxyStarted {
            timestamp: Utc::now(),
            proxy_id: id.to_string(),
            proxy: self.snapshot_with_store(&instance).await,
        });
        Ok(())
    }

    /// Stop a proxy and persist `enabled = false`
    pub async fn stop_proxy(&self, id: &str) -> ProxyResult<()> {
        let registry = self.registry.write().await;
        let instance = registry
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::configuration(format!("proxy {} not found", id)))?;

        instance.stop().await;

        let target = id.to_string();
        self.store
            .update(Box::new(move |c: &mut Config| {
                if let Some(p) = c.proxies.iter_mut().find(|p| p.id == target) {
                    p.enabled = false;
                }
                Ok(())
            }))
            .await?;

        self.broadcaster.broadcast(ProxyEvent::ProxyStopped {
            timestamp: Utc::now(),
            proxy_id: id.to_string(),
            proxy: self.snapshot_with_store(&instance).await,
        });
        Ok(())
    }

    /// Suspend a proxy while keeping it enabled
    pub async fn pause_proxy(&self, id: &str) -> ProxyResult<()> {
        let registry = self.registry.write().await;
        let instance = registry
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::configuration(format!("proxy {} not found", id)))?;

        instance.stop().await;

        let target = id.to_string();
        self.store
            .update(Box::new(move |c: &mut Config| {
                if let Some(p) = c.proxies.iter_mut().find(|p| p.id == target) {
                    p.paused = true;
                }
                Ok(())
            }))
            .await
    }

    /// Resume a paused proxy
    pub async fn resume_proxy(&self, id: &str) -> ProxyResult<()> {
        let registry = self.registry.write().await;
        let instance = registry
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::configuration(format!("proxy {} not found", id)))?;

        instance.start().await?;

        let target = id.to_string();
        self.store
            .update(Box::new(move |c: &mut Config| {
                if let Some(p) = c.proxies.iter_mut().find(|p| p.id == target) {
                    p.paused = false;
                    p.enabled = true;
                }
                Ok(())
            }))
            .await
    }

    /// Stop every running instance
    pub async fn stop_all(&self) {
        let registry = self.registry.write().await;
        for instance in registry.values() {
            if instance.status() == ProxyStatus::Running {
                instance.stop().await;
            }
        }
        info!("all proxies stopped");
    }

    /// Status snapshots of all proxies, ordered by id
    pub async fn snapshots(&self) -> Vec<ProxySnapshot> {
        let registry = self.registry.read().await;
        let config = self.store.get().await;

        let mut snapshots: Vec<ProxySnapshot> = registry
            .values()
            .map(|instance| {
                let stored = config.proxies.iter().find(|p| p.id == instance.id());
                build_snapshot(instance, stored)
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Status snapshot of one proxy
    pub async fn snapshot(&self, id: &str) -> Option<ProxySnapshot> {
        let registry = self.registry.read().await;
        let instance = registry.get(id)?.clone();
        drop(registry);
        Some(self.snapshot_with_store(&instance).await)
    }

    /// All devices seen across all proxies
    pub fn devices(&self) -> Vec<Device> {
        self.tracker.devices()
    }

    /// Assign a user-friendly name to a device
    pub fn set_device_name(&self, ip: &str, name: &str) -> ProxyResult<()> {
        self.tracker.set_device_name(ip, name)
    }

    /// Connection history, optionally filtered by device and proxy
    pub fn connection_history(
        &self,
        device_ip: Option<&str>,
        proxy_id: Option<&str>,
        limit: usize,
    ) -> Vec<ConnectionRecord> {
        self.tracker.connection_history(device_ip, proxy_id, limit)
    }

    /// Subscribe to the lifecycle event stream
    pub fn subscribe_events(&self) -> EventSubscription {
        self.broadcaster.subscribe()
    }

    /// Drop an event subscription
    pub fn unsubscribe_events(&self, id: u64) {
        self.broadcaster.unsubscribe(id)
    }

    /// Shared device tracker, for wiring into external collaborators
    pub fn tracker(&self) -> Arc<DeviceTracker> {
        Arc::clone(&self.tracker)
    }

    async fn snapshot_with_store(&self, instance: &Arc<ProxyInstance>) -> ProxySnapshot {
        let config = self.store.get().await;
        let stored = config.proxies.iter().find(|p| p.id == instance.id());
        build_snapshot(instance, stored)
    }
}

/// Merge runtime state with stored intent into one snapshot
///
/// `paused`, `enabled` and the description come from the store when it has
/// the proxy; a freshly added instance falls back to its own copy.
fn build_snapshot(instance: &Arc<ProxyInstance>, stored: Option<&ProxyConfig>) -> ProxySnapshot {
    let cfg = instance.config();
    let (paused, enabled, description) = match stored {
        Some(s) => (s.paused, s.enabled, s.description.clone()),
        None => (cfg.paused, cfg.enabled, cfg.description.clone()),
    };

    ProxySnapshot {
        id: cfg.id.clone(),
        name: cfg.name.clone(),
        listen_addr: cfg.listen_addr.clone(),
        target_addr: cfg.target_addr.clone(),
        status: instance.status(),
        paused,
        enabled,
        uptime_s: instance.uptime().as_secs(),
        requests: instance.request_count(),
        errors: instance.error_count(),
        description,
        connection_timeout: cfg.connection_timeout,
        read_timeout: cfg.read_timeout,
        max_retries: cfg.max_retries,
    }
}
