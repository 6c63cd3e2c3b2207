//! Client device tracking
//!
//! Records which Modbus masters have connected through which proxy. The
//! tracker keeps an in-memory map keyed by client IP plus a bounded ring of
//! connection events; the external admin layer reads both through the
//! manager. Persistent history belongs to an external database and is not a
//! concern here.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ProxyError, ProxyResult};

/// Connection events retained before the oldest is dropped
const HISTORY_CAPACITY: usize = 1000;

/// A client device observed on some proxy listener
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub ip: String,
    pub mac: String,
    /// User-assigned name, empty until set
    pub name: String,
    pub first_seen: DateTime<Utc>,
    pub last_connect: DateTime<Utc>,
    pub request_count: u64,
    /// Proxy the device most recently connected through
    pub proxy_id: String,
}

/// One connection event
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub device_ip: String,
    pub proxy_id: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct TrackerState {
    devices: HashMap<String, Device>,
    history: VecDeque<ConnectionRecord>,
}

/// Shared tracker of client devices across all proxy instances
#[derive(Default)]
pub struct DeviceTracker {
    state: RwLock<TrackerState>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection from `peer` through proxy `proxy_id`
    ///
    /// Upserts the device (first-seen is set once, everything else on every
    /// connection) and appends a history event.
    pub fn track_connection(&self, peer: SocketAddr, proxy_id: &str) {
        let ip = peer.ip().to_string();
        let now = Utc::now();

        let mut state = self.write();
        let device = state.devices.entry(ip.clone()).or_insert_with(|| Device {
            ip: ip.clone(),
            mac: lookup_mac(&ip),
            name: String::new(),
            first_seen: now,
            last_connect: now,
            request_count: 0,
            proxy_id: proxy_id.to_string(),
        });
        device.last_connect = now;
        device.request_count += 1;
        device.proxy_id = proxy_id.to_string();

        if state.history.len() == HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(ConnectionRecord {
            device_ip: ip,
            proxy_id: proxy_id.to_string(),
            connected_at: now,
        });
    }

    /// All tracked devices, ordered by IP
    pub fn devices(&self) -> Vec<Device> {
        let state = self.read();
        let mut devices: Vec<Device> = state.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.ip.cmp(&b.ip));
        devices
    }

    /// Assign a user-friendly name to a known device
    pub fn set_device_name(&self, ip: &str, name: &str) -> ProxyResult<()> {
        let mut state = self.write();
        match state.devices.get_mut(ip) {
            Some(device) => {
                device.name = name.to_string();
                Ok(())
            }
            None => Err(ProxyError::configuration(format!("unknown device {}", ip))),
        }
    }

    /// Connection history, newest first, optionally filtered
    pub fn connection_history(
        &self,
        device_ip: Option<&str>,
        proxy_id: Option<&str>,
        limit: usize,
    ) -> Vec<ConnectionRecord> {
        let state = self.read();
        state
            .history
            .iter()
            .rev()
            .filter(|record| device_ip.map_or(true, |ip| record.device_ip == ip))
            .filter(|record| proxy_id.map_or(true, |id| record.proxy_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TrackerState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TrackerState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Resolve a MAC address from the system ARP table
///
/// Best effort: only the Linux procfs table is consulted, and devices the
/// kernel has not resolved come back empty.
fn lookup_mac(ip: &str) -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(table) = std::fs::read_to_string("/proc/net/arp") {
            for line in table.lines().skip(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.first() == Some(&ip) {
                    if let Some(&mac) = fields.get(3) {
                        if mac != "00:00:00:00:00:00" {
                            return mac.to_string();
                        }
                    }
                }
            }
        }
        String::new()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = ip;
        String::new()
    }
}
