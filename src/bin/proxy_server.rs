/// Voltage Modbus Proxy Server
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Loads the proxy fleet from a JSON configuration file, starts every
/// enabled proxy, and runs until interrupted.

use std::sync::Arc;

use log::info;

use voltage_modbus_proxy::{JsonConfigStore, ProxyManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "proxies.json".to_string());

    println!("🚀 {}", voltage_modbus_proxy::info());
    info!("loading configuration from {}", config_path);

    let store = Arc::new(JsonConfigStore::load(&config_path).await?);
    let manager = ProxyManager::new(store);
    manager.initialize().await;

    for snapshot in manager.snapshots().await {
        info!(
            "proxy {} [{}] {} -> {} ({} retries, timeouts {}s/{}s)",
            snapshot.id,
            snapshot.status,
            snapshot.listen_addr,
            snapshot.target_addr,
            snapshot.max_retries,
            snapshot.connection_timeout,
            snapshot.read_timeout,
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    manager.stop_all().await;

    Ok(())
}
