use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::info;

use pv_load_controller::bus::{Bus, SimulatedBus};
use pv_load_controller::config::Config;
use pv_load_controller::service::Service;
use pv_load_controller::telemetry::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    info!(devices = cfg.devices.len(), "loaded configuration");

    // The production bus — entity registration, the MQTT/websocket
    // transport, persisted switch state — is an external collaborator this
    // core is driven against, not part of it. `SimulatedBus` stands in
    // here so the binary runs end to end; swap in a real adapter to drive
    // an actual home-automation bus.
    let bus: Arc<dyn Bus> = Arc::new(SimulatedBus::new());

    let mut service = Service::new(&cfg, bus).await;
    info!("load controller service started");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let now = Instant::now();
        service.poll(now).await;

        let wake_at = service.next_wakeup(now);
        let sleep_for = wake_at.saturating_duration_since(Instant::now());

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping");
                break;
            }
        }
    }

    Ok(())
}
