//! Wires devices, the supervisor, and the load manager together from
//! configuration, and drives the single top-level poll loop described in
//! the concurrency model: one logical task, no internally-spawned timers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bus::Bus;
use crate::config::{Config, DeviceConfig};
use crate::device::boolean::BooleanDevice;
use crate::device::climate::ClimateDevice;
use crate::device::direct_consumption::DirectConsumptionDevice;
use crate::device::DeviceHandle;
use crate::load_manager::LoadManager;
use crate::supervisor::{Supervisor, SupervisoryState};

/// How often `Service::poll` should be called when nothing else (a bus
/// event, a device deadline) would otherwise wake it — bounds how late the
/// supervisor's activation delay and device fan-only/watchdog timers can
/// fire relative to their deadline.
pub const IDLE_POLL_INTERVAL_MS: u64 = 1_000;

fn build_devices(configs: Vec<DeviceConfig>) -> Vec<DeviceHandle> {
    configs
        .into_iter()
        .map(|cfg| match cfg {
            DeviceConfig::Boolean(cfg) => DeviceHandle::Boolean(BooleanDevice::new(cfg)),
            DeviceConfig::Dehumidifier(cfg) => DeviceHandle::Boolean(BooleanDevice::new(cfg)),
            DeviceConfig::Climate(cfg) => DeviceHandle::Climate(ClimateDevice::new(cfg)),
            DeviceConfig::DirectConsumption(cfg) => DeviceHandle::DirectConsumption(DirectConsumptionDevice::new(cfg)),
        })
        .collect()
}

pub struct Service {
    bus: Arc<dyn Bus>,
    supervisor: Supervisor,
    load_manager: LoadManager,
}

/// Read-only view of a single managed device, for observability.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub name: String,
    pub priority: i32,
    pub management_enabled: bool,
    pub current_consumption: Option<f64>,
}

/// A point-in-time read model of the whole engine — no HTTP surface
/// attached, just a snapshot a caller (or a future API layer) can poll.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub supervisory_state: SupervisoryState,
    pub load_management_active: bool,
    pub devices: Vec<DeviceSnapshot>,
}

impl Service {
    pub async fn new(cfg: &Config, bus: Arc<dyn Bus>) -> Self {
        let devices = build_devices(cfg.devices.clone());
        let load_manager = LoadManager::new(cfg.load_manager_config(), devices);

        let pv_mean = bus.read_number(&cfg.pv.mean_1min).await;
        let enabled = bus.read_binary(&cfg.enable_entity).await.unwrap_or(true);
        let supervisor = Supervisor::new(cfg.supervisor_config(), pv_mean, enabled);

        let mut service = Self { bus, supervisor, load_manager };
        if matches!(service.supervisor.state(), SupervisoryState::Running) {
            service.load_manager.start(Instant::now());
            tracing::info!("starting with load management already running");
        }
        service
    }

    pub fn load_manager(&self) -> &LoadManager {
        &self.load_manager
    }

    pub fn supervisor_state(&self) -> SupervisoryState {
        self.supervisor.state()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            supervisory_state: self.supervisor.state(),
            load_management_active: self.load_manager.is_active(),
            devices: self
                .load_manager
                .devices()
                .iter()
                .map(|d| DeviceSnapshot {
                    name: d.name().to_owned(),
                    priority: d.priority(),
                    management_enabled: d.management_enabled(),
                    current_consumption: d.current_consumption(),
                })
                .collect(),
        }
    }

    /// One pass of the event loop: re-derive the supervisory state, start
    /// or stop the load manager on any transition, then run the load
    /// manager's tick if it's due.
    pub async fn poll(&mut self, now: Instant) {
        let transitioned = self.supervisor.refresh_and_poll(self.bus.as_ref(), now).await;
        if transitioned {
            match self.supervisor.state() {
                SupervisoryState::Running => {
                    tracing::info!("daytime load management activated");
                    self.load_manager.start(now);
                }
                SupervisoryState::Stopped => {
                    tracing::info!("daytime load management deactivated");
                    self.load_manager.stop(self.bus.as_ref()).await;
                }
            }
        }
        self.load_manager.run_due(self.bus.as_ref(), now).await;
    }

    /// How long `poll` may sleep before it should be called again, derived
    /// from the load manager's next tick and a fixed idle ceiling (device
    /// sub-timers — transitions, fan-only timeout, watchdog — piggyback on
    /// this cadence rather than scheduling their own wakeups).
    pub fn next_wakeup(&self, now: Instant) -> Instant {
        let idle = now + Duration::from_millis(IDLE_POLL_INTERVAL_MS);
        match self.load_manager.next_deadline() {
            Some(deadline) => deadline.min(idle),
            None => idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EntityId, SimulatedBus};
    use crate::config::SensorPair;
    use crate::device::boolean::BooleanConfig;

    fn cfg() -> Config {
        Config {
            devices: vec![DeviceConfig::Boolean(BooleanConfig {
                name: "Pool Pump".into(),
                priority: 2,
                switch_entity: EntityId::new("switch.pool_pump"),
                management_entity: EntityId::new("switch.pool_pump_management_enabled"),
                consumption_entity: Some(EntityId::new("sensor.pool_pump_power")),
                expected_consumption_w: 300.0,
                change_transition_ms: 10,
                turn_on_debounce_ms: 10,
                turn_off_debounce_ms: 10,
            })],
            pv: SensorPair { raw: EntityId::new("sensor.pv_power"), mean_1min: EntityId::new("sensor.pv_power_mean_1min") },
            grid: SensorPair {
                raw: EntityId::new("sensor.grid_power"),
                mean_1min: EntityId::new("sensor.grid_power_mean_1min"),
            },
            enable_entity: EntityId::new("switch.daytime_load_management_enabled"),
            status_entity: EntityId::new("binary_sensor.daytime_load_management_active"),
            pv_production_activation_threshold: 500.0,
            pv_production_activation_delay_ms: 0,
            desired_grid_consumption: 500.0,
            max_consumption_before_shedding_load: 800.0,
            min_consumption_before_adding_load: 200.0,
            loop_interval_ms: 15_000,
        }
    }

    #[tokio::test]
    async fn starts_with_load_management_running_when_pv_is_already_high() {
        let sim = SimulatedBus::new();
        sim.set_number_reading("sensor.pv_power_mean_1min", 900.0).await;
        sim.set_binary_reading("switch.daytime_load_management_enabled", true).await;
        let bus: Arc<dyn Bus> = Arc::new(sim);

        let service = Service::new(&cfg(), bus).await;
        assert_eq!(service.supervisor_state(), SupervisoryState::Running);
        assert!(service.load_manager().is_active());
    }

    #[tokio::test]
    async fn transitions_to_running_and_ticks_once_thresholds_allow() {
        let sim = SimulatedBus::new();
        sim.set_number_reading("sensor.pv_power_mean_1min", 0.0).await;
        sim.set_binary_reading("switch.daytime_load_management_enabled", true).await;
        sim.set_binary_reading("switch.pool_pump", false).await;
        sim.set_number_reading("sensor.grid_power_mean_1min", 100.0).await;
        sim.set_number_reading("sensor.grid_power", 100.0).await;
        let sim_handle = sim.clone();
        let bus: Arc<dyn Bus> = Arc::new(sim);

        let mut service = Service::new(&cfg(), bus.clone()).await;
        assert_eq!(service.supervisor_state(), SupervisoryState::Stopped);

        sim_handle.set_number_reading("sensor.pv_power_mean_1min", 900.0).await;
        let t0 = Instant::now();
        service.poll(t0).await;
        assert_eq!(service.supervisor_state(), SupervisoryState::Running);
        assert_eq!(bus.read_binary(&EntityId::new("switch.pool_pump")).await, Some(true));
    }

    #[tokio::test]
    async fn snapshot_reflects_the_configured_devices() {
        let sim = SimulatedBus::new();
        sim.set_number_reading("sensor.pv_power_mean_1min", 0.0).await;
        sim.set_binary_reading("switch.daytime_load_management_enabled", true).await;
        let bus: Arc<dyn Bus> = Arc::new(sim);

        let service = Service::new(&cfg(), bus).await;
        let snapshot = service.snapshot();
        assert_eq!(snapshot.supervisory_state, SupervisoryState::Stopped);
        assert!(!snapshot.load_management_active);
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.devices[0].name, "Pool Pump");
        assert_eq!(snapshot.devices[0].priority, 2);
    }
}
