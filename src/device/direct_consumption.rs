//! Current-controlled appliance with voltage-scaled increments and a
//! low-current shutdown watchdog — the canonical example is an EV charger.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::bus::{Bus, EntityId};
use crate::device::base_controls::BaseControls;
use crate::device::increment::{push_unique, Action, DirectConsumptionAction, Increment};
use crate::device::transition::{PendingKind, Transition, TransitionState};

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum DirectConsumptionError {
    #[error("increment delta sign does not match the requested direction")]
    WrongSign,
    #[error("device is mid-transition and cannot accept a new command")]
    NotIdle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectConsumptionConfig {
    pub name: String,
    pub priority: i32,
    pub enable_entity: EntityId,
    pub current_entity: EntityId,
    pub power_entity: EntityId,
    pub voltage_entity: EntityId,
    pub precondition_entity: EntityId,
    pub management_entity: EntityId,
    pub starting_min_current_a: f64,
    pub max_current_a: f64,
    pub current_step_a: f64,
    pub change_transition_ms: u64,
    pub debounce_ms: u64,
    pub stopping_threshold_a: f64,
    pub stopping_timeout_ms: u64,
}

/// A continuous current-controlled device, e.g. an EV charger.
#[derive(Debug)]
pub struct DirectConsumptionDevice {
    cfg: DirectConsumptionConfig,
    base_controls: BaseControls,
    transition: Transition,
    enabled: Option<bool>,
    current_a: Option<f64>,
    measured_power_w: Option<f64>,
    voltage_v: Option<f64>,
    precondition: Option<bool>,
    low_current_since: Option<Instant>,
    increase_increments: Vec<Increment>,
    decrease_increments: Vec<Increment>,
}

impl DirectConsumptionDevice {
    pub fn new(cfg: DirectConsumptionConfig) -> Self {
        let base_controls = BaseControls::new(cfg.management_entity.clone());
        Self {
            cfg,
            base_controls,
            transition: Transition::new(),
            enabled: None,
            current_a: None,
            measured_power_w: None,
            voltage_v: None,
            precondition: None,
            low_current_since: None,
            increase_increments: Vec::new(),
            decrease_increments: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn priority(&self) -> i32 {
        self.cfg.priority
    }

    pub fn base_controls(&self) -> &BaseControls {
        &self.base_controls
    }

    pub fn base_controls_mut(&mut self) -> &mut BaseControls {
        &mut self.base_controls
    }

    pub fn change_state(&self) -> TransitionState {
        self.transition.state()
    }

    pub fn current_consumption(&self) -> Option<f64> {
        self.measured_power_w
    }

    pub fn increase_increments(&self) -> &[Increment] {
        &self.increase_increments
    }

    pub fn decrease_increments(&self) -> &[Increment] {
        &self.decrease_increments
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.transition.next_deadline()
    }

    /// Advance the pending/debounce transition timer. Must run once per
    /// tick or the device stays `Pending` forever after any command.
    pub fn poll_timers(&mut self, now: Instant) -> bool {
        self.transition.poll(now)
    }

    fn voltage_or_default(&self) -> f64 {
        self.voltage_v.unwrap_or(230.0)
    }

    /// Read the bus, recompute increments, and advance the low-current
    /// watchdog. The watchdog runs independently of the load manager, on
    /// the device's own poll cadence rather than the coarser allocation tick.
    pub async fn refresh(&mut self, bus: &dyn Bus, now: Instant) {
        self.base_controls.sync_from_bus(bus).await;
        self.enabled = bus.read_binary(&self.cfg.enable_entity).await;
        self.current_a = bus.read_number(&self.cfg.current_entity).await;
        self.measured_power_w = bus.read_number(&self.cfg.power_entity).await;
        self.voltage_v = bus.read_number(&self.cfg.voltage_entity).await;
        self.precondition = bus.read_binary(&self.cfg.precondition_entity).await;

        self.run_watchdog(bus, now).await;
        self.recompute_increments();
    }

    async fn run_watchdog(&mut self, bus: &dyn Bus, now: Instant) {
        if self.enabled != Some(true) {
            self.low_current_since = None;
            return;
        }
        let voltage = self.voltage_or_default();
        let measured_current = self.measured_power_w.map(|p| p / voltage);
        match measured_current {
            Some(amps) if amps <= self.cfg.stopping_threshold_a => {
                let since = *self.low_current_since.get_or_insert(now);
                if now.duration_since(since) >= Duration::from_millis(self.cfg.stopping_timeout_ms) {
                    tracing::info!(device = %self.cfg.name, amps, "low-current watchdog disabling device");
                    if let Err(err) = bus.set_switch(&self.cfg.enable_entity, false).await {
                        tracing::warn!(device = %self.cfg.name, %err, "watchdog disable command refused");
                    }
                    self.enabled = Some(false);
                    self.transition.reset();
                    self.low_current_since = None;
                }
            }
            _ => self.low_current_since = None,
        }
    }

    fn recompute_increments(&mut self) {
        self.increase_increments.clear();
        self.decrease_increments.clear();

        let voltage = self.voltage_or_default();

        match self.enabled {
            None => {}
            Some(false) => {
                if self.precondition == Some(true) {
                    push_unique(
                        &mut self.increase_increments,
                        Increment::new(
                            self.cfg.starting_min_current_a * voltage,
                            Action::DirectConsumption(DirectConsumptionAction::EnableAndSetCurrent(
                                self.cfg.starting_min_current_a,
                            )),
                        ),
                    );
                }
            }
            Some(true) => {
                let Some(current) = self.current_a else { return };
                let step = self.cfg.current_step_a;
                if step <= 0.0 {
                    return;
                }

                let steps_up = ((self.cfg.max_current_a - current) / step).floor().max(0.0) as i64;
                for k in 1..=steps_up {
                    let target = current + k as f64 * step;
                    let delta = k as f64 * step * voltage;
                    push_unique(
                        &mut self.increase_increments,
                        Increment::new(delta, Action::DirectConsumption(DirectConsumptionAction::SetCurrent(target))),
                    );
                }

                let steps_down = ((current - self.cfg.starting_min_current_a) / step).floor().max(0.0) as i64;
                for k in 1..=steps_down {
                    let target = current - k as f64 * step;
                    let delta = -(k as f64 * step * voltage);
                    push_unique(
                        &mut self.decrease_increments,
                        Increment::new(delta, Action::DirectConsumption(DirectConsumptionAction::SetCurrent(target))),
                    );
                }

                if steps_down == 0 {
                    let stop_delta = -self.measured_power_w.unwrap_or(current * voltage);
                    push_unique(
                        &mut self.decrease_increments,
                        Increment::new(stop_delta, Action::DirectConsumption(DirectConsumptionAction::Disable)),
                    );
                }
            }
        }
    }

    pub async fn increase_consumption_by(
        &mut self,
        increment: &Increment,
        bus: &dyn Bus,
        now: Instant,
    ) -> Result<(), DirectConsumptionError> {
        if increment.delta <= 0.0 {
            return Err(DirectConsumptionError::WrongSign);
        }
        let target_current = match increment.action {
            Action::DirectConsumption(DirectConsumptionAction::EnableAndSetCurrent(a)) => {
                if let Err(err) = bus.set_switch(&self.cfg.enable_entity, true).await {
                    tracing::warn!(device = %self.cfg.name, %err, "enable command refused");
                }
                if let Err(err) = bus
                    .set_number(&self.cfg.current_entity, a, self.cfg.starting_min_current_a, self.cfg.max_current_a)
                    .await
                {
                    tracing::warn!(device = %self.cfg.name, %err, "set_current command refused");
                }
                a
            }
            Action::DirectConsumption(DirectConsumptionAction::SetCurrent(a)) if self.enabled == Some(true) => {
                if let Err(err) = bus
                    .set_number(&self.cfg.current_entity, a, self.cfg.starting_min_current_a, self.cfg.max_current_a)
                    .await
                {
                    tracing::warn!(device = %self.cfg.name, %err, "set_current command refused");
                }
                a
            }
            _ => return Err(DirectConsumptionError::WrongSign),
        };

        let expected_future = self.measured_power_w.unwrap_or(0.0) + increment.delta;
        if self
            .transition
            .begin_pending(
                PendingKind::Increase,
                expected_future,
                now,
                self.cfg.change_transition_ms,
                self.cfg.debounce_ms,
            )
            .is_err()
        {
            tracing::warn!(device = %self.cfg.name, "transition re-entry attempted while not idle");
            return Err(DirectConsumptionError::NotIdle);
        }
        self.current_a = Some(target_current);
        self.enabled = Some(true);
        Ok(())
    }

    pub async fn decrease_consumption_by(
        &mut self,
        increment: &Increment,
        bus: &dyn Bus,
        now: Instant,
    ) -> Result<(), DirectConsumptionError> {
        if increment.delta >= 0.0 {
            return Err(DirectConsumptionError::WrongSign);
        }
        match increment.action {
            Action::DirectConsumption(DirectConsumptionAction::SetCurrent(a)) => {
                if let Err(err) = bus
                    .set_number(&self.cfg.current_entity, a, self.cfg.starting_min_current_a, self.cfg.max_current_a)
                    .await
                {
                    tracing::warn!(device = %self.cfg.name, %err, "set_current command refused");
                }
                self.current_a = Some(a);
            }
            Action::DirectConsumption(DirectConsumptionAction::Disable) => {
                if let Err(err) = bus.set_switch(&self.cfg.enable_entity, false).await {
                    tracing::warn!(device = %self.cfg.name, %err, "disable command refused");
                }
                self.enabled = Some(false);
            }
            _ => return Err(DirectConsumptionError::WrongSign),
        }

        let expected_future = self.measured_power_w.unwrap_or(0.0) + increment.delta;
        if self
            .transition
            .begin_pending(
                PendingKind::Decrease,
                expected_future,
                now,
                self.cfg.change_transition_ms,
                self.cfg.debounce_ms,
            )
            .is_err()
        {
            tracing::warn!(device = %self.cfg.name, "transition re-entry attempted while not idle");
            return Err(DirectConsumptionError::NotIdle);
        }
        Ok(())
    }

    pub async fn stop(&mut self, bus: &dyn Bus) {
        if let Err(err) = bus.set_switch(&self.cfg.enable_entity, false).await {
            tracing::warn!(device = %self.cfg.name, %err, "stop command refused");
        }
        self.enabled = Some(false);
        self.transition.reset();
        self.low_current_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimulatedBus;

    fn cfg() -> DirectConsumptionConfig {
        DirectConsumptionConfig {
            name: "EV Charger".into(),
            priority: 5,
            enable_entity: EntityId::new("switch.ev_enable"),
            current_entity: EntityId::new("number.ev_current"),
            power_entity: EntityId::new("sensor.ev_power"),
            voltage_entity: EntityId::new("sensor.grid_voltage"),
            precondition_entity: EntityId::new("binary_sensor.ev_can_charge"),
            management_entity: EntityId::new("switch.ev_management_enabled"),
            starting_min_current_a: 6.0,
            max_current_a: 16.0,
            current_step_a: 1.0,
            change_transition_ms: 100,
            debounce_ms: 100,
            stopping_threshold_a: 1.0,
            stopping_timeout_ms: 300_000,
        }
    }

    async fn bus_with_voltage(v: f64) -> SimulatedBus {
        let bus = SimulatedBus::new();
        bus.set_number_reading("sensor.grid_voltage", v).await;
        bus
    }

    #[tokio::test]
    async fn disabled_with_precondition_offers_enable_increment() {
        let bus = bus_with_voltage(230.0).await;
        bus.set_binary_reading("switch.ev_enable", false).await;
        bus.set_binary_reading("binary_sensor.ev_can_charge", true).await;
        let mut dev = DirectConsumptionDevice::new(cfg());
        dev.refresh(&bus, Instant::now()).await;
        assert_eq!(dev.increase_increments().len(), 1);
        assert_eq!(dev.increase_increments()[0].delta, 6.0 * 230.0);
        assert!(dev.decrease_increments().is_empty());
    }

    #[tokio::test]
    async fn disabled_without_precondition_offers_nothing() {
        let bus = bus_with_voltage(230.0).await;
        bus.set_binary_reading("switch.ev_enable", false).await;
        bus.set_binary_reading("binary_sensor.ev_can_charge", false).await;
        let mut dev = DirectConsumptionDevice::new(cfg());
        dev.refresh(&bus, Instant::now()).await;
        assert!(dev.increase_increments().is_empty());
    }

    #[tokio::test]
    async fn enabled_mid_range_offers_steps_both_ways() {
        let bus = bus_with_voltage(230.0).await;
        bus.set_binary_reading("switch.ev_enable", true).await;
        bus.set_number_reading("number.ev_current", 10.0).await;
        bus.set_number_reading("sensor.ev_power", 2300.0).await;
        let mut dev = DirectConsumptionDevice::new(cfg());
        dev.refresh(&bus, Instant::now()).await;
        // max 16, step 1 -> 6 increase steps; min 6 -> 4 decrease steps, no stop increment
        assert_eq!(dev.increase_increments().len(), 6);
        assert_eq!(dev.decrease_increments().len(), 4);
        assert!(dev
            .decrease_increments()
            .iter()
            .all(|i| !matches!(i.action, Action::DirectConsumption(DirectConsumptionAction::Disable))));
    }

    #[tokio::test]
    async fn enabled_at_floor_offers_stop_instead_of_step_down() {
        let bus = bus_with_voltage(230.0).await;
        bus.set_binary_reading("switch.ev_enable", true).await;
        bus.set_number_reading("number.ev_current", 6.0).await;
        bus.set_number_reading("sensor.ev_power", 1380.0).await;
        let mut dev = DirectConsumptionDevice::new(cfg());
        dev.refresh(&bus, Instant::now()).await;
        assert_eq!(dev.decrease_increments().len(), 1);
        assert!(matches!(
            dev.decrease_increments()[0].action,
            Action::DirectConsumption(DirectConsumptionAction::Disable)
        ));
        assert_eq!(dev.decrease_increments()[0].delta, -1380.0);
    }

    #[tokio::test]
    async fn watchdog_disables_after_sustained_low_current() {
        let bus = bus_with_voltage(230.0).await;
        bus.set_binary_reading("switch.ev_enable", true).await;
        bus.set_number_reading("number.ev_current", 6.0).await;
        bus.set_number_reading("sensor.ev_power", 0.0).await; // 0A, below threshold

        let mut dev = DirectConsumptionDevice::new(DirectConsumptionConfig {
            stopping_timeout_ms: 1000,
            ..cfg()
        });
        let t0 = Instant::now();
        dev.refresh(&bus, t0).await;
        assert_eq!(bus.read_binary(&EntityId::new("switch.ev_enable")).await, Some(true));

        dev.refresh(&bus, t0 + Duration::from_millis(1500)).await;
        assert_eq!(bus.read_binary(&EntityId::new("switch.ev_enable")).await, Some(false));
    }

    #[tokio::test]
    async fn poll_timers_advances_back_to_idle_after_an_increase() {
        let bus = bus_with_voltage(230.0).await;
        bus.set_binary_reading("switch.ev_enable", false).await;
        bus.set_binary_reading("binary_sensor.ev_can_charge", true).await;
        let mut dev = DirectConsumptionDevice::new(cfg());
        let t0 = Instant::now();
        dev.refresh(&bus, t0).await;

        let inc = dev.increase_increments()[0];
        dev.increase_consumption_by(&inc, &bus, t0).await.unwrap();
        assert!(dev.change_state().is_in_flight());

        let after = t0 + Duration::from_millis(cfg().change_transition_ms + cfg().debounce_ms + 1);
        assert!(dev.poll_timers(after));
        assert!(dev.change_state().is_idle());
    }

    #[tokio::test]
    async fn watchdog_resets_when_current_recovers() {
        let bus = bus_with_voltage(230.0).await;
        bus.set_binary_reading("switch.ev_enable", true).await;
        bus.set_number_reading("number.ev_current", 6.0).await;
        bus.set_number_reading("sensor.ev_power", 0.0).await;

        let mut dev = DirectConsumptionDevice::new(DirectConsumptionConfig {
            stopping_timeout_ms: 1000,
            ..cfg()
        });
        let t0 = Instant::now();
        dev.refresh(&bus, t0).await;
        bus.set_number_reading("sensor.ev_power", 1380.0).await; // recovers above threshold
        dev.refresh(&bus, t0 + Duration::from_millis(1500)).await;
        assert_eq!(bus.read_binary(&EntityId::new("switch.ev_enable")).await, Some(true));
    }
}
