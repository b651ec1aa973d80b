//! Room climate unit: setpoint + mode control with blended consumption
//! estimation and multi-increment advertisement.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::bus::{Bus, ClimateMode, EntityId};
use crate::device::base_controls::BaseControls;
use crate::device::increment::{push_unique, Action, ClimateAction, Increment};
use crate::device::transition::{PendingKind, Transition, TransitionState};

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum ClimateDeviceError {
    #[error("increment delta sign does not match the requested direction")]
    WrongSign,
    #[error("device is mid-transition and cannot accept a new command")]
    NotIdle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClimateConfig {
    pub name: String,
    pub priority: i32,
    pub setpoint_entity: EntityId,
    pub mode_entity: EntityId,
    pub room_temp_entity: EntityId,
    pub consumption_entity: EntityId,
    pub desired_setpoint_entity: EntityId,
    pub desired_mode_entity: EntityId,
    pub comfort_setpoint_entity: Option<EntityId>,
    pub management_entity: EntityId,

    pub min_setpoint: f64,
    pub max_setpoint: f64,
    pub setpoint_step: f64,
    pub compressor_startup_min_consumption: f64,
    pub power_on_setpoint_offset: f64,
    pub consumption_per_degree: f64,
    pub max_compressor_consumption: f64,
    pub fan_only_min_consumption: f64,
    pub heat_cool_min_consumption: f64,

    pub setpoint_change_transition_ms: u64,
    pub setpoint_debounce_ms: u64,
    pub mode_change_transition_ms: u64,
    pub mode_debounce_ms: u64,
    pub startup_transition_ms: u64,
    pub startup_debounce_ms: u64,
    pub fan_only_timeout_ms: u64,
}

#[derive(Debug)]
pub struct ClimateDevice {
    cfg: ClimateConfig,
    base_controls: BaseControls,
    transition: Transition,

    current_mode: Option<ClimateMode>,
    current_setpoint: Option<f64>,
    room_temp: Option<f64>,
    current_consumption: Option<f64>,
    desired_setpoint: Option<f64>,
    desired_mode: Option<ClimateMode>,
    comfort_setpoint: Option<f64>,

    fan_only_since: Option<Instant>,
    increase_increments: Vec<Increment>,
    decrease_increments: Vec<Increment>,
}

impl ClimateDevice {
    pub fn new(cfg: ClimateConfig) -> Self {
        let base_controls = BaseControls::new(cfg.management_entity.clone());
        Self {
            cfg,
            base_controls,
            transition: Transition::new(),
            current_mode: None,
            current_setpoint: None,
            room_temp: None,
            current_consumption: None,
            desired_setpoint: None,
            desired_mode: None,
            comfort_setpoint: None,
            fan_only_since: None,
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
        self.current_consumption
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

    fn is_running(&self) -> bool {
        matches!(self.current_mode, Some(ClimateMode::Heat) | Some(ClimateMode::Cool))
    }

    fn mode_min_consumption(&self, starting_up: bool, fan_only: bool) -> f64 {
        if starting_up {
            self.cfg.compressor_startup_min_consumption
        } else if fan_only {
            self.cfg.fan_only_min_consumption
        } else {
            self.cfg.heat_cool_min_consumption
        }
    }

    /// The blended linear/scaled consumption estimator.
    fn estimate_consumption(&self, target_setpoint: f64, starting_up: bool, fan_only: bool) -> Option<f64> {
        let room_temp = self.room_temp?;
        let current_setpoint = self.current_setpoint?;
        let target_diff = (room_temp - target_setpoint).abs();
        let current_diff = (room_temp - current_setpoint).abs();
        let mode_min = self.mode_min_consumption(starting_up, fan_only);

        let linear = (target_diff * self.cfg.consumption_per_degree).clamp(mode_min, self.cfg.max_compressor_consumption);

        let scaled = if self.is_running() && current_diff > 0.0 {
            self.current_consumption.unwrap_or(linear) * target_diff / current_diff
        } else {
            linear
        };

        let estimated = (0.7 * scaled + 0.3 * linear).clamp(mode_min, self.cfg.max_compressor_consumption);
        Some(estimated)
    }

    /// `clamp(roomTemp ± powerOnSetpointOffset, comfort, desired)` — the
    /// startup-from-off setpoint, used only when the unit is currently off.
    fn startup_setpoint(&self, mode: ClimateMode, desired: f64) -> Option<f64> {
        let room_temp = self.room_temp?;
        let raw = match mode {
            ClimateMode::Cool => room_temp - self.cfg.power_on_setpoint_offset,
            ClimateMode::Heat => room_temp + self.cfg.power_on_setpoint_offset,
            _ => return None,
        };
        let comfort = self.comfort_setpoint.unwrap_or(desired);
        let (lo, hi) = if comfort <= desired { (comfort, desired) } else { (desired, comfort) };
        Some(raw.clamp(lo, hi))
    }

    fn within_comfort_band(&self, mode: ClimateMode, target: f64) -> bool {
        match self.comfort_setpoint {
            None => true,
            Some(comfort) => match mode {
                ClimateMode::Cool => target <= comfort,
                ClimateMode::Heat => target >= comfort,
                _ => true,
            },
        }
    }

    fn within_absolute_bounds(&self, target: f64) -> bool {
        target >= self.cfg.min_setpoint && target <= self.cfg.max_setpoint
    }

    /// Rebuild the lazy increment lists from the latest sensor snapshot.
    fn recompute_increments(&mut self) {
        self.increase_increments.clear();
        self.decrease_increments.clear();

        let Some(desired_mode) = self.desired_mode else { return };
        let Some(desired_setpoint) = self.desired_setpoint else { return };

        match self.current_mode {
            None => {}
            Some(ClimateMode::FanOnly) => {}
            Some(ClimateMode::Off) => {
                if let Some(initial) = self.startup_setpoint(desired_mode, desired_setpoint) {
                    if let Some(room_temp) = self.room_temp {
                        let delta = ((room_temp - initial).abs() * self.cfg.consumption_per_degree)
                            .max(self.cfg.compressor_startup_min_consumption);
                        if delta > 0.0 {
                            push_unique(
                                &mut self.increase_increments,
                                Increment::new(
                                    delta,
                                    Action::Climate(ClimateAction::PowerOn {
                                        mode: desired_mode,
                                        setpoint: initial,
                                    }),
                                ),
                            );
                        }
                    }
                }
            }
            Some(mode @ (ClimateMode::Heat | ClimateMode::Cool)) => {
                let Some(current_setpoint) = self.current_setpoint else { return };
                let dir = (desired_setpoint - current_setpoint).signum();

                if dir != 0.0 {
                    let raw_increase = current_setpoint + dir * self.cfg.setpoint_step;
                    let increase_target = if dir > 0.0 {
                        raw_increase.min(desired_setpoint)
                    } else {
                        raw_increase.max(desired_setpoint)
                    };
                    if increase_target != current_setpoint && self.within_absolute_bounds(increase_target) {
                        if let Some(estimated) = self.estimate_consumption(increase_target, false, false) {
                            let delta = estimated - self.current_consumption.unwrap_or(0.0);
                            if delta > 0.0 {
                                push_unique(
                                    &mut self.increase_increments,
                                    Increment::new(delta, Action::Climate(ClimateAction::ChangeSetpoint { setpoint: increase_target })),
                                );
                            }
                        }
                    }

                    let decrease_target = current_setpoint - dir * self.cfg.setpoint_step;
                    if self.within_comfort_band(mode, decrease_target) && self.within_absolute_bounds(decrease_target) {
                        if let Some(estimated) = self.estimate_consumption(decrease_target, false, false) {
                            let delta = estimated - self.current_consumption.unwrap_or(0.0);
                            if delta < 0.0 {
                                push_unique(
                                    &mut self.decrease_increments,
                                    Increment::new(delta, Action::Climate(ClimateAction::ChangeSetpoint { setpoint: decrease_target })),
                                );
                            }
                        }
                    }
                }

                // Mode -> fan-only is the sole full decrease path, and only
                // when there's no comfort band to decrease the setpoint within.
                if self.comfort_setpoint.is_none() {
                    if let Some(current_consumption) = self.current_consumption {
                        if current_consumption > 0.0 {
                            push_unique(
                                &mut self.decrease_increments,
                                Increment::new(-current_consumption, Action::Climate(ClimateAction::SwitchToFanOnly)),
                            );
                        }
                    }
                }
            }
        }
    }

    pub async fn refresh(&mut self, bus: &dyn Bus) {
        self.base_controls.sync_from_bus(bus).await;
        self.current_mode = bus.read_mode(&self.cfg.mode_entity).await;
        self.current_setpoint = bus.read_number(&self.cfg.setpoint_entity).await;
        self.room_temp = bus.read_number(&self.cfg.room_temp_entity).await;
        self.current_consumption = bus.read_number(&self.cfg.consumption_entity).await;
        self.desired_setpoint = bus.read_number(&self.cfg.desired_setpoint_entity).await;
        self.desired_mode = bus.read_mode(&self.cfg.desired_mode_entity).await;
        self.comfort_setpoint = match &self.cfg.comfort_setpoint_entity {
            Some(entity) => bus.read_number(entity).await,
            None => None,
        };
        self.recompute_increments();
    }

    /// Advance the transition state machine and the fan-only auto-off
    /// timer. Call on every device poll tick.
    pub async fn poll_timers(&mut self, now: Instant, bus: &dyn Bus) -> bool {
        let transitioned = self.transition.poll(now);

        if self.current_mode == Some(ClimateMode::FanOnly) {
            let since = *self.fan_only_since.get_or_insert(now);
            if now.duration_since(since) >= Duration::from_millis(self.cfg.fan_only_timeout_ms) {
                tracing::info!(device = %self.cfg.name, "fan-only timeout elapsed, turning off");
                if let Err(err) = bus.set_climate_mode(&self.cfg.mode_entity, ClimateMode::Off).await {
                    tracing::warn!(device = %self.cfg.name, %err, "fan-only auto-off refused");
                }
                self.current_mode = Some(ClimateMode::Off);
                self.fan_only_since = None;
                return true;
            }
        } else {
            self.fan_only_since = None;
        }
        transitioned
    }

    pub async fn increase_consumption_by(
        &mut self,
        increment: &Increment,
        bus: &dyn Bus,
        now: Instant,
    ) -> Result<(), ClimateDeviceError> {
        if increment.delta <= 0.0 {
            return Err(ClimateDeviceError::WrongSign);
        }
        let (transition_ms, debounce_ms) = match increment.action {
            Action::Climate(ClimateAction::PowerOn { mode, setpoint }) => {
                if let Err(err) = bus.set_climate_mode(&self.cfg.mode_entity, mode).await {
                    tracing::warn!(device = %self.cfg.name, %err, "mode command refused");
                }
                if let Err(err) = bus.set_climate_setpoint(&self.cfg.setpoint_entity, setpoint).await {
                    tracing::warn!(device = %self.cfg.name, %err, "setpoint command refused");
                }
                self.current_mode = Some(mode);
                self.current_setpoint = Some(setpoint);
                (self.cfg.startup_transition_ms, self.cfg.startup_debounce_ms)
            }
            Action::Climate(ClimateAction::ChangeSetpoint { setpoint }) => {
                if let Err(err) = bus.set_climate_setpoint(&self.cfg.setpoint_entity, setpoint).await {
                    tracing::warn!(device = %self.cfg.name, %err, "setpoint command refused");
                }
                self.current_setpoint = Some(setpoint);
                (self.cfg.setpoint_change_transition_ms, self.cfg.setpoint_debounce_ms)
            }
            _ => return Err(ClimateDeviceError::WrongSign),
        };

        let expected_future = self.current_consumption.unwrap_or(0.0) + increment.delta;
        if self
            .transition
            .begin_pending(PendingKind::Increase, expected_future, now, transition_ms, debounce_ms)
            .is_err()
        {
            tracing::warn!(device = %self.cfg.name, "transition re-entry attempted while not idle");
            return Err(ClimateDeviceError::NotIdle);
        }
        Ok(())
    }

    pub async fn decrease_consumption_by(
        &mut self,
        increment: &Increment,
        bus: &dyn Bus,
        now: Instant,
    ) -> Result<(), ClimateDeviceError> {
        if increment.delta >= 0.0 {
            return Err(ClimateDeviceError::WrongSign);
        }
        let (transition_ms, debounce_ms) = match increment.action {
            Action::Climate(ClimateAction::ChangeSetpoint { setpoint }) => {
                if let Err(err) = bus.set_climate_setpoint(&self.cfg.setpoint_entity, setpoint).await {
                    tracing::warn!(device = %self.cfg.name, %err, "setpoint command refused");
                }
                self.current_setpoint = Some(setpoint);
                (self.cfg.setpoint_change_transition_ms, self.cfg.setpoint_debounce_ms)
            }
            Action::Climate(ClimateAction::SwitchToFanOnly) => {
                if let Err(err) = bus.set_climate_mode(&self.cfg.mode_entity, ClimateMode::FanOnly).await {
                    tracing::warn!(device = %self.cfg.name, %err, "mode command refused");
                }
                self.current_mode = Some(ClimateMode::FanOnly);
                self.fan_only_since = Some(now);
                (self.cfg.mode_change_transition_ms, self.cfg.mode_debounce_ms)
            }
            _ => return Err(ClimateDeviceError::WrongSign),
        };

        let expected_future = self.current_consumption.unwrap_or(0.0) + increment.delta;
        if self
            .transition
            .begin_pending(PendingKind::Decrease, expected_future, now, transition_ms, debounce_ms)
            .is_err()
        {
            tracing::warn!(device = %self.cfg.name, "transition re-entry attempted while not idle");
            return Err(ClimateDeviceError::NotIdle);
        }
        Ok(())
    }

    pub async fn stop(&mut self, bus: &dyn Bus) {
        if let Err(err) = bus.set_climate_mode(&self.cfg.mode_entity, ClimateMode::Off).await {
            tracing::warn!(device = %self.cfg.name, %err, "stop command refused");
        }
        self.current_mode = Some(ClimateMode::Off);
        self.fan_only_since = None;
        self.transition.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SimulatedBus;

    fn cfg() -> ClimateConfig {
        ClimateConfig {
            name: "Living Room AC".into(),
            priority: 3,
            setpoint_entity: EntityId::new("climate.living_room_setpoint"),
            mode_entity: EntityId::new("climate.living_room_mode"),
            room_temp_entity: EntityId::new("sensor.living_room_temp"),
            consumption_entity: EntityId::new("sensor.living_room_ac_power"),
            desired_setpoint_entity: EntityId::new("input_number.living_room_desired_setpoint"),
            desired_mode_entity: EntityId::new("input_select.living_room_desired_mode"),
            comfort_setpoint_entity: None,
            management_entity: EntityId::new("switch.living_room_ac_management_enabled"),
            min_setpoint: 16.0,
            max_setpoint: 30.0,
            setpoint_step: 1.0,
            compressor_startup_min_consumption: 300.0,
            power_on_setpoint_offset: 2.0,
            consumption_per_degree: 300.0,
            max_compressor_consumption: 2400.0,
            fan_only_min_consumption: 50.0,
            heat_cool_min_consumption: 500.0,
            setpoint_change_transition_ms: 100,
            setpoint_debounce_ms: 100,
            mode_change_transition_ms: 100,
            mode_debounce_ms: 100,
            startup_transition_ms: 200,
            startup_debounce_ms: 200,
            fan_only_timeout_ms: 600_000,
        }
    }

    async fn base_bus() -> SimulatedBus {
        let bus = SimulatedBus::new();
        bus.set_mode_reading("input_select.living_room_desired_mode", ClimateMode::Cool).await;
        bus.set_number_reading("input_number.living_room_desired_setpoint", 20.0).await;
        bus
    }

    #[tokio::test]
    async fn cooling_three_degrees_below_setpoint_matches_worked_example() {
        // room=26, current setpoint=24 (cool), desired=20, consumption=1000W,
        // consumptionPerDegree=300, maxCompressorConsumption=2400 -> delta=+320
        let bus = base_bus().await;
        bus.set_mode_reading("climate.living_room_mode", ClimateMode::Cool).await;
        bus.set_number_reading("climate.living_room_setpoint", 24.0).await;
        bus.set_number_reading("sensor.living_room_temp", 26.0).await;
        bus.set_number_reading("sensor.living_room_ac_power", 1000.0).await;

        let mut dev = ClimateDevice::new(cfg());
        dev.refresh(&bus).await;

        let inc = dev
            .increase_increments()
            .iter()
            .find(|i| matches!(i.action, Action::Climate(ClimateAction::ChangeSetpoint { setpoint }) if (setpoint - 23.0).abs() < 1e-9))
            .expect("expected a +23 setpoint increment");
        assert!((inc.delta - 320.0).abs() < 1e-6, "delta was {}", inc.delta);
    }

    #[tokio::test]
    async fn off_device_offers_startup_increment_toward_desired() {
        let bus = base_bus().await;
        bus.set_mode_reading("climate.living_room_mode", ClimateMode::Off).await;
        bus.set_number_reading("sensor.living_room_temp", 28.0).await;

        let mut dev = ClimateDevice::new(cfg());
        dev.refresh(&bus).await;

        assert_eq!(dev.increase_increments().len(), 1);
        assert!(dev.decrease_increments().is_empty());
        match dev.increase_increments()[0].action {
            Action::Climate(ClimateAction::PowerOn { mode, setpoint }) => {
                assert_eq!(mode, ClimateMode::Cool);
                // room 28, offset 2 -> raw 26, clamped between desired(20) and comfort(none -> desired) = 20
                // comfort defaults to desired when unset, so clamp(26, 20, 20) = 20
                assert_eq!(setpoint, 20.0);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[tokio::test]
    async fn fan_only_device_offers_no_increase_back_into_running_mode() {
        let bus = base_bus().await;
        bus.set_mode_reading("climate.living_room_mode", ClimateMode::FanOnly).await;
        bus.set_number_reading("sensor.living_room_temp", 28.0).await;

        let mut dev = ClimateDevice::new(cfg());
        dev.refresh(&bus).await;

        assert!(dev.increase_increments().is_empty());
        assert!(dev.decrease_increments().is_empty());
    }

    #[tokio::test]
    async fn running_device_offers_fan_only_decrease_when_no_comfort_setpoint() {
        let bus = base_bus().await;
        bus.set_mode_reading("climate.living_room_mode", ClimateMode::Cool).await;
        bus.set_number_reading("climate.living_room_setpoint", 20.0).await; // already at desired
        bus.set_number_reading("sensor.living_room_temp", 22.0).await;
        bus.set_number_reading("sensor.living_room_ac_power", 600.0).await;

        let mut dev = ClimateDevice::new(cfg());
        dev.refresh(&bus).await;

        assert!(dev
            .decrease_increments()
            .iter()
            .any(|i| matches!(i.action, Action::Climate(ClimateAction::SwitchToFanOnly))));
    }

    #[tokio::test]
    async fn comfort_setpoint_blocks_decrease_past_the_band() {
        let mut c = cfg();
        c.comfort_setpoint_entity = Some(EntityId::new("input_number.comfort"));
        let bus = base_bus().await;
        bus.set_mode_reading("climate.living_room_mode", ClimateMode::Cool).await;
        bus.set_number_reading("climate.living_room_setpoint", 23.0).await;
        bus.set_number_reading("sensor.living_room_temp", 26.0).await;
        bus.set_number_reading("sensor.living_room_ac_power", 1000.0).await;
        bus.set_number_reading("input_number.comfort", 23.0).await; // already at the band edge

        let mut dev = ClimateDevice::new(c);
        dev.refresh(&bus).await;

        assert!(!dev
            .decrease_increments()
            .iter()
            .any(|i| matches!(i.action, Action::Climate(ClimateAction::ChangeSetpoint { .. }))));
        assert!(!dev
            .decrease_increments()
            .iter()
            .any(|i| matches!(i.action, Action::Climate(ClimateAction::SwitchToFanOnly))));
    }

    #[tokio::test]
    async fn fan_only_timeout_turns_the_unit_off() {
        let bus = base_bus().await;
        bus.set_mode_reading("climate.living_room_mode", ClimateMode::FanOnly).await;
        bus.set_number_reading("climate.living_room_setpoint", 20.0).await;
        bus.set_number_reading("sensor.living_room_temp", 22.0).await;

        let mut c = cfg();
        c.fan_only_timeout_ms = 500;
        let mut dev = ClimateDevice::new(c);
        dev.refresh(&bus).await;

        let t0 = Instant::now();
        assert!(!dev.poll_timers(t0, &bus).await);
        assert!(dev.poll_timers(t0 + Duration::from_millis(600), &bus).await);
        assert_eq!(bus.read_mode(&EntityId::new("climate.living_room_mode")).await, Some(ClimateMode::Off));
    }
}
