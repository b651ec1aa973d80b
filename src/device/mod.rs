//! Controllable devices: a small tagged-variant dispatcher over the three
//! device kinds plus their shared building blocks (base controls, the
//! transition state machine, and the increment/action vocabulary).
//!
//! A plain enum rather than `dyn Trait` because each kind's increment
//! action payload is a distinct concrete type (`BooleanAction`,
//! `ClimateAction`, `DirectConsumptionAction`); a trait object would force
//! either a shared supertype for all three or boxing the payload, neither
//! of which buys anything a `match` doesn't already give for free.

pub mod base_controls;
pub mod boolean;
pub mod climate;
pub mod direct_consumption;
pub mod increment;
pub mod transition;

use std::time::Instant;
use thiserror::Error;

use crate::bus::Bus;
use boolean::{BooleanDevice, BooleanDeviceError};
use climate::{ClimateDevice, ClimateDeviceError};
use direct_consumption::{DirectConsumptionDevice, DirectConsumptionError};
pub use increment::Increment;
pub use transition::{PendingKind, TransitionState};

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum DeviceError {
    #[error(transparent)]
    Boolean(#[from] BooleanDeviceError),
    #[error(transparent)]
    Climate(#[from] ClimateDeviceError),
    #[error(transparent)]
    DirectConsumption(#[from] DirectConsumptionError),
}

#[derive(Debug)]
pub enum DeviceHandle {
    Boolean(BooleanDevice),
    Climate(ClimateDevice),
    DirectConsumption(DirectConsumptionDevice),
}

impl DeviceHandle {
    pub fn name(&self) -> &str {
        match self {
            DeviceHandle::Boolean(d) => d.name(),
            DeviceHandle::Climate(d) => d.name(),
            DeviceHandle::DirectConsumption(d) => d.name(),
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            DeviceHandle::Boolean(d) => d.priority(),
            DeviceHandle::Climate(d) => d.priority(),
            DeviceHandle::DirectConsumption(d) => d.priority(),
        }
    }

    pub fn management_enabled(&self) -> bool {
        match self {
            DeviceHandle::Boolean(d) => d.base_controls().management_enabled(),
            DeviceHandle::Climate(d) => d.base_controls().management_enabled(),
            DeviceHandle::DirectConsumption(d) => d.base_controls().management_enabled(),
        }
    }

    pub async fn set_management_enabled(&mut self, bus: &dyn Bus, enabled: bool) {
        match self {
            DeviceHandle::Boolean(d) => d.base_controls_mut().set(bus, enabled).await,
            DeviceHandle::Climate(d) => d.base_controls_mut().set(bus, enabled).await,
            DeviceHandle::DirectConsumption(d) => d.base_controls_mut().set(bus, enabled).await,
        }
    }

    pub fn change_state(&self) -> TransitionState {
        match self {
            DeviceHandle::Boolean(d) => d.change_state(),
            DeviceHandle::Climate(d) => d.change_state(),
            DeviceHandle::DirectConsumption(d) => d.change_state(),
        }
    }

    pub fn current_consumption(&self) -> Option<f64> {
        match self {
            DeviceHandle::Boolean(d) => d.current_consumption(),
            DeviceHandle::Climate(d) => d.current_consumption(),
            DeviceHandle::DirectConsumption(d) => d.current_consumption(),
        }
    }

    pub fn increase_increments(&self) -> &[Increment] {
        match self {
            DeviceHandle::Boolean(d) => d.increase_increments(),
            DeviceHandle::Climate(d) => d.increase_increments(),
            DeviceHandle::DirectConsumption(d) => d.increase_increments(),
        }
    }

    pub fn decrease_increments(&self) -> &[Increment] {
        match self {
            DeviceHandle::Boolean(d) => d.decrease_increments(),
            DeviceHandle::Climate(d) => d.decrease_increments(),
            DeviceHandle::DirectConsumption(d) => d.decrease_increments(),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self {
            DeviceHandle::Boolean(d) => d.next_deadline(),
            DeviceHandle::Climate(d) => d.next_deadline(),
            DeviceHandle::DirectConsumption(d) => d.next_deadline(),
        }
    }

    /// Pull current sensor/switch state from the bus and recompute the
    /// lazy increment lists. Must run once per device per tick before any
    /// increase/decrease is attempted.
    pub async fn refresh(&mut self, bus: &dyn Bus, now: Instant) {
        match self {
            DeviceHandle::Boolean(d) => d.refresh(bus).await,
            DeviceHandle::Climate(d) => d.refresh(bus).await,
            DeviceHandle::DirectConsumption(d) => d.refresh(bus, now).await,
        }
    }

    /// Advance this device's own timers (transition/debounce, and any
    /// device-local watchdog). Returns `true` if anything changed.
    pub async fn poll_timers(&mut self, now: Instant, bus: &dyn Bus) -> bool {
        match self {
            DeviceHandle::Boolean(d) => d.poll_timers(now),
            DeviceHandle::Climate(d) => d.poll_timers(now, bus).await,
            DeviceHandle::DirectConsumption(d) => d.poll_timers(now),
        }
    }

    pub async fn increase_consumption_by(
        &mut self,
        increment: &Increment,
        bus: &dyn Bus,
        now: Instant,
    ) -> Result<(), DeviceError> {
        match self {
            DeviceHandle::Boolean(d) => d.increase_consumption_by(increment, bus, now).await.map_err(DeviceError::from),
            DeviceHandle::Climate(d) => d.increase_consumption_by(increment, bus, now).await.map_err(DeviceError::from),
            DeviceHandle::DirectConsumption(d) => {
                d.increase_consumption_by(increment, bus, now).await.map_err(DeviceError::from)
            }
        }
    }

    pub async fn decrease_consumption_by(
        &mut self,
        increment: &Increment,
        bus: &dyn Bus,
        now: Instant,
    ) -> Result<(), DeviceError> {
        match self {
            DeviceHandle::Boolean(d) => d.decrease_consumption_by(increment, bus, now).await.map_err(DeviceError::from),
            DeviceHandle::Climate(d) => d.decrease_consumption_by(increment, bus, now).await.map_err(DeviceError::from),
            DeviceHandle::DirectConsumption(d) => {
                d.decrease_consumption_by(increment, bus, now).await.map_err(DeviceError::from)
            }
        }
    }

    pub async fn stop(&mut self, bus: &dyn Bus) {
        match self {
            DeviceHandle::Boolean(d) => d.stop(bus).await,
            DeviceHandle::Climate(d) => d.stop(bus).await,
            DeviceHandle::DirectConsumption(d) => d.stop(bus).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EntityId, SimulatedBus};
    use boolean::BooleanConfig;

    fn boolean_cfg() -> BooleanConfig {
        BooleanConfig {
            name: "Pool Pump".into(),
            priority: 2,
            switch_entity: EntityId::new("switch.pool_pump"),
            management_entity: EntityId::new("switch.pool_pump_management_enabled"),
            consumption_entity: Some(EntityId::new("sensor.pool_pump_power")),
            expected_consumption_w: 800.0,
            change_transition_ms: 100,
            turn_on_debounce_ms: 200,
            turn_off_debounce_ms: 200,
        }
    }

    #[tokio::test]
    async fn handle_dispatches_to_the_wrapped_boolean_device() {
        let bus = SimulatedBus::new();
        bus.set_binary_reading("switch.pool_pump", false).await;
        let mut handle = DeviceHandle::Boolean(BooleanDevice::new(boolean_cfg()));
        handle.refresh(&bus, Instant::now()).await;
        assert_eq!(handle.name(), "Pool Pump");
        assert_eq!(handle.priority(), 2);
        assert_eq!(handle.increase_increments().len(), 1);
        assert!(handle.change_state().is_idle());
    }
}
