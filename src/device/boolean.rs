//! On/off appliance with a single discrete increment.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

use crate::bus::{Bus, EntityId};
use crate::device::base_controls::BaseControls;
use crate::device::increment::{push_unique, Action, BooleanAction, Increment};
use crate::device::transition::{PendingKind, Transition, TransitionState};

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum BooleanDeviceError {
    #[error("increment delta sign does not match the requested direction")]
    WrongSign,
    #[error("device is mid-transition and cannot accept a new command")]
    NotIdle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BooleanConfig {
    pub name: String,
    pub priority: i32,
    pub switch_entity: EntityId,
    pub management_entity: EntityId,
    pub consumption_entity: Option<EntityId>,
    pub expected_consumption_w: f64,
    pub change_transition_ms: u64,
    pub turn_on_debounce_ms: u64,
    pub turn_off_debounce_ms: u64,
}

/// A simple on/off appliance (pump, fountain pump, water heater relay, …).
#[derive(Debug)]
pub struct BooleanDevice {
    cfg: BooleanConfig,
    base_controls: BaseControls,
    transition: Transition,
    is_on: Option<bool>,
    current_consumption: Option<f64>,
    increase_increments: Vec<Increment>,
    decrease_increments: Vec<Increment>,
}

impl BooleanDevice {
    pub fn new(cfg: BooleanConfig) -> Self {
        let base_controls = BaseControls::new(cfg.management_entity.clone());
        Self {
            cfg,
            base_controls,
            transition: Transition::new(),
            is_on: None,
            current_consumption: None,
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

    pub fn poll_timers(&mut self, now: Instant) -> bool {
        self.transition.poll(now)
    }

    /// Read the bus and recompute the (lazy) increment lists. Must run
    /// once per tick before any actuator command.
    pub async fn refresh(&mut self, bus: &dyn Bus) {
        self.base_controls.sync_from_bus(bus).await;
        self.is_on = bus.read_binary(&self.cfg.switch_entity).await;
        self.current_consumption = match &self.cfg.consumption_entity {
            Some(entity) => bus.read_number(entity).await,
            None => None,
        };

        self.increase_increments.clear();
        self.decrease_increments.clear();

        let Some(is_on) = self.is_on else { return };

        if !is_on {
            push_unique(
                &mut self.increase_increments,
                Increment::new(self.cfg.expected_consumption_w, Action::Boolean(BooleanAction::TurnOn)),
            );
        } else {
            let measured = self.current_consumption.unwrap_or(self.cfg.expected_consumption_w);
            push_unique(
                &mut self.decrease_increments,
                Increment::new(-measured, Action::Boolean(BooleanAction::TurnOff)),
            );
        }
    }

    pub async fn increase_consumption_by(
        &mut self,
        increment: &Increment,
        bus: &dyn Bus,
        now: Instant,
    ) -> Result<(), BooleanDeviceError> {
        let Action::Boolean(BooleanAction::TurnOn) = increment.action else {
            return Err(BooleanDeviceError::WrongSign);
        };
        if increment.delta <= 0.0 {
            return Err(BooleanDeviceError::WrongSign);
        }
        if self.is_on == Some(true) {
            return Ok(()); // already matches target state
        }
        if let Err(err) = bus.set_switch(&self.cfg.switch_entity, true).await {
            tracing::warn!(device = %self.cfg.name, %err, "turn_on command refused");
        }
        let expected_future = self.current_consumption.unwrap_or(0.0) + increment.delta;
        if self
            .transition
            .begin_pending(
                PendingKind::Increase,
                expected_future,
                now,
                self.cfg.change_transition_ms,
                self.cfg.turn_on_debounce_ms,
            )
            .is_err()
        {
            tracing::warn!(device = %self.cfg.name, "transition re-entry attempted while not idle");
            return Err(BooleanDeviceError::NotIdle);
        }
        Ok(())
    }

    pub async fn decrease_consumption_by(
        &mut self,
        increment: &Increment,
        bus: &dyn Bus,
        now: Instant,
    ) -> Result<(), BooleanDeviceError> {
        let Action::Boolean(BooleanAction::TurnOff) = increment.action else {
            return Err(BooleanDeviceError::WrongSign);
        };
        if increment.delta >= 0.0 {
            return Err(BooleanDeviceError::WrongSign);
        }
        if self.is_on == Some(false) {
            return Ok(());
        }
        if let Err(err) = bus.set_switch(&self.cfg.switch_entity, false).await {
            tracing::warn!(device = %self.cfg.name, %err, "turn_off command refused");
        }
        let expected_future = self.current_consumption.unwrap_or(0.0) + increment.delta;
        if self
            .transition
            .begin_pending(
                PendingKind::Decrease,
                expected_future,
                now,
                self.cfg.change_transition_ms,
                self.cfg.turn_off_debounce_ms,
            )
            .is_err()
        {
            tracing::warn!(device = %self.cfg.name, "transition re-entry attempted while not idle");
            return Err(BooleanDeviceError::NotIdle);
        }
        Ok(())
    }

    pub async fn stop(&mut self, bus: &dyn Bus) {
        if let Err(err) = bus.set_switch(&self.cfg.switch_entity, false).await {
            tracing::warn!(device = %self.cfg.name, %err, "stop command refused");
        }
        self.transition.reset();
    }
}
