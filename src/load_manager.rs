//! Periodic bang-bang allocator: compares grid consumption against
//! thresholds and dispatches incremental increase/decrease actions across
//! prioritised devices.

use std::time::{Duration, Instant};

use crate::bus::{Bus, EntityId};
use crate::device::{DeviceHandle, Increment, PendingKind, TransitionState};

#[derive(Debug, Clone)]
pub struct LoadManagerConfig {
    pub grid_entity: EntityId,
    pub grid_mean_entity: EntityId,
    pub desired_grid_consumption: f64,
    pub max_consumption_before_shedding_load: f64,
    pub min_consumption_before_adding_load: f64,
    pub loop_interval_ms: u64,
}

pub struct LoadManager {
    cfg: LoadManagerConfig,
    devices: Vec<DeviceHandle>,
    active: bool,
    next_tick: Option<Instant>,
}

impl LoadManager {
    pub fn new(cfg: LoadManagerConfig, devices: Vec<DeviceHandle>) -> Self {
        Self { cfg, devices, active: false, next_tick: None }
    }

    pub fn devices(&self) -> &[DeviceHandle] {
        &self.devices
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Begin the periodic tick, with the first tick due immediately.
    pub fn start(&mut self, now: Instant) {
        self.active = true;
        self.next_tick = Some(now);
    }

    /// Cancel the periodic tick and command every device to stop.
    pub async fn stop(&mut self, bus: &dyn Bus) {
        self.active = false;
        self.next_tick = None;
        for device in &mut self.devices {
            device.stop(bus).await;
        }
    }

    /// Run one allocation pass if due. Always refreshes device state first;
    /// a tick reading an absent grid value performs no device calls.
    pub async fn run_due(&mut self, bus: &dyn Bus, now: Instant) {
        if !self.active {
            return;
        }
        match self.next_tick {
            Some(deadline) if now >= deadline => {}
            _ => return,
        }
        self.next_tick = Some(now + Duration::from_millis(self.cfg.loop_interval_ms));
        self.tick(bus, now).await;
    }

    async fn tick(&mut self, bus: &dyn Bus, now: Instant) {
        for device in &mut self.devices {
            device.refresh(bus, now).await;
            device.poll_timers(now, bus).await;
        }

        let mean = bus.read_number(&self.cfg.grid_mean_entity).await;
        let instantaneous = bus.read_number(&self.cfg.grid_entity).await;
        let (Some(mean), Some(instantaneous)) = (mean, instantaneous) else {
            return;
        };

        if mean > self.cfg.max_consumption_before_shedding_load {
            let excess = mean.max(instantaneous) - self.cfg.desired_grid_consumption;
            self.shed(bus, now, excess).await;
        } else if mean < self.cfg.min_consumption_before_adding_load {
            let surplus = self.cfg.desired_grid_consumption - mean.max(instantaneous);
            self.add(bus, now, surplus).await;
        }
    }

    async fn shed(&mut self, bus: &dyn Bus, now: Instant, excess: f64) {
        let expected_additional_future_reduction: f64 = self
            .devices
            .iter()
            .filter(|d| d.management_enabled())
            .filter_map(|d| match d.change_state() {
                TransitionState::Pending { kind: PendingKind::Decrease, expected_future_consumption } => {
                    Some((expected_future_consumption - d.current_consumption().unwrap_or(0.0)).min(0.0))
                }
                _ => None,
            })
            .sum();

        let mut remaining = excess - expected_additional_future_reduction;
        if remaining <= 0.0 {
            return;
        }

        let mut order: Vec<usize> = (0..self.devices.len()).collect();
        order.sort_by(|&a, &b| self.devices[b].priority().cmp(&self.devices[a].priority()));

        for idx in order {
            if remaining <= 0.0 {
                break;
            }
            let device = &mut self.devices[idx];
            if !device.management_enabled() || device.change_state().is_in_flight() {
                continue;
            }

            let mut decreases: Vec<Increment> = device.decrease_increments().to_vec();
            if decreases.is_empty() {
                continue;
            }
            decreases.sort_by(|a, b| b.delta.abs().partial_cmp(&a.delta.abs()).unwrap_or(std::cmp::Ordering::Equal));

            let chosen = match decreases.iter().position(|inc| inc.delta.abs() <= remaining) {
                Some(i) if i > 0 => decreases[i - 1],
                _ => decreases[0],
            };

            if let Err(err) = device.decrease_consumption_by(&chosen, bus, now).await {
                tracing::warn!(device = device.name(), %err, "shed command rejected");
                continue;
            }
            tracing::info!(device = device.name(), delta = chosen.delta, "shedding load");
            remaining += chosen.delta;
        }
    }

    async fn add(&mut self, bus: &dyn Bus, now: Instant, surplus: f64) {
        let expected_additional_future_consumption: f64 = self
            .devices
            .iter()
            .filter(|d| d.management_enabled())
            .filter_map(|d| match d.change_state() {
                TransitionState::Pending { kind: PendingKind::Increase, expected_future_consumption } => {
                    Some((expected_future_consumption - d.current_consumption().unwrap_or(0.0)).max(0.0))
                }
                _ => None,
            })
            .sum();

        let mut remaining = surplus - expected_additional_future_consumption;
        if remaining <= 0.0 {
            return;
        }

        let mut order: Vec<usize> = (0..self.devices.len()).collect();
        order.sort_by_key(|&i| self.devices[i].priority());

        for idx in order {
            if remaining <= 0.0 {
                break;
            }
            let device = &mut self.devices[idx];
            if !device.management_enabled() || device.change_state().is_in_flight() {
                continue;
            }

            let chosen = device
                .increase_increments()
                .iter()
                .filter(|inc| inc.delta <= remaining)
                .max_by(|a, b| a.delta.partial_cmp(&b.delta).unwrap_or(std::cmp::Ordering::Equal))
                .copied();

            let Some(chosen) = chosen else { continue };
            if let Err(err) = device.increase_consumption_by(&chosen, bus, now).await {
                tracing::warn!(device = device.name(), %err, "add command rejected");
                continue;
            }
            tracing::info!(device = device.name(), delta = chosen.delta, "adding load");
            remaining -= chosen.delta;
        }
    }
}
