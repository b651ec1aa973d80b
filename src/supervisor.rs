//! Debounced RUNNING/STOPPED decision from PV production and the
//! system-wide enable switch.

use std::time::{Duration, Instant};

use crate::bus::{Bus, EntityId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisoryState {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub pv_mean_entity: EntityId,
    pub enable_entity: EntityId,
    pub status_entity: EntityId,
    pub pv_production_activation_threshold: f64,
    pub pv_production_activation_delay_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingTransition {
    target: bool,
    started_at: Instant,
}

/// Runs entirely off externally-supplied readings and an externally-supplied
/// `now` — no internal timer task — so the owning service decides the
/// polling cadence (typically once per bus event plus a periodic nudge so
/// the activation delay itself elapses even with no new readings).
pub struct Supervisor {
    cfg: SupervisorConfig,
    state: SupervisoryState,
    pending: Option<PendingTransition>,
    listeners: Vec<Box<dyn FnMut(SupervisoryState) + Send>>,
}

impl Supervisor {
    /// Initial state is RUNNING iff the instantaneous derived desired state
    /// is RUNNING — no activation delay applies at construction.
    pub fn new(cfg: SupervisorConfig, initial_pv_mean: Option<f64>, initial_enabled: bool) -> Self {
        let desired = derive_desired(&cfg, initial_pv_mean, initial_enabled);
        Self {
            cfg,
            state: if desired { SupervisoryState::Running } else { SupervisoryState::Stopped },
            pending: None,
            listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> SupervisoryState {
        self.state
    }

    /// Register a listener; it fires once immediately with the current
    /// state, then on every subsequent committed transition.
    pub fn add_listener(&mut self, mut listener: Box<dyn FnMut(SupervisoryState) + Send>) {
        listener(self.state);
        self.listeners.push(listener);
    }

    /// Recompute the desired state from fresh readings and advance the
    /// activation-delay timer. Returns `true` if the committed state
    /// changed (and listeners were fired).
    pub fn poll(&mut self, pv_mean: Option<f64>, enabled: bool, now: Instant) -> bool {
        let desired = derive_desired(&self.cfg, pv_mean, enabled);
        let current = matches!(self.state, SupervisoryState::Running);

        if desired == current {
            self.pending = None;
            return false;
        }

        match self.pending {
            Some(pending) if pending.target == desired => {
                let elapsed = now.saturating_duration_since(pending.started_at);
                if elapsed >= Duration::from_millis(self.cfg.pv_production_activation_delay_ms) {
                    self.state = if desired { SupervisoryState::Running } else { SupervisoryState::Stopped };
                    self.pending = None;
                    for listener in &mut self.listeners {
                        listener(self.state);
                    }
                    true
                } else {
                    false
                }
            }
            _ => {
                self.pending = Some(PendingTransition { target: desired, started_at: now });
                false
            }
        }
    }

    /// Read PV/enable state from the bus, poll, and publish the active
    /// status indicator on any committed transition.
    pub async fn refresh_and_poll(&mut self, bus: &dyn Bus, now: Instant) -> bool {
        let pv_mean = bus.read_number(&self.cfg.pv_mean_entity).await;
        let enabled = bus.read_binary(&self.cfg.enable_entity).await.unwrap_or(false);
        let transitioned = self.poll(pv_mean, enabled, now);
        if transitioned {
            let is_running = matches!(self.state, SupervisoryState::Running);
            if let Err(err) = bus.set_switch(&self.cfg.status_entity, is_running).await {
                tracing::warn!(%err, "failed to publish load-management-active status");
            }
        }
        transitioned
    }
}

fn derive_desired(cfg: &SupervisorConfig, pv_mean: Option<f64>, enabled: bool) -> bool {
    enabled && pv_mean.is_some_and(|pv| pv > cfg.pv_production_activation_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SupervisorConfig {
        SupervisorConfig {
            pv_mean_entity: EntityId::new("sensor.pv_mean_1min"),
            enable_entity: EntityId::new("switch.daytime_load_management_enabled"),
            status_entity: EntityId::new("binary_sensor.daytime_load_management_active"),
            pv_production_activation_threshold: 500.0,
            pv_production_activation_delay_ms: 15 * 60 * 1000,
        }
    }

    #[test]
    fn initial_state_follows_instantaneous_desired_with_no_delay() {
        let s = Supervisor::new(cfg(), Some(600.0), true);
        assert_eq!(s.state(), SupervisoryState::Running);
        let s = Supervisor::new(cfg(), Some(100.0), true);
        assert_eq!(s.state(), SupervisoryState::Stopped);
    }

    #[test]
    fn listener_fires_immediately_with_current_state() {
        let mut s = Supervisor::new(cfg(), Some(100.0), true);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        s.add_listener(Box::new(move |state| seen2.lock().unwrap().push(state)));
        assert_eq!(*seen.lock().unwrap(), vec![SupervisoryState::Stopped]);
    }

    #[test]
    fn sustained_pv_commits_after_the_full_activation_delay() {
        let mut s = Supervisor::new(cfg(), Some(0.0), true);
        let t0 = Instant::now();

        // 600W sustained for 10 minutes, then 400W for 5 minutes: never commits.
        assert!(!s.poll(Some(600.0), true, t0));
        assert!(!s.poll(Some(600.0), true, t0 + Duration::from_secs(10 * 60)));
        assert!(!s.poll(Some(400.0), true, t0 + Duration::from_secs(10 * 60 + 1)));
        assert!(!s.poll(Some(400.0), true, t0 + Duration::from_secs(15 * 60)));
        assert_eq!(s.state(), SupervisoryState::Stopped);

        // 600W sustained for 15 minutes from a fresh start: commits at t=15min.
        let t1 = t0 + Duration::from_secs(20 * 60);
        assert!(!s.poll(Some(600.0), true, t1));
        assert!(!s.poll(Some(600.0), true, t1 + Duration::from_secs(15 * 60) - Duration::from_millis(1)));
        assert!(s.poll(Some(600.0), true, t1 + Duration::from_secs(15 * 60)));
        assert_eq!(s.state(), SupervisoryState::Running);
    }

    #[test]
    fn flapping_resets_the_activation_timer() {
        let mut s = Supervisor::new(cfg(), Some(0.0), true);
        let t0 = Instant::now();
        assert!(!s.poll(Some(600.0), true, t0));
        // desired flips back to Stopped before the delay elapses, then back to Running:
        // the Running timer must restart from this later point.
        assert!(!s.poll(Some(100.0), true, t0 + Duration::from_secs(5 * 60)));
        assert!(!s.poll(Some(600.0), true, t0 + Duration::from_secs(10 * 60)));
        assert!(!s.poll(Some(600.0), true, t0 + Duration::from_secs(10 * 60) + Duration::from_secs(14 * 60)));
        assert!(s.poll(Some(600.0), true, t0 + Duration::from_secs(10 * 60) + Duration::from_secs(15 * 60)));
    }

    #[test]
    fn absent_pv_is_never_running() {
        let mut s = Supervisor::new(cfg(), None, true);
        assert_eq!(s.state(), SupervisoryState::Stopped);
        assert!(!s.poll(None, true, Instant::now()));
    }
}
