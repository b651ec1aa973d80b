//! The external home-automation bus.
//!
//! Sensor readings, user-switch state, and actuator commands all flow
//! through this trait. The real bus — entity registration, MQTT/websocket
//! transport, storage of published switches — is an external collaborator;
//! this module defines the interface the core is driven against, plus two
//! test/demo implementations (a mutable in-memory world and a scripted
//! fixed-response mock).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::numeric::{to_real, RawValue};

/// Identifier for an entity on the bus (e.g. `switch.ev_charger_enable`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_owned())
    }
}

/// Climate HVAC mode, mirrored on the bus as a `climate.*` entity's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClimateMode {
    Off,
    Heat,
    Cool,
    FanOnly,
}

impl std::fmt::Display for ClimateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClimateMode::Off => "off",
            ClimateMode::Heat => "heat",
            ClimateMode::Cool => "cool",
            ClimateMode::FanOnly => "fan_only",
        };
        write!(f, "{s}")
    }
}

/// Errors a `Bus` implementation may report back to a caller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),
    #[error("actuator refused command on {entity}: {reason}")]
    ActuatorRefused { entity: EntityId, reason: String },
}

/// The home-automation bus interface the core is driven against.
///
/// All reads are best-effort and return an absent value rather than an
/// error — an absent reading is routine, not exceptional.
/// Writes can fail with an actuator refusal; callers log and continue.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Read a numeric sensor, already coerced via [`crate::numeric::to_real`].
    async fn read_number(&self, entity: &EntityId) -> Option<f64>;

    /// Read a binary sensor or switch state.
    async fn read_binary(&self, entity: &EntityId) -> Option<bool>;

    /// Read a select/text entity (e.g. user desired HVAC mode).
    async fn read_mode(&self, entity: &EntityId) -> Option<ClimateMode>;

    /// Command a boolean switch.
    async fn set_switch(&self, entity: &EntityId, on: bool) -> Result<(), BusError>;

    /// Command a numeric entity (e.g. charging current), clamped to
    /// `[min, max]` by the bus.
    async fn set_number(&self, entity: &EntityId, value: f64, min: f64, max: f64) -> Result<(), BusError>;

    /// Command a climate setpoint.
    async fn set_climate_setpoint(&self, entity: &EntityId, setpoint: f64) -> Result<(), BusError>;

    /// Command a climate HVAC mode.
    async fn set_climate_mode(&self, entity: &EntityId, mode: ClimateMode) -> Result<(), BusError>;
}

#[derive(Debug, Clone, Default)]
struct BusState {
    numbers: HashMap<EntityId, RawValue>,
    binaries: HashMap<EntityId, bool>,
    modes: HashMap<EntityId, ClimateMode>,
}

/// An in-memory bus for demos and integration tests.
///
/// Values are set directly by the caller (simulating sensors drifting and
/// the user flipping switches); writes are applied to the same in-memory
/// state, so tests can read back exactly what was commanded.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<RwLock<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_number_reading(&self, entity: impl Into<EntityId>, value: impl Into<RawValue>) {
        self.state.write().await.numbers.insert(entity.into(), value.into());
    }

    pub async fn set_binary_reading(&self, entity: impl Into<EntityId>, value: bool) {
        self.state.write().await.binaries.insert(entity.into(), value);
    }

    pub async fn set_mode_reading(&self, entity: impl Into<EntityId>, value: ClimateMode) {
        self.state.write().await.modes.insert(entity.into(), value);
    }
}

#[async_trait]
impl Bus for SimulatedBus {
    async fn read_number(&self, entity: &EntityId) -> Option<f64> {
        let state = self.state.read().await;
        state.numbers.get(entity).and_then(to_real)
    }

    async fn read_binary(&self, entity: &EntityId) -> Option<bool> {
        self.state.read().await.binaries.get(entity).copied()
    }

    async fn read_mode(&self, entity: &EntityId) -> Option<ClimateMode> {
        self.state.read().await.modes.get(entity).copied()
    }

    async fn set_switch(&self, entity: &EntityId, on: bool) -> Result<(), BusError> {
        self.state.write().await.binaries.insert(entity.clone(), on);
        Ok(())
    }

    async fn set_number(&self, entity: &EntityId, value: f64, min: f64, max: f64) -> Result<(), BusError> {
        let clamped = value.clamp(min, max);
        self.state
            .write()
            .await
            .numbers
            .insert(entity.clone(), RawValue::Number(clamped));
        Ok(())
    }

    async fn set_climate_setpoint(&self, entity: &EntityId, setpoint: f64) -> Result<(), BusError> {
        self.state
            .write()
            .await
            .numbers
            .insert(entity.clone(), RawValue::Number(setpoint));
        Ok(())
    }

    async fn set_climate_mode(&self, entity: &EntityId, mode: ClimateMode) -> Result<(), BusError> {
        self.state.write().await.modes.insert(entity.clone(), mode);
        Ok(())
    }
}

/// A scripted bus for unit tests that need precise, pre-programmed
/// responses rather than a mutable simulated world. Since most device
/// tests only need a fixed snapshot, this mock serves a single static
/// value set and fails every write whose entity is in `refuse_writes`.
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    pub numbers: HashMap<EntityId, f64>,
    pub binaries: HashMap<EntityId, bool>,
    pub modes: HashMap<EntityId, ClimateMode>,
    pub refuse_writes: std::collections::HashSet<EntityId>,
    pub writes: Arc<RwLock<Vec<(EntityId, String)>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_number(mut self, entity: impl Into<EntityId>, value: f64) -> Self {
        self.numbers.insert(entity.into(), value);
        self
    }

    pub fn with_binary(mut self, entity: impl Into<EntityId>, value: bool) -> Self {
        self.binaries.insert(entity.into(), value);
        self
    }

    pub fn with_mode(mut self, entity: impl Into<EntityId>, value: ClimateMode) -> Self {
        self.modes.insert(entity.into(), value);
        self
    }

    pub async fn recorded_writes(&self) -> Vec<(EntityId, String)> {
        self.writes.read().await.clone()
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn read_number(&self, entity: &EntityId) -> Option<f64> {
        self.numbers.get(entity).copied()
    }

    async fn read_binary(&self, entity: &EntityId) -> Option<bool> {
        self.binaries.get(entity).copied()
    }

    async fn read_mode(&self, entity: &EntityId) -> Option<ClimateMode> {
        self.modes.get(entity).copied()
    }

    async fn set_switch(&self, entity: &EntityId, on: bool) -> Result<(), BusError> {
        if self.refuse_writes.contains(entity) {
            return Err(BusError::ActuatorRefused {
                entity: entity.clone(),
                reason: "scripted refusal".into(),
            });
        }
        self.writes.write().await.push((entity.clone(), format!("switch={on}")));
        Ok(())
    }

    async fn set_number(&self, entity: &EntityId, value: f64, min: f64, max: f64) -> Result<(), BusError> {
        if self.refuse_writes.contains(entity) {
            return Err(BusError::ActuatorRefused {
                entity: entity.clone(),
                reason: "scripted refusal".into(),
            });
        }
        let clamped = value.clamp(min, max);
        self.writes.write().await.push((entity.clone(), format!("number={clamped}")));
        Ok(())
    }

    async fn set_climate_setpoint(&self, entity: &EntityId, setpoint: f64) -> Result<(), BusError> {
        if self.refuse_writes.contains(entity) {
            return Err(BusError::ActuatorRefused {
                entity: entity.clone(),
                reason: "scripted refusal".into(),
            });
        }
        self.writes.write().await.push((entity.clone(), format!("setpoint={setpoint}")));
        Ok(())
    }

    async fn set_climate_mode(&self, entity: &EntityId, mode: ClimateMode) -> Result<(), BusError> {
        if self.refuse_writes.contains(entity) {
            return Err(BusError::ActuatorRefused {
                entity: entity.clone(),
                reason: "scripted refusal".into(),
            });
        }
        self.writes.write().await.push((entity.clone(), format!("mode={mode}")));
        Ok(())
    }
}
