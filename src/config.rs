//! Static configuration: device list, sensor bindings, and the thresholds
//! the supervisor and load manager run against.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::bus::EntityId;
use crate::device::boolean::BooleanConfig;
use crate::device::climate::ClimateConfig;
use crate::device::direct_consumption::DirectConsumptionConfig;
use crate::load_manager::LoadManagerConfig;
use crate::supervisor::SupervisorConfig;

fn default_loop_interval_ms() -> u64 {
    15_000
}

/// One device's static configuration, tagged by kind. `Dehumidifier` has no
/// distinct behaviour of its own — it's driven by the same on/off contract
/// as `Boolean` and reuses its config shape (see DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceConfig {
    Boolean(BooleanConfig),
    Dehumidifier(BooleanConfig),
    Climate(ClimateConfig),
    DirectConsumption(DirectConsumptionConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorPair {
    pub raw: EntityId,
    pub mean_1min: EntityId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(length(min = 1, message = "at least one device must be configured"))]
    pub devices: Vec<DeviceConfig>,

    pub pv: SensorPair,
    pub grid: SensorPair,

    pub enable_entity: EntityId,
    pub status_entity: EntityId,

    #[validate(range(min = 0.0, message = "pv activation threshold must not be negative"))]
    pub pv_production_activation_threshold: f64,
    pub pv_production_activation_delay_ms: u64,

    pub desired_grid_consumption: f64,
    pub max_consumption_before_shedding_load: f64,
    pub min_consumption_before_adding_load: f64,

    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// `environment` selects an overlay file (`config/<environment>.toml`)
    /// merged on top of `config/default.toml`; environment variables
    /// prefixed `LOAD_CONTROLLER__` win over both.
    pub fn load_from(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{env}.toml")));
        } else {
            figment = figment.merge(Toml::file("config/local.toml").nested());
        }

        figment = figment.merge(Env::prefixed("LOAD_CONTROLLER__").split("__"));

        let config: Config = figment.extract().context("failed to parse configuration")?;
        config.validate().context("configuration failed validation")?;

        if config.max_consumption_before_shedding_load <= config.min_consumption_before_adding_load {
            anyhow::bail!(
                "max_consumption_before_shedding_load ({}) must exceed min_consumption_before_adding_load ({})",
                config.max_consumption_before_shedding_load,
                config.min_consumption_before_adding_load
            );
        }

        Ok(config)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            pv_mean_entity: self.pv.mean_1min.clone(),
            enable_entity: self.enable_entity.clone(),
            status_entity: self.status_entity.clone(),
            pv_production_activation_threshold: self.pv_production_activation_threshold,
            pv_production_activation_delay_ms: self.pv_production_activation_delay_ms,
        }
    }

    pub fn load_manager_config(&self) -> LoadManagerConfig {
        LoadManagerConfig {
            grid_entity: self.grid.raw.clone(),
            grid_mean_entity: self.grid.mean_1min.clone(),
            desired_grid_consumption: self.desired_grid_consumption,
            max_consumption_before_shedding_load: self.max_consumption_before_shedding_load,
            min_consumption_before_adding_load: self.min_consumption_before_adding_load,
            loop_interval_ms: self.loop_interval_ms,
        }
    }
}
