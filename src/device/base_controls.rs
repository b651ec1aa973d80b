//! Per-device "management enabled" switch.

use crate::bus::{Bus, EntityId};

/// The user-facing "<Device> Management Enabled" toggle. Defaults to
/// `true` on first start; when `false` the owning device is skipped by
/// the load manager but keeps reporting its current consumption.
#[derive(Debug, Clone)]
pub struct BaseControls {
    entity: EntityId,
    enabled: bool,
}

impl BaseControls {
    pub fn new(entity: EntityId) -> Self {
        Self { entity, enabled: true }
    }

    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    pub fn management_enabled(&self) -> bool {
        self.enabled
    }

    /// Pull current state from the bus; if the switch has never been
    /// published (fresh entity, no stored state), publish the default
    /// (`true`) so the bus has something to show the user.
    pub async fn sync_from_bus(&mut self, bus: &dyn Bus) {
        match bus.read_binary(&self.entity).await {
            Some(value) => self.enabled = value,
            None => {
                if let Err(err) = bus.set_switch(&self.entity, self.enabled).await {
                    tracing::warn!(entity = %self.entity, %err, "failed to publish default management-enabled state");
                }
            }
        }
    }

    pub async fn set(&mut self, bus: &dyn Bus, enabled: bool) {
        self.enabled = enabled;
        if let Err(err) = bus.set_switch(&self.entity, enabled).await {
            tracing::warn!(entity = %self.entity, %err, "failed to publish management-enabled state");
        }
    }
}
