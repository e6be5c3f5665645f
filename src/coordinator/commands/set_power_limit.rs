use crate::prelude::*;

use crate::coordinator::Coordinator;

/// Writes a charge or discharge power ceiling. The limit items only exist
/// on a master with power limits enabled, so lookup failure is the gate.
pub struct SetPowerLimit {
    coordinator: Coordinator,
    key: String,
    watts: u16,
}

impl SetPowerLimit {
    pub fn new(coordinator: Coordinator, key: String, watts: u16) -> Self {
        Self {
            coordinator,
            key,
            watts,
        }
    }

    pub async fn run(&self) -> Result<()> {
        if self.key != "max_charge" && self.key != "max_discharge" {
            bail!(
                "{}:{} is not a power limit",
                self.coordinator.battery_name(),
                self.key
            );
        }

        let Some(Item::Register(register)) = self.coordinator.register_item(&self.key) else {
            bail!(
                "{}:power limits are not enabled",
                self.coordinator.battery_name()
            );
        };

        info!(
            "{}:setting {} to {}W",
            self.coordinator.battery_name(),
            self.key,
            self.watts
        );

        let value = Value::Int(self.watts.into());
        if !register
            .write(self.coordinator.transport().as_ref(), value)
            .await
        {
            bail!(
                "{}:write of {} failed",
                self.coordinator.battery_name(),
                self.key
            );
        }

        self.coordinator.store().merge(register.name(), value);
        Ok(())
    }
}
