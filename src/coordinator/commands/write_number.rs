use crate::prelude::*;

use crate::coordinator::Coordinator;

pub struct WriteNumber {
    coordinator: Coordinator,
    key: String,
    value: f64,
}

impl WriteNumber {
    pub fn new(coordinator: Coordinator, key: String, value: f64) -> Self {
        Self {
            coordinator,
            key,
            value,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let Some(Item::Register(register)) = self.coordinator.register_item(&self.key) else {
            bail!(
                "{}:no register item named {}",
                self.coordinator.battery_name(),
                self.key
            );
        };

        let value = Value::Float(self.value);
        if !register
            .write(self.coordinator.transport().as_ref(), value)
            .await
        {
            bail!(
                "{}:write of {} to {} failed",
                self.coordinator.battery_name(),
                self.value,
                self.key
            );
        }

        // Snapshot the value a future read would decode, so write-only
        // registers stay observable between cycles.
        if let Some(written) = register.encode(value).and_then(|raw| register.decode(&raw)) {
            self.coordinator.store().merge(register.name(), written);
        }

        Ok(())
    }
}
