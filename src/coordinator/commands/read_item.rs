use crate::prelude::*;

use crate::coordinator::Coordinator;

/// On-demand read of a single item, outside the poll cycle. Successful
/// reads are merged into the battery's snapshot.
pub struct ReadItem {
    coordinator: Coordinator,
    key: String,
}

impl ReadItem {
    pub fn new(coordinator: Coordinator, key: String) -> Self {
        Self { coordinator, key }
    }

    pub async fn run(&self) -> Result<Option<Value>> {
        let Some(item) = self.coordinator.register_item(&self.key) else {
            bail!(
                "{}:no item named {}",
                self.coordinator.battery_name(),
                self.key
            );
        };

        match item {
            Item::Register(register) => {
                match register.read(self.coordinator.transport().as_ref()).await {
                    ItemRead::Value(value) => {
                        self.coordinator.store().merge(register.name(), value);
                        Ok(Some(value))
                    }
                    ItemRead::Absent => Ok(None),
                    ItemRead::ConnectionLost => bail!(
                        "{}:connection lost reading {}",
                        self.coordinator.battery_name(),
                        self.key
                    ),
                }
            }
            Item::Calculated(calculated) => {
                Ok(calculated.calculate(self.coordinator.registry()))
            }
        }
    }
}
