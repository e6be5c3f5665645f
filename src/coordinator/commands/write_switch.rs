use crate::prelude::*;

use crate::coordinator::Coordinator;

pub struct WriteSwitch {
    coordinator: Coordinator,
    key: String,
    on: bool,
}

impl WriteSwitch {
    pub fn new(coordinator: Coordinator, key: String, on: bool) -> Self {
        Self {
            coordinator,
            key,
            on,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let Some(Item::Register(register)) = self.coordinator.register_item(&self.key) else {
            bail!(
                "{}:no switch item named {}",
                self.coordinator.battery_name(),
                self.key
            );
        };

        info!(
            "{}:switching {} {}",
            self.coordinator.battery_name(),
            self.key,
            if self.on { "on" } else { "off" }
        );

        if !register
            .write(self.coordinator.transport().as_ref(), Value::Bool(self.on))
            .await
        {
            bail!(
                "{}:switch write to {} failed",
                self.coordinator.battery_name(),
                self.key
            );
        }

        self.coordinator
            .store()
            .merge(register.name(), Value::Bool(self.on));

        Ok(())
    }
}
