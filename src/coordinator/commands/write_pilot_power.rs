use crate::prelude::*;

use crate::coordinator::Coordinator;
use crate::sax::WriteOutcome;

/// Paired write of target power and power factor, sent as one multi-register
/// frame so the device never sees one without the other.
pub struct WritePilotPower {
    coordinator: Coordinator,
    power: i32,
    power_factor: f64,
}

impl WritePilotPower {
    pub fn new(coordinator: Coordinator, power: i32, power_factor: f64) -> Self {
        Self {
            coordinator,
            power,
            power_factor,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let Some(Item::Register(register)) = self.coordinator.register_item("nominal_power")
        else {
            bail!(
                "{}:pilot control items are not configured",
                self.coordinator.battery_name()
            );
        };

        let outcome = self
            .coordinator
            .transport()
            .write_pilot_power(register.address(), self.power, self.power_factor)
            .await;

        match outcome {
            WriteOutcome::Ok => {
                self.coordinator
                    .store()
                    .merge(register.name(), Value::Int(self.power.into()));
                if let Some(Item::Register(factor)) =
                    self.coordinator.register_item("nominal_power_factor")
                {
                    self.coordinator
                        .store()
                        .merge(factor.name(), Value::Float(self.power_factor));
                }
                Ok(())
            }
            WriteOutcome::Failed => bail!(
                "{}:pilot power write rejected",
                self.coordinator.battery_name()
            ),
            WriteOutcome::ConnectionError => bail!(
                "{}:connection lost writing pilot power",
                self.coordinator.battery_name()
            ),
        }
    }
}
