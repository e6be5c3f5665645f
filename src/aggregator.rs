use crate::prelude::*;

use std::collections::HashMap;

use crate::items::{CalculatedItem, Calculation};

struct RegistryInner {
    stores: HashMap<String, SnapshotStore>,
    master: String,
}

/// Read-only view over every battery's latest snapshot. Cross-battery
/// quantities are computed on demand from whatever values are present.
#[derive(Clone)]
pub struct SystemRegistry {
    inner: Arc<RegistryInner>,
}

impl SystemRegistry {
    pub fn new(stores: HashMap<String, SnapshotStore>, master: String) -> Self {
        Self {
            inner: Arc::new(RegistryInner { stores, master }),
        }
    }

    pub fn battery_count(&self) -> usize {
        self.inner.stores.len()
    }

    pub fn master(&self) -> &str {
        &self.inner.master
    }

    pub fn store(&self, battery: &str) -> Option<&SnapshotStore> {
        self.inner.stores.get(battery)
    }

    pub fn master_store(&self) -> Option<&SnapshotStore> {
        self.inner.stores.get(&self.inner.master)
    }

    /// Values for `{battery}_{suffix}` across all batteries, skipping
    /// batteries that have not reported one yet.
    fn collect(&self, suffix: &str) -> Vec<f64> {
        self.inner
            .stores
            .iter()
            .filter_map(|(name, store)| store.numeric(&format!("{}_{}", name, suffix)))
            .collect()
    }

    pub fn combined_soc(&self) -> Option<f64> {
        let values = self.collect("soc");
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    pub fn combined_power(&self) -> Option<f64> {
        self.sum("power")
    }

    pub fn cumulative_energy_produced(&self) -> Option<f64> {
        self.sum("energy_produced")
    }

    pub fn cumulative_energy_consumed(&self) -> Option<f64> {
        self.sum("energy_consumed")
    }

    fn sum(&self, suffix: &str) -> Option<f64> {
        let values = self.collect(suffix);
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum())
    }

    pub fn calculate(&self, calculation: Calculation) -> Option<Value> {
        let value = match calculation {
            Calculation::CombinedSoc => self.combined_soc(),
            Calculation::CombinedPower => self.combined_power(),
            Calculation::CumulativeEnergyProduced => self.cumulative_energy_produced(),
            Calculation::CumulativeEnergyConsumed => self.cumulative_energy_consumed(),
        };
        value.map(Value::Float)
    }
}

impl CalculatedItem {
    pub fn calculate(&self, registry: &SystemRegistry) -> Option<Value> {
        registry.calculate(self.calculation())
    }
}
