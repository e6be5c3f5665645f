use crate::prelude::*;

use serde::Deserialize;

use crate::config::Battery;
use crate::items::{Calculation, CalculatedItem, DataType, RegisterItem};

// Control registers on the master. These sit outside the telemetry block
// and are not part of the overridable catalog.
pub const PILOT_POWER_ADDRESS: u16 = crate::sax::packet::PILOT_POWER_REGISTER;
pub const PILOT_POWER_FACTOR_ADDRESS: u16 = PILOT_POWER_ADDRESS + 1;
pub const MAX_DISCHARGE_ADDRESS: u16 = 43;
pub const MAX_CHARGE_ADDRESS: u16 = 44;
pub const SWITCH_ADDRESS: u16 = 45;

pub const COMBINED_SOC_KEY: &str = "combined_soc";
pub const COMBINED_POWER_KEY: &str = "combined_power";

#[derive(Clone, Debug, Deserialize)]
pub struct ItemSpec {
    pub key: String,
    pub entity_type: EntityType,
    pub address: u16,
    #[serde(default = "ItemSpec::default_data_type")]
    pub data_type: DataType,
    #[serde(default = "ItemSpec::default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
}

impl ItemSpec {
    fn new(key: &str, entity_type: EntityType, address: u16, data_type: DataType, factor: f64) -> Self {
        Self {
            key: key.to_string(),
            entity_type,
            address,
            data_type,
            factor,
            offset: 0.0,
        }
    }

    fn sensor(key: &str, address: u16, data_type: DataType, factor: f64) -> Self {
        Self::new(key, EntityType::Sensor, address, data_type, factor)
    }

    fn default_data_type() -> DataType {
        DataType::U16
    }

    fn default_factor() -> f64 {
        1.0
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Catalog {
    #[serde(default = "Catalog::default_battery_specs")]
    pub battery: Vec<ItemSpec>,
    #[serde(default = "Catalog::default_smartmeter_specs")]
    pub smartmeter: Vec<ItemSpec>,
}

impl Catalog {
    pub fn load(override_file: Option<String>) -> Result<Self> {
        let catalog = match override_file {
            Some(file) => {
                info!("Reading item catalog from {}", file);
                let content = std::fs::read_to_string(&file)
                    .map_err(|err| file_error_with_source!(err, "error reading {}", file))?;
                serde_json::from_str(&content)
                    .map_err(|err| file_error_with_source!(err, "error parsing {}", file))?
            }
            None => Self::defaults(),
        };

        catalog.validate()?;
        Ok(catalog)
    }

    pub fn defaults() -> Self {
        Self {
            battery: Self::default_battery_specs(),
            smartmeter: Self::default_smartmeter_specs(),
        }
    }

    fn validate(&self) -> Result<()> {
        let mut keys = std::collections::HashSet::new();
        for spec in self.battery.iter().chain(self.smartmeter.iter()) {
            if !keys.insert(spec.key.as_str()) {
                bail!("catalog.rs:duplicate item key {}", spec.key);
            }
            if spec.factor == 0.0 {
                bail!("catalog.rs:item {} has zero factor", spec.key);
            }
        }
        Ok(())
    }

    /// All items polled on one battery, keys prefixed with the battery
    /// name. The master additionally carries the write-only control items
    /// and the system-level calculated items.
    pub fn items_for(&self, battery: &Battery, pilot_enabled: bool, limit_power: bool) -> Vec<Item> {
        let mut items: Vec<Item> = self
            .battery
            .iter()
            .map(|spec| self.register_item(battery, spec))
            .collect();

        if battery.master() {
            if pilot_enabled {
                items.push(Item::Register(RegisterItem::new(
                    format!("{}_nominal_power", battery.name()),
                    EntityType::NumberWo,
                    PILOT_POWER_ADDRESS,
                    battery.unit_id(),
                    DataType::I16,
                    1.0,
                    0.0,
                )));
                items.push(Item::Register(RegisterItem::new(
                    format!("{}_nominal_power_factor", battery.name()),
                    EntityType::NumberWo,
                    PILOT_POWER_FACTOR_ADDRESS,
                    battery.unit_id(),
                    DataType::U16,
                    0.0001,
                    0.0,
                )));
            }

            if limit_power {
                items.push(Item::Register(RegisterItem::new(
                    format!("{}_max_discharge", battery.name()),
                    EntityType::NumberWo,
                    MAX_DISCHARGE_ADDRESS,
                    battery.unit_id(),
                    DataType::U16,
                    1.0,
                    0.0,
                )));
                items.push(Item::Register(RegisterItem::new(
                    format!("{}_max_charge", battery.name()),
                    EntityType::NumberWo,
                    MAX_CHARGE_ADDRESS,
                    battery.unit_id(),
                    DataType::U16,
                    1.0,
                    0.0,
                )));
            }

            for (key, calculation) in [
                (COMBINED_SOC_KEY, Calculation::CombinedSoc),
                (COMBINED_POWER_KEY, Calculation::CombinedPower),
                ("cumulative_energy_produced", Calculation::CumulativeEnergyProduced),
                ("cumulative_energy_consumed", Calculation::CumulativeEnergyConsumed),
            ] {
                items.push(Item::Calculated(CalculatedItem::new(
                    key.to_string(),
                    calculation,
                )));
            }
        }

        items
    }

    /// Smart-meter block behind the master battery. Other units do not
    /// expose these registers.
    pub fn smartmeter_items(&self, battery: &Battery) -> Vec<Item> {
        if !battery.master() {
            return Vec::new();
        }

        self.smartmeter
            .iter()
            .map(|spec| self.register_item(battery, spec))
            .collect()
    }

    fn register_item(&self, battery: &Battery, spec: &ItemSpec) -> Item {
        Item::Register(RegisterItem::new(
            format!("{}_{}", battery.name(), spec.key),
            spec.entity_type,
            spec.address,
            battery.unit_id(),
            spec.data_type,
            spec.factor,
            spec.offset,
        ))
    }

    fn default_battery_specs() -> Vec<ItemSpec> {
        use DataType::*;
        use ItemSpec as S;

        vec![
            S::sensor("energy_produced", 13001, U32, 0.1),
            S::sensor("energy_consumed", 13003, U32, 0.1),
            S::sensor("temperature", 13005, U16, 0.1),
            S::sensor("status", 13006, U16, 1.0),
            S::sensor("storage_status", 13007, U16, 1.0),
            S::sensor("voltage_l1", 13011, U16, 0.1),
            S::sensor("voltage_l2", 13012, U16, 0.1),
            S::sensor("voltage_l3", 13013, U16, 0.1),
            S::sensor("current_l1", 13014, I16, 0.1),
            S::sensor("current_l2", 13015, I16, 0.1),
            S::sensor("current_l3", 13016, I16, 0.1),
            S::sensor("grid_frequency", 13017, U16, 0.01),
            S::sensor("active_power_l1", 13018, I16, 1.0),
            S::sensor("active_power_l2", 13019, I16, 1.0),
            S::sensor("active_power_l3", 13020, I16, 1.0),
            S::sensor("power", 13021, I32, 1.0),
            S::sensor("ac_power_total", 13023, I16, 1.0),
            S::sensor("capacity", 13025, U32, 0.1),
            S::sensor("cycles", 13027, U32, 1.0),
            S::sensor("phase_currents_sum", 13029, I16, 0.1),
            S::sensor("soc", 13030, U16, 0.1),
            S::sensor("apparent_power", 13031, U16, 1.0),
            S::sensor("reactive_power", 13032, I16, 1.0),
            S::sensor("power_factor", 13033, I16, 0.001),
            S::new("enabled", EntityType::Switch, SWITCH_ADDRESS, Bool, 1.0),
        ]
    }

    fn default_smartmeter_specs() -> Vec<ItemSpec> {
        use DataType::*;
        use ItemSpec as S;

        vec![
            S::sensor("smartmeter_voltage_l1", 13035, U16, 0.1),
            S::sensor("smartmeter_voltage_l2", 13036, U16, 0.1),
            S::sensor("smartmeter_voltage_l3", 13037, U16, 0.1),
            S::sensor("smartmeter_current_l1", 13038, I16, 0.1),
            S::sensor("smartmeter_current_l2", 13039, I16, 0.1),
            S::sensor("smartmeter_current_l3", 13040, I16, 0.1),
            S::sensor("smartmeter_total_power", 13041, I32, 1.0),
        ]
    }
}
