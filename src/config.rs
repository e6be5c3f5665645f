use crate::prelude::*;

use serde::Deserialize;
use serde_with::serde_as;
use std::sync::{Arc, Mutex};

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub batteries: Vec<Battery>,

    #[serde(default)]
    pub pilot: Pilot,

    pub sensor_source: Option<SensorSource>,

    #[serde(default)]
    pub limit_power: bool,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    /// Optional JSON file overriding the built-in register catalog
    pub items_file: Option<String>,
}

// Battery {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Battery {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub name: String,
    pub host: String,
    #[serde(default = "Battery::default_port")]
    pub port: u16,
    #[serde(default = "Battery::default_unit_id")]
    pub unit_id: u8,

    #[serde(default)]
    pub master: bool,

    pub poll_interval_secs: Option<u64>,
    pub use_tcp_nodelay: Option<bool>,
}

impl Battery {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn master(&self) -> bool {
        self.master
    }

    /// The master carries the grid signal the pilot steers by and polls
    /// faster than the other batteries.
    pub fn poll_interval_secs(&self) -> u64 {
        self.poll_interval_secs
            .unwrap_or(if self.master { 10 } else { 60 })
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.use_tcp_nodelay.unwrap_or(true)
    }

    fn default_port() -> u16 {
        502
    }

    fn default_unit_id() -> u8 {
        1
    }
}
// }}}

// Pilot {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Pilot {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "Pilot::default_min_soc")]
    pub min_soc: f64,

    #[serde(default = "Pilot::default_interval_secs")]
    pub interval_secs: u64,

    pub solar_charging: Option<bool>,

    #[serde(default)]
    pub manual_mode: bool,

    pub power_sensor: Option<String>,
    pub power_factor_sensor: Option<String>,

    #[serde(default = "Vec::new")]
    pub priority_devices: Vec<String>,
}

impl Pilot {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn min_soc(&self) -> f64 {
        self.min_soc
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    pub fn solar_charging(&self) -> bool {
        self.solar_charging.unwrap_or(true)
    }

    pub fn manual_mode(&self) -> bool {
        self.manual_mode
    }

    pub fn power_sensor(&self) -> Option<String> {
        self.power_sensor.clone()
    }

    pub fn power_factor_sensor(&self) -> Option<String> {
        self.power_factor_sensor.clone()
    }

    pub fn priority_devices(&self) -> Vec<String> {
        self.priority_devices.clone()
    }

    fn default_min_soc() -> f64 {
        15.0
    }

    fn default_interval_secs() -> u64 {
        60
    }
}

impl Default for Pilot {
    fn default() -> Self {
        Self {
            enabled: false,
            min_soc: Self::default_min_soc(),
            interval_secs: Self::default_interval_secs(),
            solar_charging: None,
            manual_mode: false,
            power_sensor: None,
            power_factor_sensor: None,
            priority_devices: Vec::new(),
        }
    }
}
// }}}

// SensorSource {{{
#[derive(Clone, Debug, Deserialize)]
pub struct SensorSource {
    pub base_url: String,
    pub token: String,
}

impl SensorSource {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}
// }}}

#[derive(Debug)]
pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    pub fn batteries(&self) -> Vec<Battery> {
        self.config.lock().unwrap().batteries.clone()
    }

    pub fn enabled_batteries(&self) -> Vec<Battery> {
        self.batteries().into_iter().filter(|b| b.enabled()).collect()
    }

    pub fn master_battery(&self) -> Option<Battery> {
        self.enabled_batteries().into_iter().find(|b| b.master())
    }

    pub fn battery_with_name(&self, name: &str) -> Option<Battery> {
        self.batteries().into_iter().find(|b| b.name() == name)
    }

    pub fn pilot(&self) -> Pilot {
        self.config.lock().unwrap().pilot.clone()
    }

    pub fn pilot_enabled(&self) -> bool {
        self.config.lock().unwrap().pilot.enabled
    }

    pub fn set_pilot(&self, new: Pilot) {
        self.config.lock().unwrap().pilot = new;
    }

    pub fn sensor_source(&self) -> Option<SensorSource> {
        self.config.lock().unwrap().sensor_source.clone()
    }

    pub fn limit_power(&self) -> bool {
        self.config.lock().unwrap().limit_power
    }

    pub fn loglevel(&self) -> String {
        self.config.lock().unwrap().loglevel.clone()
    }

    pub fn items_file(&self) -> Option<String> {
        self.config.lock().unwrap().items_file.clone()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error_with_source!(err, "error reading {}", file))?;

        let config: Self = serde_yaml::from_str(&content)
            .map_err(|err| file_error_with_source!(err, "error parsing {}", file))?;

        info!("Configuration loaded successfully:");
        info!(
            "  Batteries: {} configured, {} enabled",
            config.batteries.len(),
            config.batteries.iter().filter(|b| b.enabled).count()
        );
        for (i, battery) in config.batteries.iter().enumerate() {
            info!("    Battery[{}]:", i);
            info!("      Name: {}", battery.name);
            info!("      Enabled: {}", battery.enabled);
            info!("      Host: {}", battery.host);
            info!("      Port: {}", battery.port);
            info!("      Unit ID: {}", battery.unit_id);
            info!("      Master: {}", battery.master);
            info!("      Poll Interval: {}s", battery.poll_interval_secs());
            info!("      TCP NoDelay: {}", battery.use_tcp_nodelay());
        }

        info!(
            "  Pilot: {}",
            if config.pilot.enabled { "enabled" } else { "disabled" }
        );
        if config.pilot.enabled {
            info!("    Min SOC: {}%", config.pilot.min_soc);
            info!("    Interval: {}s", config.pilot.interval_secs);
            info!("    Solar Charging: {}", config.pilot.solar_charging());
            info!("    Manual Mode: {}", config.pilot.manual_mode);
            info!(
                "    Power Sensor: {}",
                config.pilot.power_sensor.as_deref().unwrap_or("")
            );
            info!(
                "    Power Factor Sensor: {}",
                config.pilot.power_factor_sensor.as_deref().unwrap_or("")
            );
            info!(
                "    Priority Devices: {}",
                config.pilot.priority_devices.len()
            );
        }

        info!(
            "  Sensor Source: {}",
            if config.sensor_source.is_some() { "configured" } else { "none" }
        );
        info!("  Power Limits: {}", config.limit_power);
        info!("  Log Level: {}", config.loglevel);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.batteries.is_empty() {
            bail!("config.rs:at least one battery must be configured");
        }

        let mut names = std::collections::HashSet::new();
        for battery in &self.batteries {
            if battery.name.is_empty() {
                bail!("config.rs:battery name cannot be empty");
            }
            if !names.insert(battery.name.as_str()) {
                bail!("config.rs:duplicate battery name {}", battery.name);
            }
            if battery.host.is_empty() {
                bail!("config.rs:battery {} host cannot be empty", battery.name);
            }
            if battery.port == 0 {
                bail!(
                    "config.rs:battery {} port must be between 1 and 65535",
                    battery.name
                );
            }
        }

        let masters = self
            .batteries
            .iter()
            .filter(|b| b.enabled && b.master)
            .count();
        if masters != 1 {
            bail!(
                "config.rs:exactly one enabled battery must be master, found {}",
                masters
            );
        }

        if let Some(source) = &self.sensor_source {
            url::Url::parse(&source.base_url)
                .map_err(|err| file_error_with_source!(err, "invalid sensor_source.base_url"))?;
        }

        if self.pilot.enabled {
            if self.pilot.power_sensor.is_none() {
                bail!("config.rs:pilot.power_sensor is required when the pilot is enabled");
            }
            if self.sensor_source.is_none() {
                bail!("config.rs:sensor_source is required when the pilot is enabled");
            }
            if !(0.0..=100.0).contains(&self.pilot.min_soc) {
                bail!("config.rs:pilot.min_soc must be between 0 and 100");
            }
            if self.pilot.interval_secs == 0 {
                bail!("config.rs:pilot.interval_secs must be positive");
            }
        }

        Ok(())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_enabled() -> bool {
        true
    }
}
