pub mod aggregator;    // Cross-battery combined values
pub mod catalog;       // Register item catalog and defaults
pub mod channels;      // Inter-component communication channels
pub mod config;        // Configuration management
pub mod coordinator;   // Per-battery poll loop and commands
pub mod error;         // Error handling helpers
pub mod home_assistant; // External sensor source (HA states API)
pub mod items;         // Register items and value conversion
pub mod options;       // Command line options parsing
pub mod pilot;         // Grid-following power controller
pub mod prelude;       // Common imports and types
pub mod sax;           // SAX Modbus TCP protocol and transport
pub mod snapshot;      // Published snapshot stores
pub mod utils;         // Utility functions

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use std::collections::HashMap;
use std::io::Write;

use crate::aggregator::SystemRegistry;
use crate::catalog::Catalog;
use crate::coordinator::Coordinator;
use crate::home_assistant::StatesClient;
use crate::pilot::Pilot;
use crate::sax::transport::Transport;
use crate::snapshot::SnapshotStore;

/// Everything `app` starts, held so shutdown can walk the components in
/// order: pilot first, then the poll loops, then the sockets.
pub struct Components {
    pub coordinators: Vec<Coordinator>,
    pub pilot: Option<Pilot>,
    pub transports: Vec<Arc<Transport>>,
    pub channels: Channels,
}

impl Components {
    pub async fn stop(&self) {
        info!("Stopping all components...");

        if let Some(pilot) = &self.pilot {
            pilot.stop();
        }
        for coordinator in &self.coordinators {
            coordinator.stop();
        }
        futures::future::join_all(self.transports.iter().map(|transport| transport.close())).await;

        info!("Shutdown complete");
    }
}

pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, options: Options) -> Result<()> {
    // Permissive filter, gated by set_max_level below. RUST_LOG still
    // overrides the filter entirely.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();
    log::set_max_level(log::LevelFilter::Info);

    info!(
        "sax-bridge {} starting with config file {}",
        CARGO_PKG_VERSION, options.config_file
    );

    let config = ConfigWrapper::new(options.config_file)?;

    match config.loglevel().parse() {
        Ok(level) => log::set_max_level(level),
        Err(_) => warn!("unknown loglevel {}, staying at info", config.loglevel()),
    }

    let channels = Channels::new();
    let catalog = Catalog::load(config.items_file())?;

    let batteries = config.enabled_batteries();
    if batteries.is_empty() {
        bail!("no enabled batteries configured");
    }

    let mut stores = HashMap::new();
    for battery in &batteries {
        stores.insert(battery.name().to_string(), SnapshotStore::new());
    }

    let master_name = config
        .master_battery()
        .map(|battery| battery.name().to_string())
        .ok_or_else(|| anyhow!("no enabled master battery configured"))?;

    let registry = SystemRegistry::new(stores.clone(), master_name);

    let pilot_enabled = config.pilot_enabled();
    let limit_power = config.limit_power();

    let mut components = Components {
        coordinators: Vec::new(),
        pilot: None,
        transports: Vec::new(),
        channels: channels.clone(),
    };
    let mut handles = Vec::new();
    let mut master: Option<Coordinator> = None;

    for battery in &batteries {
        let transport = Arc::new(Transport::new(battery));
        let items = catalog.items_for(battery, pilot_enabled, limit_power);
        let smartmeter_items = catalog.smartmeter_items(battery);
        let store = stores
            .get(battery.name())
            .cloned()
            .ok_or_else(|| anyhow!("no snapshot store for {}", battery.name()))?;

        let coordinator = Coordinator::new(
            battery.clone(),
            channels.clone(),
            transport.clone(),
            items,
            smartmeter_items,
            store,
            registry.clone(),
        );

        if battery.master() {
            master = Some(coordinator.clone());
        }

        let coordinator_clone = coordinator.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = coordinator_clone.start().await {
                error!(
                    "coordinator {} failed: {:?}",
                    coordinator_clone.battery_name(),
                    err
                );
            }
        }));

        components.transports.push(transport);
        components.coordinators.push(coordinator);
    }

    if pilot_enabled {
        let master = master
            .clone()
            .ok_or_else(|| anyhow!("pilot requires a master battery"))?;
        let source = config
            .sensor_source()
            .ok_or_else(|| anyhow!("pilot requires a sensor_source"))?;
        let states = StatesClient::new(&source)?;

        let pilot = Pilot::new(
            config.clone(),
            channels.clone(),
            registry.clone(),
            master,
            states,
        );
        let pilot_clone = pilot.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = pilot_clone.start().await {
                error!("pilot failed: {:?}", err);
            }
        }));
        components.pilot = Some(pilot);
    }

    match options.runtime {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("runtime limit reached"),
                _ = shutdown_rx.recv() => info!("shutdown signal received"),
            }
        }
        None => {
            let _ = shutdown_rx.recv().await;
            info!("shutdown signal received");
        }
    }

    components.stop().await;

    for handle in handles {
        if let Err(err) = handle.await {
            error!("error waiting for task: {}", err);
        }
    }

    info!("Application shutdown complete");
    Ok(())
}
