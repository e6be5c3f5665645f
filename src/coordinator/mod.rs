use crate::prelude::*;

pub mod commands;

use crate::aggregator::SystemRegistry;
use crate::config;
use crate::items::RegisterItem;
use crate::sax::transport::Transport;
use crate::snapshot::SnapshotValues;

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Shutdown,
    SnapshotPublished(String),
}

/// Owns the poll loop for one battery: reads every catalog item on a fixed
/// interval, evaluates calculated items, and publishes the batch as one
/// atomic snapshot.
#[derive(Clone)]
pub struct Coordinator {
    battery: config::Battery,
    channels: Channels,
    transport: Arc<Transport>,
    items: Arc<Vec<Item>>,
    smartmeter_items: Arc<Vec<Item>>,
    store: SnapshotStore,
    registry: SystemRegistry,
}

impl Coordinator {
    pub fn new(
        battery: config::Battery,
        channels: Channels,
        transport: Arc<Transport>,
        items: Vec<Item>,
        smartmeter_items: Vec<Item>,
        store: SnapshotStore,
        registry: SystemRegistry,
    ) -> Self {
        Self {
            battery,
            channels,
            transport,
            items: Arc::new(items),
            smartmeter_items: Arc::new(smartmeter_items),
            store,
            registry,
        }
    }

    pub fn battery_name(&self) -> &str {
        self.battery.name()
    }

    pub fn is_master(&self) -> bool {
        self.battery.master()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &SystemRegistry {
        &self.registry
    }

    /// Item lookup by unprefixed key, eg `soc` for battery_a resolves the
    /// item named `battery_a_soc`. Calculated items carry system-level
    /// names and match the key directly.
    pub fn register_item(&self, key: &str) -> Option<Item> {
        let name = format!("{}_{}", self.battery.name(), key);
        self.items
            .iter()
            .find(|item| item.name() == name || item.name() == key)
            .cloned()
    }

    pub async fn start(&self) -> Result<()> {
        let interval = self.battery.poll_interval_secs();
        info!(
            "{}:starting poll loop, interval {}s, {} items",
            self.battery.name(),
            interval,
            self.items.len()
        );

        let mut receiver = self.channels.to_coordinator.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_cycle().await {
                        warn!("{}:poll cycle failed: {:?}", self.battery.name(), err);
                    }
                }
                message = receiver.recv() => {
                    match message {
                        Ok(ChannelData::Shutdown) => break,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(amount)) => {
                            warn!("{}:lagged {} messages", self.battery.name(), amount);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        info!("{}:poll loop stopped", self.battery.name());
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_coordinator.send(ChannelData::Shutdown);
    }

    /// One poll cycle. Single-item failures leave a gap in the snapshot;
    /// only an unrecovered connection loss fails the whole cycle.
    pub async fn run_cycle(&self) -> Result<()> {
        if self.transport.should_force_reconnect() {
            warn!(
                "{}:connection unhealthy, forcing reconnect",
                self.battery.name()
            );
            self.transport.close().await;
        }

        let mut values = SnapshotValues::new();

        if self.battery.master() {
            self.read_smartmeter_items(&mut values).await;
        }

        for item in self.items.iter() {
            let Item::Register(register) = item else {
                continue;
            };
            if !register.is_readable() {
                continue;
            }
            let read = self.read_with_recovery(register).await?;
            values.insert(register.name().to_string(), read);
        }

        // Calculated items see the previous snapshots; this cycle's batch
        // is not published yet.
        for item in self.items.iter() {
            let Item::Calculated(calculated) = item else {
                continue;
            };
            values.insert(
                calculated.name().to_string(),
                calculated.calculate(&self.registry),
            );
        }

        self.store.publish(values);
        let _ = self
            .channels
            .from_coordinator
            .send(ChannelData::SnapshotPublished(
                self.battery.name().to_string(),
            ));

        Ok(())
    }

    /// A lost connection gets one reconnect and retry. A second loss on the
    /// same item aborts the cycle so the backoff in the transport applies.
    async fn read_with_recovery(&self, item: &RegisterItem) -> Result<Option<Value>> {
        match item.read(self.transport.as_ref()).await {
            ItemRead::Value(value) => Ok(Some(value)),
            ItemRead::Absent => Ok(None),
            ItemRead::ConnectionLost => {
                warn!(
                    "{}:connection lost reading {}, reconnecting",
                    self.battery.name(),
                    item.name()
                );
                self.transport.reconnect_on_error().await;

                match item.read(self.transport.as_ref()).await {
                    ItemRead::Value(value) => Ok(Some(value)),
                    ItemRead::Absent => Ok(None),
                    ItemRead::ConnectionLost => bail!(
                        "{}:read of {} failed after reconnect",
                        self.battery.name(),
                        item.name()
                    ),
                }
            }
        }
    }

    /// Smart-meter registers live behind the master. Failures here never
    /// fail the cycle.
    async fn read_smartmeter_items(&self, values: &mut SnapshotValues) {
        for item in self.smartmeter_items.iter() {
            let Item::Register(register) = item else {
                continue;
            };
            let read = match register.read(self.transport.as_ref()).await {
                ItemRead::Value(value) => Some(value),
                ItemRead::Absent => None,
                ItemRead::ConnectionLost => {
                    warn!(
                        "{}:smart meter read of {} failed",
                        self.battery.name(),
                        register.name()
                    );
                    None
                }
            };
            values.insert(register.name().to_string(), read);
        }
    }

    pub async fn read_item(&self, key: &str) -> Result<Option<Value>> {
        commands::read_item::ReadItem::new(self.clone(), key.to_string())
            .run()
            .await
    }

    pub async fn write_number(&self, key: &str, value: f64) -> Result<()> {
        commands::write_number::WriteNumber::new(self.clone(), key.to_string(), value)
            .run()
            .await
    }

    pub async fn write_switch(&self, key: &str, on: bool) -> Result<()> {
        commands::write_switch::WriteSwitch::new(self.clone(), key.to_string(), on)
            .run()
            .await
    }

    pub async fn write_pilot_power(&self, power: i32, power_factor: f64) -> Result<()> {
        commands::write_pilot_power::WritePilotPower::new(self.clone(), power, power_factor)
            .run()
            .await
    }

    pub async fn set_power_limit(&self, key: &str, watts: u16) -> Result<()> {
        commands::set_power_limit::SetPowerLimit::new(self.clone(), key.to_string(), watts)
            .run()
            .await
    }
}
