use crate::prelude::*;

use crate::aggregator::SystemRegistry;
use crate::catalog;
use crate::coordinator::Coordinator;
use crate::home_assistant::StatesClient;

/// Above this draw from priority devices the battery stands down entirely.
pub const PRIORITY_POWER_THRESHOLD_W: f64 = 50.0;

/// Hardware envelope per battery. Charging tops out at 3600W, discharging
/// at 4500W.
pub const CHARGE_LIMIT_W_PER_BATTERY: f64 = 3600.0;
pub const DISCHARGE_LIMIT_W_PER_BATTERY: f64 = 4500.0;

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    ConfigUpdated,
    Shutdown,
}

#[derive(Default)]
struct PilotState {
    running: bool,
    last_power: Option<f64>,
    manual_power: f64,
}

/// Closed-loop controller steering the battery fleet toward zero grid
/// exchange. Reads the grid sensors each tick, computes a target power and
/// writes it through the master coordinator.
#[derive(Clone)]
pub struct Pilot {
    config: ConfigWrapper,
    channels: Channels,
    registry: SystemRegistry,
    master: Coordinator,
    states: StatesClient,
    state: Arc<tokio::sync::Mutex<PilotState>>,
}

impl Pilot {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        registry: SystemRegistry,
        master: Coordinator,
        states: StatesClient,
    ) -> Self {
        Self {
            config,
            channels,
            registry,
            master,
            states,
            state: Arc::new(tokio::sync::Mutex::new(PilotState::default())),
        }
    }

    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.running {
                info!("pilot:already running");
                return Ok(());
            }
            state.running = true;
        }

        let mut receiver = self.channels.to_pilot.subscribe();
        let mut interval_secs = self.config.pilot().interval_secs();
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("pilot:starting, interval {}s", interval_secs);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_update().await,
                message = receiver.recv() => {
                    match message {
                        Ok(ChannelData::ConfigUpdated) => {
                            info!("pilot:config updated");
                            let new_interval = self.config.pilot().interval_secs();
                            if new_interval != interval_secs {
                                interval_secs = new_interval;
                                info!("pilot:interval changed to {}s", interval_secs);
                                // a fresh interval ticks immediately, which
                                // doubles as the post-update run
                                ticker = tokio::time::interval(Duration::from_secs(interval_secs));
                                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                            } else {
                                self.run_update().await;
                            }
                        }
                        Ok(ChannelData::Shutdown) => break,
                        Err(broadcast::error::RecvError::Lagged(amount)) => {
                            warn!("pilot:lagged {} messages", amount);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        self.state.lock().await.running = false;
        info!("pilot:stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_pilot.send(ChannelData::Shutdown);
    }

    /// A bad tick must never take the control loop down.
    async fn run_update(&self) {
        if let Err(err) = self.try_update().await {
            warn!("pilot:update failed: {:?}", err);
        }
    }

    async fn try_update(&self) -> Result<()> {
        let pilot = self.config.pilot();

        if pilot.manual_mode() {
            return self.revalidate_manual_power().await;
        }

        let Some(power_sensor) = pilot.power_sensor() else {
            bail!("power_sensor is not configured");
        };

        // No fresh measurement, no new command. The battery keeps doing
        // whatever it was last told.
        let Some(grid_power) = self.states.numeric_state(&power_sensor).await? else {
            warn!("pilot:sensor {} unavailable, skipping tick", power_sensor);
            return Ok(());
        };

        let power_factor = match pilot.power_factor_sensor() {
            Some(sensor) => match self.states.numeric_state(&sensor).await? {
                Some(value) => value,
                None => {
                    warn!("pilot:sensor {} unavailable, skipping tick", sensor);
                    return Ok(());
                }
            },
            None => 1.0,
        };

        let priority_power = self.priority_power().await;
        let net_power = if priority_power > PRIORITY_POWER_THRESHOLD_W {
            info!(
                "pilot:priority devices drawing {:.0}W, standing down",
                priority_power
            );
            0.0
        } else {
            let battery_power = self
                .registry
                .master_store()
                .and_then(|store| store.numeric(catalog::COMBINED_POWER_KEY))
                .unwrap_or(0.0);
            grid_power - battery_power
        };

        let target = compute_target(net_power);
        let clamped = clamp_to_envelope(target, self.registry.battery_count());
        let constrained = self.soc_constrained(clamped);

        let last = self.state.lock().await.last_power;
        if last != Some(constrained) {
            info!(
                "pilot:target {:.0}W (grid {:.0}W, net {:.0}W, soc {:.1}%)",
                constrained,
                grid_power,
                net_power,
                self.registry.combined_soc().unwrap_or(0.0)
            );
        }

        if !pilot.solar_charging() {
            debug!("pilot:solar charging disabled, not sending {:.0}W", constrained);
            return Ok(());
        }

        self.send_power(constrained, power_factor).await
    }

    /// Manual mode skips the computation but not the safety constraints.
    /// A SOC drift can shrink the allowed power to zero under our feet.
    async fn revalidate_manual_power(&self) -> Result<()> {
        let (manual, last) = {
            let state = self.state.lock().await;
            (state.manual_power, state.last_power)
        };

        let constrained = self.soc_constrained(manual);
        if Some(constrained) != last {
            info!(
                "pilot:manual power {:.0}W re-validated to {:.0}W, re-sending",
                manual, constrained
            );
            self.send_power(constrained, 1.0).await?;
        }

        Ok(())
    }

    pub async fn set_manual_power(&self, power: f64) -> Result<()> {
        self.state.lock().await.manual_power = power;
        let constrained = self.soc_constrained(power);
        info!("pilot:manual power set to {:.0}W", constrained);
        self.send_power(constrained, 1.0).await
    }

    pub async fn set_charge_power_limit(&self, watts: u16) -> Result<()> {
        if !self.config.limit_power() {
            bail!("power limit control is disabled");
        }
        self.master.set_power_limit("max_charge", watts).await
    }

    pub async fn set_discharge_power_limit(&self, watts: u16) -> Result<()> {
        if !self.config.limit_power() {
            bail!("power limit control is disabled");
        }
        self.master.set_power_limit("max_discharge", watts).await
    }

    async fn send_power(&self, power: f64, power_factor: f64) -> Result<()> {
        self.master
            .write_pilot_power(power.round() as i32, power_factor)
            .await?;
        self.state.lock().await.last_power = Some(power);
        Ok(())
    }

    /// Total draw of the configured priority devices. Unreadable devices
    /// count as zero.
    async fn priority_power(&self) -> f64 {
        let mut total = 0.0;
        for entity_id in self.config.pilot().priority_devices() {
            match self.states.numeric_state(&entity_id).await {
                Ok(Some(power)) => total += power,
                Ok(None) => {}
                Err(err) => warn!("pilot:priority device {} read failed: {}", entity_id, err),
            }
        }
        total
    }

    fn soc_constrained(&self, target: f64) -> f64 {
        let soc = self.registry.combined_soc().unwrap_or(0.0);
        apply_soc_constraints(target, soc, self.config.pilot().min_soc())
    }
}

/// Positive target discharges, negative charges. The grid sign convention
/// is the opposite, import is positive.
pub fn compute_target(net_power: f64) -> f64 {
    -net_power
}

pub fn clamp_to_envelope(target: f64, battery_count: usize) -> f64 {
    let count = battery_count as f64;
    target.clamp(
        -CHARGE_LIMIT_W_PER_BATTERY * count,
        DISCHARGE_LIMIT_W_PER_BATTERY * count,
    )
}

/// Discharging below the SOC floor and charging a full battery both
/// collapse the target to zero. Applying this twice changes nothing.
pub fn apply_soc_constraints(target: f64, soc: f64, min_soc: f64) -> f64 {
    if soc < min_soc && target > 0.0 {
        return 0.0;
    }
    if soc >= 100.0 && target < 0.0 {
        return 0.0;
    }
    target
}
