mod common;
use common::*;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sax_bridge::aggregator::SystemRegistry;
use sax_bridge::catalog::Catalog;
use sax_bridge::channels::Channels;
use sax_bridge::config::ConfigWrapper;
use sax_bridge::coordinator::Coordinator;
use sax_bridge::home_assistant::StatesClient;
use sax_bridge::items::Value;
use sax_bridge::pilot::Pilot;
use sax_bridge::sax::transport::Transport;
use sax_bridge::snapshot::{SnapshotStore, SnapshotValues};

/// Wires a pilot to a master coordinator the way the application does,
/// against whatever battery the config names.
fn assemble(config: ConfigWrapper) -> (Pilot, SnapshotStore) {
    let catalog = Catalog::defaults();
    let channels = Channels::new();
    let battery = config.master_battery().unwrap();

    let store = SnapshotStore::new();
    let mut stores = HashMap::new();
    stores.insert(battery.name().to_string(), store.clone());
    let registry = SystemRegistry::new(stores, battery.name().to_string());

    let items = catalog.items_for(&battery, config.pilot_enabled(), config.limit_power());
    let smartmeter_items = catalog.smartmeter_items(&battery);
    let transport = Arc::new(Transport::new(&battery));

    let master = Coordinator::new(
        battery,
        channels.clone(),
        transport,
        items,
        smartmeter_items,
        store.clone(),
        registry.clone(),
    );

    let states = StatesClient::new(&config.sensor_source().unwrap()).unwrap();
    let pilot = Pilot::new(config, channels, registry, master, states);
    (pilot, store)
}

fn config_for(device: &FakeDevice, server_url: &str, pilot_section: &str) -> ConfigWrapper {
    Factory::config_wrapper(&format!(
        r#"
        batteries:
          - name: battery_a
            host: localhost
            port: {}
            master: true
        sensor_source:
          base_url: {}
          token: test-token
        {}
        "#,
        device.port, server_url, pilot_section,
    ))
}

fn seed(store: &SnapshotStore, soc: f64, battery_power: f64) {
    let mut values = SnapshotValues::new();
    values.insert("battery_a_soc".to_string(), Some(Value::Float(soc)));
    values.insert(
        "combined_power".to_string(),
        Some(Value::Float(battery_power)),
    );
    store.publish(values);
}

async fn wait_for_writes(device: &FakeDevice, count: usize) -> Vec<(u16, Vec<u16>)> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let writes = device.writes();
        if writes.len() >= count {
            return writes;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("saw only {:?} before the deadline", writes);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn run_one_tick(pilot: &Pilot) {
    let subject = pilot.clone();
    let handle = tokio::spawn(async move { subject.start().await });
    // the first tick fires immediately; the default interval keeps a
    // second one out of the test window
    tokio::time::sleep(Duration::from_millis(400)).await;
    pilot.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn balances_the_grid_to_zero() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let grid = server
        .mock("GET", "/api/states/sensor.grid_power")
        .match_header("authorization", "Bearer test-token")
        .with_body(r#"{"state": "500"}"#)
        .create_async()
        .await;

    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          power_sensor: sensor.grid_power
        "#,
    ));
    seed(&store, 50.0, 0.0);

    let subject = pilot.clone();
    let handle = tokio::spawn(async move { subject.start().await });

    // importing 500W steers the battery to discharge 500W, sent with the
    // default power factor
    let writes = wait_for_writes(&device, 1).await;
    assert_eq!(writes, vec![(41, vec![0xFE0C, 10000])]);

    pilot.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    grid.assert_async().await;
    assert_eq!(
        store.get("battery_a_nominal_power"),
        Some(Value::Int(-500))
    );
}

#[tokio::test]
async fn subtracts_what_the_battery_already_does() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let _grid = server
        .mock("GET", "/api/states/sensor.grid_power")
        .with_body(r#"{"state": "200"}"#)
        .create_async()
        .await;

    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          power_sensor: sensor.grid_power
        "#,
    ));
    // already discharging 300W, so the net load is 500W
    seed(&store, 50.0, -300.0);

    let subject = pilot.clone();
    let handle = tokio::spawn(async move { subject.start().await });

    let writes = wait_for_writes(&device, 1).await;
    assert_eq!(writes, vec![(41, vec![0xFE0C, 10000])]);

    pilot.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn sends_the_measured_power_factor() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let _grid = server
        .mock("GET", "/api/states/sensor.grid_power")
        .with_body(r#"{"state": "500"}"#)
        .create_async()
        .await;
    let _pf = server
        .mock("GET", "/api/states/sensor.grid_pf")
        .with_body(r#"{"state": "0.95"}"#)
        .create_async()
        .await;

    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          power_sensor: sensor.grid_power
          power_factor_sensor: sensor.grid_pf
        "#,
    ));
    seed(&store, 50.0, 0.0);

    let subject = pilot.clone();
    let handle = tokio::spawn(async move { subject.start().await });

    let writes = wait_for_writes(&device, 1).await;
    assert_eq!(writes, vec![(41, vec![0xFE0C, 9500])]);

    pilot.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn low_soc_blocks_discharge() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let _grid = server
        .mock("GET", "/api/states/sensor.grid_power")
        .with_body(r#"{"state": "-500"}"#)
        .create_async()
        .await;

    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          power_sensor: sensor.grid_power
        "#,
    ));
    seed(&store, 10.0, 0.0);

    let subject = pilot.clone();
    let handle = tokio::spawn(async move { subject.start().await });

    // exporting 500W would ask for a 500W discharge, but the SOC floor
    // collapses it to zero
    let writes = wait_for_writes(&device, 1).await;
    assert_eq!(writes, vec![(41, vec![0, 10000])]);

    pilot.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn busy_priority_devices_stand_the_battery_down() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let _grid = server
        .mock("GET", "/api/states/sensor.grid_power")
        .with_body(r#"{"state": "500"}"#)
        .create_async()
        .await;
    let _wallbox = server
        .mock("GET", "/api/states/sensor.wallbox_power")
        .with_body(r#"{"state": "80"}"#)
        .create_async()
        .await;

    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          power_sensor: sensor.grid_power
          priority_devices:
            - sensor.wallbox_power
        "#,
    ));
    seed(&store, 50.0, 0.0);

    let subject = pilot.clone();
    let handle = tokio::spawn(async move { subject.start().await });

    let writes = wait_for_writes(&device, 1).await;
    assert_eq!(writes, vec![(41, vec![0, 10000])]);

    pilot.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn unavailable_grid_sensor_skips_the_tick() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let grid = server
        .mock("GET", "/api/states/sensor.grid_power")
        .with_body(r#"{"state": "unavailable"}"#)
        .expect_at_least(1)
        .create_async()
        .await;

    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          power_sensor: sensor.grid_power
        "#,
    ));
    seed(&store, 50.0, 0.0);

    run_one_tick(&pilot).await;

    grid.assert_async().await;
    assert!(device.writes().is_empty());
}

#[tokio::test]
async fn unavailable_power_factor_sensor_skips_the_tick() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let _grid = server
        .mock("GET", "/api/states/sensor.grid_power")
        .with_body(r#"{"state": "500"}"#)
        .create_async()
        .await;
    let pf = server
        .mock("GET", "/api/states/sensor.grid_pf")
        .with_body(r#"{"state": "unknown"}"#)
        .expect_at_least(1)
        .create_async()
        .await;

    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          power_sensor: sensor.grid_power
          power_factor_sensor: sensor.grid_pf
        "#,
    ));
    seed(&store, 50.0, 0.0);

    run_one_tick(&pilot).await;

    pf.assert_async().await;
    assert!(device.writes().is_empty());
}

#[tokio::test]
async fn solar_charging_off_withholds_commands() {
    common_setup();

    let mut server = mockito::Server::new_async().await;
    let grid = server
        .mock("GET", "/api/states/sensor.grid_power")
        .with_body(r#"{"state": "500"}"#)
        .expect_at_least(1)
        .create_async()
        .await;

    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          power_sensor: sensor.grid_power
          solar_charging: false
        "#,
    ));
    seed(&store, 50.0, 0.0);

    run_one_tick(&pilot).await;

    // the target is still computed and logged, just never sent
    grid.assert_async().await;
    assert!(device.writes().is_empty());
}

#[tokio::test]
async fn manual_power_is_soc_constrained() {
    common_setup();

    let server = mockito::Server::new_async().await;
    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          manual_mode: true
          power_sensor: sensor.grid_power
        "#,
    ));

    seed(&store, 10.0, 0.0);
    pilot.set_manual_power(1000.0).await.unwrap();
    assert_eq!(device.writes(), vec![(41, vec![0, 10000])]);

    // charging is still allowed below the floor
    seed(&store, 10.0, 0.0);
    pilot.set_manual_power(-800.0).await.unwrap();
    assert_eq!(device.writes()[1], (41, vec![0xFCE0, 10000]));
}

#[tokio::test]
async fn manual_mode_resends_when_constraints_drift() {
    common_setup();

    let server = mockito::Server::new_async().await;
    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          manual_mode: true
          interval_secs: 1
          power_sensor: sensor.grid_power
        "#,
    ));

    seed(&store, 50.0, 0.0);
    pilot.set_manual_power(1000.0).await.unwrap();
    assert_eq!(device.writes(), vec![(41, vec![0x03E8, 10000])]);

    let subject = pilot.clone();
    let handle = tokio::spawn(async move { subject.start().await });

    // the SOC dropping through the floor shrinks the standing command to
    // zero and the loop pushes the correction out
    seed(&store, 10.0, 0.0);
    let writes = wait_for_writes(&device, 2).await;
    assert_eq!(writes.last(), Some(&(41, vec![0, 10000])));

    pilot.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn power_limits_require_the_feature() {
    common_setup();

    let server = mockito::Server::new_async().await;
    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, _store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        pilot:
          enabled: true
          power_sensor: sensor.grid_power
        "#,
    ));

    let err = pilot.set_charge_power_limit(2000).await.unwrap_err();
    assert!(err.to_string().contains("disabled"));
    assert!(device.writes().is_empty());
}

#[tokio::test]
async fn power_limits_reach_the_device() {
    common_setup();

    let server = mockito::Server::new_async().await;
    let device = FakeDevice::start(DeviceMode::WriteQuirk).await.unwrap();
    let (pilot, store) = assemble(config_for(
        &device,
        &server.url(),
        r#"
        limit_power: true
        pilot:
          enabled: true
          power_sensor: sensor.grid_power
        "#,
    ));

    pilot.set_charge_power_limit(2000).await.unwrap();
    pilot.set_discharge_power_limit(3000).await.unwrap();

    assert_eq!(device.writes(), vec![(44, vec![2000]), (43, vec![3000])]);
    assert_eq!(store.get("battery_a_max_charge"), Some(Value::Int(2000)));
}
