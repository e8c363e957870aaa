mod common;

use common::FakeBus;
use eos::config::{Config, ConsumerConfig, StageConfig};
use eos::engine::EnergyEngine;
use std::sync::Arc;
use std::time::Duration;

fn heater_config() -> Config {
    let mut config = Config::default();
    config.precharge.enabled = false;
    config.consumers = vec![ConsumerConfig {
        name: "water_heater".to_string(),
        tracker: None,
        phase: None,
        can_be_turned_off: true,
        stages: vec![StageConfig {
            usage_w: 1600.0,
            switch: "switch.heater_1600".to_string(),
        }],
    }];
    config
}

async fn wait_for_call(bus: &FakeBus, needle: &str) -> bool {
    for _ in 0..200 {
        if bus.calls().iter().any(|c| c == needle) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn engine_starts_clean_and_shuts_down() {
    let bus = Arc::new(FakeBus::new());
    let mut engine = EnergyEngine::new(heater_config(), bus.clone()).unwrap();

    // Queue the shutdown before running; the loop drains it after startup
    engine.shutdown_handle().send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), engine.run())
        .await
        .unwrap()
        .unwrap();

    // Startup forces every configured stage off
    assert!(wait_for_call(&bus, "turn_off switch.heater_1600").await);

    // And wires up the storage controller selects
    assert!(
        wait_for_call(
            &bus,
            "select select.pv_storage_ac_charge_policy Always Allowed"
        )
        .await
    );
    assert!(
        wait_for_call(
            &bus,
            "select select.pv_storage_control_mode Remote Control"
        )
        .await
    );
}

#[tokio::test]
async fn invalid_configuration_fails_construction() {
    let mut config = heater_config();
    // Ascending stage order breaks the scheduler's invariant
    config.consumers[0].stages = vec![
        StageConfig {
            usage_w: 800.0,
            switch: "switch.heater_800".to_string(),
        },
        StageConfig {
            usage_w: 1600.0,
            switch: "switch.heater_1600".to_string(),
        },
    ];
    let bus = Arc::new(FakeBus::new());
    assert!(EnergyEngine::new(config, bus).is_err());
}
