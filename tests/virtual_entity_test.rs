mod common;

use common::FakeBus;
use eos::config::{SetpointServiceConfig, VirtualEntityConfig};
use eos::virtual_entity::VirtualEntityController;
use std::sync::Arc;

fn charger_config(events: &[&str]) -> VirtualEntityConfig {
    VirtualEntityConfig {
        id: "car_charger".to_string(),
        usage_ceiling_w: 1600.0,
        tracker: Some("sensor.car_charger_power".to_string()),
        events: events.iter().map(|e| e.to_string()).collect(),
        setpoint: SetpointServiceConfig {
            domain: "number".to_string(),
            service: "set_value".to_string(),
            entity_id: "number.wallbox_grid_setpoint".to_string(),
            field: "value".to_string(),
        },
        release_setpoint_w: 11000.0,
        block_setpoint_w: 0.0,
    }
}

fn controller(bus: Arc<FakeBus>, events: &[&str]) -> VirtualEntityController {
    VirtualEntityController::from_config(&[charger_config(events)], bus)
}

#[tokio::test]
async fn export_update_pushes_residual_surplus() {
    let bus = Arc::new(FakeBus::new());
    bus.set_state("sensor.car_charger_power", "300");
    let mut ctrl = controller(bus, &["import_update", "export_update", "switched"]);

    ctrl.set_switched("car_charger", true).await;

    // 2000 W export, 1600 W ceiling, 300 W own draw: -(1600 - 300)
    let commands = ctrl.on_export_update(2000.0).await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].entity_id, "number.wallbox_grid_setpoint");
    assert!((commands[0].value_w - -1300.0).abs() < 1e-9);
}

#[tokio::test]
async fn unparseable_tracker_defaults_to_zero_draw() {
    let bus = Arc::new(FakeBus::new());
    bus.set_state("sensor.car_charger_power", "unavailable");
    let mut ctrl = controller(bus, &["export_update", "switched"]);

    ctrl.set_switched("car_charger", true).await;

    let commands = ctrl.on_export_update(2000.0).await;
    assert!((commands[0].value_w - -1600.0).abs() < 1e-9);
}

#[tokio::test]
async fn import_update_passes_the_deficit_through() {
    let bus = Arc::new(FakeBus::new());
    let mut ctrl = controller(bus, &["import_update", "export_update", "switched"]);

    ctrl.set_switched("car_charger", true).await;

    let commands = ctrl.on_import_update(450.0).await;
    assert_eq!(commands.len(), 1);
    assert!((commands[0].value_w - 450.0).abs() < 1e-9);
}

#[tokio::test]
async fn switched_emits_sentinel_setpoints() {
    let bus = Arc::new(FakeBus::new());
    let mut ctrl = controller(bus, &["export_update", "switched"]);

    // Enabling fully restricts the actuator until the next surplus update
    let on_commands = ctrl.set_switched("car_charger", true).await;
    assert_eq!(on_commands.len(), 1);
    assert_eq!(on_commands[0].value_w, 0.0);
    assert_eq!(ctrl.is_on("car_charger"), Some(true));

    // Disabling releases the constraint entirely
    let off_commands = ctrl.set_switched("car_charger", false).await;
    assert_eq!(off_commands.len(), 1);
    assert_eq!(off_commands[0].value_w, 11000.0);
    assert_eq!(ctrl.is_on("car_charger"), Some(false));
}

#[tokio::test]
async fn inactive_entities_receive_no_events() {
    let bus = Arc::new(FakeBus::new());
    let ctrl = controller(bus, &["import_update", "export_update", "switched"]);

    // Never switched on
    assert!(ctrl.on_export_update(2000.0).await.is_empty());
    assert!(ctrl.on_import_update(450.0).await.is_empty());
}

#[tokio::test]
async fn undeclared_handlers_never_fire() {
    let bus = Arc::new(FakeBus::new());
    let mut ctrl = controller(bus, &["switched"]);

    ctrl.set_switched("car_charger", true).await;

    assert!(ctrl.on_export_update(2000.0).await.is_empty());
    assert!(ctrl.on_import_update(450.0).await.is_empty());
}

#[tokio::test]
async fn unknown_entity_is_ignored() {
    let bus = Arc::new(FakeBus::new());
    let mut ctrl = controller(bus, &["switched"]);

    assert!(ctrl.set_switched("pool_pump", true).await.is_empty());
    assert_eq!(ctrl.is_on("pool_pump"), None);
}
