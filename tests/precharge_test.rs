use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use eos::config::PrechargeConfig;
use eos::precharge::{BatterySnapshot, PrechargeController, StorageMode};

const BERLIN: Tz = chrono_tz::Europe::Berlin;

fn controller() -> PrechargeController {
    PrechargeController::new(PrechargeConfig::default(), BERLIN)
}

fn local(hour: u32, minute: u32) -> DateTime<Utc> {
    BERLIN
        .with_ymd_and_hms(2026, 1, 15, hour, minute, 0)
        .unwrap()
        .with_timezone(&Utc)
}

fn battery(usable_kwh: f64, headroom_kwh: f64) -> Option<BatterySnapshot> {
    Some(BatterySnapshot {
        usable_kwh,
        headroom_kwh,
        acceptance_w: 4000.0,
    })
}

#[test]
fn dark_morning_with_empty_battery_charges_from_grid() {
    let ctrl = controller();
    // Sunrise 08:06: two hours and six minutes past the window end at
    // 500 W baseline ~ 1.05 kWh needed, only 0.5 kWh usable
    let decision = ctrl.evaluate(
        local(3, 0),
        battery(0.5, 8.0),
        4.0,
        Some(local(8, 6)),
        false,
    );
    assert_eq!(decision.mode, StorageMode::ChargeFromGridAndPv);
    assert_eq!(decision.charge_limit_w, Some(4000.0));
    assert!(decision.grid_charge_active());
}

#[test]
fn sufficient_battery_holds_through_the_morning() {
    let ctrl = controller();
    let decision = ctrl.evaluate(
        local(3, 0),
        battery(3.0, 8.0),
        4.0,
        Some(local(8, 6)),
        false,
    );
    assert_eq!(decision.mode, StorageMode::Off);
    assert_eq!(decision.charge_limit_w, None);
}

#[test]
fn sunny_forecast_skips_precharging() {
    let ctrl = controller();
    // 20 kWh forecast: half of it already exceeds the 8 kWh headroom
    let decision = ctrl.evaluate(
        local(3, 0),
        battery(0.5, 8.0),
        20.0,
        Some(local(8, 6)),
        false,
    );
    assert_eq!(decision.mode, StorageMode::MaximizeSelfConsumption);
}

#[test]
fn outside_the_window_nothing_happens() {
    let ctrl = controller();
    let decision = ctrl.evaluate(
        local(10, 0),
        battery(0.5, 8.0),
        4.0,
        Some(local(8, 6)),
        false,
    );
    assert_eq!(decision.mode, StorageMode::MaximizeSelfConsumption);
}

#[test]
fn override_charges_while_headroom_remains() {
    let ctrl = controller();
    let decision = ctrl.evaluate(local(14, 0), battery(2.0, 5.0), 4.0, None, true);
    assert_eq!(decision.mode, StorageMode::ChargeFromGridAndPv);
    assert_eq!(decision.charge_limit_w, Some(4000.0));

    // Nearly full: the override stands down
    let decision = ctrl.evaluate(local(14, 0), battery(8.0, 1.0), 4.0, None, true);
    assert_eq!(decision.mode, StorageMode::MaximizeSelfConsumption);
}

#[test]
fn charge_rate_is_bounded_by_acceptance_and_config() {
    let mut config = PrechargeConfig::default();
    config.max_grid_charge_w = 3000.0;
    let ctrl = PrechargeController::new(config, BERLIN);

    let decision = ctrl.evaluate(
        local(3, 0),
        battery(0.5, 8.0),
        4.0,
        Some(local(8, 6)),
        false,
    );
    // min(acceptance 4000, configured 3000)
    assert_eq!(decision.charge_limit_w, Some(3000.0));
}

#[test]
fn no_battery_state_means_self_consumption() {
    let ctrl = controller();
    let decision = ctrl.evaluate(local(3, 0), None, 4.0, Some(local(8, 6)), false);
    assert_eq!(decision.mode, StorageMode::MaximizeSelfConsumption);
}

#[test]
fn forecast_entity_rolls_over_at_the_configured_hour() {
    let ctrl = controller();
    assert_eq!(
        ctrl.forecast_entity(local(1, 0)),
        "sensor.solcast_pv_forecast_prognose_heute"
    );
    assert_eq!(
        ctrl.forecast_entity(local(3, 0)),
        "sensor.solcast_pv_forecast_prognose_morgen"
    );
}

#[test]
fn storage_mode_option_strings() {
    assert_eq!(
        StorageMode::MaximizeSelfConsumption.as_option(),
        "Maximize self consumption"
    );
    assert_eq!(StorageMode::ChargeFromGridAndPv.as_option(), "Charge from PV and AC");
    assert_eq!(StorageMode::Off.as_option(), "Off");
}
