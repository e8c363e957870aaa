use eos::config::{PhaseLimitConfig, PhasesConfig};
use eos::phase::PhaseGuard;
use eos::scheduler::{Consumer, Stage, StageScheduler, SwitchIntent, SwitchRef};
use std::collections::HashSet;

fn consumer(name: &str, phase: Option<usize>, stages: &[(f64, &str)]) -> Consumer {
    Consumer {
        name: name.to_string(),
        tracker: None,
        phase,
        can_be_turned_off: true,
        stages: stages
            .iter()
            .map(|(usage_w, switch)| Stage {
                usage_w: *usage_w,
                switch: SwitchRef::parse(switch),
            })
            .collect(),
    }
}

fn unlimited_guard() -> PhaseGuard {
    PhaseGuard::new(&PhasesConfig {
        nominal_voltage_v: 230.0,
        limits: Vec::new(),
        safety_margin_amps: 0.0,
    })
}

fn limited_guard(max_amps: f64) -> PhaseGuard {
    PhaseGuard::new(&PhasesConfig {
        nominal_voltage_v: 230.0,
        limits: (1..=3)
            .map(|phase| PhaseLimitConfig { phase, max_amps })
            .collect(),
        safety_margin_amps: 0.0,
    })
}

fn household() -> StageScheduler {
    let mut scheduler = StageScheduler::new(vec![
        consumer(
            "car",
            None,
            &[
                (7200.0, "switch.car_7200"),
                (4800.0, "switch.car_4800"),
                (1600.0, "switch.car_1600"),
            ],
        ),
        consumer("water_heater", None, &[(1600.0, "switch.heater_1600")]),
    ]);
    scheduler.startup_reset();
    scheduler
}

#[test]
fn surplus_enables_largest_affordable_stage() {
    let mut scheduler = household();
    let guard = unlimited_guard();

    // 8000 W: the car's 7200 stage fits, the remaining 800 W covers nothing
    let intents = scheduler.run_tick(8000.0, &[0.0; 3], &guard, &HashSet::new());
    assert_eq!(
        intents,
        vec![SwitchIntent {
            target: SwitchRef::parse("switch.car_7200"),
            on: true,
        }]
    );
}

#[test]
fn collapse_to_low_surplus_emits_one_off_command() {
    let mut scheduler = household();
    let guard = unlimited_guard();

    scheduler.run_tick(8000.0, &[0.0; 3], &guard, &HashSet::new());

    // Surplus drops to 1000 W: 7200 off, 1600 also unaffordable. The stages
    // that were already off are not re-commanded.
    let intents = scheduler.run_tick(1000.0, &[0.0; 3], &guard, &HashSet::new());
    assert_eq!(
        intents,
        vec![SwitchIntent {
            target: SwitchRef::parse("switch.car_7200"),
            on: false,
        }]
    );
}

#[test]
fn unchanged_input_is_idempotent() {
    let mut scheduler = household();
    let guard = unlimited_guard();

    let first = scheduler.run_tick(8000.0, &[0.0; 3], &guard, &HashSet::new());
    assert!(!first.is_empty());

    let second = scheduler.run_tick(8000.0, &[0.0; 3], &guard, &HashSet::new());
    assert!(second.is_empty());
}

#[test]
fn enabled_stages_stay_contiguous_from_the_top() {
    let mut scheduler = household();
    let guard = unlimited_guard();

    // 13000 W covers 7200 + 4800 but not the 1600 tail
    let intents = scheduler.run_tick(13000.0, &[0.0; 3], &guard, &HashSet::new());
    let on: Vec<String> = intents
        .iter()
        .filter(|i| i.on)
        .map(|i| i.target.to_string())
        .collect();
    assert_eq!(on, vec!["switch.car_7200", "switch.car_4800"]);
    assert!(!on.contains(&"switch.car_1600".to_string()));
}

#[test]
fn lower_priority_consumer_gets_the_remainder() {
    let mut scheduler = household();
    let guard = unlimited_guard();

    // 9000 W: car takes 7200, the 1800 remainder covers the heater's 1600
    let intents = scheduler.run_tick(9000.0, &[0.0; 3], &guard, &HashSet::new());
    let on: Vec<String> = intents
        .iter()
        .filter(|i| i.on)
        .map(|i| i.target.to_string())
        .collect();
    assert_eq!(on, vec!["switch.car_7200", "switch.heater_1600"]);
}

#[test]
fn phase_veto_sheds_regardless_of_surplus() {
    let mut scheduler = StageScheduler::new(vec![consumer(
        "heater",
        Some(0),
        &[(1600.0, "switch.heater_1600")],
    )]);
    scheduler.startup_reset();
    let guard = limited_guard(25.0);

    // Phase L1 already at 95% of its 25 A limit; 1600 W more would trip it
    let intents = scheduler.run_tick(8000.0, &[23.75, 0.0, 0.0], &guard, &HashSet::new());
    assert!(intents.is_empty());
}

#[test]
fn veto_strictly_reduces_allocation() {
    let scheduler = {
        let mut s = StageScheduler::new(vec![
            consumer("car", Some(0), &[(7200.0, "switch.car_7200")]),
            consumer("heater", Some(0), &[(1600.0, "switch.heater_1600")]),
        ]);
        s.startup_reset();
        s
    };
    let guard = limited_guard(25.0);

    let planned = scheduler.plan(10000.0, &HashSet::new());
    let planned_w = planned.total_w(scheduler.consumers());
    assert_eq!(planned.boundaries, vec![1, 1]);

    // 10 A measured leaves ~15 A of headroom; shedding walks up from the
    // lowest priority until the car's 7200 W stage is gone too
    let vetoed = scheduler.apply_veto(planned, &[10.0, 0.0, 0.0], &guard);
    let vetoed_w = vetoed.total_w(scheduler.consumers());

    assert!(vetoed_w < planned_w);
    assert_eq!(vetoed.boundaries, vec![0, 0]);
}

#[test]
fn shedding_starts_with_the_lowest_priority_consumer() {
    let scheduler = {
        let mut s = StageScheduler::new(vec![
            consumer("car", Some(0), &[(1600.0, "switch.car_1600")]),
            consumer("heater", Some(0), &[(1600.0, "switch.heater_1600")]),
        ]);
        s.startup_reset();
        s
    };
    let guard = limited_guard(25.0);

    // Room for one 1600 W stage (~7 A) on top of 16 A measured, not two
    let planned = scheduler.plan(4000.0, &HashSet::new());
    assert_eq!(planned.boundaries, vec![1, 1]);

    let vetoed = scheduler.apply_veto(planned, &[16.0, 0.0, 0.0], &guard);
    assert_eq!(vetoed.boundaries, vec![1, 0]);
}

#[test]
fn faulted_switch_earns_no_credit() {
    let mut scheduler = household();
    let guard = unlimited_guard();
    let faulted: HashSet<String> = ["switch.car_7200".to_string()].into_iter().collect();

    // The car prefix is capped at the faulted switch; the heater still runs
    let intents = scheduler.run_tick(9000.0, &[0.0; 3], &guard, &faulted);
    let on: Vec<String> = intents
        .iter()
        .filter(|i| i.on)
        .map(|i| i.target.to_string())
        .collect();
    assert_eq!(on, vec!["switch.heater_1600"]);
}

#[test]
fn negative_budget_turns_everything_off() {
    let mut scheduler = household();
    let guard = unlimited_guard();

    scheduler.run_tick(13000.0, &[0.0; 3], &guard, &HashSet::new());
    let intents = scheduler.run_tick(-200.0, &[0.0; 3], &guard, &HashSet::new());
    assert_eq!(intents.len(), 2);
    assert!(intents.iter().all(|i| !i.on));
}

#[test]
fn virtual_switch_targets_are_routed_by_reference() {
    let mut scheduler = StageScheduler::new(vec![consumer(
        "car",
        None,
        &[(7200.0, "virtual.car_charger")],
    )]);
    scheduler.startup_reset();
    let guard = unlimited_guard();

    let intents = scheduler.run_tick(8000.0, &[0.0; 3], &guard, &HashSet::new());
    assert_eq!(
        intents,
        vec![SwitchIntent {
            target: SwitchRef::Virtual("car_charger".to_string()),
            on: true,
        }]
    );
}
