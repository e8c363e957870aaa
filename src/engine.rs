//! Control loop orchestration for Eos
//!
//! One logical control loop over four cadences: telemetry polling,
//! surplus allocation, state reconciliation and pre-charge planning.
//! Allocation never blocks on an external actuator: commands are spawned
//! as fire-and-forget tasks whose effect the enforcement manager verifies
//! on its own schedule. Telemetry flows through a watch channel, so an
//! allocation cycle always acts on the most recent sample only.

use crate::battery::BatteryManager;
use crate::bus::{EntityBus, number_or_zero, watts_or_zero};
use crate::config::Config;
use crate::enforce::{DesiredState, StateEnforcer};
use crate::error::{EosError, Result};
use crate::logging::get_logger;
use crate::phase::PhaseGuard;
use crate::precharge::{BatterySnapshot, PrechargeController};
use crate::scheduler::{Consumer, StageScheduler, SwitchIntent, SwitchRef};
use crate::telemetry::{PowerSample, TelemetryReader};
use crate::virtual_entity::{ActuatorCommand, VirtualEntityController};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, interval};

/// Engine lifecycle state
#[derive(Debug, Clone)]
pub enum EngineState {
    /// Engine is initializing
    Initializing,
    /// Engine is running normally
    Running,
    /// Engine is shutting down
    ShuttingDown,
}

/// Main control engine for Eos
pub struct EnergyEngine {
    /// Configuration
    config: Config,

    /// Entity-state bus
    bus: Arc<dyn EntityBus>,

    /// Current engine state
    state: watch::Sender<EngineState>,

    /// Telemetry reader
    telemetry: TelemetryReader,

    /// Latest published sample
    sample_rx: watch::Receiver<PowerSample>,

    /// Battery manager
    battery: BatteryManager,

    /// Phase balance guard
    guard: PhaseGuard,

    /// Virtual entity registry
    virtuals: VirtualEntityController,

    /// Stage scheduler
    scheduler: StageScheduler,

    /// Pre-charge planner
    precharge: PrechargeController,

    /// State enforcement manager
    enforcer: StateEnforcer,

    /// Budget reserve while grid charging is active (W)
    precharge_reserve_w: f64,

    /// Shutdown signal
    shutdown_tx: mpsc::UnboundedSender<()>,

    /// Shutdown receiver
    shutdown_rx: mpsc::UnboundedReceiver<()>,

    /// Logger with context
    logger: crate::logging::StructuredLogger,
}

impl EnergyEngine {
    /// Create a new engine from validated configuration
    pub fn new(config: Config, bus: Arc<dyn EntityBus>) -> Result<Self> {
        config.validate()?;

        let tz = config
            .timezone_or_default()
            .parse::<chrono_tz::Tz>()
            .map_err(|_| EosError::config("Unknown timezone name"))?;

        let logger = get_logger("engine");
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(EngineState::Initializing);

        let (telemetry, sample_rx) = TelemetryReader::new(config.telemetry.clone(), bus.clone());
        let battery = BatteryManager::new(config.battery.clone());
        let guard = PhaseGuard::new(&config.phases);
        let virtuals = VirtualEntityController::from_config(&config.virtuals, bus.clone());
        let consumers: Vec<Consumer> = config.consumers.iter().map(Consumer::from_config).collect();
        let scheduler = StageScheduler::new(consumers);
        let precharge = PrechargeController::new(config.precharge.clone(), tz);
        let enforcer = StateEnforcer::new(config.enforcement.clone());

        logger.info("Initializing energy engine");

        Ok(Self {
            config,
            bus,
            state: state_tx,
            telemetry,
            sample_rx,
            battery,
            guard,
            virtuals,
            scheduler,
            precharge,
            enforcer,
            precharge_reserve_w: 0.0,
            shutdown_tx,
            shutdown_rx,
            logger,
        })
    }

    /// Run the engine main loop
    pub async fn run(&mut self) -> Result<()> {
        self.logger.info("Starting energy engine main loop");
        self.state.send(EngineState::Running).ok();

        // Wire up the storage controller before anything else
        let startup_states = self.config.startup_states.clone();
        for startup in startup_states {
            self.enforcer
                .ensure(&startup.entity, DesiredState::Select(startup.option.clone()));
            self.dispatch_select(startup.entity, startup.option);
        }

        // Begin from a clean state: every stage off
        let reset = self.scheduler.startup_reset();
        self.logger
            .info(&format!("Disabling {} stage switches at startup", reset.len()));
        self.apply_intents(reset).await;

        let mut telemetry_interval =
            interval(Duration::from_millis(self.config.telemetry.poll_interval_ms));
        let mut allocation_interval =
            interval(Duration::from_secs(self.config.scheduler.interval_s));
        let mut enforce_interval = interval(Duration::from_secs(self.config.enforcement.interval_s));
        let mut precharge_interval =
            interval(Duration::from_secs(self.config.precharge.interval_s.max(1)));

        loop {
            tokio::select! {
                _ = telemetry_interval.tick() => {
                    self.telemetry_cycle().await;
                }
                _ = allocation_interval.tick() => {
                    self.allocation_cycle().await;
                }
                _ = enforce_interval.tick() => {
                    self.enforcer.reconcile(self.bus.as_ref(), Utc::now()).await;
                }
                _ = precharge_interval.tick() => {
                    if self.config.precharge.enabled {
                        self.precharge_cycle().await;
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    self.logger.info("Shutdown signal received");
                    break;
                }
            }
        }

        self.state.send(EngineState::ShuttingDown).ok();
        self.logger.info("Engine shutdown complete");
        Ok(())
    }

    /// Poll telemetry and feed the virtual entity feedback loop. Exactly
    /// one event fires per sample: a positive import is a deficit, anything
    /// else is a surplus report (possibly zero), so the setpoint is renewed
    /// on every sample and can never go stale.
    async fn telemetry_cycle(&mut self) {
        let sample = self.telemetry.poll().await;

        let commands = if sample.import_w() > 0.0 {
            self.virtuals.on_import_update(sample.import_w()).await
        } else {
            self.virtuals.on_export_update(sample.export_w()).await
        };
        self.dispatch_commands(commands);
    }

    /// One allocation cycle over the latest sample
    async fn allocation_cycle(&mut self) {
        self.battery.refresh(self.bus.as_ref()).await;

        let now = Utc::now();
        let sample = *self.sample_rx.borrow();

        // Live draw of currently-enabled consumers is added back into the
        // surplus: an enabled load must not erase its own budget.
        let trackers: Vec<String> = self
            .scheduler
            .active_consumers()
            .iter()
            .filter_map(|c| c.tracker.clone())
            .collect();
        let any_active = !self.scheduler.active_consumers().is_empty();
        let mut tracked_w = 0.0;
        for tracker in &trackers {
            tracked_w += watts_or_zero(tracker, self.bus.get_state(tracker).await, &self.logger);
        }

        let mut surplus_w = self.telemetry.smoothed_export_w();
        if !any_active && surplus_w < self.config.scheduler.min_export_w {
            surplus_w = 0.0;
        }

        let discharge_w = if self.battery.assist_active(now) {
            self.battery.discharge_headroom_w(now)
        } else {
            0.0
        };

        // The tolerance margin lets a stage start when the surplus is within
        // a rounding error of its draw
        let budget_w = surplus_w + tracked_w + discharge_w - self.precharge_reserve_w
            + self.config.scheduler.tolerance_w;

        let faulted = self.enforcer.faulted_entities();
        let intents =
            self.scheduler
                .run_tick(budget_w, &sample.phase_amps, &self.guard, &faulted);
        if !intents.is_empty() {
            self.logger.info(&format!(
                "Allocation changed: {} switch intents (budget {:.0}W)",
                intents.len(),
                budget_w
            ));
        }
        self.apply_intents(intents).await;
    }

    /// One pre-charge planning cycle
    async fn precharge_cycle(&mut self) {
        let now = Utc::now();

        let forecast_entity = self.precharge.forecast_entity(now).to_string();
        let forecast_kwh = number_or_zero(
            &forecast_entity,
            self.bus.get_state(&forecast_entity).await,
            &self.logger,
        );

        let sunrise_entity = self.config.precharge.sunrise_entity.clone();
        let sunrise = match self.bus.get_state(&sunrise_entity).await {
            Ok(value) if !value.is_unknown() => DateTime::parse_from_rfc3339(value.state.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        };

        let override_entity = self.config.precharge.override_entity.clone();
        let override_on = self
            .bus
            .get_state(&override_entity)
            .await
            .map(|v| v.is_on())
            .unwrap_or(false);

        let snapshot = self.battery.state().map(|state| BatterySnapshot {
            usable_kwh: state.usable_wh() / 1000.0,
            headroom_kwh: state.headroom_wh() / 1000.0,
            acceptance_w: self.battery.charge_acceptance_w(now),
        });

        let decision = self
            .precharge
            .evaluate(now, snapshot, forecast_kwh, sunrise, override_on);

        let mode_entity = self.config.precharge.mode_select_entity.clone();
        let option = decision.mode.as_option().to_string();
        self.enforcer
            .ensure(&mode_entity, DesiredState::Select(option.clone()));
        self.dispatch_select(mode_entity, option);

        if let Some(limit_w) = decision.charge_limit_w {
            let bus = Arc::clone(&self.bus);
            let entity = self.config.precharge.charge_limit_entity.clone();
            let logger = self.logger.clone();
            tokio::spawn(async move {
                if let Err(e) = bus
                    .call_service(
                        "number",
                        "set_value",
                        &entity,
                        serde_json::json!({ "value": limit_w }),
                    )
                    .await
                {
                    logger.warn(&format!("Failed to set charge limit on {}: {}", entity, e));
                }
            });
        }

        // Grid charging competes for the same budget pool
        self.precharge_reserve_w = if decision.grid_charge_active() {
            decision
                .charge_limit_w
                .unwrap_or(self.config.precharge.max_grid_charge_w)
        } else {
            0.0
        };
    }

    /// Route switch intents: real switches go through the enforcement
    /// manager and an async bus call, virtual switches through the
    /// feedback registry.
    async fn apply_intents(&mut self, intents: Vec<SwitchIntent>) {
        for intent in intents {
            match intent.target {
                SwitchRef::Entity(entity) => {
                    let desired = if intent.on {
                        DesiredState::On
                    } else {
                        DesiredState::Off
                    };
                    self.enforcer.ensure(&entity, desired);
                    self.dispatch_switch(entity, intent.on);
                }
                SwitchRef::Virtual(id) => {
                    let commands = self.virtuals.set_switched(&id, intent.on).await;
                    self.dispatch_commands(commands);
                }
            }
        }
    }

    /// Fire-and-forget a switch command; the enforcement manager observes
    /// the outcome on its own cadence.
    fn dispatch_switch(&self, entity_id: String, on: bool) {
        let bus = Arc::clone(&self.bus);
        let logger = self.logger.clone();
        tokio::spawn(async move {
            let result = if on {
                bus.turn_on(&entity_id).await
            } else {
                bus.turn_off(&entity_id).await
            };
            if let Err(e) = result {
                logger.warn(&format!("Switch command to {} failed: {}", entity_id, e));
            }
        });
    }

    /// Fire-and-forget a select command
    fn dispatch_select(&self, entity_id: String, option: String) {
        let bus = Arc::clone(&self.bus);
        let logger = self.logger.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.select_option(&entity_id, &option).await {
                logger.warn(&format!("Select command to {} failed: {}", entity_id, e));
            }
        });
    }

    /// Fire-and-forget actuator setpoint commands
    fn dispatch_commands(&self, commands: Vec<ActuatorCommand>) {
        for command in commands {
            let bus = Arc::clone(&self.bus);
            let logger = self.logger.clone();
            tokio::spawn(async move {
                if let Err(e) = bus
                    .call_service(
                        &command.domain,
                        &command.service,
                        &command.entity_id,
                        command.payload(),
                    )
                    .await
                {
                    logger.warn(&format!(
                        "Setpoint command to {} failed: {}",
                        command.entity_id, e
                    ));
                }
            });
        }
    }

    /// Get current engine state
    pub fn get_state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    /// Subscribe to engine state changes
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Handle used to request shutdown from another task
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<()> {
        self.shutdown_tx.clone()
    }

    /// Get configuration reference
    pub fn config(&self) -> &Config {
        &self.config
    }
}
