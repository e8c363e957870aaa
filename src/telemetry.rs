//! Power telemetry acquisition for Eos
//!
//! Normalizes live power and per-phase current readings from the entity
//! bus into `PowerSample`s and pushes them to subscribers. Unknown or
//! unavailable readings are coerced to zero with a warning so that loss of
//! one signal degrades allocation instead of halting it.

use crate::bus::{EntityBus, number_or_zero, watts_or_zero};
use crate::config::TelemetryConfig;
use crate::logging::get_logger;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// One normalized telemetry reading. Superseded by the next sample.
#[derive(Debug, Clone, Copy)]
pub struct PowerSample {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,

    /// Solar production (W)
    pub solar_w: f64,

    /// Grid power (W), import positive / export negative
    pub grid_w: f64,

    /// Measured per-phase current (A), L1..L3
    pub phase_amps: [f64; 3],
}

impl PowerSample {
    /// An all-zero sample, used before the first poll completes
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            solar_w: 0.0,
            grid_w: 0.0,
            phase_amps: [0.0; 3],
        }
    }

    /// Grid import (W), never negative
    pub fn import_w(&self) -> f64 {
        self.grid_w.max(0.0)
    }

    /// Grid export (W), never negative
    pub fn export_w(&self) -> f64 {
        (-self.grid_w).max(0.0)
    }
}

/// Reads telemetry entities and publishes samples to subscribers
pub struct TelemetryReader {
    config: TelemetryConfig,
    bus: Arc<dyn EntityBus>,
    tx: watch::Sender<PowerSample>,
    export_ema_w: Option<f64>,
    logger: crate::logging::StructuredLogger,
}

impl TelemetryReader {
    /// Create a reader and the receiver side of its sample channel
    pub fn new(
        config: TelemetryConfig,
        bus: Arc<dyn EntityBus>,
    ) -> (Self, watch::Receiver<PowerSample>) {
        let (tx, rx) = watch::channel(PowerSample::empty(Utc::now()));
        let logger = get_logger("telemetry");
        (
            Self {
                config,
                bus,
                tx,
                export_ema_w: None,
                logger,
            },
            rx,
        )
    }

    /// Subscribe to published samples
    pub fn subscribe(&self) -> watch::Receiver<PowerSample> {
        self.tx.subscribe()
    }

    /// Take one reading and publish it. Never fails: individual signals
    /// degrade to zero.
    pub async fn poll(&mut self) -> PowerSample {
        let solar_w = watts_or_zero(
            &self.config.solar_power_entity,
            self.bus.get_state(&self.config.solar_power_entity).await,
            &self.logger,
        );
        let export_w = watts_or_zero(
            &self.config.exported_power_entity,
            self.bus.get_state(&self.config.exported_power_entity).await,
            &self.logger,
        );
        let import_w = watts_or_zero(
            &self.config.imported_power_entity,
            self.bus.get_state(&self.config.imported_power_entity).await,
            &self.logger,
        );

        let mut phase_amps = [0.0f64; 3];
        for (i, entity) in self.config.phase_current_entities.iter().enumerate() {
            phase_amps[i] = number_or_zero(entity, self.bus.get_state(entity).await, &self.logger);
        }

        let sample = PowerSample {
            timestamp: Utc::now(),
            solar_w,
            grid_w: import_w - export_w,
            phase_amps,
        };

        self.update_export_ema(sample.export_w());

        self.logger.debug(&format!(
            "solar={:.0}W grid={:+.0}W amps=({:.1},{:.1},{:.1}) export_ema={:.0}W",
            sample.solar_w,
            sample.grid_w,
            phase_amps[0],
            phase_amps[1],
            phase_amps[2],
            self.smoothed_export_w()
        ));

        // Push to subscribers; latest value supersedes any unread sample
        self.tx.send_replace(sample);
        sample
    }

    fn update_export_ema(&mut self, export_w: f64) {
        let alpha = self.config.export_ema_alpha;
        if alpha <= 0.0 {
            self.export_ema_w = Some(export_w);
            return;
        }
        let next = match self.export_ema_w {
            Some(prev) => alpha * export_w + (1.0 - alpha) * prev,
            None => export_w,
        };
        self.export_ema_w = Some(next);
    }

    /// Smoothed export power used by the allocation budget
    pub fn smoothed_export_w(&self) -> f64 {
        self.export_ema_w.unwrap_or(0.0)
    }
}
