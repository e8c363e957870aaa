//! Battery grid pre-charge planning for Eos
//!
//! Decides, on a coarse schedule, whether to draw grid power into the
//! battery ahead of an anticipated low-production morning. The sweet spot
//! is the cheap early-morning window: charge just enough to bridge the
//! time from the end of the window to sunrise. This is a forward-looking
//! heuristic outside the tight real-time loop; it only produces a charge
//! intent that the allocation budget then respects.

use crate::config::PrechargeConfig;
use crate::logging::get_logger;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Remote storage command mode, mirroring the platform's select options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Let the inverter consume PV locally (normal operation)
    MaximizeSelfConsumption,

    /// Charge the battery from PV and from the grid
    ChargeFromGridAndPv,

    /// Hold the battery
    Off,
}

impl StorageMode {
    /// The select option string understood by the storage controller
    pub fn as_option(&self) -> &'static str {
        match self {
            Self::MaximizeSelfConsumption => "Maximize self consumption",
            Self::ChargeFromGridAndPv => "Charge from PV and AC",
            Self::Off => "Off",
        }
    }
}

/// Outcome of one planning evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrechargeDecision {
    pub mode: StorageMode,

    /// Charge rate to command while grid charging (W)
    pub charge_limit_w: Option<f64>,
}

impl PrechargeDecision {
    fn self_consumption() -> Self {
        Self {
            mode: StorageMode::MaximizeSelfConsumption,
            charge_limit_w: None,
        }
    }

    /// Whether grid charging competes for the allocation budget
    pub fn grid_charge_active(&self) -> bool {
        self.mode == StorageMode::ChargeFromGridAndPv
    }
}

/// Battery figures the controller plans against
#[derive(Debug, Clone, Copy)]
pub struct BatterySnapshot {
    /// Energy above the reserve floor (kWh)
    pub usable_kwh: f64,

    /// Energy the battery can still absorb (kWh)
    pub headroom_kwh: f64,

    /// Instantaneous charge acceptance (W)
    pub acceptance_w: f64,
}

/// Forward-looking grid charge planner
pub struct PrechargeController {
    config: PrechargeConfig,
    tz: Tz,
    logger: crate::logging::StructuredLogger,
}

impl PrechargeController {
    pub fn new(config: PrechargeConfig, tz: Tz) -> Self {
        Self {
            config,
            tz,
            logger: get_logger("precharge"),
        }
    }

    /// Which forecast entity represents "tomorrow's" production right now.
    /// Shortly after midnight the daily forecast sensors have not rolled
    /// over yet, so today's value is the one that covers the coming morning.
    pub fn forecast_entity(&self, now: DateTime<Utc>) -> &str {
        let local = now.with_timezone(&self.tz);
        if local.hour() < self.config.forecast_rollover_hour {
            &self.config.forecast_today_entity
        } else {
            &self.config.forecast_tomorrow_entity
        }
    }

    /// Evaluate the planning rule
    pub fn evaluate(
        &self,
        now: DateTime<Utc>,
        battery: Option<BatterySnapshot>,
        forecast_kwh: f64,
        sunrise: Option<DateTime<Utc>>,
        override_on: bool,
    ) -> PrechargeDecision {
        let Some(battery) = battery else {
            // Without battery figures there is nothing safe to pre-charge
            self.logger
                .warn("No battery state available, staying on self consumption");
            return PrechargeDecision::self_consumption();
        };

        let rate_w = battery.acceptance_w.min(self.config.max_grid_charge_w);

        if override_on {
            if battery.headroom_kwh > self.config.override_min_headroom_kwh && rate_w > 0.0 {
                self.logger.info(&format!(
                    "Override active, charging from grid at {:.0}W ({:.2} kWh headroom)",
                    rate_w, battery.headroom_kwh
                ));
                return PrechargeDecision {
                    mode: StorageMode::ChargeFromGridAndPv,
                    charge_limit_w: Some(rate_w),
                };
            }
            return PrechargeDecision::self_consumption();
        }

        let local = now.with_timezone(&self.tz);
        if local.hour() >= self.config.window_end_hour {
            return PrechargeDecision::self_consumption();
        }

        // Energy needed to bridge the gap between the end of the cheap
        // window and sunrise at the assumed baseline load
        let window_end = self
            .tz
            .with_ymd_and_hms(
                local.year(),
                local.month(),
                local.day(),
                self.config.window_end_hour,
                0,
                0,
            )
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        let sunrise = sunrise.unwrap_or(window_end);
        let minutes = sunrise
            .signed_duration_since(window_end)
            .num_minutes()
            .max(0) as f64;
        let needed_kwh = minutes * self.config.baseline_load_w / 60.0 / 1000.0;

        self.logger.debug(&format!(
            "window: usable={:.2}kWh headroom={:.2}kWh needed={:.2}kWh forecast={:.2}kWh",
            battery.usable_kwh, battery.headroom_kwh, needed_kwh, forecast_kwh
        ));

        if forecast_kwh / 2.0 < battery.headroom_kwh {
            if battery.usable_kwh < needed_kwh && rate_w > 0.0 {
                self.logger.info(&format!(
                    "Pre-charging from grid at {:.0}W (need {:.2} kWh, have {:.2} kWh)",
                    rate_w, needed_kwh, battery.usable_kwh
                ));
                PrechargeDecision {
                    mode: StorageMode::ChargeFromGridAndPv,
                    charge_limit_w: Some(rate_w),
                }
            } else {
                // Enough in the battery: hold it through the morning
                PrechargeDecision {
                    mode: StorageMode::Off,
                    charge_limit_w: None,
                }
            }
        } else {
            // A sunny day will refill whatever the morning takes
            PrechargeDecision::self_consumption()
        }
    }
}
