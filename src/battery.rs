//! Battery state tracking for Eos
//!
//! Maintains the latest battery state of charge and answers how much
//! instantaneous power the battery can still deliver above its reserve
//! floor or absorb before full. When SOC telemetry goes stale the headroom
//! functions report zero: assuming no battery help is the safe default.

use crate::bus::EntityBus;
use crate::config::BatteryConfig;
use crate::logging::get_logger;
use chrono::{DateTime, Utc};

/// Battery state snapshot, owned exclusively by the manager
#[derive(Debug, Clone, Copy)]
pub struct BatteryState {
    /// State of charge, 0-100
    pub soc_percent: f64,

    /// Total capacity in Wh
    pub capacity_wh: f64,

    /// Reserve floor in percent
    pub min_reserve_percent: f64,

    /// When SOC was last read successfully
    pub updated_at: DateTime<Utc>,
}

impl BatteryState {
    /// Energy above the reserve floor (Wh)
    pub fn usable_wh(&self) -> f64 {
        (self.capacity_wh * (self.soc_percent - self.min_reserve_percent) / 100.0).max(0.0)
    }

    /// Energy the battery can still absorb before full (Wh)
    pub fn headroom_wh(&self) -> f64 {
        (self.capacity_wh * (100.0 - self.soc_percent) / 100.0).max(0.0)
    }

    /// Whether the SOC sits at or below the reserve floor
    pub fn below_reserve(&self) -> bool {
        self.soc_percent <= self.min_reserve_percent
    }
}

/// Tracks battery state and exposes charge/discharge headroom
pub struct BatteryManager {
    config: BatteryConfig,
    state: Option<BatteryState>,
    logger: crate::logging::StructuredLogger,
}

impl BatteryManager {
    /// Create a new manager with no state yet
    pub fn new(config: BatteryConfig) -> Self {
        let logger = get_logger("battery");
        Self {
            config,
            state: None,
            logger,
        }
    }

    /// Re-read SOC and capacity from the bus. An unreadable SOC leaves the
    /// previous state in place so it ages into staleness instead of being
    /// replaced by a fabricated value.
    pub async fn refresh(&mut self, bus: &dyn EntityBus) {
        let soc = match bus.get_state(&self.config.soc_entity).await {
            Ok(value) => value.as_f64(),
            Err(e) => {
                self.logger
                    .warn(&format!("Failed to read {}: {}", self.config.soc_entity, e));
                None
            }
        };
        let Some(soc_percent) = soc else {
            self.logger.warn(&format!(
                "SOC entity {} has no numeric state, keeping last known state",
                self.config.soc_entity
            ));
            return;
        };

        let capacity_wh = match &self.config.capacity_entity {
            Some(entity) => match bus.get_state(entity).await {
                Ok(value) => value.as_f64().unwrap_or(self.config.capacity_wh),
                Err(_) => self.config.capacity_wh,
            },
            None => self.config.capacity_wh,
        };

        self.apply_reading(soc_percent, capacity_wh, Utc::now());
    }

    fn apply_reading(&mut self, soc_percent: f64, capacity_wh: f64, now: DateTime<Utc>) {
        let state = BatteryState {
            soc_percent: soc_percent.clamp(0.0, 100.0),
            capacity_wh,
            min_reserve_percent: self.config.min_reserve_percent,
            updated_at: now,
        };
        self.logger.debug(&format!(
            "soc={:.1}% capacity={:.0}Wh usable={:.0}Wh headroom={:.0}Wh",
            state.soc_percent,
            state.capacity_wh,
            state.usable_wh(),
            state.headroom_wh()
        ));
        self.state = Some(state);
    }

    /// Latest battery state, if any has been read
    pub fn state(&self) -> Option<&BatteryState> {
        self.state.as_ref()
    }

    fn fresh_state(&self, now: DateTime<Utc>) -> Option<&BatteryState> {
        let state = self.state.as_ref()?;
        let age = now.signed_duration_since(state.updated_at);
        if age.num_seconds() > self.config.stale_after_s as i64 {
            self.logger.warn(&format!(
                "Battery SOC is stale ({}s old), assuming no battery headroom",
                age.num_seconds()
            ));
            return None;
        }
        Some(state)
    }

    /// Power the battery can deliver above the reserve floor (W). Zero when
    /// the state is stale, missing, or at/below the floor. The energy margin
    /// is converted to power on a one-hour horizon, bounded by the rated
    /// discharge limit.
    pub fn discharge_headroom_w(&self, now: DateTime<Utc>) -> f64 {
        match self.fresh_state(now) {
            Some(state) if !state.below_reserve() => {
                state.usable_wh().min(self.config.max_discharge_w)
            }
            _ => 0.0,
        }
    }

    /// Power the battery can still absorb before full (W). Zero when the
    /// state is stale or missing.
    pub fn charge_acceptance_w(&self, now: DateTime<Utc>) -> f64 {
        match self.fresh_state(now) {
            Some(state) => state.headroom_wh().min(self.config.max_charge_w),
            None => 0.0,
        }
    }

    /// Whether discharge headroom may join the allocation budget
    pub fn assist_active(&self, now: DateTime<Utc>) -> bool {
        self.fresh_state(now)
            .is_some_and(|state| state.soc_percent >= self.config.assist_soc_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn manager() -> BatteryManager {
        BatteryManager::new(BatteryConfig {
            capacity_wh: 10000.0,
            min_reserve_percent: 10.0,
            assist_soc_percent: 15.0,
            max_charge_w: 5000.0,
            max_discharge_w: 5000.0,
            stale_after_s: 300,
            ..Default::default()
        })
    }

    #[test]
    fn headroom_math() {
        let now = Utc::now();
        let mut mgr = manager();
        mgr.apply_reading(60.0, 10000.0, now);

        let state = mgr.state().unwrap();
        assert!((state.usable_wh() - 5000.0).abs() < 1e-9);
        assert!((state.headroom_wh() - 4000.0).abs() < 1e-9);

        // One-hour horizon bounded by the rated limits
        assert!((mgr.discharge_headroom_w(now) - 5000.0).abs() < 1e-9);
        assert!((mgr.charge_acceptance_w(now) - 4000.0).abs() < 1e-9);
    }

    #[test]
    fn no_discharge_below_reserve() {
        let now = Utc::now();
        let mut mgr = manager();
        mgr.apply_reading(10.0, 10000.0, now);
        assert_eq!(mgr.discharge_headroom_w(now), 0.0);
        assert!(!mgr.assist_active(now));

        // But the battery still accepts charge
        assert!(mgr.charge_acceptance_w(now) > 0.0);
    }

    #[test]
    fn stale_state_reports_zero_headroom() {
        let read_at = Utc::now();
        let mut mgr = manager();
        mgr.apply_reading(80.0, 10000.0, read_at);

        let now = read_at + Duration::seconds(299);
        assert!(mgr.discharge_headroom_w(now) > 0.0);

        let later = read_at + Duration::seconds(301);
        assert_eq!(mgr.discharge_headroom_w(later), 0.0);
        assert_eq!(mgr.charge_acceptance_w(later), 0.0);
        assert!(!mgr.assist_active(later));
    }

    #[test]
    fn missing_state_reports_zero() {
        let mgr = manager();
        let now = Utc::now();
        assert_eq!(mgr.discharge_headroom_w(now), 0.0);
        assert_eq!(mgr.charge_acceptance_w(now), 0.0);
    }
}
