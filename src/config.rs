//! Configuration management for Eos
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. Validation is fatal at startup: the stage
//! scheduler depends on well-formed, descending-ordered stage lists.

use crate::error::{EosError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Entity-state bus connection configuration
    pub hass: HassConfig,

    /// Telemetry entity mappings and polling
    pub telemetry: TelemetryConfig,

    /// Battery entity mappings and limits
    pub battery: BatteryConfig,

    /// Per-phase breaker limits
    pub phases: PhasesConfig,

    /// Deferrable consumers in priority order (first entry = highest priority)
    pub consumers: Vec<ConsumerConfig>,

    /// Virtual entities with feedback behavior
    pub virtuals: Vec<VirtualEntityConfig>,

    /// Select states enforced once at startup (storage controller wiring)
    pub startup_states: Vec<StartupStateConfig>,

    /// Allocation scheduler settings
    pub scheduler: SchedulerConfig,

    /// AC pre-charge planning settings
    pub precharge: PrechargeConfig,

    /// State enforcement settings
    pub enforcement: EnforcementConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Timezone for planning-window decisions
    pub timezone: String,
}

/// Entity-state bus (Home Assistant REST API) connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HassConfig {
    /// Base URL of the platform API, e.g. http://homeassistant.local:8123
    pub base_url: String,

    /// Long-lived access token; may be left empty and supplied via EOS_HASS_TOKEN
    pub token: String,

    /// Request timeout in seconds
    pub timeout_s: u64,
}

/// Telemetry entity mappings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Solar production power entity (W)
    pub solar_power_entity: String,

    /// Exported power entity (W, non-negative)
    pub exported_power_entity: String,

    /// Imported power entity (W, non-negative)
    pub imported_power_entity: String,

    /// Per-phase current entities (A), L1..L3
    pub phase_current_entities: [String; 3],

    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,

    /// Exponential moving average smoothing factor for export power (0..1).
    /// Lower values increase smoothing; 1 disables and uses raw values.
    pub export_ema_alpha: f64,
}

/// Battery entity mappings and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// State-of-charge entity (percent, 0-100)
    pub soc_entity: String,

    /// Usable capacity entity (Wh); optional, falls back to capacity_wh
    pub capacity_entity: Option<String>,

    /// Static capacity fallback in Wh
    pub capacity_wh: f64,

    /// Reserve floor the scheduler must not deplete below (percent)
    pub min_reserve_percent: f64,

    /// SOC at or above which discharge headroom joins the allocation budget
    pub assist_soc_percent: f64,

    /// Rated charge power limit (W)
    pub max_charge_w: f64,

    /// Rated discharge power limit (W)
    pub max_discharge_w: f64,

    /// SOC readings older than this are considered stale (seconds)
    pub stale_after_s: u64,
}

/// Per-phase limit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseLimitConfig {
    /// Phase number, 1..=3
    pub phase: u8,

    /// Breaker limit in amps
    pub max_amps: f64,
}

/// Phase balance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasesConfig {
    /// Nominal phase-to-neutral voltage used to project added load into amps
    pub nominal_voltage_v: f64,

    /// Breaker limits per phase
    pub limits: Vec<PhaseLimitConfig>,

    /// Headroom kept below the breaker limit (amps)
    pub safety_margin_amps: f64,
}

/// One power stage of a consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Power drawn when this stage is enabled (W)
    pub usage_w: f64,

    /// Switch entity, or `virtual.<id>` to target a virtual entity
    pub switch: String,
}

/// A deferrable consumer with ordered power stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer name, unique
    pub name: String,

    /// Entity tracking the consumer's live draw (W or kW); optional
    #[serde(default)]
    pub tracker: Option<String>,

    /// Electrical phase this consumer draws on (1..=3); optional
    #[serde(default)]
    pub phase: Option<u8>,

    /// Whether the scheduler may turn this consumer fully off
    #[serde(default = "default_true")]
    pub can_be_turned_off: bool,

    /// Stages in strictly descending usage_w order
    pub stages: Vec<StageConfig>,
}

/// Service invocation target for a virtual entity's setpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetpointServiceConfig {
    /// Service domain, e.g. "number"
    pub domain: String,

    /// Service name, e.g. "set_value"
    pub service: String,

    /// Target entity id
    pub entity_id: String,

    /// Name of the numeric argument carrying the setpoint
    pub field: String,
}

/// Virtual entity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualEntityConfig {
    /// Entity id, unique (referenced from stages as `virtual.<id>`)
    pub id: String,

    /// Maximum power this entity may be granted (W)
    pub usage_ceiling_w: f64,

    /// Entity tracking the entity's own live draw (W or kW); optional
    #[serde(default)]
    pub tracker: Option<String>,

    /// Declared event handlers: import_update, export_update, switched
    pub events: Vec<String>,

    /// Setpoint service invocation target
    #[serde(default)]
    pub setpoint: SetpointServiceConfig,

    /// Setpoint pushed when the entity is disabled (no constraint)
    #[serde(default = "default_release_setpoint")]
    pub release_setpoint_w: f64,

    /// Setpoint pushed when the entity is enabled, pending the next surplus update
    #[serde(default)]
    pub block_setpoint_w: f64,
}

fn default_release_setpoint() -> f64 {
    11000.0
}

/// A select state enforced at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupStateConfig {
    /// Select entity id
    pub entity: String,

    /// Option the entity must hold
    pub option: String,
}

/// Allocation scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Allocation interval in seconds
    pub interval_s: u64,

    /// Export below this counts as zero surplus while nothing is enabled (W)
    pub min_export_w: f64,

    /// Tolerance margin on the allocation budget (W)
    pub tolerance_w: f64,
}

/// AC pre-charge planning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrechargeConfig {
    /// Whether pre-charge planning runs at all
    pub enabled: bool,

    /// Evaluation interval in seconds
    pub interval_s: u64,

    /// Local hour at which the cheap early-morning window ends
    pub window_end_hour: u32,

    /// Before this local hour, "tomorrow's" forecast means today's
    pub forecast_rollover_hour: u32,

    /// Forecast entity for today's remaining production (kWh)
    pub forecast_today_entity: String,

    /// Forecast entity for tomorrow's production (kWh)
    pub forecast_tomorrow_entity: String,

    /// Next-sunrise timestamp entity (RFC 3339)
    pub sunrise_entity: String,

    /// Manual override boolean entity
    pub override_entity: String,

    /// Storage-mode select entity commanded by the controller
    pub mode_select_entity: String,

    /// Charge-limit number entity commanded alongside grid charging
    pub charge_limit_entity: String,

    /// Assumed baseline house load during the window (W)
    pub baseline_load_w: f64,

    /// Maximum grid charge rate (W)
    pub max_grid_charge_w: f64,

    /// Override keeps charging while headroom exceeds this (kWh)
    pub override_min_headroom_kwh: f64,
}

/// State enforcement settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// Reconcile interval in seconds
    pub interval_s: u64,

    /// Max retry attempts before an entity is flagged faulted
    pub max_retries: u32,

    /// Base delay between retries (seconds); doubles per attempt
    pub retry_backoff_s: f64,

    /// Cap on the backoff delay (seconds)
    pub backoff_cap_s: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,

    /// Path to log file (or directory for rotated files)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Default for HassConfig {
    fn default() -> Self {
        Self {
            base_url: "http://homeassistant.local:8123".to_string(),
            token: String::new(),
            timeout_s: 5,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            solar_power_entity: "sensor.solar_panel_production_w".to_string(),
            exported_power_entity: "sensor.solar_exported_power_w".to_string(),
            imported_power_entity: "sensor.solar_imported_power_w".to_string(),
            phase_current_entities: [
                "sensor.phase_l1_current".to_string(),
                "sensor.phase_l2_current".to_string(),
                "sensor.phase_l3_current".to_string(),
            ],
            poll_interval_ms: 5000,
            export_ema_alpha: 0.4,
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            soc_entity: "sensor.pv_battery1_state_of_charge".to_string(),
            capacity_entity: Some("sensor.pv_battery1_size_max".to_string()),
            capacity_wh: 10000.0,
            min_reserve_percent: 10.0,
            assist_soc_percent: 15.0,
            max_charge_w: 5000.0,
            max_discharge_w: 5000.0,
            stale_after_s: 300,
        }
    }
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            nominal_voltage_v: 230.0,
            limits: vec![
                PhaseLimitConfig {
                    phase: 1,
                    max_amps: 67.0,
                },
                PhaseLimitConfig {
                    phase: 2,
                    max_amps: 67.0,
                },
                PhaseLimitConfig {
                    phase: 3,
                    max_amps: 67.0,
                },
            ],
            safety_margin_amps: 2.0,
        }
    }
}

impl Default for SetpointServiceConfig {
    fn default() -> Self {
        Self {
            domain: "number".to_string(),
            service: "set_value".to_string(),
            entity_id: String::new(),
            field: "value".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_s: 60,
            min_export_w: 300.0,
            tolerance_w: 100.0,
        }
    }
}

impl Default for PrechargeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: 300,
            window_end_hour: 6,
            forecast_rollover_hour: 2,
            forecast_today_entity: "sensor.solcast_pv_forecast_prognose_heute".to_string(),
            forecast_tomorrow_entity: "sensor.solcast_pv_forecast_prognose_morgen".to_string(),
            sunrise_entity: "sensor.sun_next_rising".to_string(),
            override_entity: "input_boolean.charge_solar_battery_override".to_string(),
            mode_select_entity: "select.pv_storage_remote_command_mode".to_string(),
            charge_limit_entity: "number.pv_storage_remote_charge_limit".to_string(),
            baseline_load_w: 500.0,
            max_grid_charge_w: 5000.0,
            override_min_headroom_kwh: 2.0,
        }
    }
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            interval_s: 15,
            max_retries: 3,
            retry_backoff_s: 5.0,
            backoff_cap_s: 60.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hass: HassConfig::default(),
            telemetry: TelemetryConfig::default(),
            battery: BatteryConfig::default(),
            phases: PhasesConfig::default(),
            consumers: Vec::new(),
            virtuals: Vec::new(),
            startup_states: vec![
                StartupStateConfig {
                    entity: "select.pv_storage_ac_charge_policy".to_string(),
                    option: "Always Allowed".to_string(),
                },
                StartupStateConfig {
                    entity: "select.pv_storage_control_mode".to_string(),
                    option: "Remote Control".to_string(),
                },
            ],
            scheduler: SchedulerConfig::default(),
            precharge: PrechargeConfig::default(),
            enforcement: EnforcementConfig::default(),
            logging: LoggingConfig::default(),
            timezone: "UTC".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/eos.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

/// Known virtual entity event names
pub const VIRTUAL_EVENTS: [&str; 3] = ["import_update", "export_update", "switched"];

/// Prefix marking a stage switch as a virtual entity reference
pub const VIRTUAL_PREFIX: &str = "virtual.";

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        let default_paths = ["eos_config.yaml", "/data/eos_config.yaml", "/etc/eos/config.yaml"];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        // Fall back to default configuration
        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration. Errors here abort startup.
    pub fn validate(&self) -> Result<()> {
        if self.hass.base_url.is_empty() {
            return Err(EosError::validation(
                "hass.base_url",
                "Base URL cannot be empty",
            ));
        }

        if self.telemetry.poll_interval_ms == 0 {
            return Err(EosError::validation(
                "telemetry.poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        if !(0.0..=1.0).contains(&self.telemetry.export_ema_alpha) {
            return Err(EosError::validation(
                "telemetry.export_ema_alpha",
                "Must be within 0..=1",
            ));
        }

        if !(0.0..=100.0).contains(&self.battery.min_reserve_percent) {
            return Err(EosError::validation(
                "battery.min_reserve_percent",
                "Must be within 0..=100",
            ));
        }

        if self.battery.capacity_wh <= 0.0 {
            return Err(EosError::validation(
                "battery.capacity_wh",
                "Must be positive",
            ));
        }

        if self.phases.nominal_voltage_v <= 0.0 {
            return Err(EosError::validation(
                "phases.nominal_voltage_v",
                "Must be positive",
            ));
        }

        for limit in &self.phases.limits {
            if !(1..=3).contains(&limit.phase) {
                return Err(EosError::validation(
                    "phases.limits.phase",
                    "Phase must be 1..=3",
                ));
            }
            if limit.max_amps <= 0.0 {
                return Err(EosError::validation(
                    "phases.limits.max_amps",
                    "Must be positive",
                ));
            }
        }

        self.validate_consumers()?;
        self.validate_virtuals()?;

        if self.scheduler.interval_s == 0 {
            return Err(EosError::validation(
                "scheduler.interval_s",
                "Must be greater than 0",
            ));
        }

        if self.enforcement.interval_s == 0 {
            return Err(EosError::validation(
                "enforcement.interval_s",
                "Must be greater than 0",
            ));
        }

        if self.precharge.enabled {
            if self.precharge.interval_s == 0 {
                return Err(EosError::validation(
                    "precharge.interval_s",
                    "Must be greater than 0",
                ));
            }
            if self.precharge.window_end_hour > 23 {
                return Err(EosError::validation(
                    "precharge.window_end_hour",
                    "Must be within 0..=23",
                ));
            }
            if self.precharge.max_grid_charge_w <= 0.0 {
                return Err(EosError::validation(
                    "precharge.max_grid_charge_w",
                    "Must be positive",
                ));
            }
        }

        self.timezone_or_default()
            .parse::<chrono_tz::Tz>()
            .map_err(|_| EosError::validation("timezone", "Unknown timezone name"))?;

        Ok(())
    }

    fn validate_consumers(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for consumer in &self.consumers {
            if consumer.name.is_empty() {
                return Err(EosError::validation("consumers.name", "Cannot be empty"));
            }
            if !names.insert(consumer.name.clone()) {
                return Err(EosError::validation(
                    "consumers.name",
                    "Consumer names must be unique",
                ));
            }
            if let Some(phase) = consumer.phase
                && !(1..=3).contains(&phase)
            {
                return Err(EosError::validation(
                    "consumers.phase",
                    "Phase must be 1..=3",
                ));
            }
            if consumer.stages.is_empty() {
                return Err(EosError::validation(
                    "consumers.stages",
                    "At least one stage is required",
                ));
            }
            let mut prev = f64::INFINITY;
            for stage in &consumer.stages {
                if stage.usage_w <= 0.0 {
                    return Err(EosError::validation(
                        "consumers.stages.usage_w",
                        "Must be positive",
                    ));
                }
                if stage.usage_w >= prev {
                    return Err(EosError::validation(
                        "consumers.stages",
                        "Stages must be strictly descending by usage_w",
                    ));
                }
                prev = stage.usage_w;
                if stage.switch.is_empty() {
                    return Err(EosError::validation(
                        "consumers.stages.switch",
                        "Cannot be empty",
                    ));
                }
                if let Some(id) = stage.switch.strip_prefix(VIRTUAL_PREFIX)
                    && !self.virtuals.iter().any(|v| v.id == id)
                {
                    return Err(EosError::validation(
                        "consumers.stages.switch",
                        "Virtual switch reference does not match any configured virtual entity",
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_virtuals(&self) -> Result<()> {
        let mut ids = std::collections::HashSet::new();
        for virt in &self.virtuals {
            if virt.id.is_empty() {
                return Err(EosError::validation("virtuals.id", "Cannot be empty"));
            }
            if !ids.insert(virt.id.clone()) {
                return Err(EosError::validation(
                    "virtuals.id",
                    "Virtual entity ids must be unique",
                ));
            }
            if virt.usage_ceiling_w <= 0.0 {
                return Err(EosError::validation(
                    "virtuals.usage_ceiling_w",
                    "Must be positive",
                ));
            }
            if virt.events.is_empty() {
                return Err(EosError::validation(
                    "virtuals.events",
                    "At least one event handler must be declared",
                ));
            }
            for event in &virt.events {
                if !VIRTUAL_EVENTS.contains(&event.as_str()) {
                    return Err(EosError::validation(
                        "virtuals.events",
                        "Unknown event name",
                    ));
                }
            }
            if virt.setpoint.entity_id.is_empty() {
                return Err(EosError::validation(
                    "virtuals.setpoint.entity_id",
                    "Cannot be empty",
                ));
            }
        }
        Ok(())
    }

    /// Timezone string, defaulting to UTC when unset
    pub fn timezone_or_default(&self) -> String {
        if self.timezone.is_empty() {
            "UTC".to_string()
        } else {
            self.timezone.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer(name: &str, stages: Vec<(f64, &str)>) -> ConsumerConfig {
        ConsumerConfig {
            name: name.to_string(),
            tracker: None,
            phase: None,
            can_be_turned_off: true,
            stages: stages
                .into_iter()
                .map(|(usage_w, switch)| StageConfig {
                    usage_w,
                    switch: switch.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.hass.timeout_s, 5);
        assert_eq!(config.telemetry.poll_interval_ms, 5000);
        assert_eq!(config.scheduler.interval_s, 60);
        assert!(config.precharge.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.hass.base_url = String::new();
        assert!(config.validate().is_err());

        config = Config::default();
        config.telemetry.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stage_order_is_fatal() {
        let mut config = Config::default();
        config.consumers = vec![consumer(
            "car",
            vec![(1600.0, "switch.car_1"), (4800.0, "switch.car_2")],
        )];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EosError::Validation { .. }));

        // Descending order passes
        config.consumers = vec![consumer(
            "car",
            vec![(4800.0, "switch.car_2"), (1600.0, "switch.car_1")],
        )];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_virtual_reference_must_resolve() {
        let mut config = Config::default();
        config.consumers = vec![consumer("car", vec![(7200.0, "virtual.car_charger")])];
        assert!(config.validate().is_err());

        config.virtuals = vec![VirtualEntityConfig {
            id: "car_charger".to_string(),
            usage_ceiling_w: 7200.0,
            tracker: None,
            events: vec!["export_update".to_string()],
            setpoint: SetpointServiceConfig {
                entity_id: "number.wallbox_grid_setpoint".to_string(),
                ..Default::default()
            },
            release_setpoint_w: 11000.0,
            block_setpoint_w: 0.0,
        }];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            config.telemetry.solar_power_entity,
            deserialized.telemetry.solar_power_entity
        );
    }
}
