//! Desired-state enforcement for Eos
//!
//! Remote actuators are unreliable: commands get lost, integrations
//! restart, devices flip back on their own. This module keeps a registry
//! of desired states, periodically reads back the actual state and
//! re-issues mismatched commands with bounded exponential backoff. After
//! the retry budget is exhausted the entity is flagged faulted (reported,
//! never thrown) and excluded from allocation credit until it reconciles.
//! Commands carry absolute desired state, so retries are always safe.

use crate::bus::{EntityBus, StateValue};
use crate::config::EnforcementConfig;
use crate::error::Result;
use crate::logging::get_logger;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

/// Desired state of an enforced entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesiredState {
    On,
    Off,
    Select(String),
}

impl DesiredState {
    fn matches(&self, actual: &StateValue) -> bool {
        match self {
            DesiredState::On => actual.state == "on",
            DesiredState::Off => actual.state == "off",
            DesiredState::Select(option) => actual.state == *option,
        }
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredState::On => write!(f, "on"),
            DesiredState::Off => write!(f, "off"),
            DesiredState::Select(option) => write!(f, "{}", option),
        }
    }
}

#[derive(Debug)]
struct EnforcementEntry {
    desired: DesiredState,
    attempts: u32,
    next_retry_at: Option<DateTime<Utc>>,
    faulted: bool,
}

/// Reconciles desired vs. actual entity state on its own cadence
pub struct StateEnforcer {
    config: EnforcementConfig,
    entries: HashMap<String, EnforcementEntry>,
    logger: crate::logging::StructuredLogger,
}

impl StateEnforcer {
    pub fn new(config: EnforcementConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            logger: get_logger("enforce"),
        }
    }

    /// Record the desired state of an entity. A changed desired state
    /// resets the retry budget and clears any fault flag.
    pub fn ensure(&mut self, entity_id: &str, desired: DesiredState) {
        match self.entries.get_mut(entity_id) {
            Some(entry) if entry.desired == desired => {}
            Some(entry) => {
                entry.desired = desired;
                entry.attempts = 0;
                entry.next_retry_at = None;
                entry.faulted = false;
            }
            None => {
                self.entries.insert(
                    entity_id.to_string(),
                    EnforcementEntry {
                        desired,
                        attempts: 0,
                        next_retry_at: None,
                        faulted: false,
                    },
                );
            }
        }
    }

    /// Whether an entity is currently flagged faulted
    pub fn is_faulted(&self, entity_id: &str) -> bool {
        self.entries.get(entity_id).is_some_and(|e| e.faulted)
    }

    /// All currently faulted entities
    pub fn faulted_entities(&self) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.faulted)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Entities under enforcement
    pub fn tracked_entities(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn backoff(base_s: f64, cap_s: f64, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let delay_s = (base_s * f64::from(1u32 << exp)).min(cap_s);
        Duration::milliseconds((delay_s * 1000.0) as i64)
    }

    async fn apply(bus: &dyn EntityBus, entity_id: &str, desired: &DesiredState) -> Result<()> {
        match desired {
            DesiredState::On => bus.turn_on(entity_id).await,
            DesiredState::Off => bus.turn_off(entity_id).await,
            DesiredState::Select(option) => bus.select_option(entity_id, option).await,
        }
    }

    /// One reconcile pass: read back every enforced entity and correct
    /// mismatches within the retry budget.
    pub async fn reconcile(&mut self, bus: &dyn EntityBus, now: DateTime<Utc>) {
        let max_retries = self.config.max_retries;
        let base_s = self.config.retry_backoff_s;
        let cap_s = self.config.backoff_cap_s;

        let entities: Vec<String> = self.entries.keys().cloned().collect();
        for entity_id in entities {
            let actual = bus.get_state(&entity_id).await;
            let Some(entry) = self.entries.get_mut(&entity_id) else {
                continue;
            };

            match actual {
                Ok(value) if entry.desired.matches(&value) => {
                    if entry.faulted {
                        self.logger
                            .info(&format!("{} reconciled, clearing fault", entity_id));
                    }
                    entry.attempts = 0;
                    entry.next_retry_at = None;
                    entry.faulted = false;
                    continue;
                }
                Ok(value) => {
                    self.logger.debug(&format!(
                        "State mismatch for {}: actual '{}', desired '{}'",
                        entity_id, value.state, entry.desired
                    ));
                }
                Err(e) => {
                    // Cannot verify; do not burn a retry on a read failure
                    self.logger
                        .warn(&format!("Readback for {} failed: {}", entity_id, e));
                    continue;
                }
            }

            if entry.faulted {
                continue;
            }
            if let Some(at) = entry.next_retry_at
                && now < at
            {
                continue;
            }
            if entry.attempts >= max_retries {
                entry.faulted = true;
                self.logger.error(&format!(
                    "{} failed to reach '{}' after {} attempts, flagging persistent fault",
                    entity_id, entry.desired, entry.attempts
                ));
                continue;
            }

            entry.attempts += 1;
            entry.next_retry_at = Some(now + Self::backoff(base_s, cap_s, entry.attempts));
            let desired = entry.desired.clone();
            self.logger.info(&format!(
                "Re-issuing '{}' to {} (attempt {}/{})",
                desired, entity_id, entry.attempts, max_retries
            ));
            if let Err(e) = Self::apply(bus, &entity_id, &desired).await {
                self.logger
                    .warn(&format!("Command to {} failed: {}", entity_id, e));
            }
        }
    }
}
