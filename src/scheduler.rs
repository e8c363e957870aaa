//! Surplus allocation across consumer stages for Eos
//!
//! Walks consumers in priority order and their stages from largest to
//! smallest, enabling a stage while the remaining budget covers it. The
//! enabled stages of a consumer always form a prefix of its descending
//! stage list: there are no gaps, and shedding retracts the most recently
//! added stage first. After the greedy pass the phase guard veto pass
//! sheds stages until no breaker limit is threatened. Intents are emitted
//! only for switches whose desired state changed, so replaying the same
//! inputs produces no commands.

use crate::config::{ConsumerConfig, VIRTUAL_PREFIX};
use crate::logging::get_logger;
use crate::phase::{PHASE_COUNT, PhaseGuard};
use std::collections::{HashMap, HashSet};

/// Target of a stage switch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SwitchRef {
    /// A real switch entity on the bus
    Entity(String),

    /// A virtual entity, addressed by id
    Virtual(String),
}

impl SwitchRef {
    /// Parse a config switch reference (`virtual.<id>` or an entity id)
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(VIRTUAL_PREFIX) {
            Some(id) => SwitchRef::Virtual(id.to_string()),
            None => SwitchRef::Entity(raw.to_string()),
        }
    }

    /// The bus entity id, when this is a real switch
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            SwitchRef::Entity(id) => Some(id),
            SwitchRef::Virtual(_) => None,
        }
    }
}

impl std::fmt::Display for SwitchRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchRef::Entity(id) => write!(f, "{}", id),
            SwitchRef::Virtual(id) => write!(f, "{}{}", VIRTUAL_PREFIX, id),
        }
    }
}

/// One power stage: a binary claim on the surplus budget
#[derive(Debug, Clone)]
pub struct Stage {
    /// Power drawn when enabled (W)
    pub usage_w: f64,

    /// Switch controlling the stage
    pub switch: SwitchRef,
}

/// A deferrable consumer with descending-ordered stages
#[derive(Debug, Clone)]
pub struct Consumer {
    pub name: String,
    pub tracker: Option<String>,
    /// Electrical phase index (0-based), if the consumer is single-phase
    pub phase: Option<usize>,
    pub can_be_turned_off: bool,
    pub stages: Vec<Stage>,
}

impl Consumer {
    /// Build a runtime consumer from validated configuration
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self {
            name: config.name.clone(),
            tracker: config.tracker.clone(),
            phase: config.phase.map(|p| (p as usize).saturating_sub(1)),
            can_be_turned_off: config.can_be_turned_off,
            stages: config
                .stages
                .iter()
                .map(|s| Stage {
                    usage_w: s.usage_w,
                    switch: SwitchRef::parse(&s.switch),
                })
                .collect(),
        }
    }
}

/// A switch-state change request
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchIntent {
    pub target: SwitchRef,
    pub on: bool,
}

/// Per-tick allocation: for each consumer, how many stages (counted from
/// the largest) are enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub boundaries: Vec<usize>,
}

impl Allocation {
    fn none(consumer_count: usize) -> Self {
        Self {
            boundaries: vec![0; consumer_count],
        }
    }

    /// Total wattage claimed by the enabled stages
    pub fn total_w(&self, consumers: &[Consumer]) -> f64 {
        consumers
            .iter()
            .zip(&self.boundaries)
            .map(|(consumer, &boundary)| enabled_w(consumer, boundary))
            .sum()
    }
}

fn enabled_w(consumer: &Consumer, boundary: usize) -> f64 {
    consumer.stages[..boundary].iter().map(|s| s.usage_w).sum()
}

/// Priority scheduler over the shared surplus budget
pub struct StageScheduler {
    consumers: Vec<Consumer>,
    /// Last emitted desired state per switch
    desired: HashMap<SwitchRef, bool>,
    logger: crate::logging::StructuredLogger,
}

impl StageScheduler {
    /// Create a scheduler over consumers in priority order (first = highest)
    pub fn new(consumers: Vec<Consumer>) -> Self {
        Self {
            consumers,
            desired: HashMap::new(),
            logger: get_logger("scheduler"),
        }
    }

    /// Registered consumers in priority order
    pub fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    /// Consumers with at least one stage currently desired on
    pub fn active_consumers(&self) -> Vec<&Consumer> {
        self.consumers
            .iter()
            .filter(|c| c.stages.iter().any(|s| self.desired_on(&s.switch)))
            .collect()
    }

    fn desired_on(&self, switch: &SwitchRef) -> bool {
        self.desired.get(switch).copied().unwrap_or(false)
    }

    /// Greedy allocation pass. Stages whose switch is faulted earn no
    /// allocation credit and cap the consumer's prefix.
    pub fn plan(&self, budget_w: f64, faulted: &HashSet<String>) -> Allocation {
        let mut allocation = Allocation::none(self.consumers.len());
        let mut allocated_w = 0.0f64;

        if budget_w > 0.0 {
            for (i, consumer) in self.consumers.iter().enumerate() {
                for stage in &consumer.stages {
                    if let Some(entity) = stage.switch.entity_id()
                        && faulted.contains(entity)
                    {
                        // A stuck actuator must not keep collecting credit
                        self.logger.debug(&format!(
                            "{}: switch {} is faulted, capping stages here",
                            consumer.name, stage.switch
                        ));
                        break;
                    }
                    if budget_w - allocated_w >= stage.usage_w {
                        allocation.boundaries[i] += 1;
                        allocated_w += stage.usage_w;
                    } else {
                        // No partial activation below a refused stage
                        break;
                    }
                }
            }
        }

        // A consumer that may not be turned off keeps its largest stage
        // while it is currently running
        for (i, consumer) in self.consumers.iter().enumerate() {
            if !consumer.can_be_turned_off
                && allocation.boundaries[i] == 0
                && consumer.stages.iter().any(|s| self.desired_on(&s.switch))
            {
                allocation.boundaries[i] = 1;
            }
        }

        allocation
    }

    /// Wattage delta per phase between an allocation and the currently
    /// desired switch states. Consumers without a phase assignment do not
    /// project onto a specific phase.
    fn added_watts_per_phase(&self, allocation: &Allocation) -> [f64; PHASE_COUNT] {
        let mut added = [0.0f64; PHASE_COUNT];
        for (i, consumer) in self.consumers.iter().enumerate() {
            let Some(phase) = consumer.phase else {
                continue;
            };
            let current_w: f64 = consumer
                .stages
                .iter()
                .filter(|s| self.desired_on(&s.switch))
                .map(|s| s.usage_w)
                .sum();
            let planned_w = enabled_w(consumer, allocation.boundaries[i]);
            added[phase] += planned_w - current_w;
        }
        added
    }

    /// Phase guard veto pass: retract the active boundary stage of the
    /// lowest-priority consumer on the offending phase until the guard is
    /// satisfied. The safety interlock overrides allocation preference,
    /// including `can_be_turned_off`.
    pub fn apply_veto(
        &self,
        mut allocation: Allocation,
        measured_amps: &[f64; PHASE_COUNT],
        guard: &PhaseGuard,
    ) -> Allocation {
        loop {
            let added = self.added_watts_per_phase(&allocation);
            let Some(veto) = guard.check(measured_amps, &added) else {
                return allocation;
            };

            let shed = self
                .consumers
                .iter()
                .enumerate()
                .rev()
                .find(|(i, consumer)| {
                    consumer.phase == Some(veto.phase) && allocation.boundaries[*i] > 0
                })
                .map(|(i, _)| i);

            match shed {
                Some(i) => {
                    allocation.boundaries[i] -= 1;
                    self.logger.warn(&format!(
                        "Phase L{} veto: shedding stage {} of {}",
                        veto.phase + 1,
                        allocation.boundaries[i] + 1,
                        self.consumers[i].name
                    ));
                }
                None => {
                    self.logger.error(&format!(
                        "Phase L{} over limit but nothing left to shed",
                        veto.phase + 1
                    ));
                    return allocation;
                }
            }
        }
    }

    /// Emit intents for switches whose desired state changed. Re-running
    /// with an unchanged allocation produces no intents.
    pub fn diff(&mut self, allocation: &Allocation) -> Vec<SwitchIntent> {
        let mut intents = Vec::new();
        for (i, consumer) in self.consumers.iter().enumerate() {
            for (idx, stage) in consumer.stages.iter().enumerate() {
                let want = idx < allocation.boundaries[i];
                if self.desired.get(&stage.switch) != Some(&want) {
                    intents.push(SwitchIntent {
                        target: stage.switch.clone(),
                        on: want,
                    });
                    self.desired.insert(stage.switch.clone(), want);
                }
            }
        }
        intents
    }

    /// Force every configured stage off and emit the corresponding intents.
    /// Run once at startup so allocation begins from a clean state.
    pub fn startup_reset(&mut self) -> Vec<SwitchIntent> {
        let mut intents = Vec::new();
        for consumer in &self.consumers {
            for stage in &consumer.stages {
                if self.desired.insert(stage.switch.clone(), false) != Some(false) {
                    intents.push(SwitchIntent {
                        target: stage.switch.clone(),
                        on: false,
                    });
                }
            }
        }
        intents
    }

    /// Convenience: plan, veto, diff in one tick
    pub fn run_tick(
        &mut self,
        budget_w: f64,
        measured_amps: &[f64; PHASE_COUNT],
        guard: &PhaseGuard,
        faulted: &HashSet<String>,
    ) -> Vec<SwitchIntent> {
        let planned = self.plan(budget_w, faulted);
        let vetoed = self.apply_veto(planned, measured_amps, guard);
        self.logger.debug(&format!(
            "budget={:.0}W allocated={:.0}W boundaries={:?}",
            budget_w,
            vetoed.total_w(&self.consumers),
            vetoed.boundaries
        ));
        self.diff(&vetoed)
    }
}
