//! Phase overload protection for Eos
//!
//! Compares measured per-phase current against the breaker limits and
//! vetoes allocations whose projected current would exceed a limit minus
//! the safety margin. The guard is a hard interlock: the scheduler must
//! shed load until the guard is satisfied.

use crate::config::PhasesConfig;
use crate::logging::get_logger;

/// Number of electrical phases
pub const PHASE_COUNT: usize = 3;

/// A veto raised for one overloaded phase
#[derive(Debug, Clone, Copy)]
pub struct PhaseVeto {
    /// Offending phase index, 0-based
    pub phase: usize,

    /// Projected current on that phase (A)
    pub projected_amps: f64,

    /// Limit minus safety margin (A)
    pub allowed_amps: f64,
}

/// Static per-phase limits plus projection logic
pub struct PhaseGuard {
    max_amps: [f64; PHASE_COUNT],
    margin_amps: f64,
    voltage_v: f64,
    logger: crate::logging::StructuredLogger,
}

impl PhaseGuard {
    /// Build the guard from configuration. Phases without a configured
    /// limit are unconstrained.
    pub fn new(config: &PhasesConfig) -> Self {
        let mut max_amps = [f64::INFINITY; PHASE_COUNT];
        for limit in &config.limits {
            let idx = (limit.phase as usize).saturating_sub(1);
            if idx < PHASE_COUNT {
                max_amps[idx] = limit.max_amps;
            }
        }
        Self {
            max_amps,
            margin_amps: config.safety_margin_amps,
            voltage_v: config.nominal_voltage_v,
            logger: get_logger("phase"),
        }
    }

    /// Nominal phase-to-neutral voltage
    pub fn voltage_v(&self) -> f64 {
        self.voltage_v
    }

    /// Check a tentative allocation: `added_w` is the wattage delta the
    /// allocation would put on each phase relative to the current state
    /// (negative when stages turn off). Returns the first phase whose
    /// projected current exceeds its allowed limit.
    pub fn check(
        &self,
        measured_amps: &[f64; PHASE_COUNT],
        added_w: &[f64; PHASE_COUNT],
    ) -> Option<PhaseVeto> {
        for phase in 0..PHASE_COUNT {
            let projected = measured_amps[phase] + added_w[phase] / self.voltage_v;
            let allowed = self.max_amps[phase] - self.margin_amps;
            if projected > allowed {
                self.logger.warn(&format!(
                    "Phase L{} projected at {:.1}A exceeds allowed {:.1}A",
                    phase + 1,
                    projected,
                    allowed
                ));
                return Some(PhaseVeto {
                    phase,
                    projected_amps: projected,
                    allowed_amps: allowed,
                });
            }
        }
        None
    }
}
