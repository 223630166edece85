//! Charging policy engine
//!
//! Pure mapping from an energy snapshot and the previously commanded current
//! to a new target current. The policy set is closed and exhaustively
//! matched; each variant is a pure function of its inputs so decisions are
//! reproducible in tests without any process state.

use crate::config::ChargingConfig;
use crate::logging::get_logger;
use crate::snapshot::EnergySnapshot;
use serde::{Deserialize, Serialize};

/// Charging policy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChargingPolicy {
    /// Export-following: probe upward on surplus, back off on any import
    #[default]
    Eco,
    /// Like ECO but tolerates grid import up to a configured ceiling
    Hurry,
    /// Maximum current regardless of metrics
    Emergency,
}

impl ChargingPolicy {
    /// Policy name for logging
    pub fn name(self) -> &'static str {
        match self {
            ChargingPolicy::Eco => "ECO",
            ChargingPolicy::Hurry => "HURRY",
            ChargingPolicy::Emergency => "EMERGENCY",
        }
    }
}

/// Why the policy produced its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyCause {
    /// Export beyond threshold: probing for more headroom
    Surplus,
    /// Importing (or balanced): backing off to protect the grid
    ImportProtection,
    /// Small export below threshold: holding the current setpoint
    Hold,
    /// Grid flow unknown: a missing signal must never cause drift
    MissingSignal,
    /// Emergency policy: deterministic maximum
    Emergency,
}

/// Target current plus the branch that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub target_amps: i32,
    pub cause: PolicyCause,
}

/// Amp bounds and thresholds governing every evaluation
#[derive(Debug, Clone, Copy)]
pub struct PolicyLimits {
    pub min_amps: i32,
    pub max_amps: i32,
    pub export_threshold_w: i32,
    pub max_import_w: i32,
    pub max_amp_change: i32,
}

impl From<&ChargingConfig> for PolicyLimits {
    fn from(cfg: &ChargingConfig) -> Self {
        Self {
            min_amps: cfg.min_amps,
            max_amps: cfg.max_amps,
            export_threshold_w: cfg.export_threshold_w,
            max_import_w: cfg.max_import_w,
            max_amp_change: cfg.max_amp_change,
        }
    }
}

/// Policy evaluation engine
pub struct PolicyEngine {
    limits: PolicyLimits,
    logger: crate::logging::StructuredLogger,
}

impl PolicyEngine {
    /// Create a new engine with the given limits
    pub fn new(limits: PolicyLimits) -> Self {
        let logger = get_logger("policy");
        Self { limits, logger }
    }

    pub fn limits(&self) -> PolicyLimits {
        self.limits
    }

    /// Compute the target current for one tick
    pub fn evaluate(
        &self,
        policy: ChargingPolicy,
        snapshot: &EnergySnapshot,
        current_amps: i32,
    ) -> PolicyOutcome {
        let outcome = evaluate(policy, snapshot, current_amps, &self.limits);
        self.logger.debug(&format!(
            "{}: grid_flow={:?}W current={}A -> target={}A ({:?})",
            policy.name(),
            snapshot.grid_flow_w,
            current_amps,
            outcome.target_amps,
            outcome.cause
        ));
        outcome
    }
}

/// Pure policy evaluation
pub fn evaluate(
    policy: ChargingPolicy,
    snapshot: &EnergySnapshot,
    current_amps: i32,
    limits: &PolicyLimits,
) -> PolicyOutcome {
    if policy == ChargingPolicy::Emergency {
        return PolicyOutcome {
            target_amps: limits.max_amps,
            cause: PolicyCause::Emergency,
        };
    }

    let Some(grid_flow_w) = snapshot.grid_flow_w else {
        return PolicyOutcome {
            target_amps: clamp_amps(current_amps, limits),
            cause: PolicyCause::MissingSignal,
        };
    };

    let (raw_target, cause) = match policy {
        ChargingPolicy::Eco => eco_target(grid_flow_w, current_amps, limits),
        ChargingPolicy::Hurry => hurry_target(grid_flow_w, current_amps, limits),
        ChargingPolicy::Emergency => unreachable!("handled above"),
    };

    let bounded = bound_step(raw_target, current_amps, limits);
    PolicyOutcome {
        target_amps: clamp_amps(bounded, limits),
        cause,
    }
}

/// ECO: increase on export beyond threshold, decrease on any import,
/// hold on small export
fn eco_target(grid_flow_w: i32, current_amps: i32, limits: &PolicyLimits) -> (i32, PolicyCause) {
    if grid_flow_w < -limits.export_threshold_w {
        (current_amps + 1, PolicyCause::Surplus)
    } else if grid_flow_w >= 0 {
        (current_amps - 2, PolicyCause::ImportProtection)
    } else {
        (current_amps, PolicyCause::Hold)
    }
}

/// HURRY: like ECO above the export threshold, but keeps increasing while
/// import stays within the configured ceiling
fn hurry_target(grid_flow_w: i32, current_amps: i32, limits: &PolicyLimits) -> (i32, PolicyCause) {
    if grid_flow_w < -limits.export_threshold_w {
        (current_amps + 1, PolicyCause::Surplus)
    } else if grid_flow_w <= limits.max_import_w {
        (current_amps + 1, PolicyCause::Surplus)
    } else {
        (current_amps - 2, PolicyCause::ImportProtection)
    }
}

/// Bound the per-tick delta; the asymmetric ±1/±2 steps stay inside the
/// configured bound in normal operation, this guards config extremes
fn bound_step(target: i32, current: i32, limits: &PolicyLimits) -> i32 {
    let delta = (target - current).clamp(-limits.max_amp_change, limits.max_amp_change);
    current + delta
}

/// Clamp to the device/circuit safety bounds
pub fn clamp_amps(amps: i32, limits: &PolicyLimits) -> i32 {
    amps.clamp(limits.min_amps, limits.max_amps)
}
