//! Control loop orchestrator
//!
//! One tick flows in a single direction: telemetry poll, snapshot, gating,
//! policy evaluation, vehicle state fetch, action dispatch. The orchestrator
//! owns the override/cooldown state machine and is the error boundary: any
//! sub-component failure degrades that tick to a no-op, never a crash.

use crate::config::Config;
use crate::error::{PhoebusError, Result, VehicleError};
use crate::logging::get_logger;
use crate::metrics::MetricsLogger;
use crate::policy::{ChargingPolicy, PolicyCause, PolicyEngine, PolicyOutcome};
use crate::snapshot::EnergySnapshot;
use crate::telemetry::{PropertyId, TelemetryReader};
use crate::token::TokenSource;
use crate::vehicle::{ChargingState, VehicleClient, VehicleState};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// What the orchestrator asks the command client to do this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    NoOp,
    StartCharging,
    StopCharging,
    SetAmps,
}

impl ControlAction {
    pub fn label(self) -> &'static str {
        match self {
            ControlAction::NoOp => "noop",
            ControlAction::StartCharging => "start_charging",
            ControlAction::StopCharging => "stop_charging",
            ControlAction::SetAmps => "set_amps",
        }
    }
}

/// Cause tag attached to every decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Surplus,
    ImportProtection,
    Hold,
    MissingSignal,
    Emergency,
    ScheduleBlock,
    OverrideCooldown,
    Disconnected,
    ChargeComplete,
    VehicleUnavailable,
    RateLimited,
}

impl DecisionReason {
    pub fn label(self) -> &'static str {
        match self {
            DecisionReason::Surplus => "surplus",
            DecisionReason::ImportProtection => "import_protection",
            DecisionReason::Hold => "hold",
            DecisionReason::MissingSignal => "missing_signal",
            DecisionReason::Emergency => "emergency",
            DecisionReason::ScheduleBlock => "schedule_block",
            DecisionReason::OverrideCooldown => "override_cooldown",
            DecisionReason::Disconnected => "disconnected",
            DecisionReason::ChargeComplete => "charge_complete",
            DecisionReason::VehicleUnavailable => "vehicle_unavailable",
            DecisionReason::RateLimited => "rate_limited",
        }
    }
}

impl From<PolicyCause> for DecisionReason {
    fn from(cause: PolicyCause) -> Self {
        match cause {
            PolicyCause::Surplus => DecisionReason::Surplus,
            PolicyCause::ImportProtection => DecisionReason::ImportProtection,
            PolicyCause::Hold => DecisionReason::Hold,
            PolicyCause::MissingSignal => DecisionReason::MissingSignal,
            PolicyCause::Emergency => DecisionReason::Emergency,
        }
    }
}

/// Per-tick decision, produced once and consumed immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlDecision {
    pub target_amps: i32,
    pub action: ControlAction,
    pub reason: DecisionReason,
}

impl ControlDecision {
    fn noop(target_amps: i32, reason: DecisionReason) -> Self {
        Self {
            target_amps,
            action: ControlAction::NoOp,
            reason,
        }
    }
}

/// Cross-tick manual override state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideState {
    Normal,
    OverrideDetected { since: DateTime<Utc> },
    Cooldown { until: DateTime<Utc> },
}

impl OverrideState {
    pub fn label(self) -> &'static str {
        match self {
            OverrideState::Normal => "normal",
            OverrideState::OverrideDetected { .. } => "override_detected",
            OverrideState::Cooldown { .. } => "cooldown",
        }
    }

    /// Advance time-driven transitions; returns the state that governs this
    /// tick
    fn step(self, now: DateTime<Utc>, cooldown: ChronoDuration) -> Self {
        match self {
            OverrideState::OverrideDetected { since } => OverrideState::Cooldown {
                until: since + cooldown,
            },
            OverrideState::Cooldown { until } if now >= until => OverrideState::Normal,
            other => other,
        }
    }

    fn blocks_commands(self, now: DateTime<Utc>) -> bool {
        match self {
            OverrideState::Normal => false,
            OverrideState::OverrideDetected { .. } => true,
            OverrideState::Cooldown { until } => now < until,
        }
    }
}

/// Everything a single tick observed and decided, for logging and metrics
#[derive(Debug, Clone)]
pub struct TickRecord {
    pub at: DateTime<Utc>,
    pub snapshot: EnergySnapshot,
    pub decision: ControlDecision,
    pub vehicle_reported_amps: Option<i32>,
    pub vehicle_state: Option<ChargingState>,
    pub override_state: OverrideState,
}

pub struct Controller {
    policy: ChargingPolicy,
    engine: PolicyEngine,
    telemetry: TelemetryReader,
    vehicle: VehicleClient,
    tokens: Arc<dyn TokenSource>,
    metrics: Option<MetricsLogger>,
    override_state: OverrideState,
    override_tolerance_amps: i32,
    cooldown: ChronoDuration,
    command_grace: ChronoDuration,
    tick_interval: std::time::Duration,
    logger: crate::logging::StructuredLogger,
}

impl Controller {
    pub fn new(
        config: &Config,
        telemetry: TelemetryReader,
        vehicle: VehicleClient,
        tokens: Arc<dyn TokenSource>,
        metrics: Option<MetricsLogger>,
    ) -> Self {
        let charging = &config.charging;
        Self {
            policy: charging.policy,
            engine: PolicyEngine::new(charging.into()),
            telemetry,
            vehicle,
            tokens,
            metrics,
            override_state: OverrideState::Normal,
            override_tolerance_amps: charging.override_tolerance_amps,
            cooldown: ChronoDuration::minutes(charging.cooldown_minutes as i64),
            command_grace: ChronoDuration::seconds(charging.command_grace_secs as i64),
            tick_interval: std::time::Duration::from_secs(config.tick_interval_secs),
            logger: get_logger("controller"),
        }
    }

    pub fn override_state(&self) -> OverrideState {
        self.override_state
    }

    /// Run ticks until the shutdown channel fires; never aborts mid-tick
    pub async fn run(&mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.logger.info(&format!(
            "control loop started (policy={}, tick={:?})",
            self.policy.name(),
            self.tick_interval
        ));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let record = self.tick().await;
                    self.emit(&record);
                }
                _ = shutdown_rx.recv() => {
                    self.logger.info("shutdown signal received, stopping control loop");
                    break;
                }
            }
        }
    }

    /// Execute one complete poll/decide/dispatch cycle
    pub async fn tick(&mut self) -> TickRecord {
        let now = Utc::now();
        let readings = self.telemetry.read(&PropertyId::ALL).await;
        let snapshot = EnergySnapshot::from_readings(&readings, now);

        let stepped = self.override_state.step(now, self.cooldown);
        if stepped == OverrideState::Normal && self.override_state != OverrideState::Normal {
            // adopt whatever the user set as the new baseline, otherwise the
            // same discrepancy would immediately re-trigger detection
            self.vehicle.reset_commanded();
            self.logger
                .info("override cooldown elapsed, resuming control");
        }
        self.override_state = stepped;
        let decision = self.decide_and_dispatch(&snapshot, now).await;

        TickRecord {
            at: now,
            snapshot,
            decision,
            vehicle_reported_amps: self
                .vehicle
                .cached_state()
                .and_then(|s| s.reported_amps),
            vehicle_state: self.vehicle.cached_state().map(|s| s.charging_state),
            override_state: self.override_state,
        }
    }

    async fn decide_and_dispatch(
        &mut self,
        snapshot: &EnergySnapshot,
        now: DateTime<Utc>,
    ) -> ControlDecision {
        let current_amps = self.current_amps();

        if self.override_state.blocks_commands(now) {
            return ControlDecision::noop(current_amps, DecisionReason::OverrideCooldown);
        }

        if let Some(state) = self.vehicle.cached_state() {
            if schedule_blocks(state, now) {
                return ControlDecision::noop(current_amps, DecisionReason::ScheduleBlock);
            }
        }

        let outcome = self.engine.evaluate(self.policy, snapshot, current_amps);

        let state = match self.fetch_vehicle_state(outcome).await {
            Ok(state) => state,
            Err(e) => {
                self.logger
                    .warn(&format!("vehicle state unavailable this tick: {}", e));
                return ControlDecision::noop(outcome.target_amps, DecisionReason::VehicleUnavailable);
            }
        };

        // gate again with the fresh state; the cache may have been stale or
        // empty on the first tick
        if schedule_blocks(&state, now) {
            return ControlDecision::noop(outcome.target_amps, DecisionReason::ScheduleBlock);
        }

        if self.detect_override(&state, now) {
            return ControlDecision::noop(outcome.target_amps, DecisionReason::OverrideCooldown);
        }

        let decision = select_action(outcome, current_amps, &state, self.engine.limits().min_amps);
        self.dispatch(decision).await
    }

    fn current_amps(&self) -> i32 {
        self.vehicle
            .ledger()
            .last_commanded_amps
            .or_else(|| self.vehicle.cached_state().and_then(|s| s.reported_amps))
            .unwrap_or(self.engine.limits().min_amps)
    }

    /// Fetch fresh vehicle state, waking only when we actually intend to
    /// drive current into the vehicle
    async fn fetch_vehicle_state(&mut self, outcome: PolicyOutcome) -> Result<VehicleState> {
        let asleep = self
            .vehicle
            .cached_state()
            .is_none_or(|s| s.charging_state == ChargingState::Asleep);
        if outcome.target_amps > 0 && asleep {
            self.vehicle.ensure_awake().await
        } else {
            self.vehicle.refresh_state().await
        }
    }

    /// Manual intervention check: the vehicle drawing something other than
    /// what we last commanded, outside the grace window after that command
    fn detect_override(&mut self, state: &VehicleState, now: DateTime<Utc>) -> bool {
        let OverrideState::Normal = self.override_state else {
            return true;
        };
        let (Some(commanded), Some(reported)) =
            (self.vehicle.ledger().last_commanded_amps, state.reported_amps)
        else {
            return false;
        };
        let within_grace = self
            .vehicle
            .ledger()
            .last_command_time
            .is_some_and(|t| now.signed_duration_since(t) < self.command_grace);
        if (reported - commanded).abs() > self.override_tolerance_amps && !within_grace {
            self.logger.warn(&format!(
                "manual override detected (commanded {}A, vehicle reports {}A), backing off for {}m",
                commanded,
                reported,
                self.cooldown.num_minutes()
            ));
            self.override_state = OverrideState::OverrideDetected { since: now };
            return true;
        }
        false
    }

    async fn dispatch(&mut self, decision: ControlDecision) -> ControlDecision {
        let result = if decision.action == ControlAction::NoOp {
            Ok(())
        } else {
            self.dispatch_once(decision, true).await
        };

        match result {
            Ok(()) => decision,
            Err(PhoebusError::Vehicle(VehicleError::RateLimited { .. })) => {
                self.logger.warn("command budget exhausted, deferring to next tick");
                ControlDecision::noop(decision.target_amps, DecisionReason::RateLimited)
            }
            Err(e) => {
                self.logger
                    .error(&format!("{} failed: {}", decision.action.label(), e));
                ControlDecision::noop(decision.target_amps, DecisionReason::VehicleUnavailable)
            }
        }
    }

    /// Issue the command, refreshing credentials and retrying once if the
    /// API reports them expired
    async fn dispatch_once(&mut self, decision: ControlDecision, retry_auth: bool) -> Result<()> {
        let result = match decision.action {
            ControlAction::NoOp => return Ok(()),
            ControlAction::StartCharging => self.vehicle.start_charging().await,
            ControlAction::StopCharging => self.vehicle.stop_charging().await,
            ControlAction::SetAmps => self.vehicle.set_amps(decision.target_amps).await,
        };
        match result {
            Err(PhoebusError::Vehicle(VehicleError::AuthExpired { .. })) if retry_auth => {
                self.logger.warn("credentials expired, refreshing and retrying once");
                self.tokens.refresh().await?;
                Box::pin(self.dispatch_once(decision, false)).await
            }
            other => other,
        }
    }

    fn emit(&mut self, record: &TickRecord) {
        self.logger.info(&format!(
            "tick solar={:?}W grid={:?}W soc={:?}% target={}A action={} reason={} reported={:?}A override={}",
            record.snapshot.solar_power_w,
            record.snapshot.grid_flow_w,
            record.snapshot.battery_soc_pct,
            record.decision.target_amps,
            record.decision.action.label(),
            record.decision.reason.label(),
            record.vehicle_reported_amps,
            record.override_state.label()
        ));
        if let Some(metrics) = &mut self.metrics {
            if let Err(e) = metrics.record(record) {
                self.logger.warn(&format!("metrics write failed: {}", e));
            }
        }
    }
}

/// True if the vehicle-side schedule forbids automation right now
fn schedule_blocks(state: &VehicleState, now: DateTime<Utc>) -> bool {
    if state.charging_state == ChargingState::Unknown {
        return false;
    }
    if !state.schedule_enabled {
        return true;
    }
    match state.schedule_start {
        Some(start) => now < start,
        None => false,
    }
}

/// Map a policy target plus observed vehicle state to a single action
fn select_action(
    outcome: PolicyOutcome,
    current_amps: i32,
    state: &VehicleState,
    min_amps: i32,
) -> ControlDecision {
    let reason: DecisionReason = outcome.cause.into();
    let target = outcome.target_amps;

    match state.charging_state {
        ChargingState::Disconnected => {
            return ControlDecision::noop(target, DecisionReason::Disconnected);
        }
        ChargingState::Complete => {
            return ControlDecision::noop(target, DecisionReason::ChargeComplete);
        }
        _ => {}
    }

    if outcome.cause == PolicyCause::MissingSignal {
        return ControlDecision::noop(target, reason);
    }

    match state.charging_state {
        ChargingState::Stopped => {
            // importing while already parked at the floor: stay stopped
            if outcome.cause == PolicyCause::ImportProtection && target <= min_amps {
                ControlDecision::noop(target, reason)
            } else {
                ControlDecision {
                    target_amps: target,
                    action: ControlAction::StartCharging,
                    reason,
                }
            }
        }
        ChargingState::Charging => {
            // at the floor and still importing, drop out entirely
            if outcome.cause == PolicyCause::ImportProtection
                && target <= min_amps
                && current_amps <= min_amps
            {
                ControlDecision {
                    target_amps: target,
                    action: ControlAction::StopCharging,
                    reason,
                }
            } else if target != current_amps || state.reported_amps != Some(target) {
                ControlDecision {
                    target_amps: target,
                    action: ControlAction::SetAmps,
                    reason,
                }
            } else {
                ControlDecision::noop(target, reason)
            }
        }
        _ => ControlDecision::noop(target, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyCause;

    fn state(charging: ChargingState, reported: Option<i32>) -> VehicleState {
        VehicleState {
            charging_state: charging,
            reported_amps: reported,
            soc_pct: Some(50.0),
            schedule_enabled: true,
            schedule_start: None,
            fetched_at: Utc::now(),
        }
    }

    fn outcome(target: i32, cause: PolicyCause) -> PolicyOutcome {
        PolicyOutcome {
            target_amps: target,
            cause,
        }
    }

    #[test]
    fn override_state_cooldown_lifecycle() {
        let now = Utc::now();
        let cooldown = ChronoDuration::minutes(30);

        let detected = OverrideState::OverrideDetected { since: now };
        let s = detected.step(now, cooldown);
        assert_eq!(
            s,
            OverrideState::Cooldown {
                until: now + cooldown
            }
        );
        assert!(s.blocks_commands(now + ChronoDuration::minutes(29)));

        let resumed = s.step(now + ChronoDuration::minutes(31), cooldown);
        assert_eq!(resumed, OverrideState::Normal);
    }

    #[test]
    fn schedule_disabled_blocks() {
        let mut s = state(ChargingState::Stopped, Some(0));
        s.schedule_enabled = false;
        assert!(schedule_blocks(&s, Utc::now()));
    }

    #[test]
    fn schedule_start_in_future_blocks() {
        let now = Utc::now();
        let mut s = state(ChargingState::Stopped, Some(0));
        s.schedule_start = Some(now + ChronoDuration::hours(2));
        assert!(schedule_blocks(&s, now));

        s.schedule_start = Some(now - ChronoDuration::hours(1));
        assert!(!schedule_blocks(&s, now));
    }

    #[test]
    fn unknown_vehicle_state_does_not_block_schedule() {
        let s = VehicleState::unknown(Utc::now());
        assert!(!schedule_blocks(&s, Utc::now()));
    }

    #[test]
    fn stopped_vehicle_with_surplus_starts_charging() {
        let d = select_action(
            outcome(7, PolicyCause::Surplus),
            6,
            &state(ChargingState::Stopped, Some(0)),
            6,
        );
        assert_eq!(d.action, ControlAction::StartCharging);
        assert_eq!(d.reason, DecisionReason::Surplus);
    }

    #[test]
    fn charging_vehicle_gets_amps_adjusted() {
        let d = select_action(
            outcome(9, PolicyCause::Surplus),
            8,
            &state(ChargingState::Charging, Some(8)),
            6,
        );
        assert_eq!(d.action, ControlAction::SetAmps);
        assert_eq!(d.target_amps, 9);
    }

    #[test]
    fn charging_at_floor_while_importing_stops() {
        let d = select_action(
            outcome(6, PolicyCause::ImportProtection),
            6,
            &state(ChargingState::Charging, Some(6)),
            6,
        );
        assert_eq!(d.action, ControlAction::StopCharging);
        assert_eq!(d.reason, DecisionReason::ImportProtection);
    }

    #[test]
    fn disconnected_vehicle_is_a_noop() {
        let d = select_action(
            outcome(10, PolicyCause::Surplus),
            6,
            &state(ChargingState::Disconnected, None),
            6,
        );
        assert_eq!(d.action, ControlAction::NoOp);
        assert_eq!(d.reason, DecisionReason::Disconnected);
    }

    #[test]
    fn missing_signal_never_dispatches() {
        let d = select_action(
            outcome(8, PolicyCause::MissingSignal),
            8,
            &state(ChargingState::Charging, Some(8)),
            6,
        );
        assert_eq!(d.action, ControlAction::NoOp);
        assert_eq!(d.reason, DecisionReason::MissingSignal);
    }

    #[test]
    fn matching_target_is_a_noop() {
        let d = select_action(
            outcome(8, PolicyCause::Hold),
            8,
            &state(ChargingState::Charging, Some(8)),
            6,
        );
        assert_eq!(d.action, ControlAction::NoOp);
    }
}
