//! # Phoebus - Solar-Surplus EV Charging Controller
//!
//! A closed-loop controller that steers an EV's charging current toward the
//! household's solar surplus: it polls home energy telemetry over the LAN,
//! decides a target current under a selectable policy, and drives the
//! vehicle through its cloud API.
//!
//! ## Features
//!
//! - **Policy-driven**: ECO (export-following), HURRY (import-tolerant) and
//!   EMERGENCY (full power) charging policies
//! - **Closed loop**: vehicle-reported current feeds back into every tick
//! - **Override-aware**: manual intervention at the car backs automation off
//!   for a cooldown period
//! - **Fail open**: any subsystem failure degrades a tick to a no-op, never
//!   to an unsafe command
//! - **Configuration**: YAML-based configuration with validation
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `echonet`: ECHONET Lite UDP client for home energy devices
//! - `telemetry`: Property reader with per-property retry and fallback
//! - `snapshot`: Immutable per-tick energy snapshot
//! - `policy`: Pure charging policy engine
//! - `token`: OAuth token management for the vehicle API
//! - `vehicle`: Vehicle state and command client with rate limiting
//! - `controller`: Control loop orchestrator and override state machine
//! - `metrics`: Per-tick CSV control trace

pub mod config;
pub mod controller;
pub mod echonet;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod snapshot;
pub mod telemetry;
pub mod token;
pub mod vehicle;

// Re-export commonly used types
pub use config::Config;
pub use controller::Controller;
pub use error::{PhoebusError, Result};
