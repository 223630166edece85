//! Configuration management for Phoebus
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. Invalid bounds are fatal at startup and
//! never surface inside the control loop.

use crate::error::{PhoebusError, Result};
use crate::policy::ChargingPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LAN telemetry device connection configuration
    pub telemetry: TelemetryConfig,

    /// Charging policy and safety limit configuration
    pub charging: ChargingConfig,

    /// Vehicle cloud API configuration
    pub vehicle: VehicleConfig,

    /// OAuth credential configuration for the vehicle API
    pub auth: AuthConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Per-tick CSV metrics configuration
    pub metrics: MetricsConfig,

    /// Control loop tick period in seconds
    pub tick_interval_secs: u64,

    /// Timezone used for schedule-of-day comparisons
    pub timezone: String,
}

/// Telemetry device connection and retry parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// IP address of the energy-management device
    pub host: String,

    /// UDP port (ECHONET Lite standard is 3610)
    pub port: u16,

    /// Timeout for a single property read in milliseconds
    pub read_timeout_ms: u64,

    /// Bounded retry count per property read
    pub read_retries: u32,

    /// Delay between retry attempts in milliseconds
    pub retry_delay_ms: u64,

    /// ECHONET instance number of the solar generation device
    pub solar_instance: u8,

    /// ECHONET instance number of the storage battery device
    pub battery_instance: u8,
}

/// Charging policy selection and safety limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargingConfig {
    /// Active charging policy
    pub policy: ChargingPolicy,

    /// Minimum settable charging current in amperes
    pub min_amps: i32,

    /// Maximum settable charging current in amperes (circuit safety bound)
    pub max_amps: i32,

    /// Export magnitude above which ECO/HURRY may increase current (W)
    pub export_threshold_w: i32,

    /// Grid import ceiling tolerated by HURRY before decreasing (W)
    pub max_import_w: i32,

    /// Maximum per-tick current change in amperes (ECO/HURRY)
    pub max_amp_change: i32,

    /// Discrepancy between commanded and reported amps that counts as a
    /// manual override
    pub override_tolerance_amps: i32,

    /// Cooldown duration after a detected override, in minutes
    pub cooldown_minutes: u64,

    /// Window after our own command during which a reported-amps discrepancy
    /// is attributed to command propagation, not an override (seconds)
    pub command_grace_secs: u64,
}

/// Vehicle cloud API parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    /// Base URL of the vehicle fleet API
    pub base_url: String,

    /// Vehicle identifier used in API paths
    pub vehicle_id: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Bounded wait for a woken vehicle to come online, in seconds
    pub wake_timeout_secs: u64,

    /// Interval between state polls while waiting for wake, in seconds
    pub wake_poll_secs: u64,

    /// Hard cap on commands per sliding minute window
    pub commands_per_minute: usize,

    /// Window within which an identical set-amps command is debounced (seconds)
    pub debounce_secs: u64,
}

/// OAuth refresh-token credential parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// OAuth token endpoint
    pub token_url: String,

    /// OAuth client id
    pub client_id: String,

    /// OAuth client secret
    pub client_secret: String,

    /// Long-lived refresh token
    pub refresh_token: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Path to log file; empty disables file output
    pub file: String,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Per-tick CSV metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether CSV metrics logging is enabled
    pub enabled: bool,

    /// Folder receiving date-named CSV files
    pub folder: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 3610,
            read_timeout_ms: 3000,
            read_retries: 3,
            retry_delay_ms: 500,
            solar_instance: 1,
            battery_instance: 1,
        }
    }
}

impl Default for ChargingConfig {
    fn default() -> Self {
        Self {
            policy: ChargingPolicy::Eco,
            min_amps: 6,
            max_amps: 20,
            export_threshold_w: 50,
            max_import_w: 1000,
            max_amp_change: 4,
            override_tolerance_amps: 1,
            cooldown_minutes: 30,
            command_grace_secs: 30,
        }
    }
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fleet-api.prd.na.vn.cloud.tesla.com".to_string(),
            vehicle_id: String::new(),
            request_timeout_secs: 10,
            wake_timeout_secs: 60,
            wake_poll_secs: 5,
            commands_per_minute: 30,
            debounce_secs: 30,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_url: "https://auth.tesla.com/oauth2/v3/token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/tmp/phoebus.log".to_string(),
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            folder: "data/metrics".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telemetry: TelemetryConfig::default(),
            charging: ChargingConfig::default(),
            vehicle: VehicleConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            tick_interval_secs: 12,
            timezone: "UTC".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from default locations, falling back to defaults
    pub fn load() -> Result<Self> {
        let default_paths = [
            "phoebus_config.yaml",
            "/data/phoebus_config.yaml",
            "/etc/phoebus/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.telemetry.host.is_empty() {
            return Err(PhoebusError::validation(
                "telemetry.host",
                "IP address cannot be empty",
            ));
        }

        if self.telemetry.port == 0 {
            return Err(PhoebusError::validation(
                "telemetry.port",
                "Port must be greater than 0",
            ));
        }

        if self.charging.max_amps <= 0 {
            return Err(PhoebusError::validation(
                "charging.max_amps",
                "Must be positive",
            ));
        }

        if self.charging.min_amps < 0 {
            return Err(PhoebusError::validation(
                "charging.min_amps",
                "Must not be negative",
            ));
        }

        if self.charging.min_amps > self.charging.max_amps {
            return Err(PhoebusError::validation(
                "charging.min_amps",
                "Must not exceed charging.max_amps",
            ));
        }

        if self.charging.max_amp_change <= 0 {
            return Err(PhoebusError::validation(
                "charging.max_amp_change",
                "Must be positive",
            ));
        }

        if self.charging.export_threshold_w < 0 {
            return Err(PhoebusError::validation(
                "charging.export_threshold_w",
                "Must not be negative",
            ));
        }

        if self.vehicle.commands_per_minute == 0 || self.vehicle.commands_per_minute > 30 {
            return Err(PhoebusError::validation(
                "vehicle.commands_per_minute",
                "Must be between 1 and 30",
            ));
        }

        if self.tick_interval_secs == 0 {
            return Err(PhoebusError::validation(
                "tick_interval_secs",
                "Must be greater than 0",
            ));
        }

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(PhoebusError::validation(
                "timezone",
                "Unknown timezone name",
            ));
        }

        Ok(())
    }
}
