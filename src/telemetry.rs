//! Energy telemetry reads for Phoebus
//!
//! This module owns the retry and timeout policy for reading the fixed set of
//! energy properties from the LAN device. The wire protocol itself sits
//! behind the [`PropertyReader`] trait; this layer only decides how often to
//! ask and how to degrade when a property will not answer.
//!
//! A failing property never fails the whole read: callers receive a partial
//! map plus a per-property error, and the snapshot layer treats the missing
//! fields as unknown.

use crate::error::TelemetryError;
use crate::logging::get_logger;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

/// Identifiers for the fixed set of properties the control loop consumes
///
/// Each maps to an opaque EPC code on one of the two ECHONET devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyId {
    /// Instantaneous solar generation, watts (solar device, EPC 0xE0)
    SolarPower,
    /// Instantaneous grid flow, watts, positive=import (solar device, EPC 0xE5)
    GridFlow,
    /// Battery state of charge, percent (battery device, EPC 0xBF)
    BatterySoc,
    /// Battery charge/discharge power, watts, positive=charging
    /// (battery device, EPC 0xD3)
    BatteryPower,
}

/// Device class hosting a property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Home solar power generation (class 0x0279)
    Solar,
    /// Storage battery (class 0x027D)
    Battery,
}

impl PropertyId {
    /// All properties read on every tick
    pub const ALL: [PropertyId; 4] = [
        PropertyId::SolarPower,
        PropertyId::GridFlow,
        PropertyId::BatterySoc,
        PropertyId::BatteryPower,
    ];

    /// EPC code of this property
    pub fn epc(self) -> u8 {
        match self {
            PropertyId::SolarPower => 0xE0,
            PropertyId::GridFlow => 0xE5,
            PropertyId::BatterySoc => 0xBF,
            PropertyId::BatteryPower => 0xD3,
        }
    }

    /// Device class hosting this property
    pub fn device(self) -> DeviceClass {
        match self {
            PropertyId::SolarPower | PropertyId::GridFlow => DeviceClass::Solar,
            PropertyId::BatterySoc | PropertyId::BatteryPower => DeviceClass::Battery,
        }
    }
}

impl DeviceClass {
    /// ECHONET class group and class code
    pub fn class_code(self) -> [u8; 2] {
        match self {
            DeviceClass::Solar => [0x02, 0x79],
            DeviceClass::Battery => [0x02, 0x7D],
        }
    }
}

/// Transport capability: read one opaque numeric property
#[async_trait::async_trait]
pub trait PropertyReader: Send + Sync {
    async fn read_property(&self, property: PropertyId) -> Result<i64, TelemetryError>;
}

/// Result of one round of property reads: partial values plus per-property
/// failures
#[derive(Debug, Default)]
pub struct PropertyReadings {
    values: HashMap<PropertyId, i64>,
    errors: HashMap<PropertyId, TelemetryError>,
}

impl PropertyReadings {
    /// Value of a property, if it was read this round
    pub fn get(&self, property: PropertyId) -> Option<i64> {
        self.values.get(&property).copied()
    }

    /// Error for a property, if its read failed
    pub fn error(&self, property: PropertyId) -> Option<&TelemetryError> {
        self.errors.get(&property)
    }

    /// True when every requested property answered
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of properties that answered
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    #[cfg(test)]
    pub fn with_value(mut self, property: PropertyId, value: i64) -> Self {
        self.values.insert(property, value);
        self
    }
}

/// Telemetry reader owning retry/timeout policy for a single read round
pub struct TelemetryReader {
    transport: Box<dyn PropertyReader>,
    retries: u32,
    retry_delay: Duration,
    logger: crate::logging::StructuredLogger,
}

impl TelemetryReader {
    /// Create a new reader over a transport
    pub fn new(transport: Box<dyn PropertyReader>, retries: u32, retry_delay: Duration) -> Self {
        let logger = get_logger("telemetry");
        Self {
            transport,
            retries,
            retry_delay,
            logger,
        }
    }

    /// Read a set of properties, retrying each independently
    ///
    /// A property that exhausts its retries contributes an error entry; the
    /// other properties still return values.
    pub async fn read(&self, properties: &[PropertyId]) -> PropertyReadings {
        let mut readings = PropertyReadings::default();

        for &property in properties {
            match self.read_with_retries(property).await {
                Ok(value) => {
                    readings.values.insert(property, value);
                }
                Err(err) => {
                    self.logger
                        .warn(&format!("{:?} read failed: {}", property, err));
                    readings.errors.insert(property, err);
                }
            }
        }

        readings
    }

    async fn read_with_retries(&self, property: PropertyId) -> Result<i64, TelemetryError> {
        let attempts = self.retries.max(1);
        let mut last_err = TelemetryError::unreachable("no attempt made");

        for attempt in 1..=attempts {
            match self.transport.read_property(property).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.logger.debug(&format!(
                        "{:?} attempt {}/{} failed: {}",
                        property, attempt, attempts, err
                    ));
                    last_err = err;
                    if attempt < attempts {
                        // Lightly backed-off: one extra delay unit per attempt
                        sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }

        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FlakyReader {
        failures_before_success: Mutex<HashMap<PropertyId, u32>>,
    }

    #[async_trait::async_trait]
    impl PropertyReader for FlakyReader {
        async fn read_property(&self, property: PropertyId) -> Result<i64, TelemetryError> {
            let mut map = self.failures_before_success.lock().unwrap();
            let remaining = map.entry(property).or_insert(0);
            if *remaining > 0 {
                *remaining -= 1;
                Err(TelemetryError::timeout("simulated timeout"))
            } else {
                Ok(1500)
            }
        }
    }

    fn reader_with(failures: &[(PropertyId, u32)]) -> TelemetryReader {
        let transport = FlakyReader {
            failures_before_success: Mutex::new(failures.iter().copied().collect()),
        };
        TelemetryReader::new(Box::new(transport), 3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn recovers_within_retry_budget() {
        let reader = reader_with(&[(PropertyId::SolarPower, 2)]);
        let readings = reader.read(&[PropertyId::SolarPower]).await;
        assert_eq!(readings.get(PropertyId::SolarPower), Some(1500));
        assert!(readings.is_complete());
    }

    #[tokio::test]
    async fn one_failing_property_does_not_fail_the_round() {
        let reader = reader_with(&[(PropertyId::GridFlow, 99)]);
        let readings = reader
            .read(&[PropertyId::SolarPower, PropertyId::GridFlow])
            .await;
        assert_eq!(readings.get(PropertyId::SolarPower), Some(1500));
        assert_eq!(readings.get(PropertyId::GridFlow), None);
        assert!(matches!(
            readings.error(PropertyId::GridFlow),
            Some(TelemetryError::Timeout { .. })
        ));
        assert!(!readings.is_complete());
        assert_eq!(readings.value_count(), 1);
    }

    #[test]
    fn property_codes_match_device_classes() {
        assert_eq!(PropertyId::SolarPower.epc(), 0xE0);
        assert_eq!(PropertyId::GridFlow.device(), DeviceClass::Solar);
        assert_eq!(PropertyId::BatteryPower.device(), DeviceClass::Battery);
        assert_eq!(DeviceClass::Battery.class_code(), [0x02, 0x7D]);
    }
}
