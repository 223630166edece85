//! Energy snapshot model
//!
//! One immutable value per control tick aggregating the round of telemetry
//! readings. Fields that did not answer are unknown; a snapshot with every
//! field unknown is still valid and simply yields a no-op decision downstream.
//!
//! Sign conventions are fixed here once: `grid_flow_w` positive means import,
//! negative means export; `battery_power_w` positive means the home battery
//! is charging.

use crate::telemetry::{PropertyId, PropertyReadings};
use chrono::{DateTime, Utc};

/// One round of energy readings with a capture timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct EnergySnapshot {
    /// When this round of readings was captured
    pub captured_at: DateTime<Utc>,

    /// Instantaneous solar generation in watts
    pub solar_power_w: Option<i32>,

    /// Home battery state of charge, 0-100
    pub battery_soc_pct: Option<f64>,

    /// Battery power flow in watts, positive=charging
    pub battery_power_w: Option<i32>,

    /// Grid power flow in watts, positive=import, negative=export
    pub grid_flow_w: Option<i32>,
}

impl EnergySnapshot {
    /// Build a snapshot from a (possibly partial) reading round
    pub fn from_readings(readings: &PropertyReadings, captured_at: DateTime<Utc>) -> Self {
        let as_i32 = |v: i64| i32::try_from(v).ok();
        Self {
            captured_at,
            solar_power_w: readings.get(PropertyId::SolarPower).and_then(as_i32),
            battery_soc_pct: readings
                .get(PropertyId::BatterySoc)
                .map(|v| (v as f64).clamp(0.0, 100.0)),
            battery_power_w: readings.get(PropertyId::BatteryPower).and_then(as_i32),
            grid_flow_w: readings.get(PropertyId::GridFlow).and_then(as_i32),
        }
    }

    /// A snapshot with every field unknown
    pub fn unknown(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            solar_power_w: None,
            battery_soc_pct: None,
            battery_power_w: None,
            grid_flow_w: None,
        }
    }

    /// True when no field carries a value
    pub fn is_empty(&self) -> bool {
        self.solar_power_w.is_none()
            && self.battery_soc_pct.is_none()
            && self.battery_power_w.is_none()
            && self.grid_flow_w.is_none()
    }

    /// Estimated house consumption in watts
    ///
    /// Derived from the flow identity solar + grid_import = consumption +
    /// battery_charge (export counts as negative import). Unknown when any
    /// operand is unknown.
    pub fn estimated_house_load_w(&self) -> Option<i32> {
        let solar = self.solar_power_w?;
        let grid = self.grid_flow_w?;
        let battery = self.battery_power_w?;
        Some(solar + grid - battery)
    }

    /// Solar generation in excess of house consumption, in watts
    ///
    /// Unknown when the house load estimate is unknown.
    pub fn surplus_w(&self) -> Option<i32> {
        let solar = self.solar_power_w?;
        let load = self.estimated_house_load_w()?;
        Some(solar - load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::PropertyReadings;

    fn full_readings() -> PropertyReadings {
        PropertyReadings::default()
            .with_value(PropertyId::SolarPower, 4200)
            .with_value(PropertyId::GridFlow, -800)
            .with_value(PropertyId::BatterySoc, 97)
            .with_value(PropertyId::BatteryPower, 500)
    }

    #[test]
    fn test_from_readings_full() {
        let snap = EnergySnapshot::from_readings(&full_readings(), Utc::now());
        assert_eq!(snap.solar_power_w, Some(4200));
        assert_eq!(snap.grid_flow_w, Some(-800));
        assert_eq!(snap.battery_soc_pct, Some(97.0));
        assert_eq!(snap.battery_power_w, Some(500));
        assert!(!snap.is_empty());
    }

    #[test]
    fn test_house_load_and_surplus() {
        let snap = EnergySnapshot::from_readings(&full_readings(), Utc::now());
        // 4200 solar - 800 exported - 500 into the battery = 2900 consumed
        assert_eq!(snap.estimated_house_load_w(), Some(2900));
        // 4200 - 2900 = 1300 available beyond house load
        assert_eq!(snap.surplus_w(), Some(1300));
    }

    #[test]
    fn test_surplus_unknown_when_operand_missing() {
        let readings = PropertyReadings::default()
            .with_value(PropertyId::SolarPower, 4200)
            .with_value(PropertyId::GridFlow, -800);
        let snap = EnergySnapshot::from_readings(&readings, Utc::now());
        assert_eq!(snap.estimated_house_load_w(), None);
        assert_eq!(snap.surplus_w(), None);
    }

    #[test]
    fn test_all_unknown_snapshot_is_valid() {
        let snap = EnergySnapshot::from_readings(&PropertyReadings::default(), Utc::now());
        assert!(snap.is_empty());
        assert_eq!(snap.surplus_w(), None);
    }

    #[test]
    fn test_soc_clamped() {
        let readings = PropertyReadings::default().with_value(PropertyId::BatterySoc, 130);
        let snap = EnergySnapshot::from_readings(&readings, Utc::now());
        assert_eq!(snap.battery_soc_pct, Some(100.0));
    }
}
