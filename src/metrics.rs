//! Per-tick CSV metrics
//!
//! Writes one row per control tick into a date-named file, enough to replay
//! the full control trace offline. Files roll at local midnight in the
//! configured timezone.

use crate::config::MetricsConfig;
use crate::controller::TickRecord;
use crate::error::Result;
use crate::logging::get_logger;
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const HEADER: &str = "timestamp,solar_w,grid_flow_w,battery_w,battery_soc_pct,\
target_amps,action,reason,vehicle_reported_amps,vehicle_state,override_state";

pub struct MetricsLogger {
    folder: PathBuf,
    timezone: Tz,
    open_date: Option<NaiveDate>,
    file: Option<File>,
    logger: crate::logging::StructuredLogger,
}

impl MetricsLogger {
    pub fn new(config: &MetricsConfig, timezone: Tz) -> Result<Self> {
        std::fs::create_dir_all(&config.folder)?;
        Ok(Self {
            folder: PathBuf::from(&config.folder),
            timezone,
            open_date: None,
            file: None,
            logger: get_logger("metrics"),
        })
    }

    /// Append one tick row, rolling to a new file at local midnight
    pub fn record(&mut self, record: &TickRecord) -> Result<()> {
        let local_date = record.at.with_timezone(&self.timezone).date_naive();
        if self.open_date != Some(local_date) {
            self.roll(local_date)?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| crate::error::PhoebusError::io("metrics file not open"))?;
        writeln!(file, "{}", format_row(record))?;
        Ok(())
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.open_date.map(|d| self.path_for(d))
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.folder.join(format!("{}.csv", date.format("%Y%m%d")))
    }

    fn roll(&mut self, date: NaiveDate) -> Result<()> {
        let path = self.path_for(date);
        let fresh = !Path::new(&path).exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if fresh {
            writeln!(file, "{}", HEADER)?;
        }
        self.logger
            .info(&format!("metrics file: {}", path.display()));
        self.open_date = Some(date);
        self.file = Some(file);
        Ok(())
    }
}

fn format_row(record: &TickRecord) -> String {
    fn opt<T: std::fmt::Display>(v: Option<T>) -> String {
        v.map(|x| x.to_string()).unwrap_or_default()
    }
    format!(
        "{},{},{},{},{},{},{},{},{},{},{}",
        record.at.to_rfc3339(),
        opt(record.snapshot.solar_power_w),
        opt(record.snapshot.grid_flow_w),
        opt(record.snapshot.battery_power_w),
        opt(record.snapshot.battery_soc_pct),
        record.decision.target_amps,
        record.decision.action.label(),
        record.decision.reason.label(),
        opt(record.vehicle_reported_amps),
        record
            .vehicle_state
            .map(|s| s.label())
            .unwrap_or_default(),
        record.override_state.label()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControlAction, ControlDecision, DecisionReason, OverrideState};
    use crate::snapshot::EnergySnapshot;
    use crate::vehicle::ChargingState;
    use chrono::{TimeZone, Utc};

    fn record_at(at: chrono::DateTime<Utc>) -> TickRecord {
        TickRecord {
            at,
            snapshot: EnergySnapshot {
                captured_at: at,
                solar_power_w: Some(3200),
                battery_soc_pct: Some(88.0),
                battery_power_w: Some(-200),
                grid_flow_w: Some(-150),
            },
            decision: ControlDecision {
                target_amps: 9,
                action: ControlAction::SetAmps,
                reason: DecisionReason::Surplus,
            },
            vehicle_reported_amps: Some(8),
            vehicle_state: Some(ChargingState::Charging),
            override_state: OverrideState::Normal,
        }
    }

    #[test]
    fn writes_header_once_and_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = MetricsConfig {
            enabled: true,
            folder: dir.path().to_string_lossy().into_owned(),
        };
        let mut metrics = MetricsLogger::new(&config, chrono_tz::UTC).unwrap();

        let at = Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap();
        metrics.record(&record_at(at)).unwrap();
        metrics
            .record(&record_at(at + chrono::Duration::seconds(12)))
            .unwrap();

        let path = metrics.current_path().unwrap();
        assert!(path.ends_with("20260314.csv"));
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,solar_w"));
        assert!(lines[1].contains(",set_amps,surplus,"));
        assert!(lines[1].contains("3200"));
    }

    #[test]
    fn rolls_to_new_file_across_midnight() {
        let dir = tempfile::tempdir().unwrap();
        let config = MetricsConfig {
            enabled: true,
            folder: dir.path().to_string_lossy().into_owned(),
        };
        let mut metrics = MetricsLogger::new(&config, chrono_tz::Asia::Tokyo).unwrap();

        // 14:50 UTC is 23:50 in Tokyo, 15:10 UTC is 00:10 the next day
        let before = Utc.with_ymd_and_hms(2026, 3, 14, 14, 50, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 14, 15, 10, 0).unwrap();
        metrics.record(&record_at(before)).unwrap();
        let first = metrics.current_path().unwrap();
        metrics.record(&record_at(after)).unwrap();
        let second = metrics.current_path().unwrap();

        assert!(first.ends_with("20260314.csv"));
        assert!(second.ends_with("20260315.csv"));
        assert!(first.exists() && second.exists());
    }

    #[test]
    fn unknown_fields_serialize_empty() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap();
        let mut record = record_at(at);
        record.snapshot.grid_flow_w = None;
        record.vehicle_reported_amps = None;
        let row = format_row(&record);
        assert!(row.contains("3200,,"));
    }
}
