//! Threshold alarms.
//!
//! [`evaluate`] is a pure function of one reading and the threshold table.
//! Every metric is checked on its own, so one reading can raise several
//! alarms, but never more than one per metric: the critical band is checked
//! first and wins over the warning band.

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use anyhow::{Context, Result};

use crate::{Alarm, AlarmStatus, AlarmType, Reading, Severity};

mod actions;
mod engine;
mod recorder;

pub use actions::AlarmActions;
pub use engine::AlarmEngine;
pub use recorder::AlarmRecorder;

// ---

/// Warning and critical limits of one metric. A value strictly beyond a
/// limit violates it; unset limits are never checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Band {
    #[serde(default)]
    pub warn_low: Option<f64>,
    #[serde(default)]
    pub warn_high: Option<f64>,
    #[serde(default)]
    pub crit_low: Option<f64>,
    #[serde(default)]
    pub crit_high: Option<f64>,
}

/// Threshold table. Loaded from JSON with missing top-level fields keeping
/// their defaults; a band that is present replaces the default band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmThresholds {
    pub temperature: Band,
    pub humidity: Band,
    pub pm25: Band,
    pub co2: Band,
    pub illuminance: Band,
    pub occupancy_capacity: Option<u32>,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        // ---
        Self {
            temperature: Band {
                warn_low: Some(18.0),
                warn_high: Some(28.0),
                crit_low: Some(10.0),
                crit_high: Some(35.0),
            },
            humidity: Band {
                warn_low: Some(40.0),
                warn_high: Some(70.0),
                crit_low: Some(20.0),
                crit_high: Some(90.0),
            },
            pm25: Band {
                warn_high: Some(75.0),
                crit_high: Some(150.0),
                ..Band::default()
            },
            co2: Band {
                warn_high: Some(1000.0),
                crit_high: Some(2000.0),
                ..Band::default()
            },
            illuminance: Band {
                warn_low: Some(300.0),
                ..Band::default()
            },
            occupancy_capacity: Some(30),
        }
    }
}

impl AlarmThresholds {
    /// Read a threshold table from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        // ---
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read alarm thresholds '{}'", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid alarm thresholds in '{}'", path.display()))
    }
}

struct Metric {
    name: &'static str,
    unit: &'static str,
    high: AlarmType,
    low: AlarmType,
}

struct Violation {
    alarm_type: AlarmType,
    severity: Severity,
    threshold: f64,
    above: bool,
}

fn check_band(metric: &Metric, value: f64, band: &Band) -> Option<Violation> {
    // ---
    let checks = [
        (band.crit_high, Severity::Danger, true),
        (band.crit_low, Severity::Danger, false),
        (band.warn_high, Severity::Warning, true),
        (band.warn_low, Severity::Warning, false),
    ];
    checks.into_iter().find_map(|(limit, severity, above)| {
        let limit = limit?;
        let violated = if above { value > limit } else { value < limit };
        violated.then(|| Violation {
            alarm_type: if above { metric.high } else { metric.low },
            severity,
            threshold: limit,
            above,
        })
    })
}

/// Same reading and alarm type always map to the same id, so redelivered
/// readings raise alarms the recorder already holds.
fn alarm_id(reading: &Reading, alarm_type: AlarmType) -> Uuid {
    // ---
    let name = format!(
        "{}:{}:{}",
        reading.site_id,
        reading.timestamp.to_rfc3339(),
        alarm_type.as_str()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

fn raise(reading: &Reading, violation: Violation, message: String, observed: f64) -> Alarm {
    // ---
    Alarm {
        id: alarm_id(reading, violation.alarm_type),
        site_id: reading.site_id,
        site_name: reading.site_name.clone(),
        alarm_type: violation.alarm_type,
        severity: violation.severity,
        message,
        observed_value: observed,
        threshold_value: violation.threshold,
        raised_at: reading.timestamp,
        status: AlarmStatus::Pending,
        confirmed_by: None,
        confirmed_at: None,
        resolved_by: None,
        resolved_at: None,
        ignored_by: None,
        ignored_at: None,
        remark: None,
    }
}

const TEMPERATURE: Metric = Metric {
    name: "temperature",
    unit: "°C",
    high: AlarmType::TempHigh,
    low: AlarmType::TempLow,
};
const HUMIDITY: Metric = Metric {
    name: "humidity",
    unit: "%",
    high: AlarmType::HumidityHigh,
    low: AlarmType::HumidityLow,
};
const PM25: Metric = Metric {
    name: "pm25",
    unit: " μg/m³",
    high: AlarmType::Pm25High,
    low: AlarmType::Pm25High,
};
const CO2: Metric = Metric {
    name: "co2",
    unit: " ppm",
    high: AlarmType::Co2High,
    low: AlarmType::Co2High,
};
const ILLUMINANCE: Metric = Metric {
    name: "illuminance",
    unit: " lux",
    high: AlarmType::IlluminanceLow,
    low: AlarmType::IlluminanceLow,
};

/// Alarms raised by `reading` under `thresholds`, in metric order.
pub fn evaluate(reading: &Reading, thresholds: &AlarmThresholds) -> Vec<Alarm> {
    // ---
    let mut alarms = Vec::new();

    let numeric = [
        (&TEMPERATURE, reading.temperature, &thresholds.temperature),
        (&HUMIDITY, reading.humidity, &thresholds.humidity),
        (&PM25, reading.pm25, &thresholds.pm25),
        (&CO2, reading.co2, &thresholds.co2),
        (&ILLUMINANCE, reading.illuminance, &thresholds.illuminance),
    ];
    for (metric, value, band) in numeric {
        let Some(value) = value else { continue };
        if let Some(violation) = check_band(metric, value, band) {
            let tier = match violation.severity {
                Severity::Danger => "critical",
                Severity::Warning => "warning",
            };
            let direction = if violation.above { "above" } else { "below" };
            let message = format!(
                "{} {value:.1}{unit} {direction} {tier} limit {:.1}{unit}",
                metric.name,
                violation.threshold,
                unit = metric.unit,
            );
            alarms.push(raise(reading, violation, message, value));
        }
    }

    if let (Some(online), Some(total)) = (reading.online_device_count, reading.total_device_count) {
        if online < total {
            let severity = if online == 0 {
                Severity::Danger
            } else {
                Severity::Warning
            };
            let violation = Violation {
                alarm_type: AlarmType::DeviceOffline,
                severity,
                threshold: f64::from(total),
                above: false,
            };
            let message = format!("{} of {total} devices offline", total - online);
            alarms.push(raise(reading, violation, message, f64::from(online)));
        }
    }

    if let (Some(count), Some(capacity)) = (reading.occupancy, thresholds.occupancy_capacity) {
        if count > capacity {
            let violation = Violation {
                alarm_type: AlarmType::OccupancyExceeded,
                severity: Severity::Warning,
                threshold: f64::from(capacity),
                above: true,
            };
            let message = format!("occupancy {count} exceeds capacity {capacity}");
            alarms.push(raise(reading, violation, message, f64::from(count)));
        }
    }

    alarms
}
