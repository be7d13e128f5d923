//! Data models for the telemetry pipeline.
//!
//! A [`RawReading`] is what clients submit; validation turns it into an
//! immutable [`Reading`], which is what travels on the event bus. Every
//! downstream path derives its own entities from a reading: [`Alarm`]s from
//! the alarm engine and [`DailyAggregate`]s from the statistics aggregator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{FieldError, TransitionError, ValidationError};

// ---

/// Identifier of a monitored site.
pub type SiteId = i64;

/// Source tag applied when the client does not supply one.
pub const DEFAULT_SOURCE: &str = "SENSOR";

/// Sensor snapshot as submitted at the ingestion boundary.
///
/// Legacy client field names (`labId`, `stationId`, `monitorTime`, ...) are
/// accepted here and nowhere else.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReading {
    // ---
    #[serde(alias = "labId", alias = "stationId")]
    pub site_id: Option<SiteId>,
    #[serde(alias = "labName", alias = "stationName")]
    pub site_name: Option<String>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pm25: Option<f64>,
    pub illuminance: Option<f64>,
    pub co2: Option<f64>,
    #[serde(alias = "onlineDeviceCount")]
    pub online_device_count: Option<u32>,
    #[serde(alias = "totalDeviceCount")]
    pub total_device_count: Option<u32>,
    #[serde(alias = "currentPeopleCount")]
    pub occupancy: Option<u32>,
    #[serde(alias = "monitorTime")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(alias = "dataSource")]
    pub source: Option<String>,
    #[serde(alias = "alarmStatus")]
    pub alarm_status: Option<u8>,
    pub remark: Option<String>,
}

/// One validated sensor snapshot for one site at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    // ---
    pub site_id: SiteId,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub pm25: Option<f64>,
    #[serde(default)]
    pub illuminance: Option<f64>,
    #[serde(default)]
    pub co2: Option<f64>,
    #[serde(default)]
    pub online_device_count: Option<u32>,
    #[serde(default)]
    pub total_device_count: Option<u32>,
    #[serde(default)]
    pub occupancy: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// 0 = normal, anything above = the source flagged this reading.
    #[serde(default)]
    pub alarm_status: Option<u8>,
    #[serde(default)]
    pub remark: Option<String>,
}

impl RawReading {
    // ---
    /// Validate and convert into a [`Reading`], stamping `now` when the
    /// client did not provide a timestamp.
    pub fn into_reading(self, now: DateTime<Utc>) -> Result<Reading, ValidationError> {
        // ---
        let mut errors = Vec::new();

        let site_id = match self.site_id {
            Some(id) if id > 0 => id,
            Some(_) => {
                errors.push(FieldError::new("site_id", "must be positive"));
                0
            }
            None => {
                errors.push(FieldError::new("site_id", "is required"));
                0
            }
        };

        check_range(&mut errors, "temperature", self.temperature, -50.0, 100.0);
        check_range(&mut errors, "humidity", self.humidity, 0.0, 100.0);
        check_non_negative(&mut errors, "pm25", self.pm25);
        check_non_negative(&mut errors, "illuminance", self.illuminance);
        check_non_negative(&mut errors, "co2", self.co2);

        if let (Some(online), Some(total)) = (self.online_device_count, self.total_device_count) {
            if online > total {
                errors.push(FieldError::new(
                    "online_device_count",
                    format!("{online} exceeds total_device_count {total}"),
                ));
            }
        }

        if !errors.is_empty() {
            return Err(ValidationError { errors });
        }

        let source = self
            .source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SOURCE.to_string());

        Ok(Reading {
            site_id,
            site_name: self.site_name.filter(|s| !s.trim().is_empty()),
            temperature: self.temperature,
            humidity: self.humidity,
            pm25: self.pm25,
            illuminance: self.illuminance,
            co2: self.co2,
            online_device_count: self.online_device_count,
            total_device_count: self.total_device_count,
            occupancy: self.occupancy,
            timestamp: self.timestamp.unwrap_or(now),
            source,
            alarm_status: self.alarm_status,
            remark: self.remark,
        })
    }
}

fn check_range(errors: &mut Vec<FieldError>, field: &str, value: Option<f64>, min: f64, max: f64) {
    if let Some(v) = value {
        if !v.is_finite() || v < min || v > max {
            errors.push(FieldError::new(field, format!("must be within [{min}, {max}]")));
        }
    }
}

fn check_non_negative(errors: &mut Vec<FieldError>, field: &str, value: Option<f64>) {
    if let Some(v) = value {
        if !v.is_finite() || v < 0.0 {
            errors.push(FieldError::new(field, "must not be negative"));
        }
    }
}

impl Reading {
    // ---
    /// Calendar day (UTC) the reading belongs to.
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// Whether the source flagged this reading as abnormal.
    pub fn is_flagged(&self) -> bool {
        self.alarm_status.is_some_and(|s| s > 0)
    }

    /// Partition key on the bus: all events of one site stay ordered.
    pub fn partition_key(&self) -> String {
        self.site_id.to_string()
    }
}

// ---

/// Fixed enumeration of detectable violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmType {
    TempHigh,
    TempLow,
    HumidityHigh,
    HumidityLow,
    Pm25High,
    Co2High,
    IlluminanceLow,
    DeviceOffline,
    #[serde(alias = "PEOPLE_EXCEED")]
    OccupancyExceeded,
    UnauthorizedAccess,
}

impl AlarmType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmType::TempHigh => "TEMP_HIGH",
            AlarmType::TempLow => "TEMP_LOW",
            AlarmType::HumidityHigh => "HUMIDITY_HIGH",
            AlarmType::HumidityLow => "HUMIDITY_LOW",
            AlarmType::Pm25High => "PM25_HIGH",
            AlarmType::Co2High => "CO2_HIGH",
            AlarmType::IlluminanceLow => "ILLUMINANCE_LOW",
            AlarmType::DeviceOffline => "DEVICE_OFFLINE",
            AlarmType::OccupancyExceeded => "OCCUPANCY_EXCEEDED",
            AlarmType::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
        }
    }
}

impl FromStr for AlarmType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        let t = match s {
            "TEMP_HIGH" => AlarmType::TempHigh,
            "TEMP_LOW" => AlarmType::TempLow,
            "HUMIDITY_HIGH" => AlarmType::HumidityHigh,
            "HUMIDITY_LOW" => AlarmType::HumidityLow,
            "PM25_HIGH" => AlarmType::Pm25High,
            "CO2_HIGH" => AlarmType::Co2High,
            "ILLUMINANCE_LOW" => AlarmType::IlluminanceLow,
            "DEVICE_OFFLINE" => AlarmType::DeviceOffline,
            "OCCUPANCY_EXCEEDED" | "PEOPLE_EXCEED" => AlarmType::OccupancyExceeded,
            "UNAUTHORIZED_ACCESS" => AlarmType::UnauthorizedAccess,
            other => return Err(format!("unknown alarm type '{other}'")),
        };
        Ok(t)
    }
}

impl fmt::Display for AlarmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two-tier severity. Ordered so that `Danger > Warning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Danger,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "WARNING",
            Severity::Danger => "DANGER",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WARNING" => Ok(Severity::Warning),
            "DANGER" => Ok(Severity::Danger),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Alarm lifecycle: `PENDING -> CONFIRMED -> RESOLVED`, or `-> IGNORED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmStatus {
    Pending,
    Confirmed,
    Resolved,
    Ignored,
}

impl AlarmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmStatus::Pending => "PENDING",
            AlarmStatus::Confirmed => "CONFIRMED",
            AlarmStatus::Resolved => "RESOLVED",
            AlarmStatus::Ignored => "IGNORED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AlarmStatus::Resolved | AlarmStatus::Ignored)
    }

    /// Next status after `action`, or the reason the action is not allowed.
    pub fn after(self, action: AlarmAction) -> Result<AlarmStatus, TransitionError> {
        // ---
        let next = match (self, action) {
            (AlarmStatus::Pending, AlarmAction::Confirm) => AlarmStatus::Confirmed,
            (AlarmStatus::Pending | AlarmStatus::Confirmed, AlarmAction::Resolve) => {
                AlarmStatus::Resolved
            }
            (AlarmStatus::Pending | AlarmStatus::Confirmed, AlarmAction::Ignore) => {
                AlarmStatus::Ignored
            }
            (from, action) => return Err(TransitionError { action, from }),
        };
        Ok(next)
    }
}

impl FromStr for AlarmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AlarmStatus::Pending),
            "CONFIRMED" => Ok(AlarmStatus::Confirmed),
            "RESOLVED" => Ok(AlarmStatus::Resolved),
            "IGNORED" => Ok(AlarmStatus::Ignored),
            other => Err(format!("unknown alarm status '{other}'")),
        }
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator actions on an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmAction {
    Confirm,
    Resolve,
    Ignore,
}

impl fmt::Display for AlarmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlarmAction::Confirm => "confirm",
            AlarmAction::Resolve => "resolve",
            AlarmAction::Ignore => "ignore",
        })
    }
}

/// One detected threshold violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    // ---
    pub id: Uuid,
    pub site_id: SiteId,
    pub site_name: Option<String>,
    pub alarm_type: AlarmType,
    pub severity: Severity,
    pub message: String,
    pub observed_value: f64,
    pub threshold_value: f64,
    /// Timestamp of the reading that raised the alarm.
    pub raised_at: DateTime<Utc>,
    pub status: AlarmStatus,
    #[serde(default)]
    pub confirmed_by: Option<String>,
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ignored_by: Option<String>,
    #[serde(default)]
    pub ignored_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remark: Option<String>,
}

impl Alarm {
    // ---
    /// Apply an operator action, recording who performed it and when.
    pub fn apply(
        &mut self,
        action: AlarmAction,
        operator: &str,
        at: DateTime<Utc>,
        remark: Option<String>,
    ) -> Result<(), TransitionError> {
        // ---
        let next = self.status.after(action)?;
        match next {
            AlarmStatus::Confirmed => {
                self.confirmed_by = Some(operator.to_string());
                self.confirmed_at = Some(at);
            }
            AlarmStatus::Resolved => {
                self.resolved_by = Some(operator.to_string());
                self.resolved_at = Some(at);
            }
            AlarmStatus::Ignored => {
                self.ignored_by = Some(operator.to_string());
                self.ignored_at = Some(at);
            }
            AlarmStatus::Pending => {}
        }
        if remark.is_some() {
            self.remark = remark;
        }
        self.status = next;
        Ok(())
    }

    /// Partition key on `alarm-events`.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.site_id, self.alarm_type)
    }
}

// ---

/// Running average/min/max of one metric.
///
/// `samples` counts only the readings that carried this metric, so the
/// average stays the exact mean even when some readings omit it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub samples: u32,
}

impl MetricSummary {
    pub fn seed(value: f64) -> Self {
        Self {
            avg: value,
            min: value,
            max: value,
            samples: 1,
        }
    }

    /// `new_avg = (old_avg * n + v) / (n + 1)`
    pub fn fold(&mut self, value: f64) {
        // ---
        let n = f64::from(self.samples);
        self.avg = (self.avg * n + value) / (n + 1.0);
        self.max = self.max.max(value);
        self.min = self.min.min(value);
        self.samples += 1;
    }
}

fn fold_metric(slot: &mut Option<MetricSummary>, value: Option<f64>) {
    match (slot.as_mut(), value) {
        (Some(summary), Some(v)) => summary.fold(v),
        (None, Some(v)) => *slot = Some(MetricSummary::seed(v)),
        (_, None) => {}
    }
}

/// Per-metric summaries of a [`DailyAggregate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    pub temperature: Option<MetricSummary>,
    pub humidity: Option<MetricSummary>,
    pub pm25: Option<MetricSummary>,
    pub co2: Option<MetricSummary>,
    pub illuminance: Option<MetricSummary>,
    pub online_devices: Option<MetricSummary>,
    pub occupancy: Option<MetricSummary>,
}

impl MetricSet {
    fn fold(&mut self, reading: &Reading) {
        // ---
        fold_metric(&mut self.temperature, reading.temperature);
        fold_metric(&mut self.humidity, reading.humidity);
        fold_metric(&mut self.pm25, reading.pm25);
        fold_metric(&mut self.co2, reading.co2);
        fold_metric(&mut self.illuminance, reading.illuminance);
        fold_metric(&mut self.online_devices, reading.online_device_count.map(f64::from));
        fold_metric(&mut self.occupancy, reading.occupancy.map(f64::from));
    }
}

/// Running statistical summary for one (site, calendar day).
///
/// Invariant: `count >= alarm_count`. Averages are folded incrementally and
/// are never recomputed from raw readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    // ---
    pub site_id: SiteId,
    pub site_name: Option<String>,
    pub stat_date: NaiveDate,
    pub count: u32,
    pub alarm_count: u32,
    /// `(count - alarm_count) / count`, in `[0, 1]`.
    pub normal_rate: f64,
    pub metrics: MetricSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DailyAggregate {
    // ---
    /// First reading of the day for a site: every summary is seeded from it.
    pub fn seed(reading: &Reading, now: DateTime<Utc>) -> Self {
        // ---
        let mut metrics = MetricSet::default();
        metrics.fold(reading);

        let mut aggregate = Self {
            site_id: reading.site_id,
            site_name: reading.site_name.clone(),
            stat_date: reading.day(),
            count: 1,
            alarm_count: u32::from(reading.is_flagged()),
            normal_rate: 1.0,
            metrics,
            created_at: now,
            updated_at: now,
        };
        aggregate.normal_rate = aggregate.compute_normal_rate();
        aggregate
    }

    /// Fold one more reading of the same (site, day) into the aggregate.
    pub fn fold(&mut self, reading: &Reading, now: DateTime<Utc>) {
        // ---
        self.metrics.fold(reading);
        self.count += 1;
        if reading.is_flagged() {
            self.alarm_count += 1;
        }
        if reading.site_name.is_some() {
            self.site_name = reading.site_name.clone();
        }
        self.normal_rate = self.compute_normal_rate();
        self.updated_at = now;
    }

    fn compute_normal_rate(&self) -> f64 {
        if self.count == 0 {
            return 1.0;
        }
        f64::from(self.count - self.alarm_count) / f64::from(self.count)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn create_test_raw_reading(temperature: f64, humidity: f64) -> RawReading {
        // ---
        RawReading {
            site_id: Some(7),
            site_name: Some("lab-7".to_string()),
            temperature: Some(temperature),
            humidity: Some(humidity),
            timestamp: Some(Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap()),
            ..Default::default()
        }
    }

    fn create_test_reading(temperature: f64, humidity: f64) -> Reading {
        create_test_raw_reading(temperature, humidity)
            .into_reading(Utc::now())
            .unwrap()
    }

    #[test]
    fn test_missing_timestamp_defaults_to_publish_time() {
        // ---
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let raw = RawReading {
            site_id: Some(1),
            ..Default::default()
        };

        let reading = raw.into_reading(now).unwrap();

        assert_eq!(reading.timestamp, now);
        assert_eq!(reading.source, DEFAULT_SOURCE);
    }

    #[test]
    fn test_validation_rejects_missing_site_and_out_of_range_values() {
        // ---
        let raw = RawReading {
            site_id: None,
            humidity: Some(140.0),
            co2: Some(-1.0),
            online_device_count: Some(5),
            total_device_count: Some(3),
            ..Default::default()
        };

        let err = raw.into_reading(Utc::now()).unwrap_err();
        let fields: Vec<&str> = err.errors.iter().map(|e| e.field.as_str()).collect();

        assert_eq!(fields, vec!["site_id", "humidity", "co2", "online_device_count"]);
    }

    #[test]
    fn test_legacy_field_names_are_accepted() {
        // ---
        let json = r#"{"labId": 3, "labName": "chem", "currentPeopleCount": 12, "temperature": 21.5}"#;
        let raw: RawReading = serde_json::from_str(json).unwrap();
        let reading = raw.into_reading(Utc::now()).unwrap();

        assert_eq!(reading.site_id, 3);
        assert_eq!(reading.site_name.as_deref(), Some("chem"));
        assert_eq!(reading.occupancy, Some(12));
    }

    #[test]
    fn test_people_exceed_alias_maps_to_occupancy_exceeded() {
        // ---
        let t: AlarmType = serde_json::from_str("\"PEOPLE_EXCEED\"").unwrap();
        assert_eq!(t, AlarmType::OccupancyExceeded);
        assert_eq!("PM25_HIGH".parse::<AlarmType>(), Ok(AlarmType::Pm25High));
        assert_eq!(serde_json::to_string(&AlarmType::Co2High).unwrap(), "\"CO2_HIGH\"");
    }

    #[test]
    fn test_alarm_status_transitions() {
        // ---
        use AlarmAction::*;
        use AlarmStatus::*;

        assert_eq!(Pending.after(Confirm), Ok(Confirmed));
        assert_eq!(Pending.after(Resolve), Ok(Resolved));
        assert_eq!(Pending.after(Ignore), Ok(Ignored));
        assert_eq!(Confirmed.after(Resolve), Ok(Resolved));
        assert_eq!(Confirmed.after(Ignore), Ok(Ignored));

        // No path leads back, and terminal states stay terminal
        assert!(Confirmed.after(Confirm).is_err());
        for terminal in [Resolved, Ignored] {
            for action in [Confirm, Resolve, Ignore] {
                assert_eq!(
                    terminal.after(action),
                    Err(TransitionError { action, from: terminal })
                );
            }
        }
    }

    #[test]
    fn test_alarm_apply_records_operator() {
        // ---
        let at = Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap();
        let mut alarm = Alarm {
            id: Uuid::new_v4(),
            site_id: 1,
            site_name: None,
            alarm_type: AlarmType::TempHigh,
            severity: Severity::Warning,
            message: "hot".to_string(),
            observed_value: 30.0,
            threshold_value: 28.0,
            raised_at: at,
            status: AlarmStatus::Pending,
            confirmed_by: None,
            confirmed_at: None,
            resolved_by: None,
            resolved_at: None,
            ignored_by: None,
            ignored_at: None,
            remark: None,
        };

        alarm.apply(AlarmAction::Confirm, "ops-anna", at, None).unwrap();
        alarm
            .apply(AlarmAction::Resolve, "ops-li", at, Some("fan fixed".to_string()))
            .unwrap();

        assert_eq!(alarm.status, AlarmStatus::Resolved);
        assert_eq!(alarm.confirmed_by.as_deref(), Some("ops-anna"));
        assert_eq!(alarm.resolved_by.as_deref(), Some("ops-li"));
        assert_eq!(alarm.remark.as_deref(), Some("fan fixed"));
        assert!(alarm.apply(AlarmAction::Ignore, "ops-li", at, None).is_err());
    }

    #[test]
    fn test_first_reading_seeds_aggregate() {
        // ---
        let reading = create_test_reading(20.0, 50.0);
        let agg = DailyAggregate::seed(&reading, Utc::now());

        let temp = agg.metrics.temperature.unwrap();
        let hum = agg.metrics.humidity.unwrap();
        assert_eq!((temp.avg, temp.min, temp.max), (20.0, 20.0, 20.0));
        assert_eq!((hum.avg, hum.min, hum.max), (50.0, 50.0, 50.0));
        assert_eq!(agg.count, 1);
        assert_eq!(agg.alarm_count, 0);
        assert_eq!(agg.normal_rate, 1.0);
        assert!(agg.metrics.pm25.is_none());
    }

    #[test]
    fn test_incremental_average() {
        // ---
        let mut agg = DailyAggregate::seed(&create_test_reading(20.0, 50.0), Utc::now());
        agg.fold(&create_test_reading(30.0, 40.0), Utc::now());

        let temp = agg.metrics.temperature.unwrap();
        assert_eq!(temp.avg, 25.0);
        assert_eq!(temp.max, 30.0);
        assert_eq!(temp.min, 20.0);
        assert_eq!(agg.count, 2);
    }

    #[test]
    fn test_metric_absent_from_some_readings_keeps_exact_mean() {
        // ---
        let mut first = create_test_reading(20.0, 50.0);
        first.pm25 = Some(10.0);
        let second = create_test_reading(22.0, 50.0);
        let mut third = create_test_reading(24.0, 50.0);
        third.pm25 = Some(30.0);

        let mut agg = DailyAggregate::seed(&first, Utc::now());
        agg.fold(&second, Utc::now());
        agg.fold(&third, Utc::now());

        let pm25 = agg.metrics.pm25.unwrap();
        assert_eq!(pm25.avg, 20.0);
        assert_eq!(pm25.samples, 2);
        assert_eq!(agg.count, 3);
    }

    #[test]
    fn test_flagged_readings_update_normal_rate() {
        // ---
        let mut flagged = create_test_reading(36.0, 50.0);
        flagged.alarm_status = Some(2);

        let mut agg = DailyAggregate::seed(&create_test_reading(20.0, 50.0), Utc::now());
        agg.fold(&flagged, Utc::now());
        agg.fold(&create_test_reading(21.0, 50.0), Utc::now());
        agg.fold(&create_test_reading(22.0, 50.0), Utc::now());

        assert_eq!(agg.count, 4);
        assert_eq!(agg.alarm_count, 1);
        assert_eq!(agg.normal_rate, 0.75);
        assert!(agg.count >= agg.alarm_count);
    }

    #[test]
    fn test_reading_day_is_utc_calendar_day() {
        // ---
        let reading = create_test_reading(20.0, 50.0);
        assert_eq!(reading.day(), NaiveDate::from_ymd_opt(2025, 3, 26).unwrap());
        assert_eq!(reading.partition_key(), "7");
    }
}
