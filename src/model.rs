//! Instance configuration and the values that flow through a refresh cycle

use crate::errors::{MonitorError, Result};
use crate::schedule::ActiveWindows;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_GRAPH_POINTS: u32 = 20;
pub const MAX_GRAPH_POINTS: u32 = 8000;
pub const FIELD_COUNT: usize = 8;

/// Stable identifier of one monitored instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the eight numbered fields of a channel (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct FieldIndex(u8);

impl FieldIndex {
    pub fn new(index: u8) -> Result<Self> {
        if (1..=FIELD_COUNT as u8).contains(&index) {
            Ok(Self(index))
        } else {
            Err(MonitorError::InvalidConfig(format!(
                "field must be between 1 and {}, got {}",
                FIELD_COUNT, index
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based slot into a feed's field array.
    pub fn slot(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl Default for FieldIndex {
    fn default() -> Self {
        Self(1)
    }
}

impl TryFrom<u8> for FieldIndex {
    type Error = MonitorError;

    fn try_from(value: u8) -> Result<Self> {
        FieldIndex::new(value)
    }
}

impl From<FieldIndex> for u8 {
    fn from(field: FieldIndex) -> u8 {
        field.0
    }
}

impl fmt::Display for FieldIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full configuration of one monitored instance. Replaced wholesale on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub channel_id: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub field: FieldIndex,

    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    #[serde(default)]
    pub upper_limit: Option<f64>,

    #[serde(default)]
    pub lower_limit: Option<f64>,

    #[serde(default)]
    pub active_windows: ActiveWindows,

    #[serde(default)]
    pub show_alarms: bool,

    #[serde(default)]
    pub show_schedules: bool,

    #[serde(default = "default_graph_points")]
    pub graph_points: u32,
}

fn default_update_interval() -> u64 {
    DEFAULT_UPDATE_INTERVAL_SECS
}

fn default_graph_points() -> u32 {
    DEFAULT_GRAPH_POINTS
}

impl InstanceConfig {
    pub fn new(channel_id: impl Into<String>, field: FieldIndex) -> Self {
        Self {
            channel_id: channel_id.into(),
            api_key: None,
            field,
            update_interval_secs: DEFAULT_UPDATE_INTERVAL_SECS,
            upper_limit: None,
            lower_limit: None,
            active_windows: ActiveWindows::new(),
            show_alarms: true,
            show_schedules: true,
            graph_points: DEFAULT_GRAPH_POINTS,
        }
    }

    /// Polling interval, never shorter than `floor`.
    pub fn effective_interval(&self, floor: Duration) -> Duration {
        Duration::from_secs(self.update_interval_secs).max(floor)
    }

    /// Reject input that evaluation would otherwise have to tolerate.
    pub fn validate(&self) -> Result<()> {
        if self.channel_id.trim().is_empty() {
            return Err(MonitorError::InvalidConfig("channel_id cannot be empty".to_string()));
        }

        if self.update_interval_secs == 0 {
            return Err(MonitorError::InvalidConfig(
                "update_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.graph_points == 0 || self.graph_points > MAX_GRAPH_POINTS {
            return Err(MonitorError::InvalidConfig(format!(
                "graph_points must be between 1 and {}",
                MAX_GRAPH_POINTS
            )));
        }

        for (name, limit) in [("upper_limit", self.upper_limit), ("lower_limit", self.lower_limit)] {
            if limit.is_some_and(|v| !v.is_finite()) {
                return Err(MonitorError::InvalidConfig(format!("{} must be a finite number", name)));
            }
        }

        if let (Some(upper), Some(lower)) = (self.upper_limit, self.lower_limit) {
            if upper <= lower {
                return Err(MonitorError::InvalidConfig(format!(
                    "upper_limit ({}) must be greater than lower_limit ({})",
                    upper, lower
                )));
            }
        }

        for (day, window) in &self.active_windows {
            window.validate().map_err(|_| {
                MonitorError::InvalidScheduleWindow(format!("{}: {}", day, window))
            })?;
        }

        Ok(())
    }
}

/// Latest entry returned for a field. The fetch succeeded even when `value`
/// is absent (null or non-numeric field).
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub entry_id: u64,
    pub raw: Option<String>,
    pub value: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(entry_id: u64, raw: Option<String>, observed_at: DateTime<Utc>) -> Self {
        let value = raw.as_deref().and_then(|s| s.trim().parse::<f64>().ok()).filter(|v| v.is_finite());
        Self {
            entry_id,
            raw,
            value,
            observed_at,
        }
    }
}

/// Most recent numeric value seen for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastKnownValue {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmReason {
    None,
    AboveUpper,
    BelowLower,
    DayInactive,
    NoThresholdSet,
}

/// Outcome of evaluating one value. Derived fresh every cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmResult {
    pub triggered: bool,
    pub reason: AlarmReason,
    pub message: String,
}

impl AlarmResult {
    pub fn quiet(reason: AlarmReason) -> Self {
        Self {
            triggered: false,
            reason,
            message: String::new(),
        }
    }

    pub fn triggered(reason: AlarmReason, message: String) -> Self {
        Self {
            triggered: true,
            reason,
            message,
        }
    }
}
