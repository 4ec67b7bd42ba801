//! Versioned on-disk document for instance configuration
//!
//! Current documents carry `schema_version`. Documents without it use the
//! legacy widget layout (camelCase keys, nullable `schedules` keyed by
//! "1".."7") and are upgraded on load.

use crate::errors::{MonitorError, Result};
use crate::model::{
    FieldIndex, InstanceConfig, DEFAULT_GRAPH_POINTS, DEFAULT_UPDATE_INTERVAL_SECS,
};
use crate::schedule::{ActiveWindows, Day, TimeWindow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigDocument {
    schema_version: u32,
    #[serde(flatten)]
    config: InstanceConfig,
}

/// Serialize a configuration as a current-version document.
pub fn encode(config: &InstanceConfig) -> Result<Vec<u8>> {
    let document = ConfigDocument {
        schema_version: CURRENT_SCHEMA_VERSION,
        config: config.clone(),
    };
    Ok(serde_json::to_vec_pretty(&document)?)
}

/// Parse a stored document of any known version into the current model.
pub fn decode(bytes: &[u8]) -> Result<InstanceConfig> {
    let value: Value = serde_json::from_slice(bytes)?;
    upgrade(value)
}

/// Deterministic upgrade from any known schema version to the current one.
pub fn upgrade(value: Value) -> Result<InstanceConfig> {
    let version = match value.get("schema_version") {
        None => 0,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| MonitorError::Store(format!("schema_version is not a number: {}", v)))?,
    };

    match version {
        0 => {
            debug!("Upgrading legacy configuration document to schema v{}", CURRENT_SCHEMA_VERSION);
            let legacy: LegacyConfigV0 = serde_json::from_value(value)?;
            legacy.into_current()
        }
        1 => {
            let document: ConfigDocument = serde_json::from_value(value)?;
            Ok(document.config)
        }
        other => Err(MonitorError::Store(format!(
            "unsupported schema_version {} (newest known is {})",
            other, CURRENT_SCHEMA_VERSION
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyConfigV0 {
    channel_id: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    show_alarms: bool,
    #[serde(default)]
    show_schedules: bool,
    #[serde(default)]
    upper_limit: Option<f64>,
    #[serde(default)]
    lower_limit: Option<f64>,
    #[serde(default)]
    schedules: Option<HashMap<String, LegacyDaySchedule>>,
    #[serde(default)]
    selected_field: Option<u8>,
    #[serde(default)]
    update_interval_seconds: Option<i64>,
    #[serde(default)]
    graph_points_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyDaySchedule {
    #[serde(default = "legacy_start_hour")]
    start_hour: u8,
    #[serde(default)]
    start_min: u8,
    #[serde(default = "legacy_end_hour")]
    end_hour: u8,
    #[serde(default)]
    end_min: u8,
}

fn legacy_start_hour() -> u8 {
    8
}

fn legacy_end_hour() -> u8 {
    18
}

impl LegacyConfigV0 {
    fn into_current(self) -> Result<InstanceConfig> {
        let field = FieldIndex::new(self.selected_field.unwrap_or(1))?;

        let mut active_windows = ActiveWindows::new();
        for (key, schedule) in self.schedules.unwrap_or_default() {
            let day = key.parse::<u8>().ok().and_then(Day::from_index);
            match day {
                Some(day) => {
                    active_windows.insert(
                        day,
                        TimeWindow::new(
                            schedule.start_hour,
                            schedule.start_min,
                            schedule.end_hour,
                            schedule.end_min,
                        ),
                    );
                }
                None => warn!("Dropping legacy schedule with unknown day key {:?}", key),
            }
        }

        let update_interval_secs = self
            .update_interval_seconds
            .filter(|s| *s > 0)
            .map(|s| s as u64)
            .unwrap_or(DEFAULT_UPDATE_INTERVAL_SECS);

        let graph_points = self
            .graph_points_count
            .filter(|n| *n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(DEFAULT_GRAPH_POINTS);

        Ok(InstanceConfig {
            channel_id: self.channel_id,
            api_key: self.api_key.filter(|k| !k.is_empty()),
            field,
            update_interval_secs,
            upper_limit: self.upper_limit,
            lower_limit: self.lower_limit,
            active_windows,
            show_alarms: self.show_alarms,
            show_schedules: self.show_schedules,
            graph_points,
        })
    }
}
