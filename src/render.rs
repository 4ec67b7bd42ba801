//! Display surface for instance state

use crate::alarm::status_line;
use crate::errors::Result;
use crate::model::{AlarmResult, InstanceConfig, InstanceId, LastKnownValue, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What the display surface shows for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ViewState {
    Unconfigured,
    Loading {
        channel_id: String,
        last_known: Option<LastKnownValue>,
    },
    Data {
        title: String,
        display_value: String,
        observed_at: DateTime<Utc>,
        alarm_active: bool,
        alarm_message: Option<String>,
        status_line: String,
        show_alarms: bool,
        show_schedules: bool,
    },
    Error {
        message: String,
        last_known: Option<LastKnownValue>,
    },
}

impl ViewState {
    pub fn data(config: &InstanceConfig, reading: &Reading, alarm: &AlarmResult) -> Self {
        let display_value = reading
            .raw
            .clone()
            .unwrap_or_else(|| format!("Null (F{})", config.field));

        ViewState::Data {
            title: format!("Channel {} (F{})", config.channel_id, config.field),
            display_value,
            observed_at: reading.observed_at,
            alarm_active: alarm.triggered,
            alarm_message: alarm.triggered.then(|| alarm.message.clone()),
            status_line: status_line(alarm).to_string(),
            show_alarms: config.show_alarms,
            show_schedules: config.show_schedules,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ViewState::Unconfigured => "unconfigured",
            ViewState::Loading { .. } => "loading",
            ViewState::Data { .. } => "data",
            ViewState::Error { .. } => "error",
        }
    }

    pub fn is_alarm_active(&self) -> bool {
        matches!(self, ViewState::Data { alarm_active: true, .. })
    }
}

/// Receives every state transition of every instance.
#[async_trait]
pub trait RenderSink: Send + Sync {
    async fn render(&self, id: InstanceId, state: &ViewState) -> Result<()>;
}

/// Logs each rendered state as one line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRenderSink;

#[async_trait]
impl RenderSink for LogRenderSink {
    async fn render(&self, id: InstanceId, state: &ViewState) -> Result<()> {
        match state {
            ViewState::Unconfigured => info!(instance = %id, "Setup required"),
            ViewState::Loading { channel_id, .. } => {
                info!(instance = %id, "Loading... ID: {}", channel_id)
            }
            ViewState::Data {
                title,
                display_value,
                observed_at,
                status_line,
                alarm_active,
                ..
            } => {
                let updated = observed_at.with_timezone(&Local).format("%H:%M:%S");
                if *alarm_active {
                    warn!(instance = %id, "{}: {} (updated {}) {}", title, display_value, updated, status_line);
                } else {
                    info!(instance = %id, "{}: {} (updated {}) {}", title, display_value, updated, status_line);
                }
            }
            ViewState::Error { message, .. } => warn!(instance = %id, "{}", message),
        }
        Ok(())
    }
}

/// Keeps the latest state of each instance as `<dir>/view-<id>.json`.
#[derive(Debug, Clone)]
pub struct SurfaceRenderSink {
    dir: PathBuf,
}

impl SurfaceRenderSink {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, id: InstanceId) -> PathBuf {
        self.dir.join(format!("view-{}.json", id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl RenderSink for SurfaceRenderSink {
    async fn render(&self, id: InstanceId, state: &ViewState) -> Result<()> {
        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
