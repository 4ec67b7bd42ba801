//! Configuration management for the monitor daemon

use crate::notify::DEFAULT_ALERT_TITLE;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_THINGSPEAK_URL: &str = "https://api.thingspeak.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one configuration document per instance
    pub store_dir: PathBuf,

    /// Directory for rendered view documents; states are only logged when unset
    pub surface_dir: Option<PathBuf>,

    /// Base URL of the ThingSpeak API
    pub thingspeak_url: String,

    /// Upper bound on one fetch inside a refresh cycle
    pub fetch_timeout: Duration,

    /// HTTP client timeout for ThingSpeak and webhook requests
    pub http_timeout: Duration,

    /// Floor applied to every instance's update interval
    pub min_update_interval: Duration,

    /// Webhook receiving alarms; alarms are only logged when unset
    pub alert_webhook_url: Option<String>,

    /// Title attached to every alarm
    pub alert_title: String,

    /// Interval of the periodic metrics report
    pub metrics_interval: Duration,

    /// How often the daemon rescans the store for saved, deleted and
    /// refresh-requested instances
    pub store_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./monitor-data"),
            surface_dir: None,
            thingspeak_url: DEFAULT_THINGSPEAK_URL.to_string(),
            fetch_timeout: Duration::from_secs(15),
            http_timeout: Duration::from_secs(10),
            min_update_interval: Duration::from_secs(30),
            alert_webhook_url: None,
            alert_title: DEFAULT_ALERT_TITLE.to_string(),
            metrics_interval: Duration::from_secs(60),
            store_poll_interval: Duration::from_secs(5),
        }
    }
}

fn seconds_var(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(dir) = non_empty_var("MONITOR_STORE_DIR") {
            config.store_dir = PathBuf::from(dir);
        }

        if let Some(dir) = non_empty_var("SURFACE_DIR") {
            config.surface_dir = Some(PathBuf::from(dir));
        }

        if let Some(url) = non_empty_var("THINGSPEAK_BASE_URL") {
            config.thingspeak_url = url;
        }

        if let Some(timeout) = seconds_var("FETCH_TIMEOUT_SECONDS") {
            config.fetch_timeout = timeout;
        }

        if let Some(timeout) = seconds_var("HTTP_TIMEOUT_SECONDS") {
            config.http_timeout = timeout;
        }

        if let Some(interval) = seconds_var("MIN_UPDATE_INTERVAL_SECONDS") {
            config.min_update_interval = interval;
        }

        config.alert_webhook_url = non_empty_var("ALERT_WEBHOOK_URL");

        if let Some(title) = non_empty_var("ALERT_TITLE") {
            config.alert_title = title;
        }

        if let Some(interval) = seconds_var("METRICS_INTERVAL_SECONDS") {
            config.metrics_interval = interval;
        }

        if let Some(interval) = seconds_var("STORE_POLL_INTERVAL_SECONDS") {
            config.store_poll_interval = interval;
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.store_dir.as_os_str().is_empty() {
            return Err("store_dir cannot be empty".to_string());
        }

        if self.thingspeak_url.is_empty() {
            return Err("thingspeak_url cannot be empty".to_string());
        }

        if !self.thingspeak_url.starts_with("http://") && !self.thingspeak_url.starts_with("https://") {
            return Err(format!("thingspeak_url must be an http(s) URL: {}", self.thingspeak_url));
        }

        if self.fetch_timeout.is_zero() {
            return Err("fetch_timeout must be greater than 0".to_string());
        }

        if self.http_timeout.is_zero() {
            return Err("http_timeout must be greater than 0".to_string());
        }

        if self.min_update_interval.is_zero() {
            return Err("min_update_interval must be greater than 0".to_string());
        }

        if self.metrics_interval.is_zero() {
            return Err("metrics_interval must be greater than 0".to_string());
        }

        if self.store_poll_interval.is_zero() {
            return Err("store_poll_interval must be greater than 0".to_string());
        }

        if self.alert_title.is_empty() {
            return Err("alert_title cannot be empty".to_string());
        }

        Ok(())
    }
}
