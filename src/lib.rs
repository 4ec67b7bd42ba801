//! Field Monitor Library
//!
//! Polls ThingSpeak-style channel feeds on a per-instance schedule, renders the
//! latest value and raises alarms when it crosses a configured threshold
//! inside an active time window.

pub mod alarm;
pub mod clock;
pub mod config;
pub mod controller;
pub mod errors;
pub mod fetcher;
pub mod model;
pub mod notify;
pub mod render;
pub mod schedule;
pub mod scheduler;
pub mod schema;
pub mod service;
pub mod store;

pub use config::Config;
pub use controller::{CycleOutcome, RefreshController, Trigger};
pub use errors::{AlertError, FetchError, MonitorError, Result};
pub use model::{AlarmReason, AlarmResult, FieldIndex, InstanceConfig, InstanceId};
pub use service::MonitorService;
