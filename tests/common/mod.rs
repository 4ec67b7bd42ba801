#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use field_monitor::clock::FixedClock;
use field_monitor::controller::{Collaborators, ControllerSettings, RefreshController};
use field_monitor::fetcher::ValueFetcher;
use field_monitor::model::Reading;
use field_monitor::notify::AlertSink;
use field_monitor::render::{RenderSink, ViewState};
use field_monitor::schedule::{Day, TimeWindow};
use field_monitor::scheduler::{ScheduleToken, SchedulerAdapter};
use field_monitor::store::MemoryStore;
use field_monitor::{AlertError, FetchError, FieldIndex, InstanceConfig, InstanceId, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Monday 2026-10-19 10:00 at UTC+0.
pub fn monday_10am() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2026, 10, 19, 10, 0, 0)
        .unwrap()
}

/// Sunday 2026-10-18 10:00 at UTC+0.
pub fn sunday_10am() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2026, 10, 18, 10, 0, 0)
        .unwrap()
}

/// `upper_limit = 30`, active Monday 08:00-18:00.
pub fn monday_config() -> InstanceConfig {
    let mut config = InstanceConfig::new("12345", FieldIndex::new(1).unwrap());
    config.upper_limit = Some(30.0);
    config.active_windows.insert(Day::Monday, TimeWindow::new(8, 0, 18, 0));
    config
}

pub fn reading(raw: &str) -> Reading {
    Reading::new(
        1,
        Some(raw.to_string()),
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 59, 0).unwrap(),
    )
}

/// Scheduler double that records tokens instead of running timers.
#[derive(Default)]
pub struct RecordingScheduler {
    pending: Mutex<HashMap<ScheduleToken, (InstanceId, DateTime<FixedOffset>)>>,
    scheduled: AtomicUsize,
    cancelled: AtomicUsize,
}

impl RecordingScheduler {
    pub fn pending_for(&self, id: InstanceId) -> Vec<DateTime<FixedOffset>> {
        self.pending
            .lock()
            .unwrap()
            .values()
            .filter(|(pending_id, _)| *pending_id == id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl SchedulerAdapter for RecordingScheduler {
    fn schedule_at(&self, id: InstanceId, at: DateTime<FixedOffset>) -> ScheduleToken {
        let token = ScheduleToken::new();
        self.pending.lock().unwrap().insert(token, (id, at));
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        token
    }

    fn cancel(&self, token: ScheduleToken) {
        if self.pending.lock().unwrap().remove(&token).is_some() {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Fetcher answering from a script, then from a fallback.
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<std::result::Result<Reading, FetchError>>>,
    fallback: Mutex<std::result::Result<Reading, FetchError>>,
    delay: Mutex<Duration>,
    hold: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(reading("20"))),
            delay: Mutex::new(Duration::ZERO),
            hold: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, result: std::result::Result<Reading, FetchError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn set_fallback(&self, result: std::result::Result<Reading, FetchError>) {
        *self.fallback.lock().unwrap() = result;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Block every fetch until `release` is notified.
    pub fn hold(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ValueFetcher for ScriptedFetcher {
    async fn fetch_latest(
        &self,
        _channel_id: &str,
        _field: FieldIndex,
        _api_key: Option<&str>,
    ) -> std::result::Result<Reading, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        self.entered.notify_one();
        if self.hold.load(Ordering::SeqCst) {
            self.release.notified().await;
        }

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
pub struct RecordingAlertSink {
    raised: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl RecordingAlertSink {
    pub fn raised(&self) -> Vec<(String, String)> {
        self.raised.lock().unwrap().clone()
    }

    pub fn fail_deliveries(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn raise(&self, title: &str, message: &str) -> std::result::Result<(), AlertError> {
        self.raised
            .lock()
            .unwrap()
            .push((title.to_string(), message.to_string()));

        if self.fail.load(Ordering::SeqCst) {
            return Err(AlertError::new("notification channel unavailable"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingRenderSink {
    states: Mutex<Vec<(InstanceId, ViewState)>>,
}

impl RecordingRenderSink {
    pub fn states_for(&self, id: InstanceId) -> Vec<ViewState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(state_id, _)| *state_id == id)
            .map(|(_, state)| state.clone())
            .collect()
    }

    pub fn last_for(&self, id: InstanceId) -> Option<ViewState> {
        self.states_for(id).pop()
    }
}

#[async_trait]
impl RenderSink for RecordingRenderSink {
    async fn render(&self, id: InstanceId, state: &ViewState) -> Result<()> {
        self.states.lock().unwrap().push((id, state.clone()));
        Ok(())
    }
}

pub struct TestContext {
    pub controller: Arc<RefreshController>,
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub alerts: Arc<RecordingAlertSink>,
    pub renderer: Arc<RecordingRenderSink>,
    pub scheduler: Arc<RecordingScheduler>,
    pub clock: Arc<FixedClock>,
}

pub fn build_test_context() -> TestContext {
    build_test_context_with(ControllerSettings::default())
}

pub fn build_test_context_with(settings: ControllerSettings) -> TestContext {
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let alerts = Arc::new(RecordingAlertSink::default());
    let renderer = Arc::new(RecordingRenderSink::default());
    let scheduler = Arc::new(RecordingScheduler::default());
    let clock = Arc::new(FixedClock::new(monday_10am()));

    let controller = RefreshController::new(
        Collaborators {
            store: store.clone(),
            fetcher: fetcher.clone(),
            alerts: alerts.clone(),
            renderer: renderer.clone(),
            scheduler: scheduler.clone(),
            clock: clock.clone(),
        },
        settings,
    );

    TestContext {
        controller: Arc::new(controller),
        store,
        fetcher,
        alerts,
        renderer,
        scheduler,
        clock,
    }
}
