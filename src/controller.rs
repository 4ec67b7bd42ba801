//! Refresh controller: one cycle per trigger, serialized per instance
//!
//! A cycle loads the configuration, fetches the latest value, evaluates the
//! alarm, renders the result, raises an alert when triggered and schedules the
//! next cycle. Every instance has exactly one schedule slot; writing it always
//! cancels the previous token first.
//!
//! Deletion and teardown bump the instance's generation. A trigger captures
//! the generation when it is registered, before it waits for the cycle lock,
//! and its cycle only writes the cache or the schedule slot while the
//! generation is unchanged. A cycle that was in flight or queued during a
//! delete or teardown can never re-arm the instance.
//!
//! The last known value is written through to the store and restored by the
//! first cycle after a restart.

use crate::alarm::evaluate;
use crate::clock::Clock;
use crate::errors::{AlertError, FetchError, Result};
use crate::fetcher::ValueFetcher;
use crate::model::{AlarmResult, InstanceConfig, InstanceId, LastKnownValue, Reading};
use crate::notify::AlertSink;
use crate::render::{RenderSink, ViewState};
use crate::schedule::LocalTime;
use crate::scheduler::{ScheduleToken, SchedulerAdapter};
use crate::store::ConfigStore;

use chrono::{DateTime, FixedOffset, TimeDelta};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// What caused a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
    Reconfigured,
    Startup,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled => write!(f, "scheduled"),
            Trigger::Manual => write!(f, "manual"),
            Trigger::Reconfigured => write!(f, "reconfigured"),
            Trigger::Startup => write!(f, "startup"),
        }
    }
}

/// Per-instance position in the refresh loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Unconfigured,
    Idle,
    Fetching,
    Rendering,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No configuration; the loop for this instance stops.
    Unconfigured,
    /// Value fetched and rendered.
    Rendered(AlarmResult),
    /// Fetch failed; the next scheduled cycle retries.
    Failed(FetchError),
    /// The instance was deleted or torn down while the cycle ran; nothing
    /// further was rendered, raised or scheduled.
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStatus {
    pub state: RefreshState,
    pub consecutive_failures: u32,
    pub last_known: Option<LastKnownValue>,
    pub next_refresh: Option<DateTime<FixedOffset>>,
}

/// Timing and presentation knobs of the controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Upper bound on one fetch; elapsed fetches count as `FetchError::Timeout`
    pub fetch_timeout: Duration,
    /// Floor applied to every instance's update interval
    pub min_update_interval: Duration,
    /// Title passed to the alert sink
    pub alert_title: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(15),
            min_update_interval: Duration::from_secs(30),
            alert_title: crate::notify::DEFAULT_ALERT_TITLE.to_string(),
        }
    }
}

/// External collaborators of the controller.
pub struct Collaborators {
    pub store: Arc<dyn ConfigStore>,
    pub fetcher: Arc<dyn ValueFetcher>,
    pub alerts: Arc<dyn AlertSink>,
    pub renderer: Arc<dyn RenderSink>,
    pub scheduler: Arc<dyn SchedulerAdapter>,
    pub clock: Arc<dyn Clock>,
}

struct InstanceEntry {
    generation: u64,
    cycle: Arc<Mutex<()>>,
    state: RefreshState,
    pending: Option<(ScheduleToken, DateTime<FixedOffset>)>,
    last_known: Option<LastKnownValue>,
    /// Set once the stored last value has been consulted.
    restored: bool,
    consecutive_failures: u32,
}

pub struct RefreshController {
    store: Arc<dyn ConfigStore>,
    fetcher: Arc<dyn ValueFetcher>,
    alerts: Arc<dyn AlertSink>,
    renderer: Arc<dyn RenderSink>,
    scheduler: Arc<dyn SchedulerAdapter>,
    clock: Arc<dyn Clock>,
    settings: ControllerSettings,
    entries: Mutex<HashMap<InstanceId, InstanceEntry>>,
    generations: AtomicU64,
    metrics: RefreshMetrics,
}

impl RefreshController {
    pub fn new(collaborators: Collaborators, settings: ControllerSettings) -> Self {
        Self {
            store: collaborators.store,
            fetcher: collaborators.fetcher,
            alerts: collaborators.alerts,
            renderer: collaborators.renderer,
            scheduler: collaborators.scheduler,
            clock: collaborators.clock,
            settings,
            entries: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
            metrics: RefreshMetrics::default(),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Run one refresh cycle for `id`. A cycle already in flight for the same
    /// id finishes first; cycles for different ids run independently.
    #[instrument(skip(self))]
    pub async fn refresh(&self, id: InstanceId, trigger: Trigger) -> CycleOutcome {
        let (cycle_lock, registered) = self.register(id).await;

        let outcome = {
            let _cycle = cycle_lock.lock().await;
            self.run_cycle(id, trigger, registered).await
        };

        self.release(id, cycle_lock).await;
        outcome
    }

    async fn run_cycle(&self, id: InstanceId, trigger: Trigger, generation: u64) -> CycleOutcome {
        if self.generation_of(id).await != Some(generation) {
            debug!("Queued {} trigger for instance {} was retired before it ran", trigger, id);
            return CycleOutcome::Superseded;
        }

        self.metrics.cycles.fetch_add(1, Ordering::Relaxed);
        let started_at = self.clock.now();
        debug!("Refresh cycle for instance {} started ({})", id, trigger);

        let config = match self.store.load(id).await {
            Ok(Some(config)) => config,
            Ok(None) => return self.finish_unconfigured(id, generation).await,
            Err(e) => {
                error!("Failed to load configuration for instance {}: {}", id, e);
                return self.finish_unconfigured(id, generation).await;
            }
        };

        self.restore_last_known(id, generation).await;

        let Some(last_known) = self
            .with_entry(id, generation, |entry| {
                entry.state = RefreshState::Fetching;
                entry.last_known
            })
            .await
        else {
            return self.superseded(id);
        };

        self.render(
            id,
            &ViewState::Loading {
                channel_id: config.channel_id.clone(),
                last_known,
            },
        )
        .await;

        let outcome = match self.fetch(&config).await {
            Ok(reading) => self.on_reading(id, generation, &config, reading, started_at).await,
            Err(err) => self.on_fetch_error(id, generation, err).await,
        };

        self.reschedule(id, generation, &config, started_at).await;
        outcome
    }

    /// Validate and persist a configuration, then refresh immediately.
    pub async fn save_config(&self, id: InstanceId, config: InstanceConfig) -> Result<CycleOutcome> {
        config.validate()?;
        self.store.save(id, &config).await?;
        info!("Saved configuration for instance {} (channel {})", id, config.channel_id);
        Ok(self.refresh(id, Trigger::Reconfigured).await)
    }

    /// Cancel the pending refresh, drop cached values and delete the
    /// configuration. Safe to call when nothing is scheduled.
    pub async fn delete(&self, id: InstanceId) -> Result<()> {
        // Held across the store delete: a cycle persisting its last value
        // takes the same lock, and one starting afterwards finds nothing to
        // load.
        let mut entries = self.entries.lock().await;
        let removed = self.store.delete(id).await;
        self.retire(&mut entries, id, true);
        drop(entries);
        removed?;
        info!("Deleted instance {}", id);
        Ok(())
    }

    /// Stop polling the given instances without touching their configuration.
    pub async fn teardown(&self, ids: &[InstanceId]) {
        let mut entries = self.entries.lock().await;
        for id in ids {
            self.retire(&mut entries, *id, false);
        }
        debug!("Tore down {} instances", ids.len());
    }

    /// Tear down every tracked instance.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        let ids: Vec<InstanceId> = entries.keys().copied().collect();
        for id in &ids {
            self.retire(&mut entries, *id, false);
        }
        info!("Refresh controller stopped, {} instances torn down", ids.len());
    }

    pub async fn status(&self, id: InstanceId) -> Option<InstanceStatus> {
        let entries = self.entries.lock().await;
        entries.get(&id).map(|entry| InstanceStatus {
            state: entry.state,
            consecutive_failures: entry.consecutive_failures,
            last_known: entry.last_known,
            next_refresh: entry.pending.map(|(_, at)| at),
        })
    }

    pub async fn pending_token(&self, id: InstanceId) -> Option<ScheduleToken> {
        let entries = self.entries.lock().await;
        entries.get(&id).and_then(|entry| entry.pending.map(|(token, _)| token))
    }

    pub async fn last_known(&self, id: InstanceId) -> Option<LastKnownValue> {
        let entries = self.entries.lock().await;
        entries.get(&id).and_then(|entry| entry.last_known)
    }

    pub async fn metrics(&self) -> RefreshMetricsSnapshot {
        let (tracked, pending) = {
            let entries = self.entries.lock().await;
            let pending = entries.values().filter(|e| e.pending.is_some()).count();
            (entries.len(), pending)
        };
        self.metrics.snapshot(tracked, pending)
    }

    /// Track `id` if needed and return its cycle lock together with the
    /// generation this trigger belongs to.
    async fn register(&self, id: InstanceId) -> (Arc<Mutex<()>>, u64) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(id).or_insert_with(|| InstanceEntry {
            generation: self.next_generation(),
            cycle: Arc::new(Mutex::new(())),
            state: RefreshState::Idle,
            pending: None,
            last_known: None,
            restored: false,
            consecutive_failures: 0,
        });
        (Arc::clone(&entry.cycle), entry.generation)
    }

    /// Drop this trigger's hold on the entry. An unconfigured entry that
    /// nobody else holds or awaits is forgotten.
    async fn release(&self, id: InstanceId, cycle_lock: Arc<Mutex<()>>) {
        let mut entries = self.entries.lock().await;
        drop(cycle_lock);

        // Clones are only handed out under the entries lock.
        let unused = entries.get(&id).is_some_and(|entry| {
            entry.state == RefreshState::Unconfigured && Arc::strong_count(&entry.cycle) == 1
        });
        if unused {
            entries.remove(&id);
        }
    }

    async fn restore_last_known(&self, id: InstanceId, generation: u64) {
        let wanted = self
            .with_entry(id, generation, |entry| {
                let wanted = !entry.restored && entry.last_known.is_none();
                entry.restored = true;
                wanted
            })
            .await
            .unwrap_or(false);
        if !wanted {
            return;
        }

        match self.store.load_last_value(id).await {
            Ok(Some(value)) => {
                self.with_entry(id, generation, |entry| {
                    entry.last_known.get_or_insert(value);
                })
                .await;
                debug!("Restored last value {} for instance {}", value.value, id);
            }
            Ok(None) => {}
            Err(e) => warn!("Could not restore last value for instance {}: {}", id, e),
        }
    }

    async fn generation_of(&self, id: InstanceId) -> Option<u64> {
        self.entries.lock().await.get(&id).map(|entry| entry.generation)
    }

    /// Apply `f` to the entry if it still belongs to `generation`.
    async fn with_entry<R>(
        &self,
        id: InstanceId,
        generation: u64,
        f: impl FnOnce(&mut InstanceEntry) -> R,
    ) -> Option<R> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&id) {
            Some(entry) if entry.generation == generation => Some(f(entry)),
            _ => None,
        }
    }

    async fn fetch(&self, config: &InstanceConfig) -> std::result::Result<Reading, FetchError> {
        let request = self.fetcher.fetch_latest(
            &config.channel_id,
            config.field,
            config.api_key.as_deref(),
        );

        match timeout(self.settings.fetch_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }

    async fn on_reading(
        &self,
        id: InstanceId,
        generation: u64,
        config: &InstanceConfig,
        reading: Reading,
        now: DateTime<FixedOffset>,
    ) -> CycleOutcome {
        self.metrics.successes.fetch_add(1, Ordering::Relaxed);

        let alarm = evaluate(reading.value, config, LocalTime::from_datetime(&now));

        let latest = reading.value.map(|value| LastKnownValue {
            value,
            observed_at: reading.observed_at,
        });

        {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&id).filter(|e| e.generation == generation) else {
                return self.superseded(id);
            };
            entry.state = RefreshState::Rendering;
            entry.consecutive_failures = 0;

            if let Some(value) = latest {
                entry.last_known = Some(value);
                // Under the entries lock, which `delete` holds while removing it.
                if let Err(e) = self.store.save_last_value(id, &value).await {
                    warn!("Failed to persist last value for instance {}: {}", id, e);
                }
            }
        }

        self.render(id, &ViewState::data(config, &reading, &alarm)).await;

        if alarm.triggered {
            self.deliver_alert(id, &alarm).await;
        }

        CycleOutcome::Rendered(alarm)
    }

    async fn on_fetch_error(&self, id: InstanceId, generation: u64, err: FetchError) -> CycleOutcome {
        self.metrics.failures.fetch_add(1, Ordering::Relaxed);

        let Some((failures, last_known)) = self
            .with_entry(id, generation, |entry| {
                entry.state = RefreshState::Failed;
                entry.consecutive_failures += 1;
                (entry.consecutive_failures, entry.last_known)
            })
            .await
        else {
            return self.superseded(id);
        };

        warn!(
            "Fetch failed for instance {} (consecutive failures: {}): {}",
            id, failures, err
        );

        self.render(
            id,
            &ViewState::Error {
                message: err.to_string(),
                last_known,
            },
        )
        .await;

        CycleOutcome::Failed(err)
    }

    async fn deliver_alert(&self, id: InstanceId, alarm: &AlarmResult) {
        let raise = self.alerts.raise(&self.settings.alert_title, &alarm.message);
        let result = match timeout(self.settings.fetch_timeout, raise).await {
            Ok(result) => result,
            Err(_) => Err(AlertError::new("alert sink timed out")),
        };

        match result {
            Ok(()) => {
                self.metrics.alerts_raised.fetch_add(1, Ordering::Relaxed);
                info!("Alarm raised for instance {}: {}", id, alarm.message);
            }
            Err(e) => {
                self.metrics.alert_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to deliver alarm for instance {}: {}", id, e);
            }
        }
    }

    async fn render(&self, id: InstanceId, state: &ViewState) {
        if let Err(e) = self.renderer.render(id, state).await {
            warn!("Failed to render {} state for instance {}: {}", state.name(), id, e);
        }
    }

    fn superseded(&self, id: InstanceId) -> CycleOutcome {
        debug!("Instance {} was retired during its cycle, dropping the result", id);
        CycleOutcome::Superseded
    }

    async fn finish_unconfigured(&self, id: InstanceId, generation: u64) -> CycleOutcome {
        self.metrics.unconfigured.fetch_add(1, Ordering::Relaxed);

        let stale = self
            .with_entry(id, generation, |entry| {
                entry.state = RefreshState::Unconfigured;
                entry.pending.take()
            })
            .await
            .flatten();

        if let Some((token, _)) = stale {
            self.scheduler.cancel(token);
        }

        info!("Instance {} has no configuration, polling stopped", id);
        self.render(id, &ViewState::Unconfigured).await;
        CycleOutcome::Unconfigured
    }

    async fn reschedule(
        &self,
        id: InstanceId,
        generation: u64,
        config: &InstanceConfig,
        started_at: DateTime<FixedOffset>,
    ) {
        match self.store.load(id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("Instance {} was removed during its cycle, not rescheduling", id);
                return;
            }
            Err(e) => warn!("Could not re-check configuration for instance {}: {}", id, e),
        }

        let interval = config.effective_interval(self.settings.min_update_interval);
        let interval = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
        let next = started_at
            .checked_add_signed(interval)
            .unwrap_or(started_at)
            .max(self.clock.now());

        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&id).filter(|e| e.generation == generation) else {
            debug!("Instance {} was retired during its cycle, not rescheduling", id);
            return;
        };

        if let Some((previous, _)) = entry.pending.take() {
            self.scheduler.cancel(previous);
        }

        let token = self.scheduler.schedule_at(id, next);
        entry.pending = Some((token, next));
        entry.state = RefreshState::Idle;
        debug!("Next refresh of instance {} at {}", id, next);
    }

    /// Supersede every registered trigger and cancel the schedule slot. When
    /// `forget` is set the cache is cleared too, and the entry is dropped once
    /// no cycle holds or awaits it.
    fn retire(&self, entries: &mut HashMap<InstanceId, InstanceEntry>, id: InstanceId, forget: bool) {
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };

        entry.generation = self.next_generation();
        if let Some((token, _)) = entry.pending.take() {
            self.scheduler.cancel(token);
        }

        if forget {
            entry.last_known = None;
            entry.consecutive_failures = 0;
            entry.state = RefreshState::Unconfigured;

            // Only the map holds the lock: nothing is running or queued.
            if Arc::strong_count(&entry.cycle) == 1 {
                entries.remove(&id);
            }
        } else if entry.state != RefreshState::Unconfigured {
            entry.state = RefreshState::Idle;
        }
    }
}

#[derive(Debug, Default)]
struct RefreshMetrics {
    cycles: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    unconfigured: AtomicU64,
    alerts_raised: AtomicU64,
    alert_failures: AtomicU64,
}

impl RefreshMetrics {
    fn snapshot(&self, tracked_instances: usize, pending_refreshes: usize) -> RefreshMetricsSnapshot {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let fetches = successes + failures;

        let success_rate = if fetches > 0 {
            (successes as f64 / fetches as f64) * 100.0
        } else {
            0.0
        };

        RefreshMetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            successes,
            failures,
            unconfigured: self.unconfigured.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            alert_failures: self.alert_failures.load(Ordering::Relaxed),
            success_rate,
            tracked_instances,
            pending_refreshes,
        }
    }
}

/// Snapshot of controller counters
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshMetricsSnapshot {
    pub cycles: u64,
    pub successes: u64,
    pub failures: u64,
    pub unconfigured: u64,
    pub alerts_raised: u64,
    pub alert_failures: u64,
    pub success_rate: f64,
    pub tracked_instances: usize,
    pub pending_refreshes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot_success_rate() {
        let metrics = RefreshMetrics::default();
        assert_eq!(metrics.snapshot(0, 0).success_rate, 0.0);

        metrics.successes.fetch_add(3, Ordering::Relaxed);
        metrics.failures.fetch_add(1, Ordering::Relaxed);
        let snapshot = metrics.snapshot(2, 1);
        assert_eq!(snapshot.success_rate, 75.0);
        assert_eq!(snapshot.tracked_instances, 2);
        assert_eq!(snapshot.pending_refreshes, 1);
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(Trigger::Scheduled.to_string(), "scheduled");
        assert_eq!(Trigger::Reconfigured.to_string(), "reconfigured");
    }

    #[test]
    fn test_default_settings() {
        let settings = ControllerSettings::default();
        assert_eq!(settings.fetch_timeout, Duration::from_secs(15));
        assert_eq!(settings.min_update_interval, Duration::from_secs(30));
        assert_eq!(settings.alert_title, crate::notify::DEFAULT_ALERT_TITLE);
    }
}
