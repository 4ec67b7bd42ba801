//! Daemon wiring: collaborators, trigger dispatch, restart re-arming
//!
//! The store directory is the daemon's control surface. Every
//! `store_poll_interval` it is rescanned: new or changed documents are
//! refreshed, vanished ones are deleted from the controller and
//! `refresh-<id>.request` markers trigger a manual cycle.

use crate::clock::SystemClock;
use crate::config::Config;
use crate::controller::{Collaborators, ControllerSettings, RefreshController, Trigger};
use crate::errors::{MonitorError, Result};
use crate::fetcher::ThingSpeakClient;
use crate::model::{InstanceConfig, InstanceId};
use crate::notify::{AlertSink, LogAlertSink, WebhookAlertSink};
use crate::render::{LogRenderSink, RenderSink, SurfaceRenderSink};
use crate::scheduler::TokioScheduler;
use crate::store::{ConfigStore, JsonFileStore};

use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Last scanned configuration per instance; `None` marks an unreadable
/// document.
type KnownConfigs = HashMap<InstanceId, Option<InstanceConfig>>;

/// Long-running monitor over every stored instance
pub struct MonitorService {
    config: Config,
    store: Arc<JsonFileStore>,
    controller: Arc<RefreshController>,
    fired: Mutex<Option<mpsc::UnboundedReceiver<InstanceId>>>,
}

impl MonitorService {
    /// Build the service and its collaborators from configuration
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().map_err(MonitorError::Config)?;

        let store = Arc::new(JsonFileStore::open(&config.store_dir).await?);
        let fetcher = Arc::new(ThingSpeakClient::new(&config.thingspeak_url, config.http_timeout)?);

        let alerts: Arc<dyn AlertSink> = match &config.alert_webhook_url {
            Some(url) => {
                info!("Alarms are delivered to webhook {}", url);
                Arc::new(WebhookAlertSink::new(url.clone(), config.http_timeout)?)
            }
            None => Arc::new(LogAlertSink),
        };

        let renderer: Arc<dyn RenderSink> = match &config.surface_dir {
            Some(dir) => {
                info!("Rendering views into {}", dir.display());
                Arc::new(SurfaceRenderSink::open(dir).await?)
            }
            None => Arc::new(LogRenderSink),
        };

        let (scheduler, fired) = TokioScheduler::new();

        let controller = RefreshController::new(
            Collaborators {
                store: store.clone(),
                fetcher,
                alerts,
                renderer,
                scheduler: Arc::new(scheduler),
                clock: Arc::new(SystemClock),
            },
            ControllerSettings {
                fetch_timeout: config.fetch_timeout,
                min_update_interval: config.min_update_interval,
                alert_title: config.alert_title.clone(),
            },
        );

        Ok(Self {
            config,
            store,
            controller: Arc::new(controller),
            fired: Mutex::new(Some(fired)),
        })
    }

    pub fn controller(&self) -> &Arc<RefreshController> {
        &self.controller
    }

    /// Run until Ctrl-C
    pub async fn start(&self) -> Result<()> {
        let signal = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to wait for shutdown signal: {}", e);
            }
        };
        self.run_until(signal).await
    }

    /// Run until `shutdown` resolves, then tear every instance down
    #[instrument(skip(self, shutdown))]
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let fired = self
            .fired
            .lock()
            .await
            .take()
            .ok_or_else(|| MonitorError::Other("monitor service is already running".to_string()))?;

        info!(
            "Starting field monitor v{} (store: {}, source: {})",
            env!("CARGO_PKG_VERSION"),
            self.config.store_dir.display(),
            self.config.thingspeak_url
        );

        let mut known = KnownConfigs::new();
        let rearmed = self.sync_store(&mut known, Trigger::Startup).await?;
        info!("Re-armed {} stored instances", rearmed);

        let dispatcher = tokio::spawn(dispatch(Arc::clone(&self.controller), fired));
        let reporter = tokio::spawn(report_metrics(
            Arc::clone(&self.controller),
            self.config.metrics_interval,
        ));

        let mut poll = interval(self.config.store_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        poll.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = poll.tick() => {
                    if let Err(e) = self.sync_store(&mut known, Trigger::Reconfigured).await {
                        warn!("Store scan of {} failed: {}", self.store.dir().display(), e);
                    }
                }
            }
        }

        info!("Shutting down field monitor");
        self.controller.shutdown().await;
        dispatcher.abort();
        reporter.abort();

        let metrics = self.controller.metrics().await;
        info!(
            "Final refresh metrics - Cycles: {}, Success rate: {:.1}%, Alerts: {} ({} failed)",
            metrics.cycles, metrics.success_rate, metrics.alerts_raised, metrics.alert_failures
        );

        Ok(())
    }

    /// Reconcile the controller with the store directory. Changed documents
    /// are refreshed with `trigger`, requested ones manually, all
    /// concurrently. Returns the number of cycles run.
    async fn sync_store(&self, known: &mut KnownConfigs, trigger: Trigger) -> Result<usize> {
        let mut current = KnownConfigs::new();
        for id in self.store.list().await? {
            match self.store.load(id).await {
                Ok(Some(config)) => {
                    current.insert(id, Some(config));
                }
                // Removed between list and load; the next scan sees it gone.
                Ok(None) => {}
                Err(e) => {
                    if !matches!(known.get(&id), Some(None)) {
                        warn!("Configuration of instance {} is unreadable: {}", id, e);
                    }
                    current.insert(id, None);
                }
            }
        }

        let removed: Vec<InstanceId> = known
            .keys()
            .filter(|id| !current.contains_key(*id))
            .copied()
            .collect();
        for id in &removed {
            if let Err(e) = self.controller.delete(*id).await {
                warn!("Failed to retire removed instance {}: {}", id, e);
            }
        }

        let mut triggers: Vec<(InstanceId, Trigger)> = current
            .iter()
            .filter(|(id, config)| known.get(*id) != Some(*config))
            .map(|(id, _)| (*id, trigger))
            .collect();
        let changed = triggers.len();

        for id in self.store.take_refresh_requests().await? {
            if !triggers.iter().any(|(queued, _)| *queued == id) {
                triggers.push((id, Trigger::Manual));
            }
        }

        if changed > 0 || !removed.is_empty() || triggers.len() > changed {
            info!(
                "Store scan: {} changed, {} removed, {} refresh requests",
                changed,
                removed.len(),
                triggers.len() - changed
            );
        }

        *known = current;

        let cycles = triggers.len();
        join_all(
            triggers
                .into_iter()
                .map(|(id, trigger)| self.controller.refresh(id, trigger)),
        )
        .await;

        Ok(cycles)
    }
}

async fn dispatch(controller: Arc<RefreshController>, mut fired: mpsc::UnboundedReceiver<InstanceId>) {
    while let Some(id) = fired.recv().await {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller.refresh(id, Trigger::Scheduled).await;
        });
    }
    debug!("Trigger channel closed, dispatcher stopped");
}

async fn report_metrics(controller: Arc<RefreshController>, every: std::time::Duration) {
    let mut metrics_interval = interval(every);
    // First tick completes immediately.
    metrics_interval.tick().await;

    loop {
        metrics_interval.tick().await;

        let metrics = controller.metrics().await;
        info!(
            "Monitor metrics - Instances: {} ({} scheduled), Cycles: {}, Fetch success rate: {:.1}%, Alerts: {} ({} failed)",
            metrics.tracked_instances,
            metrics.pending_refreshes,
            metrics.cycles,
            metrics.success_rate,
            metrics.alerts_raised,
            metrics.alert_failures
        );
    }
}
