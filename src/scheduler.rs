//! Wall-clock triggers for the next refresh of an instance

use crate::model::InstanceId;
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use uuid::Uuid;

/// Handle to one pending trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleToken(Uuid);

impl ScheduleToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduleToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arranges for an instance to be refreshed at a wall-clock time.
pub trait SchedulerAdapter: Send + Sync {
    fn schedule_at(&self, id: InstanceId, at: DateTime<FixedOffset>) -> ScheduleToken;

    /// Cancelling a token that already fired or was never issued is a no-op.
    fn cancel(&self, token: ScheduleToken);
}

/// Longest single sleep before the wall clock is consulted again, so a
/// suspended host does not stretch the wait.
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(30);

/// Timer tasks on the tokio runtime. Fired ids are delivered on the channel
/// returned by [`TokioScheduler::new`].
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    pending: Arc<Mutex<HashMap<ScheduleToken, AbortHandle>>>,
    fired: mpsc::UnboundedSender<InstanceId>,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InstanceId>) {
        let (fired, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            fired,
        };
        (scheduler, receiver)
    }

    /// Number of triggers that have neither fired nor been cancelled
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ScheduleToken, AbortHandle>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn sleep_until_wall_clock(at: DateTime<Utc>) {
    loop {
        let remaining = match (at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => return,
        };
        tokio::time::sleep(remaining.min(MAX_SLEEP_SLICE)).await;
    }
}

impl SchedulerAdapter for TokioScheduler {
    fn schedule_at(&self, id: InstanceId, at: DateTime<FixedOffset>) -> ScheduleToken {
        let token = ScheduleToken::new();
        let at = at.with_timezone(&Utc);
        let pending = Arc::clone(&self.pending);
        let fired = self.fired.clone();

        // Hold the lock across spawn so the task cannot remove its own entry
        // before it has been inserted.
        let mut guard = self.lock();
        let handle = tokio::spawn(async move {
            sleep_until_wall_clock(at).await;

            let still_pending = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&token)
                .is_some();

            if still_pending {
                trace!("Trigger {} fired for instance {}", token, id);
                if fired.send(id).is_err() {
                    debug!("Dispatcher closed, dropping trigger for instance {}", id);
                }
            }
        });
        guard.insert(token, handle.abort_handle());

        debug!("Scheduled instance {} at {} ({})", id, at, token);
        token
    }

    fn cancel(&self, token: ScheduleToken) {
        if let Some(handle) = self.lock().remove(&token) {
            handle.abort();
            debug!("Cancelled trigger {}", token);
        }
    }
}
