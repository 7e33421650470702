//! Activity sequencing, dependency ordering and gap recovery

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use treeacl_core::error::{Result, SecurityError};
use treeacl_core::traits::{DataProvider, LoggedActivity, MessageProvider};
use treeacl_core::types::{Activity, ActivityId, ActivityMessage, ExecutionState, MutationKind};
use uuid::Uuid;

use super::completion::CompletionState;
use super::dependency::must_wait_for;
use super::persist::persist;
use crate::cache::SecurityCache;
use crate::config::ActivitySection;

/// Lifecycle of one activity inside this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityState {
    Submitted,
    WaitingForDependencies,
    Executing,
    Applied,
    Faulted,
    Cancelled,
}

/// How an admitted activity is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Execution {
    /// Prepare, persist, apply, mark done, broadcast
    Local,
    /// Prepare and apply to memory only
    Remote,
}

/// An activity that passed validation but failed to apply
#[derive(Debug, Clone)]
pub struct FaultRecord {
    pub activity: Activity,
    pub reason: String,
    /// Whether this process owns the store writes of the activity
    pub local: bool,
    pub faulted_at: DateTime<Utc>,
}

struct InFlight {
    activity: Arc<Activity>,
    state: ActivityState,
}

#[derive(Default)]
struct QueueState {
    in_flight: BTreeMap<ActivityId, InFlight>,
    completion: CompletionState,
    highest_admitted: ActivityId,
}

impl QueueState {
    fn is_known(&self, id: ActivityId) -> bool {
        self.in_flight.contains_key(&id) || self.completion.is_applied(id)
    }
}

struct EngineInner {
    origin: Uuid,
    cache: Arc<SecurityCache>,
    data: Arc<dyn DataProvider>,
    messages: Option<Arc<dyn MessageProvider>>,
    gap_load_batch_size: usize,
    /// Serializes id assignment and gap filling
    admission: tokio::sync::Mutex<()>,
    queue: Mutex<QueueState>,
    faults: DashMap<ActivityId, FaultRecord>,
    /// Signalled whenever an activity leaves the in-flight set
    progress: Notify,
}

/// Serializes mutations into sequenced activities.
///
/// Activities touching related ids run in sequence order; unrelated ones
/// run concurrently. Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct ActivityEngine {
    inner: Arc<EngineInner>,
}

/// Cancels a waiting submission if its future is dropped
struct PendingGuard {
    inner: Arc<EngineInner>,
    id: ActivityId,
    armed: bool,
}

impl PendingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // resolved here and now, so nothing later can run it out of order
        self.inner.finish(self.id);
        warn!(activity_id = self.id, "Waiting submission dropped, activity cancelled");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                let id = self.id;
                handle.spawn(async move { inner.record_cancelled(id).await });
            }
            Err(_) => {
                warn!(activity_id = self.id, "No runtime to record the cancellation in the log");
            }
        }
    }
}

impl EngineInner {
    /// Drop `id` from the in-flight set and count it as resolved
    fn finish(&self, id: ActivityId) {
        {
            let mut queue = self.queue.lock();
            queue.in_flight.remove(&id);
            queue.completion.complete(id);
        }
        self.progress.notify_waiters();
    }

    async fn record_cancelled(&self, id: ActivityId) {
        if let Err(e) = self
            .data
            .set_execution_state(id, ExecutionState::Cancelled)
            .await
        {
            warn!(activity_id = id, error = %e, "Could not record cancellation");
        }
    }
}

impl ActivityEngine {
    pub fn new(
        origin: Uuid,
        cache: Arc<SecurityCache>,
        data: Arc<dyn DataProvider>,
        messages: Option<Arc<dyn MessageProvider>>,
        config: &ActivitySection,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                origin,
                cache,
                data,
                messages,
                gap_load_batch_size: config.gap_load_batch_size.max(1),
                admission: tokio::sync::Mutex::new(()),
                queue: Mutex::new(QueueState::default()),
                faults: DashMap::new(),
                progress: Notify::new(),
            }),
        }
    }

    pub fn origin(&self) -> Uuid {
        self.inner.origin
    }

    pub fn cache(&self) -> &SecurityCache {
        &self.inner.cache
    }

    pub fn completion_state(&self) -> CompletionState {
        self.inner.queue.lock().completion.clone()
    }

    /// Current state of an activity, `None` when this process never saw it
    pub fn state_of(&self, id: ActivityId) -> Option<ActivityState> {
        if self.inner.faults.contains_key(&id) {
            return Some(ActivityState::Faulted);
        }
        let queue = self.inner.queue.lock();
        if let Some(entry) = queue.in_flight.get(&id) {
            return Some(entry.state);
        }
        queue
            .completion
            .is_applied(id)
            .then_some(ActivityState::Applied)
    }

    /// Faulted activities, ascending by id
    pub fn faults(&self) -> Vec<(ActivityId, FaultRecord)> {
        let mut faults: Vec<_> = self
            .inner
            .faults
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        faults.sort_by_key(|(id, _)| *id);
        faults
    }

    // ------------------------------------------------------------------
    // Start-up
    // ------------------------------------------------------------------

    /// Seed the completion state from the store log and re-execute every
    /// activity left unprocessed by a previous run. Call after the cache
    /// has been loaded.
    pub async fn recover(&self) -> Result<usize> {
        let _admission = self.inner.admission.lock().await;
        let last = self.inner.data.last_activity_id().await?;
        let unprocessed = self.inner.data.load_unprocessed_activities().await?;
        let ids: Vec<ActivityId> = unprocessed.iter().map(|a| a.sequence_id).collect();

        {
            let mut queue = self.inner.queue.lock();
            queue.completion = CompletionState::recovered(last, &ids);
            queue.highest_admitted = last;
        }
        info!(
            last_activity_id = last,
            unprocessed = ids.len(),
            "Activity log recovered"
        );

        let count = unprocessed.len();
        for activity in unprocessed {
            let activity = Arc::new(activity);
            self.admit(activity.clone());
            self.wait_for_dependencies(activity.sequence_id, None).await;
            if let Err(e) = self.execute(activity, Execution::Local).await {
                warn!(error = %e, "Recovered activity failed");
            }
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Local submissions
    // ------------------------------------------------------------------

    pub async fn submit(&self, payload: MutationKind) -> Result<ActivityId> {
        self.submit_with_cancellation(payload, CancellationToken::new())
            .await
    }

    /// Log, order and execute a mutation.
    ///
    /// Validation errors are returned before anything is logged. Cancelling
    /// `token` before execution starts resolves the activity without
    /// applying it.
    pub async fn submit_with_cancellation(
        &self,
        payload: MutationKind,
        token: CancellationToken,
    ) -> Result<ActivityId> {
        self.inner.cache.validate(&payload)?;

        let activity = {
            let _admission = self.inner.admission.lock().await;
            let mut activity = Activity::new(payload);
            activity.sequence_id = self.inner.data.save_activity(&activity).await?;
            self.fill_gaps_before(activity.sequence_id).await;
            let activity = Arc::new(activity);
            self.admit(activity.clone());
            activity
        };
        let id = activity.sequence_id;
        debug!(activity_id = id, kind = activity.payload.name(), "Activity admitted");

        let guard = PendingGuard {
            inner: self.inner.clone(),
            id,
            armed: true,
        };
        let ready = self.wait_for_dependencies(id, Some(&token)).await;
        guard.disarm();

        if !ready {
            self.cancel(id).await;
            return Err(SecurityError::Cancelled(id));
        }

        // once started, execution runs to completion even if the caller goes away
        let engine = self.clone();
        tokio::spawn(async move { engine.execute(activity, Execution::Local).await })
            .await
            .map_err(|e| SecurityError::Internal(format!("activity task failed: {}", e)))?
    }

    async fn cancel(&self, id: ActivityId) {
        self.inner.record_cancelled(id).await;
        self.finish(id);
        warn!(activity_id = id, "Activity cancelled before execution");
    }

    // ------------------------------------------------------------------
    // Received activities
    // ------------------------------------------------------------------

    /// Handle one encoded activity from the transport.
    ///
    /// Own broadcasts and duplicates are ignored; missing lower ids are
    /// loaded from the store first.
    pub async fn receive(&self, payload: &[u8]) -> Result<()> {
        let message = ActivityMessage::decode(payload)?;
        if message.origin == self.inner.origin {
            return Ok(());
        }
        let activity = message.activity;
        let id = activity.sequence_id;
        if id == 0 {
            warn!("Received activity without sequence id");
            return Ok(());
        }

        let _admission = self.inner.admission.lock().await;
        if self.is_known(id) {
            debug!(activity_id = id, "Duplicate activity ignored");
            return Ok(());
        }
        self.fill_gaps_before(id).await;
        if self.is_known(id) {
            return Ok(());
        }
        let activity = Arc::new(activity);
        self.admit(activity.clone());
        self.spawn_execution(activity, Execution::Remote);
        Ok(())
    }

    fn is_known(&self, id: ActivityId) -> bool {
        self.inner.faults.contains_key(&id) || self.inner.queue.lock().is_known(id)
    }

    // ------------------------------------------------------------------
    // Gap handling
    // ------------------------------------------------------------------

    /// Load ids between the highest admitted one and `id` from the log.
    /// Caller holds the admission lock.
    async fn fill_gaps_before(&self, id: ActivityId) {
        let highest = self.inner.queue.lock().highest_admitted;
        if id > highest + 1 {
            warn!(from = highest + 1, to = id - 1, "Gap detected, loading from activity log");
            self.load_and_admit(highest + 1, id - 1).await;
        }
    }

    /// Admit every logged activity in `from..=to` that this process has not
    /// seen. Ids missing from the log stay open gaps.
    async fn load_and_admit(&self, from: ActivityId, to: ActivityId) {
        let mut cursor = from;
        while cursor <= to {
            let batch = match self
                .inner
                .data
                .load_activities(cursor, to, self.inner.gap_load_batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(from = cursor, to, error = %e, "Could not load activities");
                    break;
                }
            };
            let Some(last) = batch.last().map(|l| l.activity.sequence_id) else {
                break;
            };
            for logged in batch {
                self.admit_logged(logged);
            }
            cursor = last + 1;
        }

        let mut queue = self.inner.queue.lock();
        queue.highest_admitted = queue.highest_admitted.max(to);
    }

    fn admit_logged(&self, logged: LoggedActivity) {
        let id = logged.activity.sequence_id;
        if self.is_known(id) {
            return;
        }
        if logged.state == ExecutionState::Cancelled {
            debug!(activity_id = id, "Logged activity was cancelled, resolving");
            self.finish(id);
            return;
        }
        let activity = Arc::new(logged.activity);
        self.admit(activity.clone());
        self.spawn_execution(activity, Execution::Remote);
    }

    /// Re-request every open gap and anything logged beyond the highest
    /// admitted id. Returns the resulting completion state.
    pub async fn catch_up(&self) -> Result<CompletionState> {
        let _admission = self.inner.admission.lock().await;

        let gaps: Vec<ActivityId> = {
            let queue = self.inner.queue.lock();
            queue
                .completion
                .gaps_up_to(queue.highest_admitted)
                .into_iter()
                .filter(|id| !queue.in_flight.contains_key(id) && !self.inner.faults.contains_key(id))
                .collect()
        };
        for (from, to) in ranges(&gaps) {
            self.load_and_admit(from, to).await;
        }

        let last = self.inner.data.last_activity_id().await?;
        let highest = self.inner.queue.lock().highest_admitted;
        if last > highest {
            self.load_and_admit(highest + 1, last).await;
        }
        Ok(self.completion_state())
    }

    // ------------------------------------------------------------------
    // Faults
    // ------------------------------------------------------------------

    /// Run a faulted activity again
    pub async fn retry_faulted(&self, id: ActivityId) -> Result<ActivityId> {
        let (_, record) = self.inner.faults.remove(&id).ok_or_else(|| {
            SecurityError::InvalidArgument(format!("activity {} is not faulted", id))
        })?;
        info!(activity_id = id, "Retrying faulted activity");
        let execution = if record.local {
            Execution::Local
        } else {
            Execution::Remote
        };
        let activity = Arc::new(record.activity);
        self.admit(activity.clone());
        self.wait_for_dependencies(id, None).await;
        self.execute(activity, execution).await
    }

    /// Mark a faulted activity as handled operationally, unblocking the floor
    pub async fn resolve_fault(&self, id: ActivityId) -> Result<()> {
        let (_, record) = self.inner.faults.remove(&id).ok_or_else(|| {
            SecurityError::InvalidArgument(format!("activity {} is not faulted", id))
        })?;
        if record.local {
            self.inner
                .data
                .set_execution_state(id, ExecutionState::Done)
                .await?;
        }
        self.finish(id);
        info!(activity_id = id, "Fault resolved");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------

    /// Wait until `id` is applied (or resolved); fails if it faults
    pub async fn wait_until_applied(&self, id: ActivityId) -> Result<()> {
        loop {
            let notified = self.inner.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.queue.lock().completion.is_applied(id) {
                return Ok(());
            }
            if let Some(record) = self.inner.faults.get(&id) {
                return Err(SecurityError::Faulted {
                    activity_id: id,
                    reason: record.reason.clone(),
                });
            }
            notified.await;
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn admit(&self, activity: Arc<Activity>) {
        let id = activity.sequence_id;
        let mut queue = self.inner.queue.lock();
        queue.highest_admitted = queue.highest_admitted.max(id);
        queue.in_flight.insert(
            id,
            InFlight {
                activity,
                state: ActivityState::Submitted,
            },
        );
    }

    fn spawn_execution(&self, activity: Arc<Activity>, execution: Execution) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .wait_for_dependencies(activity.sequence_id, None)
                .await;
            // faults are recorded in the ledger
            let _ = engine.execute(activity, execution).await;
        });
    }

    /// Whether no earlier related activity is still in flight
    fn dependencies_cleared(&self, id: ActivityId) -> bool {
        let mut queue = self.inner.queue.lock();
        let Some(me) = queue.in_flight.get(&id).map(|e| e.activity.clone()) else {
            return true;
        };
        let blocked = {
            let store = self.inner.cache.entities();
            queue
                .in_flight
                .range(..id)
                .any(|(_, earlier)| must_wait_for(&me, &earlier.activity, &store))
        };
        if let Some(entry) = queue.in_flight.get_mut(&id) {
            entry.state = if blocked {
                ActivityState::WaitingForDependencies
            } else {
                ActivityState::Executing
            };
        }
        !blocked
    }

    /// Returns `false` when `token` fired first
    async fn wait_for_dependencies(&self, id: ActivityId, token: Option<&CancellationToken>) -> bool {
        loop {
            let notified = self.inner.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if token.is_some_and(|t| t.is_cancelled()) {
                return false;
            }
            if self.dependencies_cleared(id) {
                return true;
            }
            match token {
                Some(token) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = token.cancelled() => return false,
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn execute(&self, activity: Arc<Activity>, execution: Execution) -> Result<ActivityId> {
        let id = activity.sequence_id;
        let result = match execution {
            Execution::Local => self.execute_local(&activity).await,
            Execution::Remote => self.inner.cache.apply(&activity.payload),
        };

        match result {
            Ok(()) => {
                self.finish(id);
                info!(activity_id = id, kind = activity.payload.name(), "Activity applied");
                if execution == Execution::Local {
                    self.broadcast(&activity).await;
                }
                Ok(id)
            }
            Err(e) => {
                let reason = e.to_string();
                error!(activity_id = id, kind = activity.payload.name(), error = %reason, "Activity faulted");
                self.inner.faults.insert(
                    id,
                    FaultRecord {
                        activity: (*activity).clone(),
                        reason: reason.clone(),
                        local: execution == Execution::Local,
                        faulted_at: Utc::now(),
                    },
                );
                self.inner.queue.lock().in_flight.remove(&id);
                self.inner.progress.notify_waiters();
                Err(SecurityError::Faulted {
                    activity_id: id,
                    reason,
                })
            }
        }
    }

    async fn execute_local(&self, activity: &Activity) -> Result<()> {
        let id = activity.sequence_id;
        let data = self.inner.data.as_ref();
        data.set_execution_state(id, ExecutionState::Executing).await?;
        // dependencies are applied, so editor batches resolve against their final inputs
        let prepared = self.inner.cache.prepare(&activity.payload)?;
        persist(data, &self.inner.cache, &prepared).await?;
        self.inner.cache.commit(&prepared)?;
        data.set_execution_state(id, ExecutionState::Done).await
    }

    async fn broadcast(&self, activity: &Activity) {
        let Some(messages) = self.inner.messages.as_ref() else {
            return;
        };
        let encoded = match ActivityMessage::new(self.inner.origin, activity.clone()).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(activity_id = activity.sequence_id, error = %e, "Could not encode activity");
                return;
            }
        };
        if let Err(e) = messages.send(encoded).await {
            warn!(activity_id = activity.sequence_id, error = %e, "Broadcast failed, peers will catch up from the log");
        }
    }

    fn finish(&self, id: ActivityId) {
        self.inner.finish(id);
    }
}

/// Collapse sorted ids into inclusive ranges
fn ranges(ids: &[ActivityId]) -> Vec<(ActivityId, ActivityId)> {
    let mut out: Vec<(ActivityId, ActivityId)> = Vec::new();
    for &id in ids {
        match out.last_mut() {
            Some((_, end)) if *end + 1 == id => *end = id,
            _ => out.push((id, id)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        assert_eq!(ranges(&[2, 3, 4, 7, 9, 10]), vec![(2, 4), (7, 7), (9, 10)]);
        assert!(ranges(&[]).is_empty());
    }
}
