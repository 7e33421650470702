//! Lifecycle handle tying the cache, the activity engine and the providers
//! together

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use treeacl_core::error::{Result, SecurityError};
use treeacl_core::traits::{DataProvider, MessageProvider, MissingEntityResolver};
use treeacl_core::types::{ActivityId, EntityId, EntryType, IdentityId, MutationKind};
use uuid::Uuid;

use crate::activity::{ActivityEngine, ActivityState, CompletionState, FaultRecord};
use crate::cache::SecurityCache;
use crate::config::SecurityConfig;
use crate::editor::AclEditor;

/// Builder for [`SecuritySystem`]
pub struct SecuritySystemBuilder {
    config: SecurityConfig,
    data: Option<Arc<dyn DataProvider>>,
    messages: Option<Arc<dyn MessageProvider>>,
    resolver: Option<Arc<dyn MissingEntityResolver>>,
}

impl SecuritySystemBuilder {
    pub fn data_provider(mut self, data: Arc<dyn DataProvider>) -> Self {
        self.data = Some(data);
        self
    }

    /// Transport used to replicate activities. Without one the system runs
    /// standalone.
    pub fn message_provider(mut self, messages: Arc<dyn MessageProvider>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn missing_entity_resolver(mut self, resolver: Arc<dyn MissingEntityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Load the cache, recover unprocessed activities and start the
    /// background tasks.
    pub async fn start(self) -> Result<SecuritySystem> {
        self.config.validate()?;
        let data = self.data.ok_or_else(|| {
            SecurityError::Configuration("a data provider is required".to_string())
        })?;

        let mut cache = SecurityCache::new(self.config.clone())?;
        if let Some(resolver) = self.resolver {
            cache = cache.with_resolver(resolver);
        }
        let cache = Arc::new(cache);

        // subscribe before loading so nothing sent in between is lost
        let receiver = self.messages.as_ref().map(|m| m.subscribe());

        cache.load(data.as_ref()).await?;

        let origin = Uuid::new_v4();
        let engine = ActivityEngine::new(
            origin,
            cache.clone(),
            data,
            self.messages,
            &self.config.activity,
        );
        let recovered = engine.recover().await?;

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();
        if let Some(receiver) = receiver {
            tasks.push(spawn_listener(engine.clone(), receiver, shutdown.clone()));
        }
        if self.config.activity.health_check_interval_ms > 0 {
            tasks.push(spawn_health_check(
                engine.clone(),
                Duration::from_millis(self.config.activity.health_check_interval_ms),
                shutdown.clone(),
            ));
        }

        info!(
            %origin,
            recovered,
            completion = %engine.completion_state(),
            "Security system started"
        );

        Ok(SecuritySystem {
            cache,
            engine,
            shutdown,
            tasks,
        })
    }
}

/// A running authorization cache.
///
/// Reads go through [`SecuritySystem::cache`]; every mutation is sequenced
/// by the activity engine and returns the id it was assigned.
pub struct SecuritySystem {
    cache: Arc<SecurityCache>,
    engine: ActivityEngine,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SecuritySystem {
    pub fn builder(config: SecurityConfig) -> SecuritySystemBuilder {
        SecuritySystemBuilder {
            config,
            data: None,
            messages: None,
            resolver: None,
        }
    }

    /// Stop the background tasks. Activities already executing finish.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!(origin = %self.engine.origin(), "Security system stopped");
    }

    pub fn cache(&self) -> &SecurityCache {
        &self.cache
    }

    pub fn engine(&self) -> &ActivityEngine {
        &self.engine
    }

    pub fn origin(&self) -> Uuid {
        self.engine.origin()
    }

    // ------------------------------------------------------------------
    // Structural mutations
    // ------------------------------------------------------------------

    pub async fn create_entity(
        &self,
        entity_id: EntityId,
        parent_id: Option<EntityId>,
        owner_id: Option<IdentityId>,
    ) -> Result<ActivityId> {
        self.engine
            .submit(MutationKind::CreateEntity {
                entity_id,
                parent_id,
                owner_id,
            })
            .await
    }

    /// Delete an entity with its whole subtree
    pub async fn delete_entity(&self, entity_id: EntityId) -> Result<ActivityId> {
        self.engine
            .submit(MutationKind::DeleteEntity { entity_id })
            .await
    }

    pub async fn move_entity(&self, entity_id: EntityId, target_id: EntityId) -> Result<ActivityId> {
        self.engine
            .submit(MutationKind::MoveEntity {
                entity_id,
                target_id,
            })
            .await
    }

    pub async fn modify_owner(&self, entity_id: EntityId, owner_id: Option<IdentityId>) -> Result<ActivityId> {
        self.engine
            .submit(MutationKind::ModifyOwner {
                entity_id,
                owner_id,
            })
            .await
    }

    // ------------------------------------------------------------------
    // Membership mutations
    // ------------------------------------------------------------------

    /// Add users and groups to `group_id`, and `group_id` to each of
    /// `parent_group_ids`
    pub async fn add_members(
        &self,
        group_id: IdentityId,
        user_ids: &[IdentityId],
        group_ids: &[IdentityId],
        parent_group_ids: &[IdentityId],
    ) -> Result<ActivityId> {
        self.engine
            .submit(MutationKind::AddMembers {
                group_id,
                user_ids: user_ids.to_vec(),
                group_ids: group_ids.to_vec(),
                parent_group_ids: parent_group_ids.to_vec(),
            })
            .await
    }

    pub async fn remove_members(
        &self,
        group_id: IdentityId,
        user_ids: &[IdentityId],
        group_ids: &[IdentityId],
        parent_group_ids: &[IdentityId],
    ) -> Result<ActivityId> {
        self.engine
            .submit(MutationKind::RemoveMembers {
                group_id,
                user_ids: user_ids.to_vec(),
                group_ids: group_ids.to_vec(),
                parent_group_ids: parent_group_ids.to_vec(),
            })
            .await
    }

    pub async fn add_user_to_groups(&self, user_id: IdentityId, group_ids: &[IdentityId]) -> Result<ActivityId> {
        self.engine
            .submit(MutationKind::AddUserToGroups {
                user_id,
                group_ids: group_ids.to_vec(),
            })
            .await
    }

    pub async fn remove_user_from_groups(&self, user_id: IdentityId, group_ids: &[IdentityId]) -> Result<ActivityId> {
        self.engine
            .submit(MutationKind::RemoveUserFromGroups {
                user_id,
                group_ids: group_ids.to_vec(),
            })
            .await
    }

    pub async fn delete_group(&self, group_id: IdentityId) -> Result<ActivityId> {
        self.engine
            .submit(MutationKind::DeleteGroup { group_id })
            .await
    }

    pub async fn delete_user(&self, user_id: IdentityId) -> Result<ActivityId> {
        self.engine
            .submit(MutationKind::DeleteUser { user_id })
            .await
    }

    /// Submit any payload with an explicit cancellation token
    pub async fn submit_with_cancellation(
        &self,
        payload: MutationKind,
        token: CancellationToken,
    ) -> Result<ActivityId> {
        self.engine.submit_with_cancellation(payload, token).await
    }

    // ------------------------------------------------------------------
    // ACL editing
    // ------------------------------------------------------------------

    /// Editor for `Normal` entries
    pub fn acl_editor(&self) -> AclEditor<'_> {
        self.acl_editor_for(EntryType::Normal)
    }

    pub fn acl_editor_for(&self, entry_type: EntryType) -> AclEditor<'_> {
        AclEditor::new(&self.engine, entry_type)
    }

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------

    pub fn completion_state(&self) -> CompletionState {
        self.engine.completion_state()
    }

    pub fn activity_state(&self, id: ActivityId) -> Option<ActivityState> {
        self.engine.state_of(id)
    }

    /// Fill every open gap from the activity log now
    pub async fn catch_up(&self) -> Result<CompletionState> {
        self.engine.catch_up().await
    }

    pub async fn wait_until_applied(&self, id: ActivityId) -> Result<()> {
        self.engine.wait_until_applied(id).await
    }

    pub fn faults(&self) -> Vec<(ActivityId, FaultRecord)> {
        self.engine.faults()
    }

    pub async fn retry_faulted(&self, id: ActivityId) -> Result<ActivityId> {
        self.engine.retry_faulted(id).await
    }

    pub async fn resolve_fault(&self, id: ActivityId) -> Result<()> {
        self.engine.resolve_fault(id).await
    }
}

impl Drop for SecuritySystem {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_listener(
    engine: ActivityEngine,
    mut receiver: tokio::sync::broadcast::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = receiver.recv() => received,
            };
            match received {
                Ok(payload) => {
                    if let Err(e) = engine.receive(&payload).await {
                        warn!(error = %e, "Dropped undecodable activity message");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Transport lagged, catching up from activity log");
                    if let Err(e) = engine.catch_up().await {
                        warn!(error = %e, "Catch-up failed");
                    }
                }
                Err(RecvError::Closed) => {
                    debug!("Transport closed");
                    break;
                }
            }
        }
    })
}

fn spawn_health_check(engine: ActivityEngine, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match engine.catch_up().await {
                Ok(state) if !state.gaps().is_empty() => {
                    warn!(completion = %state, "Open gaps remain after health check");
                }
                Ok(state) => debug!(completion = %state, "Health check passed"),
                Err(e) => warn!(error = %e, "Health check failed"),
            }
        }
    })
}
