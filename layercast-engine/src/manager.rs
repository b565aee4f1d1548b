//! Session manager
//!
//! Owns every session's state behind one lock and hands detached
//! [`BatchPipeline`]s to generation runs. Entering GENERATING is an atomic
//! check-and-set under the write lock, so at most one run exists per session.
//! Progress and snapshot writes that accompany a state change happen under
//! the same lock, so removal and reconfiguration never interleave with them.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use layercast_common::config::GenerationSettings;
use layercast_common::events::{EventBus, GenerationEvent, GenerationStatus, ProgressSnapshot};
use layercast_common::time;

use crate::config::{validate_request, ConfigOutcome};
use crate::error::{EngineError, EngineResult};
use crate::layers::{LayerLimits, LayerStore, LayerSummary};
use crate::persistence::SessionStore;
use crate::pipeline::{BatchPipeline, COMPLETE_PERCENT};
use crate::progress::ProgressRegistry;
use crate::session::{ArtifactRecord, GenerationRequest, GenerationResult, GenerationSession};
use crate::storage::Storage;

struct SessionEntry {
    session: GenerationSession,
    layers: Arc<LayerStore>,
    /// Artifacts of every finished batch, ordered by index
    artifacts: Vec<ArtifactRecord>,
    result: Option<Arc<GenerationResult>>,
}

/// Background generation run
#[derive(Debug)]
pub struct GenerationHandle {
    session_id: Uuid,
    join: JoinHandle<EngineResult<Arc<GenerationResult>>>,
}

impl GenerationHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run; yields the result or the error that ended it
    pub async fn join(self) -> EngineResult<Arc<GenerationResult>> {
        self.join.await?
    }
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
    progress: ProgressRegistry,
    storage: Arc<dyn Storage>,
    settings: GenerationSettings,
    event_bus: EventBus,
    persistence: Option<SessionStore>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>, settings: GenerationSettings, event_bus: EventBus) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            progress: ProgressRegistry::new(event_bus.clone()),
            storage,
            settings,
            event_bus,
            persistence: None,
        }
    }

    /// Persist session snapshots to `store`
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.persistence = Some(store);
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn progress(&self) -> &ProgressRegistry {
        &self.progress
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Upload step: register a session for `layers`
    pub async fn create_session(&self, layers: LayerStore) -> EngineResult<Uuid> {
        let errors = layers.validate(&LayerLimits::from(&self.settings));
        if !errors.is_empty() {
            return Err(EngineError::InvalidLayers(errors));
        }

        let id = Uuid::new_v4();
        for (layer, trait_name) in layers.missing_images() {
            warn!(session_id = %id, layer, trait_name, "Trait has no image, it will be skipped");
        }

        if let Some(store) = &self.persistence {
            store.save_layers(id, &layers).await?;
        }

        let layer_count = layers.len();
        self.sessions.write().await.insert(
            id,
            SessionEntry {
                session: GenerationSession::new(id),
                layers: Arc::new(layers),
                artifacts: Vec::new(),
                result: None,
            },
        );

        info!(session_id = %id, layers = layer_count, "Session created");
        self.event_bus.emit_lossy(GenerationEvent::SessionCreated {
            session_id: id,
            layer_count,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    /// Validate and save the session configuration
    ///
    /// Allowed until generation starts; a later call replaces the earlier one.
    pub async fn configure(
        &self,
        id: Uuid,
        request: GenerationRequest,
    ) -> EngineResult<ConfigOutcome> {
        let outcome = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions.get_mut(&id).ok_or(EngineError::SessionNotFound(id))?;
            if entry.session.status != GenerationStatus::Pending {
                return Err(EngineError::Conflict(format!(
                    "Session {} is {}, configuration is closed",
                    id, entry.session.status
                )));
            }
            let outcome = validate_request(&request, &entry.layers, &self.settings)
                .map_err(EngineError::InvalidConfig)?;

            // Persisted and published before a start can observe the config
            if let Some(store) = &self.persistence {
                store.save_config(id, &request).await?;
            }
            entry.session.configure(request.clone())?;
            self.progress
                .publish(ProgressSnapshot::pending(id, request.target_supply))
                .await;
            outcome
        };

        for warning in &outcome.warnings {
            warn!(session_id = %id, "{}", warning);
        }

        info!(
            session_id = %id,
            supply = request.target_supply,
            possible = %outcome.total_possible_combinations,
            "Session configured"
        );
        self.event_bus.emit_lossy(GenerationEvent::SessionConfigured {
            session_id: id,
            target_supply: request.target_supply,
            timestamp: Utc::now(),
        });
        Ok(outcome)
    }

    /// Start generation in the background
    ///
    /// Fails with `Conflict` if a run already owns the session or the
    /// session is terminal.
    pub async fn start_generation(&self, id: Uuid) -> EngineResult<GenerationHandle> {
        let pipeline = self.begin_run(id).await?;
        let manager = self.clone();
        let join = tokio::spawn(async move { manager.execute(pipeline).await });
        Ok(GenerationHandle {
            session_id: id,
            join,
        })
    }

    /// Run generation to completion on the caller's task
    pub async fn run_generation(&self, id: Uuid) -> EngineResult<Arc<GenerationResult>> {
        let pipeline = self.begin_run(id).await?;
        self.execute(pipeline).await
    }

    /// PENDING → GENERATING check-and-set
    async fn begin_run(&self, id: Uuid) -> EngineResult<BatchPipeline> {
        let pipeline = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions.get_mut(&id).ok_or(EngineError::SessionNotFound(id))?;
            if entry.session.status != GenerationStatus::Pending {
                return Err(EngineError::Conflict(format!(
                    "Session {} is already {}",
                    id, entry.session.status
                )));
            }
            let request = entry.session.config.clone().ok_or_else(|| {
                EngineError::Conflict(format!("Session {} is not configured", id))
            })?;
            entry.session.transition_to(GenerationStatus::Generating)?;
            let pipeline = BatchPipeline::new(
                id,
                Arc::clone(&entry.layers),
                request,
                Arc::clone(&self.storage),
                self.progress.clone(),
                &self.settings,
            );

            self.progress
                .publish(ProgressSnapshot {
                    session_id: id,
                    status: GenerationStatus::Generating,
                    percentage: 0.0,
                    current: 0,
                    total: pipeline.total(),
                    message: "Generating combinations...".to_string(),
                    error: None,
                    updated_at: Utc::now(),
                })
                .await;
            pipeline
        };

        let total = pipeline.total();
        info!(session_id = %id, total, "Generation started");
        self.event_bus.emit_lossy(GenerationEvent::GenerationStarted {
            session_id: id,
            total,
            timestamp: Utc::now(),
        });
        Ok(pipeline)
    }

    async fn execute(&self, pipeline: BatchPipeline) -> EngineResult<Arc<GenerationResult>> {
        let id = pipeline.session_id();
        let started = Instant::now();
        match self.drive(&pipeline).await {
            Ok(result) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    session_id = %id,
                    items = result.total_supply,
                    duration_ms,
                    "Generation completed"
                );
                self.event_bus.emit_lossy(GenerationEvent::GenerationCompleted {
                    session_id: id,
                    total_supply: result.total_supply,
                    metadata_uri: result.metadata_base_uri.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                Ok(result)
            }
            Err(err) => {
                self.record_failure(id, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(&self, pipeline: &BatchPipeline) -> EngineResult<Arc<GenerationResult>> {
        let id = pipeline.session_id();
        let combinations = pipeline.combinations().await?;

        // Batches strictly in order; each one is recorded before the next starts
        let mut artifacts = Vec::with_capacity(combinations.len());
        for (batch_index, batch) in combinations.chunks(pipeline.batch_size()).enumerate() {
            let records = pipeline.run_batch(batch_index, batch).await?;
            artifacts.extend(records.iter().cloned());
            let produced = artifacts.len();
            self.with_session(id, move |entry| {
                entry.artifacts.extend(records);
                entry.session.record_produced(produced);
                Ok(())
            })
            .await?;
            pipeline.report_batch(batch_index + 1, produced).await;
        }

        self.with_session(id, |entry| {
            entry.session.transition_to(GenerationStatus::Uploading).map(|_| ())
        })
        .await?;

        let metadata_uri = pipeline.upload_collection(&artifacts).await?;
        let result = Arc::new(GenerationResult::new(
            id,
            artifacts,
            metadata_uri,
            pipeline.request().collection.clone(),
        ));

        {
            // A session removed meanwhile must not get its snapshot back
            let mut sessions = self.sessions.write().await;
            let entry = sessions.get_mut(&id).ok_or(EngineError::SessionNotFound(id))?;
            if let Some(store) = &self.persistence {
                store.save_result(id, &result).await?;
            }
            entry.session.transition_to(GenerationStatus::Completed)?;
            entry.result = Some(Arc::clone(&result));

            self.progress
                .replace(ProgressSnapshot {
                    session_id: id,
                    status: GenerationStatus::Completed,
                    percentage: COMPLETE_PERCENT,
                    current: result.total_supply,
                    total: result.total_supply,
                    message: "Generation completed!".to_string(),
                    error: None,
                    updated_at: Utc::now(),
                })
                .await;
        }
        Ok(result)
    }

    /// Move to ERROR, keeping the last percentage and counters
    async fn record_failure(&self, id: Uuid, err: &EngineError) {
        let message = err.to_string();
        error!(session_id = %id, error = %message, "Generation failed");

        let transitioned = self
            .with_session(id, |entry| entry.session.fail(message.clone()))
            .await;
        if let Err(e) = transitioned {
            warn!(session_id = %id, error = %e, "Could not mark session as failed");
        }

        if let Some(mut snapshot) = self.progress.get(id).await {
            snapshot.status = GenerationStatus::Error;
            snapshot.message = "Generation failed".to_string();
            snapshot.error = Some(message.clone());
            snapshot.updated_at = Utc::now();
            self.progress.replace(snapshot).await;
        }

        self.event_bus.emit_lossy(GenerationEvent::GenerationFailed {
            session_id: id,
            error: message,
            timestamp: Utc::now(),
        });
    }

    async fn with_session<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut SessionEntry) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&id).ok_or(EngineError::SessionNotFound(id))?;
        f(entry)
    }

    pub async fn get_progress(&self, id: Uuid) -> Option<ProgressSnapshot> {
        self.progress.get(id).await
    }

    /// Result of a completed run; `None` until COMPLETED
    pub async fn get_result(&self, id: Uuid) -> EngineResult<Option<Arc<GenerationResult>>> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(&id).ok_or(EngineError::SessionNotFound(id))?;
        Ok(entry.result.clone())
    }

    /// Artifacts of every finished batch, including those of a failed run
    pub async fn get_artifacts(&self, id: Uuid) -> EngineResult<Vec<ArtifactRecord>> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(&id).ok_or(EngineError::SessionNotFound(id))?;
        Ok(entry.artifacts.clone())
    }

    pub async fn get_session(&self, id: Uuid) -> EngineResult<GenerationSession> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(&id).ok_or(EngineError::SessionNotFound(id))?;
        Ok(entry.session.clone())
    }

    pub async fn get_config(&self, id: Uuid) -> EngineResult<Option<GenerationRequest>> {
        Ok(self.get_session(id).await?.config)
    }

    pub async fn layer_summary(&self, id: Uuid) -> EngineResult<LayerSummary> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(&id).ok_or(EngineError::SessionNotFound(id))?;
        Ok(entry.layers.summary())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.sessions.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Drop all state for a session
    ///
    /// Safe at any time. A run in flight is not stopped; its remaining
    /// output is orphaned.
    pub async fn remove_session(&self, id: Uuid) -> EngineResult<()> {
        let removed = self.sessions.write().await.remove(&id);
        if removed.is_none() {
            return Err(EngineError::SessionNotFound(id));
        }
        self.purge(id, false).await;
        Ok(())
    }

    /// Remove sessions idle for longer than the configured TTL
    ///
    /// Sessions with a run in flight are kept. Returns the removed ids.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let ttl = self.settings.session_ttl().as_secs();
        let expired: Vec<Uuid> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<Uuid> = sessions
                .values()
                .filter(|e| !e.session.status.is_running())
                .filter(|e| time::elapsed_seconds(e.session.updated_at, now) >= ttl)
                .map(|e| e.session.id)
                .collect();
            for id in &ids {
                sessions.remove(id);
            }
            ids
        };

        for id in &expired {
            self.purge(*id, true).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired sessions evicted");
        }
        expired
    }

    /// Periodically evict expired sessions
    pub fn spawn_eviction_task(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.evict_expired(time::now()).await;
            }
        })
    }

    async fn purge(&self, id: Uuid, expired: bool) {
        self.progress.remove(id).await;
        if let Some(store) = &self.persistence {
            if let Err(e) = store.remove(id).await {
                warn!(session_id = %id, error = %e, "Failed to delete session snapshot");
            }
        }
        info!(session_id = %id, expired, "Session removed");
        self.event_bus.emit_lossy(GenerationEvent::SessionRemoved {
            session_id: id,
            expired,
            timestamp: Utc::now(),
        });
    }

    /// Rebuild sessions from the persistent store
    ///
    /// Completed sessions come back COMPLETED at 100%. Anything else comes
    /// back PENDING with no progress entry and can be started again.
    /// Unreadable snapshots are deleted. Returns the number restored.
    pub async fn recover(&self) -> EngineResult<usize> {
        let Some(store) = &self.persistence else {
            return Ok(0);
        };

        let mut restored = 0;
        for id in store.list().await? {
            if self.sessions.read().await.contains_key(&id) {
                continue;
            }
            match self.restore(store, id).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Discarding unreadable session snapshot");
                    if let Err(e) = store.remove(id).await {
                        warn!(session_id = %id, error = %e, "Failed to delete session snapshot");
                    }
                }
            }
        }

        info!(sessions = restored, "Sessions recovered");
        Ok(restored)
    }

    async fn restore(&self, store: &SessionStore, id: Uuid) -> EngineResult<()> {
        let layers = store.load_layers(id).await?;
        let config = store.load_config(id).await?;
        let result = store.load_result(id).await?;

        let mut session = GenerationSession::new(id);
        if let Some(request) = config {
            session.configure(request)?;
        }

        let result = match result {
            Some(result) => {
                session.transition_to(GenerationStatus::Generating)?;
                session.transition_to(GenerationStatus::Uploading)?;
                session.transition_to(GenerationStatus::Completed)?;
                session.record_produced(result.total_supply);
                self.progress
                    .publish(ProgressSnapshot {
                        session_id: id,
                        status: GenerationStatus::Completed,
                        percentage: COMPLETE_PERCENT,
                        current: result.total_supply,
                        total: result.total_supply,
                        message: "Generation completed!".to_string(),
                        error: None,
                        updated_at: result.completed_at,
                    })
                    .await;
                Some(Arc::new(result))
            }
            None => None,
        };
        let artifacts = result
            .as_ref()
            .map(|r| r.artifacts.clone())
            .unwrap_or_default();

        self.sessions.write().await.insert(
            id,
            SessionEntry {
                session,
                layers: Arc::new(layers),
                artifacts,
                result,
            },
        );
        Ok(())
    }
}
