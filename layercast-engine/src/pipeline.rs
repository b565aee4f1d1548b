//! Batch pipeline
//!
//! The work of one generation run: combinations, per-batch compositing and
//! upload, then the collection metadata document. The
//! [`SessionManager`](crate::manager::SessionManager) sequences the batches
//! and owns state transitions; this module does the work and reports
//! progress.
//!
//! # Progress
//! - 0%: run started, combinations being computed
//! - 25%: combinations ready
//! - 25% + 50% * (batches done / batches): after each batch, capped at 75%
//! - 75%: collection metadata upload (UPLOADING)
//! - 100%: COMPLETED
//!
//! Batches run strictly one after another. Within a batch every item is
//! composited concurrently (blocking pool, bounded), then every item is
//! uploaded concurrently (same bound).

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use layercast_common::config::GenerationSettings;
use layercast_common::events::{GenerationStatus, ProgressSnapshot};

use crate::combination::{self, Combination};
use crate::compositor;
use crate::error::{EngineError, EngineResult};
use crate::layers::LayerStore;
use crate::metadata::{sha256_hex, CollectionDocument, TokenMetadata};
use crate::progress::ProgressRegistry;
use crate::session::{ArtifactRecord, GenerationRequest};
use crate::storage::Storage;

pub const COMBINATIONS_DONE_PERCENT: f64 = 25.0;
pub const BATCHES_DONE_PERCENT: f64 = 75.0;
pub const COMPLETE_PERCENT: f64 = 100.0;

/// Storage key of item `index`
pub fn artifact_key(session_id: Uuid, index: usize) -> String {
    format!("{}/{}.png", session_id, index)
}

/// Storage key of the collection metadata document
pub fn metadata_key(session_id: Uuid) -> String {
    format!("{}/metadata.json", session_id)
}

/// Percentage reported after `batches_done` of `batches`
pub fn batch_percentage(batches_done: usize, batches: usize) -> f64 {
    if batches == 0 {
        return BATCHES_DONE_PERCENT;
    }
    let share = batches_done as f64 / batches as f64;
    (COMBINATIONS_DONE_PERCENT + share * (BATCHES_DONE_PERCENT - COMBINATIONS_DONE_PERCENT))
        .min(BATCHES_DONE_PERCENT)
}

/// Everything one run needs, detached from the session map
#[derive(Clone)]
pub struct BatchPipeline {
    session_id: Uuid,
    store: Arc<LayerStore>,
    request: Arc<GenerationRequest>,
    layer_order: Arc<[String]>,
    storage: Arc<dyn Storage>,
    progress: ProgressRegistry,
    canvas_size: u32,
    batch_size: usize,
    concurrency: usize,
}

impl BatchPipeline {
    pub fn new(
        session_id: Uuid,
        store: Arc<LayerStore>,
        request: GenerationRequest,
        storage: Arc<dyn Storage>,
        progress: ProgressRegistry,
        settings: &GenerationSettings,
    ) -> Self {
        Self {
            session_id,
            store,
            layer_order: request.layer_order.clone().into(),
            request: Arc::new(request),
            storage,
            progress,
            canvas_size: settings.canvas_size,
            batch_size: settings.batch_size.max(1),
            concurrency: settings.effective_concurrency().max(1),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn total(&self) -> usize {
        self.request.target_supply
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches the target supply splits into
    pub fn batch_count(&self) -> usize {
        self.total().div_ceil(self.batch_size)
    }

    /// Start of the GENERATING phase: every combination, then 25%
    pub async fn combinations(&self) -> EngineResult<Vec<Combination>> {
        let combinations = self.compute_combinations().await?;
        self.report(
            GenerationStatus::Generating,
            COMBINATIONS_DONE_PERCENT,
            0,
            "Generating images...",
        )
        .await;
        Ok(combinations)
    }

    /// Composite and upload batch `batch_index`
    ///
    /// Returns its artifacts ordered by index. The first failing item fails
    /// the batch; artifacts uploaded by earlier batches stay in storage.
    pub async fn run_batch(
        &self,
        batch_index: usize,
        batch: &[Combination],
    ) -> EngineResult<Vec<ArtifactRecord>> {
        let start = batch_index * self.batch_size;
        let mut records = self.process_batch(start, batch).await?;
        records.sort_by_key(|r| r.index);

        info!(
            session_id = %self.session_id,
            batch = batch_index + 1,
            batches = self.batch_count(),
            items = start + batch.len(),
            "Batch complete"
        );
        Ok(records)
    }

    /// Progress after `batches_done` batches covering `produced` items
    pub async fn report_batch(&self, batches_done: usize, produced: usize) {
        self.report(
            GenerationStatus::Generating,
            batch_percentage(batches_done, self.batch_count()),
            produced,
            &format!("Generated {}/{} items...", produced, self.total()),
        )
        .await;
    }

    /// UPLOADING phase: the collection document; returns its URI
    pub async fn upload_collection(&self, artifacts: &[ArtifactRecord]) -> EngineResult<String> {
        self.report(
            GenerationStatus::Uploading,
            BATCHES_DONE_PERCENT,
            artifacts.len(),
            "Uploading metadata...",
        )
        .await;

        let items: Vec<TokenMetadata> = artifacts.iter().map(|a| a.metadata.clone()).collect();
        let document = CollectionDocument::build(&self.request.collection, &items);
        let value = serde_json::to_value(&document)?;
        let uri = self
            .storage
            .upload_metadata(&value, &metadata_key(self.session_id))
            .await?;

        info!(session_id = %self.session_id, uri = %uri, "Collection metadata uploaded");
        Ok(uri)
    }

    async fn compute_combinations(&self) -> EngineResult<Vec<Combination>> {
        let store = Arc::clone(&self.store);
        let request = Arc::clone(&self.request);
        let combinations = tokio::task::spawn_blocking(move || {
            combination::generate(
                &request.layer_order,
                &request.weights,
                &store,
                request.target_supply,
                request.seed,
            )
        })
        .await??;

        debug!(
            session_id = %self.session_id,
            count = combinations.len(),
            "Combinations generated"
        );
        Ok(combinations)
    }

    async fn process_batch(
        &self,
        start: usize,
        batch: &[Combination],
    ) -> EngineResult<Vec<ArtifactRecord>> {
        // Composite every item
        let composited: Vec<EngineResult<(usize, Combination, Vec<u8>)>> =
            stream::iter(batch.iter().cloned().enumerate())
                .map(|(offset, combination)| {
                    let store = Arc::clone(&self.store);
                    let layer_order = Arc::clone(&self.layer_order);
                    let canvas_size = self.canvas_size;
                    async move {
                        let (combination, png) = tokio::task::spawn_blocking(move || {
                            compositor::composite(&combination, &layer_order, &store, canvas_size)
                                .map(|png| (combination, png))
                        })
                        .await??;
                        Ok::<_, EngineError>((start + offset, combination, png))
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
        let composited = composited.into_iter().collect::<EngineResult<Vec<_>>>()?;

        // Upload every item
        let uploaded: Vec<EngineResult<ArtifactRecord>> = stream::iter(composited)
            .map(|(index, combination, png)| async move {
                let key = artifact_key(self.session_id, index);
                let sha256 = sha256_hex(&png);
                let uri = self.storage.upload(png, &key).await?;
                let metadata =
                    TokenMetadata::new(index, &combination, &self.request.collection)
                        .with_image(uri.clone());
                Ok::<_, EngineError>(ArtifactRecord {
                    index,
                    key,
                    uri,
                    sha256,
                    combination,
                    metadata,
                })
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        uploaded.into_iter().collect()
    }

    async fn report(&self, status: GenerationStatus, percentage: f64, current: usize, message: &str) {
        self.progress
            .replace(ProgressSnapshot {
                session_id: self.session_id,
                status,
                percentage,
                current,
                total: self.total(),
                message: message.to_string(),
                error: None,
                updated_at: Utc::now(),
            })
            .await;
    }
}
