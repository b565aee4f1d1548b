//! Generation session model and state machine
//!
//! PENDING → GENERATING → UPLOADING → COMPLETED, ERROR from any
//! non-terminal state. The success path never skips a state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use layercast_common::events::GenerationStatus;

use crate::combination::Combination;
use crate::error::{EngineError, EngineResult};
use crate::metadata::TokenMetadata;
use crate::rarity::WeightTable;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    pub address: String,
    pub share: u8,
    #[serde(default)]
    pub verified: bool,
}

/// Collection-level information supplied at configuration time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub symbol: String,
    #[serde(default)]
    pub description: String,
    /// Royalty percentage (2.5 = 2.5%)
    #[serde(default)]
    pub royalties: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub creators: Vec<Creator>,
}

/// Session configuration as submitted by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Compositing order, bottom layer first
    pub layer_order: Vec<String>,
    #[serde(default)]
    pub weights: WeightTable,
    pub target_supply: usize,
    pub collection: CollectionInfo,
    /// Reject configuration when the combination space is smaller than the supply
    #[serde(default)]
    pub require_unique: bool,
    /// Fixed RNG seed for reproducible combinations
    #[serde(default)]
    pub seed: Option<u64>,
}

/// One composited and uploaded item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub index: usize,
    pub key: String,
    pub uri: String,
    /// Hex SHA-256 of the PNG bytes
    pub sha256: String,
    pub combination: Combination,
    pub metadata: TokenMetadata,
}

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub session_id: Uuid,
    /// Item URIs ordered by index
    pub artifact_uris: Vec<String>,
    pub metadata_base_uri: String,
    pub total_supply: usize,
    pub artifacts: Vec<ArtifactRecord>,
    pub collection: CollectionInfo,
    pub completed_at: DateTime<Utc>,
}

impl GenerationResult {
    pub fn new(
        session_id: Uuid,
        artifacts: Vec<ArtifactRecord>,
        metadata_base_uri: String,
        collection: CollectionInfo,
    ) -> Self {
        Self {
            session_id,
            artifact_uris: artifacts.iter().map(|a| a.uri.clone()).collect(),
            metadata_base_uri,
            total_supply: artifacts.len(),
            artifacts,
            collection,
            completed_at: Utc::now(),
        }
    }
}

/// Status change record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub session_id: Uuid,
    pub old_state: GenerationStatus,
    pub new_state: GenerationStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// Session state (in-memory)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: Uuid,
    pub status: GenerationStatus,
    /// None until configuration is accepted
    pub config: Option<GenerationRequest>,
    pub produced_count: usize,
    pub total: usize,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last lifecycle change; drives TTL eviction
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl GenerationSession {
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: GenerationStatus::Pending,
            config: None,
            produced_count: 0,
            total: 0,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    /// Accept a validated configuration; only before generation starts
    pub fn configure(&mut self, request: GenerationRequest) -> EngineResult<()> {
        if self.status != GenerationStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "Session {} cannot be reconfigured while {}",
                self.id, self.status
            )));
        }
        self.total = request.target_supply;
        self.config = Some(request);
        self.touch();
        Ok(())
    }

    pub fn can_transition_to(&self, next: GenerationStatus) -> bool {
        use GenerationStatus::*;
        match (self.status, next) {
            (Pending, Generating) | (Generating, Uploading) | (Uploading, Completed) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Move to `next`, rejecting illegal transitions with `Conflict`
    pub fn transition_to(&mut self, next: GenerationStatus) -> EngineResult<StateTransition> {
        if !self.can_transition_to(next) {
            return Err(EngineError::Conflict(format!(
                "Session {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }

        let transition = StateTransition {
            session_id: self.id,
            old_state: self.status,
            new_state: next,
            transitioned_at: Utc::now(),
        };
        self.status = next;
        self.updated_at = transition.transitioned_at;

        match next {
            GenerationStatus::Generating => self.started_at = Some(transition.transitioned_at),
            GenerationStatus::Completed | GenerationStatus::Error => {
                self.ended_at = Some(transition.transitioned_at)
            }
            _ => {}
        }

        Ok(transition)
    }

    /// Transition to ERROR and keep the message
    pub fn fail(&mut self, message: impl Into<String>) -> EngineResult<StateTransition> {
        let transition = self.transition_to(GenerationStatus::Error)?;
        self.error = Some(message.into());
        Ok(transition)
    }

    /// Record items produced so far; never decreases
    pub fn record_produced(&mut self, count: usize) {
        self.produced_count = self.produced_count.max(count);
        self.touch();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
