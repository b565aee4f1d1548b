//! layercast-engine: generative collection engine
//!
//! Layers of mutually exclusive trait images plus a rarity weighting go in;
//! composited PNG artifacts, per-item metadata and one collection document
//! come out, produced as a batched background job with progress reporting.
//!
//! Leaf to root: [`layers`] → [`rarity`] → [`combination`] → [`compositor`]
//! → [`pipeline`] / [`manager`] → [`progress`].

pub mod combination;
pub mod compositor;
pub mod config;
pub mod error;
pub mod layers;
pub mod manager;
pub mod metadata;
pub mod persistence;
pub mod pipeline;
pub mod progress;
pub mod rarity;
pub mod session;
pub mod storage;

pub use crate::error::{EngineError, EngineResult};
pub use crate::layers::{Layer, LayerStore};
pub use crate::manager::{GenerationHandle, SessionManager};
pub use crate::rarity::WeightTable;
pub use crate::session::{CollectionInfo, GenerationRequest, GenerationResult};
pub use crate::storage::{FileStorage, MemoryStorage, Storage};
