//! On-disk session snapshots for crash recovery
//!
//! ```text
//! <root_folder>/sessions/<session_id>/
//!   layers.json              layer names, trait order, image file names
//!   images/<layer>/<file>    raw trait image bytes
//!   config.json              accepted GenerationRequest
//!   result.json              GenerationResult, once COMPLETED
//! ```
//!
//! Progress is never persisted; it is rebuilt as unknown after a restart.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::layers::{sanitize_layer_name, Layer, LayerStore};
use crate::session::{GenerationRequest, GenerationResult};

const LAYERS_FILE: &str = "layers.json";
const CONFIG_FILE: &str = "config.json";
const RESULT_FILE: &str = "result.json";
const IMAGES_DIR: &str = "images";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Session snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session snapshot parse error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerRecord {
    name: String,
    /// Directory below `images/`
    dir: String,
    /// Trait name and image file name, in declaration order
    traits: Vec<TraitRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TraitRecord {
    name: String,
    file: Option<String>,
}

/// Filesystem store of session snapshots
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Store rooted at `<root_folder>/sessions`
    pub fn new(root_folder: &Path) -> Self {
        Self {
            root: root_folder.join("sessions"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub async fn save_layers(&self, id: Uuid, store: &LayerStore) -> Result<(), PersistenceError> {
        let dir = self.session_dir(id);
        let mut records = Vec::with_capacity(store.len());

        for (layer_index, layer) in store.layers().iter().enumerate() {
            let layer_dir = format!("{}_{}", layer_index, sanitize_layer_name(layer.name()));
            let images_dir = dir.join(IMAGES_DIR).join(&layer_dir);
            tokio::fs::create_dir_all(&images_dir).await?;

            let mut traits = Vec::with_capacity(layer.trait_count());
            for (trait_index, trait_name) in layer.traits().iter().enumerate() {
                let file = match layer.image(trait_name) {
                    Some(bytes) => {
                        let file = format!("{}_{}", trait_index, sanitize_layer_name(trait_name));
                        tokio::fs::write(images_dir.join(&file), bytes).await?;
                        Some(file)
                    }
                    None => None,
                };
                traits.push(TraitRecord {
                    name: trait_name.clone(),
                    file,
                });
            }

            records.push(LayerRecord {
                name: layer.name().to_string(),
                dir: layer_dir,
                traits,
            });
        }

        write_json(&dir.join(LAYERS_FILE), &records).await?;
        debug!(session_id = %id, layers = records.len(), "Layer snapshot saved");
        Ok(())
    }

    pub async fn load_layers(&self, id: Uuid) -> Result<LayerStore, PersistenceError> {
        let dir = self.session_dir(id);
        let records: Vec<LayerRecord> = read_json(&dir.join(LAYERS_FILE)).await?;

        let mut layers = Vec::with_capacity(records.len());
        for record in records {
            let images_dir = dir.join(IMAGES_DIR).join(&record.dir);
            let mut names = Vec::with_capacity(record.traits.len());
            let mut images = HashMap::new();
            for t in record.traits {
                if let Some(file) = &t.file {
                    images.insert(t.name.clone(), tokio::fs::read(images_dir.join(file)).await?);
                }
                names.push(t.name);
            }
            layers.push(Layer::from_parts(record.name, names, images));
        }
        Ok(LayerStore::new(layers))
    }

    pub async fn save_config(
        &self,
        id: Uuid,
        request: &GenerationRequest,
    ) -> Result<(), PersistenceError> {
        write_json(&self.session_dir(id).join(CONFIG_FILE), request).await
    }

    pub async fn load_config(&self, id: Uuid) -> Result<Option<GenerationRequest>, PersistenceError> {
        read_optional(&self.session_dir(id).join(CONFIG_FILE)).await
    }

    pub async fn save_result(
        &self,
        id: Uuid,
        result: &GenerationResult,
    ) -> Result<(), PersistenceError> {
        write_json(&self.session_dir(id).join(RESULT_FILE), result).await
    }

    pub async fn load_result(&self, id: Uuid) -> Result<Option<GenerationResult>, PersistenceError> {
        read_optional(&self.session_dir(id).join(RESULT_FILE)).await
    }

    /// Ids of every stored session; stray entries are skipped
    pub async fn list(&self) -> Result<Vec<Uuid>, PersistenceError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            match Uuid::parse_str(&entry.file_name().to_string_lossy()) {
                Ok(id) if is_dir => ids.push(id),
                _ => warn!(path = %entry.path().display(), "Ignoring non-session entry"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a session's snapshot; missing snapshots are fine
    pub async fn remove(&self, id: Uuid) -> Result<(), PersistenceError> {
        match tokio::fs::remove_dir_all(self.session_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write via temp file + rename so a crash never leaves half a document
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
