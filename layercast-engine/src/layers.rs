//! Layer Store
//!
//! In-memory trait layers for one session. Written once when layers are
//! extracted, read-only afterwards (shared behind an `Arc`).
//!
//! A directory tree is the extracted form of an uploaded archive:
//!
//! ```text
//! layers/
//!   Background/  Blue.png  Red.png
//!   Eyes/        Normal.png  Laser.png
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use layercast_common::config::GenerationSettings;

/// Shared, immutable image bytes
pub type ImageBytes = Arc<[u8]>;

/// File extensions accepted as trait images
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Layer loading error
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Layer directory not found: {0}")]
    NotADirectory(PathBuf),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

/// A named set of mutually exclusive traits
#[derive(Debug, Clone, Default)]
pub struct Layer {
    name: String,
    traits: Vec<String>,
    images: HashMap<String, ImageBytes>,
}

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder form of [`Layer::add_trait`] with image bytes
    pub fn with_trait(mut self, trait_name: impl Into<String>, image: impl Into<Vec<u8>>) -> Self {
        self.add_trait(trait_name, Some(image.into()));
        self
    }

    /// Build a layer from a trait list and an image map
    ///
    /// Traits without an entry in `images` are kept; compositing skips them.
    pub fn from_parts(
        name: impl Into<String>,
        traits: Vec<String>,
        images: HashMap<String, Vec<u8>>,
    ) -> Self {
        let mut layer = Self::new(name);
        let mut images = images;
        for trait_name in traits {
            let image = images.remove(&trait_name);
            layer.add_trait(trait_name, image);
        }
        layer
    }

    /// Append a trait in declaration order; duplicate names are ignored
    pub fn add_trait(&mut self, trait_name: impl Into<String>, image: Option<Vec<u8>>) {
        let trait_name = trait_name.into();
        if self.traits.contains(&trait_name) {
            debug!(layer = %self.name, trait_name = %trait_name, "Duplicate trait ignored");
            return;
        }
        if let Some(bytes) = image {
            self.images.insert(trait_name.clone(), Arc::from(bytes));
        }
        self.traits.push(trait_name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Traits in declaration order
    pub fn traits(&self) -> &[String] {
        &self.traits
    }

    pub fn trait_count(&self) -> usize {
        self.traits.len()
    }

    pub fn has_trait(&self, trait_name: &str) -> bool {
        self.traits.iter().any(|t| t == trait_name)
    }

    pub fn image(&self, trait_name: &str) -> Option<&ImageBytes> {
        self.images.get(trait_name)
    }

    /// A layer needs at least one trait to take part in generation
    pub fn is_usable(&self) -> bool {
        !self.traits.is_empty()
    }

    /// Traits that have no image bytes
    pub fn missing_images(&self) -> Vec<&str> {
        self.traits
            .iter()
            .filter(|t| !self.images.contains_key(*t))
            .map(String::as_str)
            .collect()
    }
}

/// Limits checked by [`LayerStore::validate`]
#[derive(Debug, Clone, Copy)]
pub struct LayerLimits {
    pub max_traits_per_layer: usize,
    pub max_image_dimension: u32,
}

impl Default for LayerLimits {
    fn default() -> Self {
        Self::from(&GenerationSettings::default())
    }
}

impl From<&GenerationSettings> for LayerLimits {
    fn from(settings: &GenerationSettings) -> Self {
        Self {
            max_traits_per_layer: settings.max_traits_per_layer,
            max_image_dimension: settings.max_image_dimension,
        }
    }
}

/// Per-layer summary returned after upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub name: String,
    pub traits: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub layers: Vec<LayerInfo>,
    pub total_traits: usize,
}

/// All layers of one session
#[derive(Debug, Clone, Default)]
pub struct LayerStore {
    layers: Vec<Layer>,
}

impl LayerStore {
    /// Build a store; a layer whose name is already taken is dropped
    pub fn new(layers: Vec<Layer>) -> Self {
        let mut store = Self::default();
        for layer in layers {
            if store.get(layer.name()).is_some() {
                warn!(layer = %layer.name(), "Duplicate layer name, keeping first");
                continue;
            }
            store.layers.push(layer);
        }
        store
    }

    pub fn get(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Load layers from an extracted directory tree
    ///
    /// Each sub-directory becomes a layer (name sanitized), each image file a
    /// trait named after its file stem. Layers and traits are sorted by name;
    /// directories without images are skipped.
    pub fn load_dir(root: &Path) -> Result<Self, LayerError> {
        if !root.is_dir() {
            return Err(LayerError::NotADirectory(root.to_path_buf()));
        }

        let mut layers = Vec::new();
        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                continue;
            }

            let layer_name = sanitize_layer_name(&entry.file_name().to_string_lossy());
            let mut layer = Layer::new(layer_name);

            for file in WalkDir::new(entry.path())
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
            {
                let file = file?;
                if !file.file_type().is_file() || !is_image_file(file.path()) {
                    continue;
                }
                let Some(stem) = file.path().file_stem() else {
                    continue;
                };
                let bytes = std::fs::read(file.path())?;
                layer.add_trait(stem.to_string_lossy().into_owned(), Some(bytes));
            }

            if layer.is_usable() {
                layers.push(layer);
            } else {
                debug!(dir = %entry.path().display(), "Directory has no images, skipped");
            }
        }

        let store = Self::new(layers);
        info!(
            root = %root.display(),
            layers = store.len(),
            traits = store.layers.iter().map(Layer::trait_count).sum::<usize>(),
            "Layers loaded"
        );
        Ok(store)
    }

    /// Check the store against upload limits
    ///
    /// Returns one message per problem; an empty list means valid. Traits
    /// without an image are not errors here, compositing skips them.
    pub fn validate(&self, limits: &LayerLimits) -> Vec<String> {
        let mut errors = Vec::new();

        if self.layers.is_empty() {
            errors.push("No valid layers found".to_string());
        }

        for layer in &self.layers {
            if !layer.is_usable() {
                errors.push(format!("Layer \"{}\" has no valid image files", layer.name));
            }

            if layer.trait_count() > limits.max_traits_per_layer {
                errors.push(format!(
                    "Layer \"{}\" has too many traits (max {})",
                    layer.name, limits.max_traits_per_layer
                ));
            }

            for trait_name in &layer.traits {
                let Some(bytes) = layer.image(trait_name) else {
                    continue;
                };
                match image_dimensions(bytes) {
                    Ok((width, height)) => {
                        if width > limits.max_image_dimension || height > limits.max_image_dimension
                        {
                            errors.push(format!(
                                "Image \"{}\" in layer \"{}\" is too large (max {}x{})",
                                trait_name,
                                layer.name,
                                limits.max_image_dimension,
                                limits.max_image_dimension
                            ));
                        }
                    }
                    Err(_) => errors.push(format!(
                        "Invalid image file \"{}\" in layer \"{}\"",
                        trait_name, layer.name
                    )),
                }
            }
        }

        errors
    }

    /// `(layer, trait)` pairs that have no image bytes
    pub fn missing_images(&self) -> Vec<(&str, &str)> {
        self.layers
            .iter()
            .flat_map(|l| l.missing_images().into_iter().map(move |t| (l.name(), t)))
            .collect()
    }

    pub fn summary(&self) -> LayerSummary {
        let layers: Vec<LayerInfo> = self
            .layers
            .iter()
            .map(|l| LayerInfo {
                name: l.name.clone(),
                traits: l.traits.clone(),
                count: l.trait_count(),
            })
            .collect();
        let total_traits = layers.iter().map(|l| l.count).sum();
        LayerSummary {
            layers,
            total_traits,
        }
    }
}

/// Replace every non-alphanumeric character with `_`
pub fn sanitize_layer_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn image_dimensions(bytes: &[u8]) -> image::ImageResult<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::solid_png;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_layer_name() {
        assert_eq!(sanitize_layer_name("Back ground-1"), "Back_ground_1");
        assert_eq!(sanitize_layer_name("Eyes"), "Eyes");
    }

    #[test]
    fn test_duplicate_traits_ignored() {
        let layer = Layer::new("Hat")
            .with_trait("Cap", solid_png(2, [1, 2, 3, 255]))
            .with_trait("Cap", solid_png(2, [9, 9, 9, 255]));
        assert_eq!(layer.traits(), &["Cap".to_string()]);
    }

    #[test]
    fn test_from_parts_tracks_missing_images() {
        let mut images = HashMap::new();
        images.insert("Blue".to_string(), solid_png(2, [0, 0, 255, 255]));
        let layer = Layer::from_parts(
            "Background",
            vec!["Blue".to_string(), "Red".to_string()],
            images,
        );
        assert_eq!(layer.trait_count(), 2);
        assert_eq!(layer.missing_images(), vec!["Red"]);
        assert!(layer.image("Blue").is_some());
    }

    #[test]
    fn test_store_keeps_first_duplicate_layer() {
        let store = LayerStore::new(vec![
            Layer::new("Eyes").with_trait("Normal", solid_png(2, [0, 0, 0, 255])),
            Layer::new("Eyes").with_trait("Laser", solid_png(2, [255, 0, 0, 255])),
        ]);
        assert_eq!(store.len(), 1);
        assert!(store.get("Eyes").unwrap().has_trait("Normal"));
    }

    #[test]
    fn test_load_dir_sorts_and_filters() {
        let temp = TempDir::new().unwrap();
        let bg = temp.path().join("Back ground");
        let eyes = temp.path().join("Eyes");
        let empty = temp.path().join("Empty");
        std::fs::create_dir_all(&bg).unwrap();
        std::fs::create_dir_all(&eyes).unwrap();
        std::fs::create_dir_all(&empty).unwrap();
        std::fs::write(bg.join("Red.png"), solid_png(4, [255, 0, 0, 255])).unwrap();
        std::fs::write(bg.join("Blue.PNG"), solid_png(4, [0, 0, 255, 255])).unwrap();
        std::fs::write(bg.join("notes.txt"), b"not an image").unwrap();
        std::fs::write(eyes.join("Laser.png"), solid_png(4, [0, 255, 0, 255])).unwrap();
        std::fs::write(temp.path().join("stray.png"), solid_png(4, [0, 0, 0, 0])).unwrap();

        let store = LayerStore::load_dir(temp.path()).unwrap();
        assert_eq!(store.layer_names(), vec!["Back_ground", "Eyes"]);
        assert_eq!(
            store.get("Back_ground").unwrap().traits(),
            &["Blue".to_string(), "Red".to_string()]
        );
        assert_eq!(store.summary().total_traits, 3);
    }

    #[test]
    fn test_load_dir_requires_directory() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope");
        assert!(matches!(
            LayerStore::load_dir(&missing),
            Err(LayerError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_validate_reports_each_problem() {
        let store = LayerStore::new(vec![
            Layer::new("Big").with_trait("Huge", solid_png(16, [1, 1, 1, 255])),
            Layer::new("Broken").with_trait("Garbage", b"definitely not a png".to_vec()),
            Layer::from_parts("Partial", vec!["Ghost".to_string()], HashMap::new()),
            Layer::new("Crowded")
                .with_trait("A", solid_png(2, [0, 0, 0, 255]))
                .with_trait("B", solid_png(2, [0, 0, 0, 255])),
        ]);
        let limits = LayerLimits {
            max_traits_per_layer: 1,
            max_image_dimension: 8,
        };

        let errors = store.validate(&limits);
        assert!(errors.iter().any(|e| e.contains("\"Huge\"") && e.contains("too large")));
        assert!(errors.iter().any(|e| e.contains("Invalid image file \"Garbage\"")));
        assert!(!errors.iter().any(|e| e.contains("\"Ghost\"")));
        assert!(errors.iter().any(|e| e.contains("\"Crowded\" has too many traits")));
    }

    #[test]
    fn test_validate_empty_store() {
        let errors = LayerStore::default().validate(&LayerLimits::default());
        assert_eq!(errors, vec!["No valid layers found".to_string()]);
    }
}
