//! Compositor
//!
//! Flattens one combination into a PNG: a transparent square RGBA canvas
//! with each selected trait image alpha-blended over it ("over" only), in
//! the caller-supplied layer order. Trait images that do not match the
//! canvas size are scaled to fill it.
//!
//! CPU-bound; the pipeline runs it on the blocking pool.

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use thiserror::Error;
use tracing::warn;

use crate::combination::Combination;
use crate::layers::LayerStore;

/// Compositing error (infrastructure, aborts the batch)
#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("Canvas size must be positive")]
    InvalidCanvas,

    #[error("Failed to decode trait \"{trait_name}\" in layer \"{layer}\": {source}")]
    Decode {
        layer: String,
        trait_name: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to encode composite: {0}")]
    Encode(#[source] image::ImageError),
}

/// Composite `combination` over a `canvas_size` square canvas
///
/// Layers are applied in `layer_order`, bottom first. A layer with no
/// selection, or whose selected trait has no image, contributes nothing
/// and is logged as a data-quality warning.
pub fn composite(
    combination: &Combination,
    layer_order: &[String],
    store: &LayerStore,
    canvas_size: u32,
) -> Result<Vec<u8>, CompositeError> {
    if canvas_size == 0 {
        return Err(CompositeError::InvalidCanvas);
    }

    let mut canvas = RgbaImage::from_pixel(canvas_size, canvas_size, Rgba([0, 0, 0, 0]));

    for layer_name in layer_order {
        let Some(trait_name) = combination.get(layer_name) else {
            warn!(layer = %layer_name, "Combination has no selection for layer, skipped");
            continue;
        };
        let Some(bytes) = store.get(layer_name).and_then(|l| l.image(trait_name)) else {
            warn!(
                layer = %layer_name,
                trait_name = %trait_name,
                "Trait image missing, layer skipped"
            );
            continue;
        };

        let decoded = image::load_from_memory(bytes).map_err(|source| CompositeError::Decode {
            layer: layer_name.clone(),
            trait_name: trait_name.to_string(),
            source,
        })?;
        let mut top = decoded.to_rgba8();
        if top.dimensions() != (canvas_size, canvas_size) {
            top = imageops::resize(&top, canvas_size, canvas_size, FilterType::Triangle);
        }

        imageops::overlay(&mut canvas, &top, 0, 0);
    }

    encode_png(&canvas)
}

fn encode_png(canvas: &RgbaImage) -> Result<Vec<u8>, CompositeError> {
    let mut out = Cursor::new(Vec::new());
    canvas
        .write_to(&mut out, ImageFormat::Png)
        .map_err(CompositeError::Encode)?;
    Ok(out.into_inner())
}
