//! Image, layer and request fixtures

use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::Path;
use tokio::sync::broadcast;
use uuid::Uuid;

use layercast_common::config::GenerationSettings;
use layercast_common::events::{GenerationEvent, GenerationStatus, ProgressSnapshot};
use layercast_engine::{CollectionInfo, GenerationRequest, Layer, LayerStore, WeightTable};

/// Encoded PNG of a `size`×`size` single-colour square
pub fn solid_png(size: u32, rgba: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(size, size, Rgba(rgba));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Background {Blue, Red}, Eyes {Normal, Laser}, Hat {None}
pub fn three_layer_store() -> LayerStore {
    LayerStore::new(vec![
        Layer::new("Background")
            .with_trait("Blue", solid_png(8, [0, 0, 255, 255]))
            .with_trait("Red", solid_png(8, [255, 0, 0, 255])),
        Layer::new("Eyes")
            .with_trait("Normal", solid_png(8, [0, 0, 0, 128]))
            .with_trait("Laser", solid_png(8, [0, 255, 0, 128])),
        Layer::new("Hat").with_trait("None", solid_png(8, [0, 0, 0, 0])),
    ])
}

pub fn three_layer_weights() -> WeightTable {
    let mut weights = WeightTable::new();
    weights.set("Background", "Blue", 50.0);
    weights.set("Background", "Red", 50.0);
    weights.set("Eyes", "Normal", 70.0);
    weights.set("Eyes", "Laser", 30.0);
    weights.set("Hat", "None", 100.0);
    weights
}

pub fn request(layer_order: &[&str], weights: WeightTable, supply: usize) -> GenerationRequest {
    GenerationRequest {
        layer_order: layer_order.iter().map(|s| s.to_string()).collect(),
        weights,
        target_supply: supply,
        collection: CollectionInfo {
            name: "Test Cats".to_string(),
            symbol: "TCAT".to_string(),
            description: "Integration test collection".to_string(),
            royalties: 2.5,
            price: Some(0.1),
            creators: Vec::new(),
        },
        require_unique: false,
        seed: Some(42),
    }
}

/// Small canvas, explicit concurrency
pub fn settings(batch_size: usize) -> GenerationSettings {
    GenerationSettings {
        canvas_size: 8,
        batch_size,
        concurrency: 4,
        ..Default::default()
    }
}

/// Write `layers` as `<root>/<layer>/<trait>.png`
pub fn write_layer_dir(root: &Path, layers: &[(&str, &[(&str, [u8; 4])])]) {
    for (layer, traits) in layers {
        let dir = root.join(layer);
        std::fs::create_dir_all(&dir).unwrap();
        for (name, rgba) in *traits {
            std::fs::write(dir.join(format!("{}.png", name)), solid_png(8, *rgba)).unwrap();
        }
    }
}

/// Drain buffered progress snapshots for `session_id` until a terminal one
pub async fn collect_progress(
    rx: &mut broadcast::Receiver<GenerationEvent>,
    session_id: Uuid,
) -> Vec<ProgressSnapshot> {
    let mut snapshots = Vec::new();
    loop {
        match rx.recv().await {
            Ok(GenerationEvent::ProgressUpdated { snapshot }) if snapshot.session_id == session_id => {
                let terminal = matches!(
                    snapshot.status,
                    GenerationStatus::Completed | GenerationStatus::Error
                );
                snapshots.push(snapshot);
                if terminal {
                    return snapshots;
                }
            }
            Ok(_) => {}
            Err(e) => panic!("event stream ended early: {}", e),
        }
    }
}
