//! Test Helper Utilities
//!
//! Shared utilities for layercast-engine integration tests

#![allow(dead_code)]

pub mod fixtures;
pub mod log_capture;
pub mod storage_doubles;

pub use fixtures::{
    collect_progress, request, settings, solid_png, three_layer_store, three_layer_weights,
    write_layer_dir,
};
pub use log_capture::{capture_logs, LogCapture};
pub use storage_doubles::{FailingStorage, GatedStorage, SlowStorage};
