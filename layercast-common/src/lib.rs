//! # Layercast Common Library
//!
//! Shared code for the layercast crates including:
//! - Error types
//! - Bootstrap configuration loading and root folder resolution
//! - Event types (GenerationEvent enum) and the event bus
//! - Timestamp utilities

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
