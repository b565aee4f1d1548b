//! Session configuration validation
//!
//! [`validate_request`] is the single entry point: it either accepts a
//! [`GenerationRequest`] as a whole (possibly with warnings) or rejects it
//! with one message per problem. Nothing is coerced.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use layercast_common::config::GenerationSettings;

use crate::combination::total_possible_combinations;
use crate::layers::LayerStore;
use crate::rarity::{layer_total, OUTLIER_WEIGHT};
use crate::session::{CollectionInfo, GenerationRequest};

/// Accepted configuration report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOutcome {
    /// Non-fatal findings (zero-sum layers, outlier weights, duplicate risk)
    pub warnings: Vec<String>,
    pub total_possible_combinations: u128,
}

/// Validate `request` against the session's layers and engine limits
pub fn validate_request(
    request: &GenerationRequest,
    store: &LayerStore,
    settings: &GenerationSettings,
) -> Result<ConfigOutcome, Vec<String>> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    check_layer_order(request, store, &mut errors);
    check_weights(request, store, &mut errors, &mut warnings);
    check_collection(
        &request.collection,
        request.target_supply,
        settings,
        &mut errors,
    );

    let total = total_possible_combinations(&request.layer_order, store);
    if total < request.target_supply as u128 && errors.is_empty() {
        if request.require_unique {
            errors.push(format!(
                "Only {} unique combinations possible, {} requested",
                total, request.target_supply
            ));
        } else {
            warnings.push(format!(
                "Only {} unique combinations possible, {} requested; duplicates will be generated",
                total, request.target_supply
            ));
        }
    }

    if errors.is_empty() {
        Ok(ConfigOutcome {
            warnings,
            total_possible_combinations: total,
        })
    } else {
        Err(errors)
    }
}

fn check_layer_order(request: &GenerationRequest, store: &LayerStore, errors: &mut Vec<String>) {
    if request.layer_order.is_empty() {
        errors.push("Layer order is empty".to_string());
    }

    let mut seen = HashSet::new();
    for name in &request.layer_order {
        if !seen.insert(name.as_str()) {
            errors.push(format!("Layer \"{}\" appears more than once in order", name));
            continue;
        }
        match store.get(name) {
            None => errors.push(format!("Layer \"{}\" in order not found", name)),
            Some(layer) if !layer.is_usable() => {
                errors.push(format!("Layer \"{}\" has no traits", name))
            }
            Some(_) => {}
        }
    }
}

fn check_weights(
    request: &GenerationRequest,
    store: &LayerStore,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    for (layer_name, weights) in request.weights.iter() {
        let Some(layer) = store.get(layer_name) else {
            errors.push(format!("Weights reference unknown layer \"{}\"", layer_name));
            continue;
        };

        for (trait_name, weight) in weights {
            if !layer.has_trait(trait_name) {
                errors.push(format!(
                    "Weight given for unknown trait \"{}\" in layer \"{}\"",
                    trait_name, layer_name
                ));
            }
            if !weight.is_finite() || *weight < 0.0 {
                errors.push(format!(
                    "Invalid weight {} for trait \"{}\" in layer \"{}\"",
                    weight, trait_name, layer_name
                ));
            } else if *weight > OUTLIER_WEIGHT {
                warnings.push(format!(
                    "Trait \"{}\" in layer \"{}\" has a very high weight ({})",
                    trait_name, layer_name, weight
                ));
            }
        }

        if weights.is_empty() {
            continue;
        }

        for trait_name in layer.traits() {
            if !weights.contains_key(trait_name) {
                errors.push(format!(
                    "Missing weight for trait \"{}\" in layer \"{}\"",
                    trait_name, layer_name
                ));
            }
        }

        if layer_total(weights) == 0.0 {
            warnings.push(format!(
                "Layer \"{}\" weights sum to zero; traits will be equally likely",
                layer_name
            ));
        }
    }
}

fn check_collection(
    info: &CollectionInfo,
    supply: usize,
    settings: &GenerationSettings,
    errors: &mut Vec<String>,
) {
    if info.name.trim().is_empty() {
        errors.push("Collection name is required".to_string());
    }
    if info.symbol.trim().is_empty() {
        errors.push("Collection symbol is required".to_string());
    }
    if !(0.0..=settings.max_royalties).contains(&info.royalties) {
        errors.push(format!(
            "Royalties must be between 0 and {}",
            settings.max_royalties
        ));
    }
    if supply < 1 || supply > settings.max_supply {
        errors.push(format!(
            "Supply must be between 1 and {}",
            settings.max_supply
        ));
    }
    if let Some(price) = info.price {
        if !price.is_finite() || price < 0.0 {
            errors.push("Price must not be negative".to_string());
        }
    }
    let shares: u32 = info.creators.iter().map(|c| u32::from(c.share)).sum();
    if !info.creators.is_empty() && shares != 100 {
        errors.push(format!("Creator shares must sum to 100 (got {})", shares));
    }
}
