//! Combination Generator
//!
//! Produces exactly `target_supply` combinations in three phases:
//!
//! 1. Random: weighted draws, novel combinations only, bounded to
//!    `target_supply * 10` attempts.
//! 2. Sweep: deterministic walk over combinations not yet seen, heaviest
//!    traits first. Only entered when the random phase fell short and the
//!    space still holds unseen combinations.
//! 3. Fill: weighted draws accepted unconditionally (duplicates allowed).
//!
//! Phase 3 runs only once the unique pool is exhausted, so every combination
//! is distinct whenever `target_supply <= total_possible_combinations`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

use crate::layers::{Layer, LayerStore};
use crate::rarity::{self, LayerWeights, WeightTable};

/// Combination generation error
#[derive(Debug, Error)]
pub enum CombinationError {
    #[error("Layer \"{0}\" not found in uploaded layers")]
    LayerNotFound(String),

    #[error("Layer \"{0}\" has no traits")]
    EmptyLayer(String),
}

/// One trait chosen for one layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub layer: String,
    #[serde(rename = "trait")]
    pub trait_name: String,
}

/// One trait per layer, in the configured layer order
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Combination(Vec<Selection>);

impl Combination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: impl Into<String>, trait_name: impl Into<String>) {
        self.0.push(Selection {
            layer: layer.into(),
            trait_name: trait_name.into(),
        });
    }

    /// Selections in layer order
    pub fn selections(&self) -> &[Selection] {
        &self.0
    }

    /// Trait selected for `layer`
    pub fn get(&self, layer: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|s| s.layer == layer)
            .map(|s| s.trait_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Order-independent identity: sorted `layer=trait` pairs joined by `|`
    pub fn canonical_key(&self) -> String {
        let mut pairs: Vec<String> = self
            .0
            .iter()
            .map(|s| format!("{}={}", s.layer, s.trait_name))
            .collect();
        pairs.sort();
        pairs.join("|")
    }

    /// Mean rarity percentage of the selected traits
    pub fn rarity_score(&self, weights: &WeightTable, store: &LayerStore) -> f64 {
        rarity::combination_rarity_score(
            self.0.iter().map(|s| {
                let trait_count = store.get(&s.layer).map(Layer::trait_count).unwrap_or(0);
                (s.layer.as_str(), s.trait_name.as_str(), trait_count)
            }),
            weights,
        )
    }
}

/// A layer from the configured order, resolved against the store
struct Resolved<'a> {
    layer: &'a Layer,
    weights: Option<&'a LayerWeights>,
}

/// Product of trait counts over `layer_order` (saturating)
///
/// A layer that is missing from the store contributes zero.
pub fn total_possible_combinations(layer_order: &[String], store: &LayerStore) -> u128 {
    layer_order.iter().fold(1u128, |acc, name| {
        let count = store.get(name).map(Layer::trait_count).unwrap_or(0);
        acc.saturating_mul(count as u128)
    })
}

/// Generate `target_supply` combinations
///
/// With a `seed` the output is reproducible for the same inputs.
pub fn generate(
    layer_order: &[String],
    weights: &WeightTable,
    store: &LayerStore,
    target_supply: usize,
    seed: Option<u64>,
) -> Result<Vec<Combination>, CombinationError> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    generate_with_rng(layer_order, weights, store, target_supply, &mut rng)
}

/// [`generate`] with a caller-supplied RNG
pub fn generate_with_rng<R: Rng + ?Sized>(
    layer_order: &[String],
    weights: &WeightTable,
    store: &LayerStore,
    target_supply: usize,
    rng: &mut R,
) -> Result<Vec<Combination>, CombinationError> {
    let resolved = resolve(layer_order, weights, store)?;
    let total_possible = total_possible_combinations(layer_order, store);

    let mut combinations = Vec::with_capacity(target_supply);
    let mut seen: HashSet<String> = HashSet::with_capacity(target_supply);

    let max_attempts = target_supply.saturating_mul(10);
    let mut attempts = 0;
    while combinations.len() < target_supply && attempts < max_attempts {
        attempts += 1;
        let combination = draw(&resolved, rng);
        if seen.insert(combination.canonical_key()) {
            combinations.push(combination);
        }
    }

    if combinations.len() < target_supply && (seen.len() as u128) < total_possible {
        let before = combinations.len();
        sweep(&resolved, target_supply, &mut seen, &mut combinations);
        debug!(
            attempts,
            swept = combinations.len() - before,
            "Random phase exhausted, swept unseen combinations"
        );
    }

    if combinations.len() < target_supply {
        warn!(
            unique = combinations.len(),
            target = target_supply,
            total_possible = %total_possible,
            "Unique combinations exhausted, allowing duplicates"
        );
        while combinations.len() < target_supply {
            combinations.push(draw(&resolved, rng));
        }
    }

    Ok(combinations)
}

fn resolve<'a>(
    layer_order: &[String],
    weights: &'a WeightTable,
    store: &'a LayerStore,
) -> Result<Vec<Resolved<'a>>, CombinationError> {
    layer_order
        .iter()
        .map(|name| {
            let layer = store
                .get(name)
                .ok_or_else(|| CombinationError::LayerNotFound(name.clone()))?;
            if !layer.is_usable() {
                return Err(CombinationError::EmptyLayer(name.clone()));
            }
            Ok(Resolved {
                layer,
                weights: weights.layer(name),
            })
        })
        .collect()
}

fn draw<R: Rng + ?Sized>(layers: &[Resolved<'_>], rng: &mut R) -> Combination {
    let mut combination = Combination::new();
    for resolved in layers {
        if let Some(trait_name) =
            rarity::select_weighted_trait(resolved.layer.traits(), resolved.weights, rng)
        {
            combination.push(resolved.layer.name(), trait_name);
        }
    }
    combination
}

/// Visit combinations in odometer order until `target` is reached or the
/// space is exhausted; the first layer varies slowest.
fn sweep(
    layers: &[Resolved<'_>],
    target: usize,
    seen: &mut HashSet<String>,
    out: &mut Vec<Combination>,
) {
    let ordered: Vec<Vec<&str>> = layers.iter().map(traits_by_weight).collect();
    let mut cursor = vec![0usize; ordered.len()];

    loop {
        let mut combination = Combination::new();
        for ((resolved, traits), &i) in layers.iter().zip(&ordered).zip(&cursor) {
            combination.push(resolved.layer.name(), traits[i]);
        }
        if seen.insert(combination.canonical_key()) {
            out.push(combination);
            if out.len() >= target {
                return;
            }
        }

        // Advance the odometer from the last layer
        let mut position = cursor.len();
        loop {
            if position == 0 {
                return;
            }
            position -= 1;
            cursor[position] += 1;
            if cursor[position] < ordered[position].len() {
                break;
            }
            cursor[position] = 0;
        }
    }
}

/// Traits heaviest first; ties and unweighted traits keep declared order
fn traits_by_weight<'a>(resolved: &Resolved<'a>) -> Vec<&'a str> {
    let weight = |t: &str| {
        resolved
            .weights
            .and_then(|w| w.get(t))
            .copied()
            .filter(|w| w.is_finite() && *w > 0.0)
            .unwrap_or(0.0)
    };
    let mut traits: Vec<&str> = resolved.layer.traits().iter().map(String::as_str).collect();
    traits.sort_by(|a, b| weight(b).total_cmp(&weight(a)));
    traits
}
