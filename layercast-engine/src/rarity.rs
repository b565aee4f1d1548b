//! Rarity Engine
//!
//! Weighted trait selection, rarity percentages, weight validation and
//! normalization, and tiering of combinations by rarity score.
//!
//! Weights are relative: `{A: 50, B: 30, C: 20}` and `{A: 5, B: 3, C: 2}`
//! select identically. A layer whose weights sum to zero (or that has no
//! weight table at all) falls back to uniform selection.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Weights above this are flagged as outliers by [`validate`]
pub const OUTLIER_WEIGHT: f64 = 1000.0;

/// Upper bound on samples drawn by [`rarity_distribution`]
const MAX_DISTRIBUTION_SAMPLES: usize = 100_000;

/// Trait name → weight for one layer
pub type LayerWeights = BTreeMap<String, f64>;

/// Layer name → trait weights
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightTable(BTreeMap<String, LayerWeights>);

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(&self, layer: &str) -> Option<&LayerWeights> {
        self.0.get(layer)
    }

    /// Set one trait weight, creating the layer entry if needed
    pub fn set(&mut self, layer: impl Into<String>, trait_name: impl Into<String>, weight: f64) {
        self.0
            .entry(layer.into())
            .or_default()
            .insert(trait_name.into(), weight);
    }

    pub fn insert_layer(&mut self, layer: impl Into<String>, weights: LayerWeights) {
        self.0.insert(layer.into(), weights);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LayerWeights)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, LayerWeights)> for WeightTable {
    fn from_iter<I: IntoIterator<Item = (String, LayerWeights)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Outcome of [`validate`]; problems are reported, never thrown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Rarity of a single trait within its layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitRarity {
    #[serde(rename = "trait")]
    pub trait_name: String,
    pub weight: f64,
    /// Percentage of the layer's total weight
    pub rarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRarity {
    pub layer: String,
    pub traits: Vec<TraitRarity>,
}

/// Rarity tier bands (fixed, never inferred from data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RarityTier {
    Legendary,
    Epic,
    Rare,
    Uncommon,
    Common,
}

impl RarityTier {
    /// All tiers, highest band first
    pub const ALL: [RarityTier; 5] = [
        RarityTier::Legendary,
        RarityTier::Epic,
        RarityTier::Rare,
        RarityTier::Uncommon,
        RarityTier::Common,
    ];

    /// Inclusive lower bound of the band
    pub fn min_score(self) -> f64 {
        match self {
            RarityTier::Legendary => 90.0,
            RarityTier::Epic => 70.0,
            RarityTier::Rare => 40.0,
            RarityTier::Uncommon => 20.0,
            RarityTier::Common => 0.0,
        }
    }

    /// Exclusive upper bound of the band (Legendary is capped at 100)
    pub fn max_score(self) -> f64 {
        match self {
            RarityTier::Legendary => 100.0,
            RarityTier::Epic => 90.0,
            RarityTier::Rare => 70.0,
            RarityTier::Uncommon => 40.0,
            RarityTier::Common => 20.0,
        }
    }

    /// Band containing `score`
    pub fn for_score(score: f64) -> Self {
        Self::ALL
            .into_iter()
            .find(|tier| score >= tier.min_score())
            .unwrap_or(RarityTier::Common)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub tier: RarityTier,
    pub min_rarity: f64,
    pub max_rarity: f64,
    pub count: usize,
    pub percentage: f64,
}

/// One distinct sampled combination with its score and repeat count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCombination {
    pub combination: BTreeMap<String, String>,
    pub rarity: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RarityPreview {
    pub total_combinations: u128,
    pub estimated_unique: u128,
    pub rarity_distribution: Vec<TierStats>,
}

/// Sum of a layer's usable (positive, finite) weights
pub fn layer_total(weights: &LayerWeights) -> f64 {
    weights.values().copied().map(usable_weight).sum()
}

fn usable_weight(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

/// Flag zero-sum layers, negative weights and outliers
///
/// A zero-sum layer is reported even though generation can still proceed
/// with equal weighting; callers decide whether that is acceptable.
pub fn validate(weights: &WeightTable) -> ValidationResult {
    let mut errors = Vec::new();

    for (layer, layer_weights) in weights.iter() {
        if layer_total(layer_weights) == 0.0 {
            errors.push(format!("Layer \"{}\" has no valid weights", layer));
        }

        for (trait_name, weight) in layer_weights {
            if *weight < 0.0 {
                errors.push(format!(
                    "Trait \"{}\" in layer \"{}\" has negative weight",
                    trait_name, layer
                ));
            } else if !weight.is_finite() {
                errors.push(format!(
                    "Trait \"{}\" in layer \"{}\" has a non-finite weight",
                    trait_name, layer
                ));
            }
        }

        let max_weight = layer_weights
            .values()
            .copied()
            .filter(|w| w.is_finite())
            .fold(f64::MIN, f64::max);
        if max_weight > OUTLIER_WEIGHT {
            errors.push(format!(
                "Layer \"{}\" has very high weights (max: {})",
                layer, max_weight
            ));
        }
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
    }
}

/// Pick one trait by weight
///
/// Without weights (or when they sum to zero) every trait is equally likely.
/// Otherwise a value is drawn from `[0, total)` and the first trait, in
/// declared order, whose cumulative weight reaches it wins. Traits with no
/// weight never win. Returns `None` only for an empty trait list.
pub fn select_weighted_trait<'a, R: Rng + ?Sized>(
    traits: &'a [String],
    weights: Option<&LayerWeights>,
    rng: &mut R,
) -> Option<&'a str> {
    if traits.is_empty() {
        return None;
    }

    let weight_of = |t: &String| {
        weights
            .and_then(|w| w.get(t))
            .copied()
            .map(usable_weight)
            .unwrap_or(0.0)
    };

    let total: f64 = traits.iter().map(weight_of).sum();
    if total <= 0.0 {
        let index = rng.gen_range(0..traits.len());
        return Some(traits[index].as_str());
    }

    let draw = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for trait_name in traits {
        let weight = weight_of(trait_name);
        cumulative += weight;
        if weight > 0.0 && cumulative >= draw {
            return Some(trait_name.as_str());
        }
    }

    // Floating-point rounding can leave `cumulative` just short of `draw`
    traits
        .iter()
        .rev()
        .find(|t| weight_of(t) > 0.0)
        .or_else(|| traits.last())
        .map(String::as_str)
}

/// `weight(trait) / total * 100`; zero when the total is not positive
pub fn rarity_percentage(trait_name: &str, weights: &LayerWeights, total_weight: f64) -> f64 {
    if total_weight <= 0.0 {
        return 0.0;
    }
    let weight = weights.get(trait_name).copied().map(usable_weight).unwrap_or(0.0);
    weight / total_weight * 100.0
}

/// Rescale each layer to sum to 100
///
/// Zero-sum layers get `100 / trait_count` for every trait.
pub fn normalize(weights: &WeightTable) -> WeightTable {
    weights
        .iter()
        .map(|(layer, layer_weights)| {
            let total = layer_total(layer_weights);
            let normalized: LayerWeights = if total == 0.0 {
                let equal = if layer_weights.is_empty() {
                    0.0
                } else {
                    100.0 / layer_weights.len() as f64
                };
                layer_weights.keys().map(|t| (t.clone(), equal)).collect()
            } else {
                layer_weights
                    .iter()
                    .map(|(t, w)| (t.clone(), usable_weight(*w) / total * 100.0))
                    .collect()
            };
            (layer.clone(), normalized)
        })
        .collect()
}

/// Rarity of every trait in a layer, rarest-weight first
pub fn layer_rarity(weights: &LayerWeights) -> Vec<TraitRarity> {
    let total = layer_total(weights);
    let mut traits: Vec<TraitRarity> = weights
        .iter()
        .map(|(t, w)| TraitRarity {
            trait_name: t.clone(),
            weight: if total == 0.0 { 0.0 } else { *w },
            rarity: rarity_percentage(t, weights, total),
        })
        .collect();
    traits.sort_by(|a, b| b.rarity.total_cmp(&a.rarity));
    traits
}

pub fn all_rarity(weights: &WeightTable) -> Vec<LayerRarity> {
    weights
        .iter()
        .map(|(layer, layer_weights)| LayerRarity {
            layer: layer.clone(),
            traits: layer_rarity(layer_weights),
        })
        .collect()
}

/// Mean of the selected traits' rarity percentages
///
/// Layers without a weight table count as uniform.
pub fn combination_rarity_score<'a, I>(selections: I, weights: &WeightTable) -> f64
where
    I: IntoIterator<Item = (&'a str, &'a str, usize)>,
{
    let mut sum = 0.0;
    let mut layers = 0usize;
    for (layer, trait_name, trait_count) in selections {
        layers += 1;
        sum += match weights.layer(layer) {
            Some(layer_weights) if layer_total(layer_weights) > 0.0 => {
                rarity_percentage(trait_name, layer_weights, layer_total(layer_weights))
            }
            _ if trait_count > 0 => 100.0 / trait_count as f64,
            _ => 0.0,
        };
    }
    if layers == 0 {
        0.0
    } else {
        sum / layers as f64
    }
}

/// Partition `(score, count)` pairs into the fixed tier bands
pub fn tier(scored: &[(f64, usize)]) -> Vec<TierStats> {
    let mut counts: HashMap<RarityTier, usize> = HashMap::new();
    for (score, count) in scored {
        *counts.entry(RarityTier::for_score(*score)).or_default() += count;
    }
    let total: usize = counts.values().sum();

    RarityTier::ALL
        .into_iter()
        .map(|tier| {
            let count = counts.get(&tier).copied().unwrap_or(0);
            TierStats {
                tier,
                min_rarity: tier.min_score(),
                max_rarity: tier.max_score(),
                count,
                percentage: if total == 0 {
                    0.0
                } else {
                    count as f64 / total as f64 * 100.0
                },
            }
        })
        .collect()
}

/// Draw one combination from the weight table alone (traits = weight keys)
fn sample_from_table<R: Rng + ?Sized>(
    weights: &WeightTable,
    rng: &mut R,
) -> (BTreeMap<String, String>, f64) {
    let mut combination = BTreeMap::new();
    let mut rarity_sum = 0.0;
    for (layer, layer_weights) in weights.iter() {
        let traits: Vec<String> = layer_weights.keys().cloned().collect();
        if let Some(selected) = select_weighted_trait(&traits, Some(layer_weights), rng) {
            rarity_sum += rarity_percentage(selected, layer_weights, layer_total(layer_weights));
            combination.insert(layer.clone(), selected.to_string());
        }
    }
    let rarity = if weights.is_empty() {
        0.0
    } else {
        rarity_sum / weights.len() as f64
    };
    (combination, rarity)
}

/// Sampled distribution of combinations, highest rarity score first
///
/// Draws `min(supply * 10, 100_000)` samples and counts repeats.
pub fn rarity_distribution<R: Rng + ?Sized>(
    weights: &WeightTable,
    supply: usize,
    rng: &mut R,
) -> Vec<ScoredCombination> {
    let sample_size = supply.saturating_mul(10).min(MAX_DISTRIBUTION_SAMPLES);
    let mut index: HashMap<BTreeMap<String, String>, usize> = HashMap::new();
    let mut combinations: Vec<ScoredCombination> = Vec::new();

    for _ in 0..sample_size {
        let (combination, rarity) = sample_from_table(weights, rng);
        match index.get(&combination) {
            Some(&i) => combinations[i].count += 1,
            None => {
                index.insert(combination.clone(), combinations.len());
                combinations.push(ScoredCombination {
                    combination,
                    rarity,
                    count: 1,
                });
            }
        }
    }

    combinations.sort_by(|a, b| b.rarity.total_cmp(&a.rarity));
    combinations
}

/// Combination-space size and tier spread estimated from `sample_size` draws
pub fn preview<R: Rng + ?Sized>(
    weights: &WeightTable,
    sample_size: usize,
    rng: &mut R,
) -> RarityPreview {
    let total_combinations = weights
        .iter()
        .fold(1u128, |acc, (_, w)| acc.saturating_mul(w.len() as u128));

    let scored: Vec<(f64, usize)> = (0..sample_size)
        .map(|_| (sample_from_table(weights, rng).1, 1))
        .collect();

    RarityPreview {
        total_combinations,
        estimated_unique: total_combinations.min(sample_size as u128),
        rarity_distribution: tier(&scored),
    }
}
