//! Per-item and collection metadata documents
//!
//! Item documents follow the common NFT metadata layout (`name`,
//! `description`, `image`, `attributes`, `properties`, `collection`). The
//! collection document aggregates every item's URI and attributes and is the
//! single object uploaded during UPLOADING.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::combination::Combination;
use crate::session::{CollectionInfo, Creator};

const IMAGE_CATEGORY: &str = "image";
const PNG_MIME: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub trait_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataFile {
    pub uri: String,
    #[serde(rename = "type")]
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProperties {
    pub files: Vec<MetadataFile>,
    pub category: String,
    pub creators: Vec<Creator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRef {
    pub name: String,
    /// Collection symbol
    pub family: String,
}

impl From<&CollectionInfo> for CollectionRef {
    fn from(info: &CollectionInfo) -> Self {
        Self {
            name: info.name.clone(),
            family: info.symbol.clone(),
        }
    }
}

/// Metadata for one generated item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub name: String,
    pub description: String,
    /// Empty until the image is uploaded
    pub image: String,
    pub attributes: Vec<Attribute>,
    pub properties: TokenProperties,
    pub collection: CollectionRef,
}

impl TokenMetadata {
    /// Metadata for item `index`; one attribute per layer, in layer order
    pub fn new(index: usize, combination: &Combination, info: &CollectionInfo) -> Self {
        Self {
            name: format!("{} #{}", info.name, index),
            description: info.description.clone(),
            image: String::new(),
            attributes: combination
                .selections()
                .iter()
                .map(|s| Attribute {
                    trait_type: s.layer.clone(),
                    value: s.trait_name.clone(),
                })
                .collect(),
            properties: TokenProperties {
                files: Vec::new(),
                category: IMAGE_CATEGORY.to_string(),
                creators: info.creators.clone(),
            },
            collection: CollectionRef::from(info),
        }
    }

    /// Record the uploaded image URI
    pub fn with_image(mut self, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        self.properties.files = vec![MetadataFile {
            uri: uri.clone(),
            mime_type: PNG_MIME.to_string(),
        }];
        self.image = uri;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionProperties {
    pub category: String,
    pub files: Vec<MetadataFile>,
}

/// Collection-level document uploaded once per session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDocument {
    pub name: String,
    pub symbol: String,
    pub description: String,
    /// First item's image
    pub image: String,
    pub seller_fee_basis_points: u16,
    /// Distinct trait/value pairs, first-seen order
    pub attributes: Vec<Attribute>,
    pub properties: CollectionProperties,
    pub collection: CollectionRef,
    pub items: Vec<TokenMetadata>,
}

impl CollectionDocument {
    pub fn build(info: &CollectionInfo, items: &[TokenMetadata]) -> Self {
        let mut seen = HashSet::new();
        let attributes = items
            .iter()
            .flat_map(|item| item.attributes.iter())
            .filter(|attr| seen.insert(*attr))
            .cloned()
            .collect();

        Self {
            name: info.name.clone(),
            symbol: info.symbol.clone(),
            description: info.description.clone(),
            image: items.first().map(|i| i.image.clone()).unwrap_or_default(),
            seller_fee_basis_points: royalty_basis_points(info.royalties),
            attributes,
            properties: CollectionProperties {
                category: IMAGE_CATEGORY.to_string(),
                files: items
                    .iter()
                    .map(|i| MetadataFile {
                        uri: i.image.clone(),
                        mime_type: PNG_MIME.to_string(),
                    })
                    .collect(),
            },
            collection: CollectionRef::from(info),
            items: items.to_vec(),
        }
    }
}

/// Royalty percentage → basis points (2.5% → 250)
pub fn royalty_basis_points(royalties: f64) -> u16 {
    (royalties * 100.0).round().clamp(0.0, 10_000.0) as u16
}

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
