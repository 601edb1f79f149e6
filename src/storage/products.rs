//! Product catalog storage and loading

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::vision::references::{ImageSource, ProductRegistration, ReferenceImage};

/// A catalog of products available for recognition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductCatalog {
    /// Registered products
    pub products: Vec<ProductDefinition>,
    /// Directory relative image paths resolve against (set on load)
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// A product definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductDefinition {
    /// Product identifier
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Minimum confidence for a method to report this product
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Words expected on the packaging
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Reference photos of the product
    #[serde(default)]
    pub reference_images: Vec<ReferenceImageEntry>,
}

fn default_confidence_threshold() -> f32 {
    0.6
}

fn default_weight() -> f32 {
    1.0
}

/// One reference photo of a product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceImageEntry {
    /// Reference identifier
    pub id: String,
    /// Path to the image, relative to the catalog file
    pub path: PathBuf,
    /// Reliability of this view (0, 1]
    #[serde(default = "default_weight")]
    pub weight: f32,
    /// Free-form note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProductDefinition {
    /// Required-field and range check, run before any image is decoded
    pub fn validate(&self) -> Result<(), EngineError> {
        self.to_registration(Path::new("")).map(|_| ())
    }

    /// Validate and convert into a registration, resolving image paths against `base_dir`
    pub fn to_registration(&self, base_dir: &Path) -> Result<ProductRegistration, EngineError> {
        let references = self
            .reference_images
            .iter()
            .map(|entry| ReferenceImage {
                id: entry.id.clone(),
                weight: entry.weight,
                source: ImageSource::File(resolve_path(base_dir, &entry.path)),
            })
            .collect();

        let registration = ProductRegistration {
            product_id: self.id.trim().to_string(),
            references,
            keywords: self
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            confidence_threshold: self.confidence_threshold,
        };
        registration.validate()?;
        Ok(registration)
    }
}

impl ProductCatalog {
    /// Get a product definition by ID
    pub fn get(&self, id: &str) -> Option<&ProductDefinition> {
        self.products.iter().find(|p| p.id == id)
    }
}

fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Load a product catalog from file
pub fn load_catalog(path: &Path) -> Result<ProductCatalog> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read product catalog: {:?}", path))?;
    let mut catalog: ProductCatalog = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse product catalog: {:?}", path))?;
    catalog.base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    Ok(catalog)
}

/// Save a product catalog to file
pub fn save_catalog(catalog: &ProductCatalog, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(catalog)?;
    std::fs::write(path, content)?;
    Ok(())
}
