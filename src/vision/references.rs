//! Reference Store
//!
//! Holds, per product, the precomputed descriptors of every reference image.
//! Descriptors are immutable once loaded; re-registering a product replaces
//! its whole entry.

use image::RgbaImage;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{AppConfig, SignatureSettings};
use crate::error::EngineError;
use crate::vision::augment;
use crate::vision::signature::SignatureDescriptor;
use crate::vision::{decode_image, fit_within};

/// Source of reference pixels
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Image file decoded at registration time
    File(PathBuf),
    /// Already-decoded pixels
    Pixels(RgbaImage),
}

/// One reference image as supplied by the caller
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub id: String,
    /// Reliability of this view (0, 1]
    pub weight: f32,
    pub source: ImageSource,
}

/// Everything needed to register one product
#[derive(Debug, Clone)]
pub struct ProductRegistration {
    pub product_id: String,
    /// Ordered reference images
    pub references: Vec<ReferenceImage>,
    /// Lower-case keywords for the text matcher
    pub keywords: Vec<String>,
    pub confidence_threshold: f32,
}

impl ProductRegistration {
    /// Required-field check, run before any image is decoded
    pub fn validate(&self) -> Result<(), EngineError> {
        let id = self.product_id.trim();
        if id.is_empty() {
            return Err(EngineError::invalid_registration("<unnamed>", "product id is empty"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(EngineError::invalid_registration(
                id,
                format!("confidence_threshold {} is outside [0, 1]", self.confidence_threshold),
            ));
        }
        if self.references.is_empty() {
            return Err(EngineError::invalid_registration(id, "no reference images listed"));
        }

        let mut seen = HashSet::new();
        for reference in &self.references {
            if reference.id.trim().is_empty() {
                return Err(EngineError::invalid_registration(id, "reference image with empty id"));
            }
            if !seen.insert(reference.id.as_str()) {
                return Err(EngineError::invalid_registration(
                    id,
                    format!("duplicate reference id '{}'", reference.id),
                ));
            }
            if !(reference.weight > 0.0 && reference.weight <= 1.0) {
                return Err(EngineError::invalid_registration(
                    id,
                    format!("reference '{}' weight {} is outside (0, 1]", reference.id, reference.weight),
                ));
            }
        }

        Ok(())
    }
}

static NEXT_REFERENCE_KEY: AtomicU64 = AtomicU64::new(1);

/// Precomputed representation of one reference view
#[derive(Debug, Clone)]
pub struct ReferenceDescriptor {
    /// Process-unique key, used by matchers to cache derived data
    pub key: u64,
    pub id: String,
    /// Fixed at load time
    pub weight: f32,
    pub signature: SignatureDescriptor,
    /// Pixels at working resolution for keypoint extraction and template scans
    pub raster: Arc<RgbaImage>,
}

/// A registered product and its references
#[derive(Debug, Clone)]
pub struct ProductEntry {
    pub product_id: String,
    pub confidence_threshold: f32,
    pub keywords: Vec<String>,
    pub references: Vec<ReferenceDescriptor>,
}

/// Outcome of a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSummary {
    pub product_id: String,
    /// Reference images that decoded
    pub loaded: usize,
    /// Reference images that failed to decode
    pub skipped: usize,
    /// Descriptors stored, including augmented variants
    pub descriptors: usize,
}

/// Reference store
pub struct ReferenceStore {
    products: BTreeMap<String, ProductEntry>,
    signature_settings: SignatureSettings,
    working_size: u32,
    augment: bool,
}

impl ReferenceStore {
    /// Create an empty store
    pub fn new(config: &AppConfig) -> Self {
        Self {
            products: BTreeMap::new(),
            signature_settings: config.signature.clone(),
            working_size: config.keypoint.working_size,
            augment: config.references.augment,
        }
    }

    /// Load and precompute descriptors for every reference image of a product.
    ///
    /// Images that fail to decode are skipped with a warning; registration fails
    /// only when none of them load. Re-registering a product replaces it.
    pub fn register(&mut self, registration: ProductRegistration) -> Result<RegistrationSummary, EngineError> {
        registration.validate()?;
        let product_id = registration.product_id.trim().to_string();

        let mut references = Vec::new();
        let mut loaded = 0;
        let mut skipped = 0;

        for reference in registration.references {
            let pixels = match reference.source {
                ImageSource::Pixels(pixels) => pixels,
                ImageSource::File(path) => match decode_image(&path) {
                    Ok(pixels) => pixels,
                    Err(e) => {
                        warn!(
                            "Skipping reference '{}' of product '{}': {:#}",
                            reference.id, product_id, e
                        );
                        skipped += 1;
                        continue;
                    }
                },
            };

            if pixels.width() == 0 || pixels.height() == 0 {
                warn!("Skipping empty reference '{}' of product '{}'", reference.id, product_id);
                skipped += 1;
                continue;
            }

            loaded += 1;
            let raster = fit_within(&pixels, self.working_size);

            if self.augment {
                for variant in augment::variants(&raster) {
                    references.push(self.describe(
                        format!("{}_{}", reference.id, variant.suffix),
                        reference.weight * variant.weight,
                        variant.image,
                    ));
                }
            }
            references.push(self.describe(reference.id, reference.weight, raster));
        }

        if loaded == 0 {
            return Err(EngineError::NoReferencesLoaded { product_id });
        }

        let summary = RegistrationSummary {
            product_id: product_id.clone(),
            loaded,
            skipped,
            descriptors: references.len(),
        };
        info!(
            "Registered product '{}': {} references loaded, {} skipped, {} descriptors",
            product_id, loaded, skipped, summary.descriptors
        );

        let keywords = registration
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        self.products.insert(
            product_id.clone(),
            ProductEntry {
                product_id,
                confidence_threshold: registration.confidence_threshold,
                keywords,
                references,
            },
        );

        Ok(summary)
    }

    fn describe(&self, id: String, weight: f32, raster: RgbaImage) -> ReferenceDescriptor {
        ReferenceDescriptor {
            key: NEXT_REFERENCE_KEY.fetch_add(1, Ordering::Relaxed),
            id,
            weight,
            signature: SignatureDescriptor::compute(&raster, &self.signature_settings),
            raster: Arc::new(raster),
        }
    }

    /// Reference descriptors of a product
    pub fn get(&self, product_id: &str) -> Option<&[ReferenceDescriptor]> {
        self.products.get(product_id).map(|p| p.references.as_slice())
    }

    /// Full entry of a product
    pub fn product(&self, product_id: &str) -> Option<&ProductEntry> {
        self.products.get(product_id)
    }

    /// Iterate products in id order
    pub fn products(&self) -> impl Iterator<Item = &ProductEntry> {
        self.products.values()
    }

    /// Whether a product is registered
    pub fn contains(&self, product_id: &str) -> bool {
        self.products.contains_key(product_id)
    }

    /// Remove a product by ID
    pub fn remove(&mut self, product_id: &str) -> Option<ProductEntry> {
        self.products.remove(product_id)
    }

    /// Get the number of registered products
    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}
