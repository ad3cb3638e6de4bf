pub mod replicate;
#[cfg(test)]
pub(crate) mod mock;

use crate::core::error::{GenResult, GenerationError};
use crate::core::io::Storage;
use crate::core::slots::ReferenceWeights;
use crate::core::state::Tier;
use crate::services::billing::{BillingConfig, EnergyLedger};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use replicate::{ReplicateBackend, ReplicateConfig};

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_image_provider")]
    pub provider: String,
    #[serde(default)]
    pub replicate: ReplicateConfig,
    /// How far the backbone may drift from the references.
    #[serde(default = "default_prompt_strength")]
    pub prompt_strength: f64,
    #[serde(default)]
    pub weights: ReferenceWeights,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_image_provider(),
            replicate: ReplicateConfig::default(),
            prompt_strength: default_prompt_strength(),
            weights: ReferenceWeights::default(),
        }
    }
}

fn default_image_provider() -> String {
    "replicate".to_string()
}
fn default_prompt_strength() -> f64 {
    0.45
}

// --- Requests ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Sheet,
    Cover,
    Page(u32),
}

impl ImageKind {
    pub fn aspect_ratio(&self) -> &'static str {
        match self {
            ImageKind::Sheet => "16:9",
            ImageKind::Cover => "3:4",
            ImageKind::Page(_) => "4:3",
        }
    }

    fn file_stem(&self) -> String {
        match self {
            ImageKind::Sheet => "sheet".to_string(),
            ImageKind::Cover => "cover".to_string(),
            ImageKind::Page(n) => format!("page-{:02}", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub book_id: String,
    pub kind: ImageKind,
    pub prompt: String,
    /// Packed reference list, at most ten entries, order is meaningful.
    pub input_images: Vec<String>,
    pub image_prompt_strength: f64,
    pub seed: Option<u64>,
    pub tier: Tier,
}

/// Backend result; the URL is on the generation host and will expire.
#[derive(Debug, Clone)]
pub struct BackendImage {
    pub url: String,
    pub used_seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    /// Permanent URL in our own storage.
    pub image_url: String,
    pub used_seed: Option<u64>,
}

#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn generate(&self, request: &ImageRequest) -> GenResult<BackendImage>;
    /// Fetches the bytes behind an ephemeral result URL.
    async fn download(&self, url: &str) -> Result<(Vec<u8>, Option<String>)>;
}

pub fn create_image_backend(config: &ImageConfig) -> Result<Arc<dyn ImageBackend>> {
    match config.provider.as_str() {
        "replicate" => Ok(Arc::new(ReplicateBackend::new(config.replicate.clone()))),
        _ => Err(anyhow!("Unknown image provider: {}", config.provider)),
    }
}

fn extension_for(mime: Option<&str>, url: &str) -> &'static str {
    match mime.map(|m| m.split(';').next().unwrap_or(m).trim()) {
        Some("image/png") => return "png",
        Some("image/jpeg") | Some("image/jpg") => return "jpg",
        Some("image/webp") => return "webp",
        _ => {}
    }
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "jpg"
    } else if path.ends_with(".webp") {
        "webp"
    } else {
        "png"
    }
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Balance gate, backend call, and re-upload to permanent storage.
pub struct ImageGateway {
    backend: Arc<dyn ImageBackend>,
    ledger: Arc<EnergyLedger>,
    storage: Arc<dyn Storage>,
    billing: BillingConfig,
}

impl ImageGateway {
    pub fn new(
        backend: Arc<dyn ImageBackend>,
        ledger: Arc<EnergyLedger>,
        storage: Arc<dyn Storage>,
        billing: BillingConfig,
    ) -> Self {
        Self { backend, ledger, storage, billing }
    }

    pub fn ledger(&self) -> &EnergyLedger {
        &self.ledger
    }

    pub async fn generate(&self, request: &ImageRequest) -> GenResult<GeneratedImage> {
        let cost = self.billing.cost_for(request.tier);
        self.ledger.try_debit(cost).await?;

        match self.generate_and_persist(request).await {
            Ok(image) => Ok(image),
            Err(e) => {
                if let Err(refund_err) = self.ledger.refund(cost).await {
                    warn!("Refund of {} failed: {:#}", cost, refund_err);
                }
                Err(e)
            }
        }
    }

    async fn generate_and_persist(&self, request: &ImageRequest) -> GenResult<GeneratedImage> {
        let result = self.backend.generate(request).await?;
        let used_seed = result.used_seed.or(request.seed);

        let (bytes, mime) = self
            .backend
            .download(&result.url)
            .await
            .map_err(|e| GenerationError::Upstream(format!("Result download failed: {:#}", e)))?;

        let key = format!(
            "images/{}/{}-{}-{}.{}",
            request.book_id,
            request.kind.file_stem(),
            used_seed.map(|s| s.to_string()).unwrap_or_else(|| "x".to_string()),
            timestamp_millis(),
            extension_for(mime.as_deref(), &result.url),
        );
        self.storage.write(&key, &bytes).await?;
        let image_url = self.storage.public_url(&key)?;
        info!("Stored {:?} for {} at {}", request.kind, request.book_id, image_url);

        Ok(GeneratedImage { image_url, used_seed })
    }
}
