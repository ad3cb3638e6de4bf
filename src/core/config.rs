use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::seed::deserialize_lenient_seed;
use crate::core::state::Tier;
use crate::services::billing::BillingConfig;
use crate::services::image::ImageConfig;
use crate::services::llm::LlmConfig;
use crate::services::text::TextConfig;

const CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_storage")]
    pub storage_folder: String,

    /// Base URL the storage folder is served from. Without it, `file://` URLs
    /// are handed out.
    #[serde(default)]
    pub public_base_url: Option<String>,

    #[serde(default)]
    pub unattended: bool,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    pub llm: LlmConfig,

    #[serde(default)]
    pub text: TextConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub billing: BillingConfig,

    #[serde(default)]
    pub story: StoryConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoryLength {
    Short,
    #[default]
    Medium,
    Long,
}

impl StoryLength {
    pub fn page_count(&self) -> usize {
        match self {
            StoryLength::Short => 4,
            StoryLength::Medium => 8,
            StoryLength::Long => 12,
        }
    }
}

/// What the user asked for.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StoryConfig {
    #[serde(default)]
    pub book_id: Option<String>,
    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub character_description: String,
    #[serde(default)]
    pub setting: String,
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default)]
    pub length: StoryLength,
    #[serde(default = "default_age_band")]
    pub age_band: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tier: Tier,
    /// Hero mode: the user's own photo becomes the identity reference.
    #[serde(default)]
    pub hero_photo_url: Option<String>,
    /// Scene references shared by every page: a backdrop, a recurring prop,
    /// and a lighting mood.
    #[serde(default)]
    pub environment_ref: Option<String>,
    #[serde(default)]
    pub prop_ref: Option<String>,
    #[serde(default)]
    pub lighting_ref: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_seed")]
    pub seed: Option<u64>,
}

impl StoryConfig {
    pub fn is_complete(&self) -> bool {
        !self.character_name.trim().is_empty() && !self.setting.trim().is_empty()
    }
}

fn default_storage() -> String {
    "storage".to_string()
}
fn default_max_concurrency() -> usize {
    3
}
fn default_style() -> String {
    "watercolor".to_string()
}
fn default_age_band() -> String {
    "3-5".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_PATH);
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", CONFIG_PATH);
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config =
            serde_yaml_ng::from_str(content).context("Failed to parse config.yml")?;
        config.image.replicate.apply_env();
        if config.max_concurrency == 0 {
            config.max_concurrency = 1;
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(CONFIG_PATH, content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.storage_folder)?;
        Ok(())
    }
}
