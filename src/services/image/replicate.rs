use super::{BackendImage, ImageBackend, ImageRequest};
use crate::core::error::{GenResult, GenerationError};
use crate::core::slots::SLOT_COUNT;
use crate::core::state::Tier;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::{sleep, Duration};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReplicateConfig {
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Faster, cheaper backbone.
    #[serde(default = "default_standard_model")]
    pub standard_model: String,
    #[serde(default = "default_premium_model")]
    pub premium_model: String,
    /// Synchronous wait requested on submission, capped at 60 by the API.
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            base_url: default_base_url(),
            standard_model: default_standard_model(),
            premium_model: default_premium_model(),
            wait_seconds: default_wait_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl ReplicateConfig {
    /// Fills an empty token from `REPLICATE_API_TOKEN`.
    pub fn apply_env(&mut self) {
        if self.api_token.trim().is_empty() {
            if let Ok(token) = std::env::var("REPLICATE_API_TOKEN") {
                self.api_token = token.trim().to_string();
            }
        }
    }

    pub fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Standard => &self.standard_model,
            Tier::Premium => &self.premium_model,
        }
    }
}

fn default_base_url() -> String {
    "https://api.replicate.com/v1".to_string()
}
fn default_standard_model() -> String {
    "black-forest-labs/flux-2-dev".to_string()
}
fn default_premium_model() -> String {
    "black-forest-labs/flux-2-pro".to_string()
}
fn default_wait_seconds() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_max_poll_attempts() -> u32 {
    60
}

#[derive(Debug, Clone, PartialEq)]
enum PredictionStatus {
    Succeeded,
    Failed(String),
    Running,
}

fn prediction_status(prediction: &Value) -> PredictionStatus {
    let status = prediction
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    match status.as_str() {
        "succeeded" => PredictionStatus::Succeeded,
        "failed" | "canceled" | "aborted" => {
            let reason = prediction
                .get("error")
                .filter(|e| !e.is_null())
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                .unwrap_or_else(|| status.clone());
            PredictionStatus::Failed(reason)
        }
        _ => PredictionStatus::Running,
    }
}

/// First http(s) URL in `output`, which is either a string or a list.
fn extract_output_url(prediction: &Value) -> Option<String> {
    fn find(v: &Value) -> Option<String> {
        match v {
            Value::String(s) if s.trim().starts_with("http") => Some(s.trim().to_string()),
            Value::Array(items) => items.iter().find_map(find),
            Value::Object(obj) => obj.get("url").and_then(find),
            _ => None,
        }
    }
    prediction.get("output").and_then(find)
}

/// Flux-family models log the seed they used as `Using seed: N`.
fn parse_seed_from_logs(prediction: &Value) -> Option<u64> {
    let logs = prediction.get("logs")?.as_str()?;
    logs.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Using seed:")?;
        rest.trim().parse().ok()
    })
}

fn latest_version_id(model: &Value) -> Option<String> {
    model
        .get("latest_version")
        .and_then(|v| v.get("id"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn build_input(request: &ImageRequest) -> Map<String, Value> {
    let mut input = Map::new();
    input.insert("prompt".into(), json!(request.prompt));
    input.insert("aspect_ratio".into(), json!(request.kind.aspect_ratio()));
    input.insert("output_format".into(), json!("png"));
    let images: Vec<&String> = request.input_images.iter().take(SLOT_COUNT).collect();
    if !images.is_empty() {
        input.insert("input_images".into(), json!(images));
        input.insert("image_prompt_strength".into(), json!(request.image_prompt_strength));
    }
    if let Some(seed) = request.seed {
        input.insert("seed".into(), json!(seed));
    }
    input
}

pub struct ReplicateBackend {
    config: ReplicateConfig,
    client: Client,
}

impl ReplicateBackend {
    pub fn new(config: ReplicateConfig) -> Self {
        Self::with_client(config, Client::new())
    }

    pub fn with_client(config: ReplicateConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn token(&self) -> GenResult<&str> {
        let token = self.config.api_token.trim();
        if token.is_empty() {
            return Err(GenerationError::Unauthorized(
                "REPLICATE_API_TOKEN not set".to_string(),
            ));
        }
        Ok(token)
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn json_or_error(what: &str, resp: Response) -> GenResult<Value> {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GenerationError::Unauthorized(format!("{} rejected the API token", what)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Upstream(format!("{} failed ({}): {}", what, status, body)));
        }
        Ok(resp.json::<Value>().await?)
    }

    /// The registry does not promise a stable version id, so ask every time.
    async fn resolve_version(&self, model: &str) -> GenResult<String> {
        let token = self.token()?;
        let resp = self
            .client
            .get(self.api(&format!("models/{}", model)))
            .bearer_auth(token)
            .send()
            .await?;
        let payload = Self::json_or_error("Replicate model lookup", resp).await?;
        latest_version_id(&payload).ok_or_else(|| {
            GenerationError::Upstream(format!("Model {} has no published version", model))
        })
    }

    async fn poll(&self, poll_url: &str) -> GenResult<Value> {
        let token = self.token()?;
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        for attempt in 1..=self.config.max_poll_attempts {
            sleep(interval).await;
            let resp = self.client.get(poll_url).bearer_auth(token).send().await?;
            let prediction = Self::json_or_error("Replicate poll", resp).await?;
            match prediction_status(&prediction) {
                PredictionStatus::Succeeded => return Ok(prediction),
                PredictionStatus::Failed(reason) => {
                    return Err(GenerationError::Upstream(format!("Prediction failed: {}", reason)))
                }
                PredictionStatus::Running => {
                    debug!("Prediction still running (poll {}/{})", attempt, self.config.max_poll_attempts);
                }
            }
        }
        Err(GenerationError::Timeout { attempts: self.config.max_poll_attempts })
    }
}

#[async_trait]
impl ImageBackend for ReplicateBackend {
    async fn generate(&self, request: &ImageRequest) -> GenResult<BackendImage> {
        let token = self.token()?;
        let model = self.config.model_for(request.tier);
        let version = self.resolve_version(model).await?;
        info!("Submitting {:?} to {} ({})", request.kind, model, version);

        let payload = json!({
            "version": version,
            "input": Value::Object(build_input(request)),
        });
        let resp = self
            .client
            .post(self.api("predictions"))
            .bearer_auth(token)
            .header("Prefer", format!("wait={}", self.config.wait_seconds.min(60)))
            .json(&payload)
            .send()
            .await?;
        let mut prediction = Self::json_or_error("Replicate submission", resp).await?;

        match prediction_status(&prediction) {
            PredictionStatus::Succeeded => {}
            PredictionStatus::Failed(reason) => {
                return Err(GenerationError::Upstream(format!("Prediction failed: {}", reason)))
            }
            PredictionStatus::Running => {
                let poll_url = prediction
                    .get("urls")
                    .and_then(|u| u.get("get"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| GenerationError::Upstream("Prediction missing poll URL".into()))?;
                prediction = self.poll(&poll_url).await?;
            }
        }

        let url = extract_output_url(&prediction)
            .ok_or_else(|| GenerationError::Upstream("Prediction returned no image URL".into()))?;
        Ok(BackendImage { url, used_seed: parse_seed_from_logs(&prediction).or(request.seed) })
    }

    async fn download(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed downloading {}", url))?;
        if !resp.status().is_success() {
            return Err(anyhow!("Image download failed ({}): {}", resp.status(), url));
        }
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.context("Failed reading image bytes")?;
        Ok((bytes.to_vec(), mime))
    }
}
