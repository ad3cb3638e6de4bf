use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Debug;
use std::time::Duration;

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_retry_count() -> usize {
    2
}
fn default_retry_delay() -> u64 {
    3
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;

    /// Chat about a single image. Providers without vision support error out.
    async fn chat_with_image(&self, _system: &str, _user: &str, _image_url: &str) -> Result<String> {
        Err(anyhow!("This LLM provider does not support image input"))
    }
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    let inner: Box<dyn LlmClient> = match config.provider.as_str() {
        "gemini" => {
            let cfg = config.gemini.as_ref().context("Gemini config missing")?;
            Box::new(GeminiClient::new(&cfg.api_key, &cfg.model))
        }
        "ollama" => {
            let cfg = config.ollama.as_ref().context("Ollama config missing")?;
            Box::new(OllamaClient::new(&cfg.base_url, &cfg.model))
        }
        "openai" => {
            let cfg = config.openai.as_ref().context("OpenAI config missing")?;
            Box::new(OpenAIClient::new(&cfg.api_key, &cfg.model, cfg.base_url.as_deref()))
        }
        _ => return Err(anyhow!("Unknown LLM provider: {}", config.provider)),
    };

    if config.retry_count == 0 {
        return Ok(inner);
    }
    Ok(Box::new(RetryingLlm {
        inner,
        retries: config.retry_count,
        delay: Duration::from_secs(config.retry_delay_seconds),
    }))
}

// --- Retry ---

#[derive(Debug)]
pub struct RetryingLlm {
    inner: Box<dyn LlmClient>,
    retries: usize,
    delay: Duration,
}

impl RetryingLlm {
    pub fn new(inner: Box<dyn LlmClient>, retries: usize, delay: Duration) -> Self {
        Self { inner, retries, delay }
    }
}

#[async_trait]
impl LlmClient for RetryingLlm {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.inner.chat(system, user).await {
                Ok(r) => return Ok(r),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!("LLM call failed (attempt {}/{}): {:#}", attempt, self.retries + 1, e);
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn chat_with_image(&self, system: &str, user: &str, image_url: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.inner.chat_with_image(system, user, image_url).await {
                Ok(r) => return Ok(r),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!("LLM vision call failed (attempt {}/{}): {:#}", attempt, self.retries + 1, e);
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Image bytes as base64 with their mime type. `file://` URLs are read from
/// disk so local storage works without a public base URL.
async fn fetch_image_base64(client: &reqwest::Client, url: &str) -> Result<(String, String)> {
    let (mime, bytes) = match url::Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => {
            let path = parsed
                .to_file_path()
                .map_err(|_| anyhow!("Invalid file URL: {}", url))?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            (mime_from_path(url).to_string(), bytes)
        }
        _ => {
            let resp = client.get(url).send().await.context("Failed to download image")?;
            if !resp.status().is_success() {
                return Err(anyhow!("Image download failed: {}", resp.status()));
            }
            let mime = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("image/png")
                .to_string();
            (mime, resp.bytes().await?.to_vec())
        }
    };
    Ok((mime, base64::engine::general_purpose::STANDARD.encode(&bytes)))
}

fn mime_from_path(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn generate(&self, system: &str, parts: Vec<Value>) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let request_body = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "system_instruction": { "parts": [{ "text": system }] },
        });

        let resp = self.client.post(&url).json(&request_body).send().await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Gemini API error: {}", error_text));
        }

        let response_text = resp.text().await?;
        let result: GeminiResponse = serde_json::from_str(&response_text).map_err(|e| {
            anyhow!("Failed to parse Gemini response: {}. Body: {}", e, response_text)
        })?;
        result.into_text()
    }
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

impl GeminiResponse {
    fn into_text(self) -> Result<String> {
        if let Some(err) = self.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }
        let first = self
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| anyhow!("Gemini response has no candidates"))?;

        if let Some(part) = first.content.and_then(|c| c.parts.into_iter().next()) {
            return Ok(part.text);
        }
        let reason = first.finish_reason.as_deref().unwrap_or("UNKNOWN");
        Err(anyhow!("Gemini response empty. Finish reason: {}", reason))
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        self.generate(system, vec![json!({ "text": user })]).await
    }

    async fn chat_with_image(&self, system: &str, user: &str, image_url: &str) -> Result<String> {
        let (mime, data) = fetch_image_base64(&self.client, image_url).await?;
        self.generate(
            system,
            vec![
                json!({ "inline_data": { "mime_type": mime, "data": data } }),
                json!({ "text": user }),
            ],
        )
        .await
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, messages: Value) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let request_body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });

        let resp = self.client.post(&url).json(&request_body).send().await?;
        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Ollama API error: {}", error_text));
        }

        let result: OllamaResponse = resp.json().await?;
        Ok(result.message.content)
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        self.send(json!([
            { "role": "system", "content": system },
            { "role": "user", "content": user },
        ]))
        .await
    }

    async fn chat_with_image(&self, system: &str, user: &str, image_url: &str) -> Result<String> {
        let (_, data) = fetch_image_base64(&self.client, image_url).await?;
        self.send(json!([
            { "role": "system", "content": system },
            { "role": "user", "content": user, "images": [data] },
        ]))
        .await
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, messages: Value) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let request_body = json!({ "model": self.model, "messages": messages });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("OpenAI API error: {}", error_text));
        }

        let result: OpenAIResponse = resp.json().await?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("OpenAI response empty or missing content"))
    }
}

#[derive(Deserialize)]
pub(crate) struct OpenAIResponse {
    pub(crate) choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
pub(crate) struct OpenAIChoice {
    pub(crate) message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
pub(crate) struct OpenAIMessageResponse {
    pub(crate) content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        self.send(json!([
            { "role": "system", "content": system },
            { "role": "user", "content": user },
        ]))
        .await
    }

    async fn chat_with_image(&self, system: &str, user: &str, image_url: &str) -> Result<String> {
        // The API can fetch http(s) itself; local files go inline.
        let image_url = if image_url.starts_with("file://") {
            let (mime, data) = fetch_image_base64(&self.client, image_url).await?;
            format!("data:{};base64,{}", mime, data)
        } else {
            image_url.to_string()
        };
        self.send(json!([
            { "role": "system", "content": system },
            { "role": "user", "content": [
                { "type": "text", "text": user },
                { "type": "image_url", "image_url": { "url": image_url } },
            ]},
        ]))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_gemini_response_parsing_safety_block() {
        let json = r#"{
            "candidates": [
                {
                    "finishReason": "SAFETY",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        let err = result.into_text().unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn test_gemini_response_parsing_success() {
        let json = r#"{
            "candidates": [
                {
                    "content": {
                        "parts": [
                            { "text": "Hello world" }
                        ],
                        "role": "model"
                    },
                    "finishReason": "STOP",
                    "index": 0
                }
            ]
        }"#;

        let result: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.into_text().unwrap(), "Hello world");
    }

    #[test]
    fn test_openai_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Once upon a time"
                },
                "finish_reason": "stop"
            }]
        }"#;

        let result: OpenAIResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            result.choices[0].message.content.as_deref(),
            Some("Once upon a time")
        );
    }

    #[derive(Debug)]
    struct FlakyLlm {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(anyhow!("boom"))
            } else {
                Ok("ok".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let llm = RetryingLlm::new(
            Box::new(FlakyLlm { failures: 2, calls: calls.clone() }),
            2,
            Duration::from_millis(1),
        );
        assert_eq!(llm.chat("s", "u").await.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let llm = RetryingLlm::new(
            Box::new(FlakyLlm { failures: 5, calls: calls.clone() }),
            1,
            Duration::from_millis(1),
        );
        assert!(llm.chat("s", "u").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_local_image() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sheet.jpg");
        std::fs::write(&path, b"abc")?;
        let url = url::Url::from_file_path(&path).map_err(|_| anyhow!("bad path"))?;
        let (mime, data) = fetch_image_base64(&reqwest::Client::new(), url.as_str()).await?;
        assert_eq!(mime, "image/jpeg");
        assert_eq!(data, "YWJj");
        Ok(())
    }

    #[tokio::test]
    async fn test_default_vision_unsupported() {
        let calls = Arc::new(AtomicUsize::new(0));
        let llm = FlakyLlm { failures: 0, calls };
        assert!(llm.chat_with_image("s", "u", "http://x/y.png").await.is_err());
    }
}
