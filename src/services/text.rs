use crate::core::config::StoryConfig;
use crate::core::dna::VisualDna;
use crate::core::state::{Character, Identity, StoryBook, StoryPage};
use crate::services::llm::{LlmClient, OpenAIResponse};
use crate::utils::text::{slugify, strip_code_blocks};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TextConfig {
    #[serde(default = "default_text_provider")]
    pub provider: String, // "llm" or "remote"
    pub remote: Option<RemoteTextConfig>,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self { provider: default_text_provider(), remote: None }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RemoteTextConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_text_provider() -> String {
    "llm".to_string()
}

// --- Actions ---

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", content = "payload", rename_all = "kebab-case")]
pub enum TextAction {
    GenerateStructure(StoryConfig),
    GenerateIdea {
        setting: String,
        style: String,
        age_band: String,
    },
    ExtractVisualDna {
        image_url: String,
        hint: Option<String>,
    },
}

impl TextAction {
    pub fn name(&self) -> &'static str {
        match self {
            TextAction::GenerateStructure(_) => "generate-structure",
            TextAction::GenerateIdea { .. } => "generate-idea",
            TextAction::ExtractVisualDna { .. } => "extract-visual-dna",
        }
    }
}

/// The opaque text-generation service. Returns the raw reply body.
#[async_trait]
pub trait TextService: Send + Sync {
    async fn invoke(&self, action: &TextAction) -> Result<String>;
}

pub fn create_text_service(
    config: &TextConfig,
    llm: Box<dyn LlmClient>,
) -> Result<Box<dyn TextService>> {
    match config.provider.as_str() {
        "llm" => Ok(Box::new(LlmTextService::new(llm))),
        "remote" => {
            let cfg = config.remote.as_ref().context("Remote text config missing")?;
            Ok(Box::new(RemoteTextService::new(&cfg.endpoint, &cfg.api_key)))
        }
        _ => Err(anyhow!("Unknown text provider: {}", config.provider)),
    }
}

// --- LLM-backed ---

const AUTHOR_SYSTEM: &str =
    "You are a children's picture book author. Reply with valid JSON only, no commentary.";

const DNA_SYSTEM: &str = "You are a character designer. Describe only fixed visual traits, in plain English. Reply with valid JSON only.";

pub struct LlmTextService {
    llm: Box<dyn LlmClient>,
}

impl LlmTextService {
    pub fn new(llm: Box<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn structure_prompt(story: &StoryConfig) -> String {
        format!(
            "Write a picture book for children aged {age}.\n\
             Main character: {name}. {description}\n\
             Setting: {setting}\n\
             Art style: {style}\n\
             Number of pages: {pages}\n\n\
             Rules:\n\
             - Each page has one or two short sentences of story text.\n\
             - \"art_prompt\" describes the scene and action only. Never describe the main character's body, face or clothes there, and never use their name.\n\
             - \"descriptor\" is a short generic phrase for the main character without the name, e.g. \"the small blue dragon\".\n\
             - \"identity_prompt\" is a precise English description of the main character's look for a character reference sheet.\n\n\
             Return exactly this JSON shape:\n\
             {{\"title\": \"...\", \"character\": {{\"name\": \"...\", \"descriptor\": \"...\"}}, \
             \"identity_prompt\": \"...\", \"cover_prompt\": \"...\", \
             \"pages\": [{{\"text\": \"...\", \"art_prompt\": \"...\"}}]}}",
            age = story.age_band,
            name = story.character_name,
            description = story.character_description,
            setting = story.setting,
            style = story.style,
            pages = story.length.page_count(),
        )
    }
}

#[async_trait]
impl TextService for LlmTextService {
    async fn invoke(&self, action: &TextAction) -> Result<String> {
        debug!("Text action: {}", action.name());
        match action {
            TextAction::GenerateStructure(story) => {
                self.llm.chat(AUTHOR_SYSTEM, &Self::structure_prompt(story)).await
            }
            TextAction::GenerateIdea { setting, style, age_band } => {
                let prompt = format!(
                    "Suggest one original picture book idea for children aged {}. \
                     Setting hint: {}. Art style: {}.\n\
                     Return JSON: {{\"title\": \"...\", \"premise\": \"...\", \"character_name\": \"...\", \"character_description\": \"...\"}}",
                    age_band, setting, style
                );
                self.llm.chat(AUTHOR_SYSTEM, &prompt).await
            }
            TextAction::ExtractVisualDna { image_url, hint } => {
                let prompt = format!(
                    "This image is a character reference sheet. Extract the character's fixed visual traits.\n\
                     {}\n\
                     Return JSON: {{\"species\": \"...\", \"features\": [\"...\"], \"clothing\": \"...\", \"palette\": [\"...\"]}}",
                    hint.as_deref()
                        .map(|h| format!("The author described it as: {}", h))
                        .unwrap_or_default()
                );
                self.llm.chat_with_image(DNA_SYSTEM, &prompt, image_url).await
            }
        }
    }
}

// --- Remote function ---

/// Posts `{action, payload}` to a hosted text function.
pub struct RemoteTextService {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl RemoteTextService {
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TextService for RemoteTextService {
    async fn invoke(&self, action: &TextAction) -> Result<String> {
        if self.api_key.trim().is_empty() {
            return Err(anyhow!("Missing authorization token for text service"));
        }
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(action)
            .send()
            .await
            .with_context(|| format!("Text service request failed ({})", action.name()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(anyhow!("Text service rejected the authorization token"));
        }
        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("Text service error: {}", error_text));
        }
        Ok(resp.text().await?)
    }
}

// --- Reply handling ---

/// Unwraps an OpenAI chat envelope if present and strips code fences.
pub fn unwrap_content(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(envelope) = serde_json::from_str::<OpenAIResponse>(trimmed) {
        if let Some(content) = envelope.choices.into_iter().next().and_then(|c| c.message.content) {
            return strip_code_blocks(&content);
        }
    }
    strip_code_blocks(trimmed)
}

#[derive(Debug, Deserialize, Default)]
struct OutlineCharacter {
    #[serde(default)]
    name: String,
    #[serde(default)]
    descriptor: String,
}

#[derive(Debug, Deserialize)]
struct Outline {
    title: String,
    #[serde(default)]
    character: OutlineCharacter,
    #[serde(default)]
    identity_prompt: String,
    #[serde(default)]
    cover_prompt: String,
    pages: Vec<OutlinePage>,
}

#[derive(Debug, Deserialize)]
struct OutlinePage {
    text: String,
    #[serde(default, alias = "image_prompt")]
    art_prompt: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StoryIdea {
    pub title: String,
    pub premise: String,
    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub character_description: String,
}

/// Story text and DNA extraction on top of a `TextService`, with local
/// fallbacks for malformed replies.
pub struct StoryWriter {
    service: Box<dyn TextService>,
}

impl StoryWriter {
    pub fn new(service: Box<dyn TextService>) -> Self {
        Self { service }
    }

    pub async fn generate_structure(&self, story: &StoryConfig) -> Result<StoryBook> {
        info!("Generating story structure...");
        let raw = self
            .service
            .invoke(&TextAction::GenerateStructure(story.clone()))
            .await?;
        let content = unwrap_content(&raw);

        let outline = match serde_json::from_str::<Outline>(&content) {
            Ok(o) if !o.pages.is_empty() => o,
            Ok(_) => {
                warn!("Story structure has no pages, using fallback book");
                return Ok(fallback_book(story));
            }
            Err(e) => {
                warn!("Malformed story structure ({}), using fallback book", e);
                return Ok(fallback_book(story));
            }
        };
        Ok(book_from_outline(story, outline))
    }

    pub async fn generate_idea(&self, story: &StoryConfig) -> Result<StoryIdea> {
        let raw = self
            .service
            .invoke(&TextAction::GenerateIdea {
                setting: story.setting.clone(),
                style: story.style.clone(),
                age_band: story.age_band.clone(),
            })
            .await?;
        let content = unwrap_content(&raw);
        Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Malformed story idea ({}), using fallback", e);
            StoryIdea {
                title: "The Lost Star".to_string(),
                premise: "A curious little fox helps a fallen star find its way back to the sky."
                    .to_string(),
                character_name: "Pip".to_string(),
                character_description: "a small orange fox with a white-tipped tail".to_string(),
            }
        }))
    }

    /// Never fails: extraction errors fall back to `previous`, then to the
    /// default placeholder, so the pipeline keeps moving.
    pub async fn extract_visual_dna(
        &self,
        sheet_url: &str,
        hint: Option<&str>,
        previous: Option<&VisualDna>,
    ) -> VisualDna {
        let action = TextAction::ExtractVisualDna {
            image_url: sheet_url.to_string(),
            hint: hint.map(str::to_string),
        };
        let extracted = match self.service.invoke(&action).await {
            Ok(raw) => VisualDna::parse(&unwrap_content(&raw)),
            Err(e) => {
                warn!("Visual DNA extraction failed: {:#}", e);
                None
            }
        };
        extracted
            .or_else(|| previous.cloned())
            .unwrap_or_else(VisualDna::placeholder)
    }
}

fn identity_for(story: &StoryConfig, prompt: &str) -> Identity {
    let prompt = if prompt.trim().is_empty() {
        story.character_description.trim()
    } else {
        prompt.trim()
    };
    if prompt.is_empty() && story.hero_photo_url.is_none() {
        return Identity::Unlocked;
    }
    let dna_hint = VisualDna::parse(&story.character_description);
    Identity::Requested { prompt: prompt.to_string(), dna_hint }
}

fn base_book(story: &StoryConfig, title: &str) -> StoryBook {
    StoryBook {
        id: story.book_id.clone().unwrap_or_else(|| slugify(title)),
        title: title.to_string(),
        author: story.author.clone(),
        age_band: story.age_band.clone(),
        style: story.style.clone(),
        hero_photo_url: story.hero_photo_url.clone(),
        character_seed: story.seed,
        tier: story.tier,
        environment_ref: story.environment_ref.clone(),
        prop_ref: story.prop_ref.clone(),
        lighting_ref: story.lighting_ref.clone(),
        ..Default::default()
    }
}

fn book_from_outline(story: &StoryConfig, outline: Outline) -> StoryBook {
    let mut book = base_book(story, &outline.title);
    let name = if outline.character.name.trim().is_empty() {
        story.character_name.clone()
    } else {
        outline.character.name
    };
    book.character = Character {
        name,
        descriptor: outline.character.descriptor,
        description: Some(story.character_description.clone()).filter(|d| !d.trim().is_empty()),
    };
    book.identity = identity_for(story, &outline.identity_prompt);
    book.cover_prompt = outline.cover_prompt;
    book.pages = outline
        .pages
        .into_iter()
        .enumerate()
        .map(|(i, p)| StoryPage {
            number: i as u32 + 1,
            text: p.text,
            art_prompt: p.art_prompt,
            ..Default::default()
        })
        .collect();
    book
}

/// Static single-page book used when the text service returns garbage.
pub fn fallback_book(story: &StoryConfig) -> StoryBook {
    let name = if story.character_name.trim().is_empty() {
        "Our hero"
    } else {
        story.character_name.trim()
    };
    let setting = if story.setting.trim().is_empty() {
        "a faraway land"
    } else {
        story.setting.trim()
    };
    let mut book = base_book(story, &format!("{}'s Big Adventure", name));
    book.character = Character {
        name: name.to_string(),
        descriptor: String::new(),
        description: Some(story.character_description.clone()).filter(|d| !d.trim().is_empty()),
    };
    book.identity = identity_for(story, "");
    book.cover_prompt = format!("the hero standing happily in {}", setting);
    book.pages = vec![StoryPage {
        number: 1,
        text: format!(
            "Once upon a time, {} set off to explore {}, and found that every day holds a little magic.",
            name, setting
        ),
        art_prompt: format!("the hero exploring {} with wide, wondering eyes", setting),
        ..Default::default()
    }];
    book
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct MockTextService {
        reply: Result<String, String>,
        actions: Arc<Mutex<Vec<String>>>,
    }

    impl MockTextService {
        fn ok(reply: &str) -> Self {
            Self { reply: Ok(reply.to_string()), actions: Arc::new(Mutex::new(Vec::new())) }
        }
        fn failing() -> Self {
            Self { reply: Err("down".to_string()), actions: Arc::new(Mutex::new(Vec::new())) }
        }
    }

    #[async_trait]
    impl TextService for MockTextService {
        async fn invoke(&self, action: &TextAction) -> Result<String> {
            self.actions.lock().unwrap().push(action.name().to_string());
            self.reply.clone().map_err(|e| anyhow!(e))
        }
    }

    fn story() -> StoryConfig {
        StoryConfig {
            character_name: "Storm".to_string(),
            character_description: "a small blue dragon with a red scarf".to_string(),
            setting: "a cloud kingdom".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_unwrap_openai_envelope() {
        let raw = r#"{"choices":[{"message":{"content":"```json\n{\"a\":1}\n```"}}]}"#;
        assert_eq!(unwrap_content(raw), "{\"a\":1}");
        assert_eq!(unwrap_content("  {\"b\":2} "), "{\"b\":2}");
    }

    #[test]
    fn test_action_wire_shape() {
        let action = TextAction::ExtractVisualDna { image_url: "u".into(), hint: None };
        let v = serde_json::to_value(&action).unwrap();
        assert_eq!(v["action"], "extract-visual-dna");
        assert_eq!(v["payload"]["image_url"], "u");
    }

    #[tokio::test]
    async fn test_malformed_structure_falls_back_to_single_page() {
        let writer = StoryWriter::new(Box::new(MockTextService::ok("Sorry, I can't do JSON today")));
        let mut story = story();
        story.environment_ref = Some("https://cdn/clouds.png".into());
        let book = writer.generate_structure(&story).await.unwrap();
        assert_eq!(book.environment_ref.as_deref(), Some("https://cdn/clouds.png"));
        assert_eq!(book.pages.len(), 1);
        assert_eq!(book.pages[0].number, 1);
        assert!(book.title.contains("Storm"));
        assert!(matches!(book.identity, Identity::Requested { .. }));
    }

    #[tokio::test]
    async fn test_structure_from_wrapped_reply() {
        let content = serde_json::json!({
            "title": "Storm and the Rainbow Bridge",
            "character": {"name": "Storm", "descriptor": "the small blue dragon"},
            "identity_prompt": "a small blue dragon, round belly, red scarf",
            "cover_prompt": "a dragon on a rainbow bridge",
            "pages": [
                {"text": "Storm woke up.", "art_prompt": "waking up in a cloud bed"},
                {"text": "Storm flew.", "art_prompt": "flying over clouds"}
            ]
        })
        .to_string();
        let raw = serde_json::json!({"choices": [{"message": {"content": content}}]}).to_string();

        let writer = StoryWriter::new(Box::new(MockTextService::ok(&raw)));
        let book = writer.generate_structure(&story()).await.unwrap();

        assert_eq!(book.id, "storm-and-the-rainbow-bridge");
        assert_eq!(book.pages.len(), 2);
        assert_eq!(book.pages[1].number, 2);
        assert_eq!(book.character.descriptor, "the small blue dragon");
        assert_eq!(
            book.identity,
            Identity::Requested {
                prompt: "a small blue dragon, round belly, red scarf".into(),
                dna_hint: Some(VisualDna::PlainText("a small blue dragon with a red scarf".into())),
            }
        );
    }

    #[tokio::test]
    async fn test_dna_extraction_fallbacks() {
        let writer = StoryWriter::new(Box::new(MockTextService::failing()));
        let previous = VisualDna::PlainText("a green frog".into());
        assert_eq!(writer.extract_visual_dna("u", None, Some(&previous)).await, previous);
        assert_eq!(writer.extract_visual_dna("u", None, None).await, VisualDna::placeholder());

        let writer = StoryWriter::new(Box::new(MockTextService::ok(r#"{"species": "frog"}"#)));
        let dna = writer.extract_visual_dna("u", None, Some(&previous)).await;
        assert!(matches!(dna, VisualDna::Structured(ref p) if p.species == "frog"));
    }

    #[tokio::test]
    async fn test_idea_fallback() {
        let writer = StoryWriter::new(Box::new(MockTextService::ok("not json")));
        let idea = writer.generate_idea(&story()).await.unwrap();
        assert_eq!(idea.title, "The Lost Star");
    }
}
