use crate::core::slots::{ReferenceRole, SlotLayout};
use crate::core::state::StoryBook;
use crate::utils::text::{contains_word_ignore_case, replace_word_ignore_case};
use serde::Serialize;
use serde_json::{json, Value};

/// Fallback descriptors, first one free of any name token wins.
const GENERIC_DESCRIPTORS: [&str; 4] = ["the main character", "the hero", "the little one", "our friend"];

/// Connector words inside names ("Puss in Boots", "Anne of Green Gables")
/// that are left alone.
const NAME_PARTICLES: [&str; 10] = ["the", "a", "an", "of", "in", "and", "de", "la", "le", "von"];

/// Unsafe word → neutral substitute. Whole words, case-insensitive.
const SAFETY_SUBSTITUTIONS: &[(&str, &str)] = &[
    ("kill", "stop"),
    ("killed", "stopped"),
    ("killing", "stopping"),
    ("murder", "mystery"),
    ("blood", "red paint"),
    ("bloody", "messy"),
    ("gun", "water squirter"),
    ("guns", "water squirters"),
    ("knife", "spoon"),
    ("sword", "wooden stick"),
    ("weapon", "tool"),
    ("weapons", "tools"),
    ("dead", "sleeping"),
    ("die", "rest"),
    ("dies", "rests"),
    ("fight", "race"),
    ("fighting", "racing"),
    ("attack", "surprise"),
    ("attacks", "surprises"),
    ("war", "parade"),
    ("explosion", "burst of confetti"),
    ("gore", "mess"),
    ("terrifying", "mysterious"),
    ("horror", "wonder"),
];

/// Replaces known unsafe terms before anything is submitted.
pub fn apply_safety_filter(text: &str) -> String {
    SAFETY_SUBSTITUTIONS
        .iter()
        .fold(text.to_string(), |acc, (bad, good)| replace_word_ignore_case(&acc, bad, good))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    WideShot,
    CloseUp,
    LowAngle,
    HighAngle,
    MidShot,
}

impl Framing {
    /// Rotation: wide, close-up, low/high angle (alternating per cycle), mid shot.
    pub fn for_page(number: u32) -> Self {
        let i = number.saturating_sub(1);
        match i % 4 {
            0 => Framing::WideShot,
            1 => Framing::CloseUp,
            2 => {
                if (i / 4) % 2 == 0 {
                    Framing::LowAngle
                } else {
                    Framing::HighAngle
                }
            }
            _ => Framing::MidShot,
        }
    }

    pub fn instruction(&self) -> &'static str {
        match self {
            Framing::WideShot => "wide establishing shot, character small in a detailed environment",
            Framing::CloseUp => "close-up shot focusing on the character's face and expression",
            Framing::LowAngle => "low-angle shot looking up at the character, heroic perspective",
            Framing::HighAngle => "high-angle shot looking down on the scene",
            Framing::MidShot => "medium shot, character from the waist up interacting with the scene",
        }
    }
}

/// Style tag → prompt vocabulary.
pub fn style_vocabulary(style: &str) -> &'static str {
    match style.trim().to_ascii_lowercase().as_str() {
        "watercolor" | "watercolour" => {
            "soft watercolor children's book illustration, gentle washes, visible paper texture, pastel palette"
        }
        "3d" | "pixar" | "cgi" => {
            "3D animated movie style, soft global illumination, rounded appealing shapes, vibrant colors"
        }
        "anime" | "ghibli" => {
            "hand-drawn anime style, lush painted backgrounds, clean line art, warm natural light"
        }
        "clay" | "claymation" => {
            "claymation style, handcrafted plasticine textures, miniature set, soft studio light"
        }
        "pencil" | "sketch" => {
            "colored pencil illustration, visible strokes, warm paper tone, cozy storybook feel"
        }
        "flat" | "vector" => "flat vector illustration, bold simple shapes, limited bright palette",
        _ => "classic children's picture book illustration, warm colors, friendly shapes",
    }
}

/// What an image request carries as its instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptPayload {
    Text(String),
    Structured(Value),
}

impl PromptPayload {
    /// Wire form: plain text as-is, structured as a JSON string.
    pub fn render(&self) -> String {
        match self {
            PromptPayload::Text(s) => s.clone(),
            PromptPayload::Structured(v) => v.to_string(),
        }
    }
}

/// Turns the proper name into a generic descriptor wherever it appears.
/// Multi-word names are also scrubbed token by token, so "Storm Whisker"
/// never leaks as "Storm" or "Whisker".
#[derive(Debug, Clone)]
pub struct SubjectAnchor {
    name: String,
    tokens: Vec<String>,
    descriptor: String,
}

fn name_tokens(name: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for raw in name.split_whitespace() {
        let token = raw.trim_matches(|c: char| !c.is_alphanumeric());
        if token.is_empty()
            || token == name
            || NAME_PARTICLES.contains(&token.to_lowercase().as_str())
            || tokens.iter().any(|t| t.eq_ignore_ascii_case(token))
        {
            continue;
        }
        tokens.push(token.to_string());
    }
    tokens
}

fn mentions(text: &str, word: &str) -> bool {
    contains_word_ignore_case(text, word) || text.contains(word)
}

/// Whole-word pass, then a verbatim pass for leftovers inside longer words
/// when `word` has at least `min_verbatim` characters.
fn replace_everywhere(text: &str, word: &str, replacement: &str, min_verbatim: usize) -> String {
    let out = replace_word_ignore_case(text, word, replacement);
    if word.chars().count() >= min_verbatim && out.contains(word) {
        out.replace(word, replacement)
    } else {
        out
    }
}

impl SubjectAnchor {
    pub fn new(name: &str, descriptor: &str) -> Self {
        let name = name.trim().to_string();
        let tokens = name_tokens(&name);
        let names_it = |text: &str| {
            !name.is_empty() && (mentions(text, &name) || tokens.iter().any(|t| mentions(text, t)))
        };
        let descriptor = descriptor.trim();
        let descriptor = if descriptor.is_empty() || names_it(descriptor) {
            GENERIC_DESCRIPTORS
                .into_iter()
                .find(|d| !names_it(*d))
                .unwrap_or(GENERIC_DESCRIPTORS[0])
                .to_string()
        } else {
            descriptor.to_string()
        };
        Self { name, tokens, descriptor }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Full name first, then each token; whole-word case-insensitive, then
    /// any verbatim leftover.
    pub fn deidentify(&self, text: &str) -> String {
        if self.name.is_empty() {
            return text.to_string();
        }
        let mut out = replace_everywhere(text, &self.name, &self.descriptor, 1);
        // Very short tokens would hit too many unrelated words verbatim.
        for token in &self.tokens {
            out = replace_everywhere(&out, token, &self.descriptor, 3);
        }
        out
    }
}

pub struct PromptComposer<'a> {
    book: &'a StoryBook,
    anchor: SubjectAnchor,
}

impl<'a> PromptComposer<'a> {
    pub fn new(book: &'a StoryBook) -> Self {
        Self {
            book,
            anchor: SubjectAnchor::new(&book.character.name, &book.character.descriptor),
        }
    }

    /// De-identifies every string in a structured payload.
    fn scrub(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.anchor.deidentify(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.scrub(v)),
            Value::Object(map) => map.values_mut().for_each(|v| self.scrub(v)),
            _ => {}
        }
    }

    pub fn anchor(&self) -> &SubjectAnchor {
        &self.anchor
    }

    /// DNA first; then the descriptor plus any user description.
    pub fn subject_text(&self) -> String {
        let raw = match self.book.identity.dna() {
            Some(dna) => dna.anchor_text(),
            None => match self.book.character.description.as_deref().map(str::trim) {
                Some(desc) if !desc.is_empty() => format!("{}, {}", self.anchor.descriptor(), desc),
                _ => self.anchor.descriptor().to_string(),
            },
        };
        self.anchor.deidentify(&raw)
    }

    fn references(layout: &SlotLayout) -> Vec<Value> {
        layout
            .filled()
            .map(|s| json!({ "slot": s.position, "role": s.role, "weight": s.weight }))
            .collect()
    }

    fn reference_note(layout: &SlotLayout) -> Option<&'static str> {
        let has = |role| layout.filled().any(|s| s.role == role);
        if has(ReferenceRole::Identity) {
            Some("Match the character exactly to the identity reference images: same species, face, proportions, outfit and colors.")
        } else {
            None
        }
    }

    /// Plain text. Neutral background, multiple angles, nothing else in frame.
    pub fn sheet_prompt(&self, identity_prompt: &str, layout: &SlotLayout) -> PromptPayload {
        let subject = self.anchor.deidentify(&apply_safety_filter(identity_prompt));
        let mut prompt = format!(
            "{style}. Character reference sheet of {subject}. \
             Layout: front view, side view, back view, three-quarter view and a close-up of the face, \
             all of the same character, evenly spaced. \
             Plain pure white background, neutral even studio lighting. \
             No environment, no scenery, no ground, no props, no other characters, no text or labels.",
            style = style_vocabulary(&self.book.style),
            subject = subject,
        );
        if self.book.hero_photo_url.is_some() && !layout.is_empty() {
            prompt.push_str(
                " Reinterpret the person in the reference photo in this art style; keep their recognisable features, do not copy the photo.",
            );
        } else if let Some(note) = Self::reference_note(layout) {
            prompt.push(' ');
            prompt.push_str(note);
        }
        PromptPayload::Text(prompt)
    }

    /// Structured. Wide, full body, a single scene.
    pub fn cover_prompt(&self, layout: &SlotLayout) -> PromptPayload {
        let scene = self.anchor.deidentify(&apply_safety_filter(&self.book.cover_prompt));
        let mut value = json!({
            "type": "book_cover",
            "style": style_vocabulary(&self.book.style),
            "subject": self.subject_text(),
            "scene": scene,
            "framing": "wide distant shot, the full body of the character visible from head to toe, centered in one continuous scene",
            "composition": "single illustration with space at the top for a title",
            "constraints": [
                "not a character sheet",
                "no grid, no multiple views, no panels, no split frames",
                "no text, no letters, no watermark"
            ],
            "reference_guidance": Self::reference_note(layout),
            "references": Self::references(layout),
        });
        self.scrub(&mut value);
        PromptPayload::Structured(value)
    }

    /// Structured. The framing rotates with the page number.
    pub fn page_prompt(&self, page_number: u32, art_prompt: &str, layout: &SlotLayout) -> PromptPayload {
        let framing = Framing::for_page(page_number);
        let action = self.anchor.deidentify(&apply_safety_filter(art_prompt));
        let mut value = json!({
            "type": "story_page",
            "page": page_number,
            "style": style_vocabulary(&self.book.style),
            "subject": self.subject_text(),
            "action": action,
            "framing": framing,
            "camera": framing.instruction(),
            "constraints": [
                "same character design as the references in every detail",
                "single scene, no panels",
                "no text, no letters, no watermark"
            ],
            "reference_guidance": Self::reference_note(layout),
            "references": Self::references(layout),
        });
        self.scrub(&mut value);
        PromptPayload::Structured(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dna::VisualDna;
    use crate::core::slots::{ReferenceSet, ReferenceWeights, SlotPhase};
    use crate::core::state::{Character, Identity};

    fn book(name: &str, descriptor: &str) -> StoryBook {
        StoryBook {
            id: "b".into(),
            title: "T".into(),
            style: "watercolor".into(),
            character: Character {
                name: name.into(),
                descriptor: descriptor.into(),
                description: None,
            },
            identity: Identity::Locked {
                prompt: "p".into(),
                sheet_url: "https://cdn/sheet.png".into(),
                dna: VisualDna::PlainText(format!("{} is a small blue dragon with a red scarf", name)),
            },
            cover_prompt: format!("{} standing on a hill", name),
            ..Default::default()
        }
    }

    fn page_layout() -> SlotLayout {
        let refs = ReferenceSet::default()
            .with_identity(Some("https://cdn/sheet.png"))
            .with_style(Some("https://cdn/cover.png"));
        SlotLayout::assemble(&refs, SlotPhase::Page, &ReferenceWeights::default())
    }

    #[test]
    fn test_name_never_in_page_prompt() {
        for name in ["Storm", "Sunny", "Rain", "Luna", "Élodie"] {
            let b = book(name, "the small blue dragon");
            let composer = PromptComposer::new(&b);
            let art = format!("{n} dances with {n}'s friends; {n}ish clouds and {n}y skies", n = name);
            for page in 1..=6 {
                let prompt = composer.page_prompt(page, &art, &page_layout()).render();
                assert!(!prompt.contains(name), "{} leaked into: {}", name, prompt);
                assert!(prompt.contains("the small blue dragon"));
            }
        }
    }

    #[test]
    fn test_descriptor_containing_name_is_replaced() {
        let b = book("Blue", "Blue the dragon");
        let composer = PromptComposer::new(&b);
        assert_eq!(composer.anchor().descriptor(), "the main character");
        let prompt = composer.page_prompt(1, "Blue flies", &page_layout()).render();
        assert!(!prompt.contains("Blue"));
    }

    #[test]
    fn test_multiword_name_tokens_never_leak() {
        let b = book("Storm Whisker", "the little dragon");
        let composer = PromptComposer::new(&b);
        assert_eq!(composer.anchor().descriptor(), "the little dragon");

        let art = "Storm flies over the castle while Whisker waves; STORM lands and whisker's tail curls";
        for page in 1..=4 {
            let prompt = composer.page_prompt(page, art, &page_layout()).render();
            for part in ["Storm", "Whisker", "STORM", "whisker"] {
                assert!(!prompt.contains(part), "{} leaked into: {}", part, prompt);
            }
            assert!(prompt.contains("the little dragon flies over the castle"));
        }
        let cover = composer.cover_prompt(&page_layout()).render();
        assert!(!cover.contains("Storm") && !cover.contains("Whisker"));
    }

    #[test]
    fn test_descriptor_naming_one_token_is_replaced() {
        let anchor = SubjectAnchor::new("Storm Whisker", "Whisker the dragon");
        assert_eq!(anchor.descriptor(), "the main character");
        assert_eq!(anchor.deidentify("Whisker sings"), "the main character sings");

        // Every fallback that mentions a token is skipped.
        let anchor = SubjectAnchor::new("Main Character", "");
        assert_eq!(anchor.descriptor(), "the hero");

        // Particles are not name tokens.
        let anchor = SubjectAnchor::new("Puss in Boots", "the clever cat");
        assert_eq!(anchor.deidentify("Boots hides in the barn"), "the clever cat hides in the barn");
    }

    #[test]
    fn test_framing_rotation_never_repeats_adjacent() {
        let seq: Vec<Framing> = (1..=12).map(Framing::for_page).collect();
        assert_eq!(
            &seq[..5],
            &[
                Framing::WideShot,
                Framing::CloseUp,
                Framing::LowAngle,
                Framing::MidShot,
                Framing::WideShot
            ]
        );
        assert_eq!(seq[6], Framing::HighAngle);
        for pair in seq.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_sheet_prompt_forces_neutral_multi_view() {
        let b = book("Storm", "the small blue dragon");
        let composer = PromptComposer::new(&b);
        let layout = SlotLayout::assemble(&ReferenceSet::default(), SlotPhase::Sheet, &ReferenceWeights::default());
        let PromptPayload::Text(prompt) = composer.sheet_prompt("Storm, a blue dragon", &layout) else {
            panic!("sheet prompt must be plain text");
        };
        assert!(prompt.contains("white background"));
        assert!(prompt.contains("front view"));
        assert!(prompt.contains("back view"));
        assert!(prompt.contains("No environment"));
        assert!(!prompt.contains("Storm"));
    }

    #[test]
    fn test_cover_prompt_is_wide_and_gridless() {
        let b = book("Storm", "the small blue dragon");
        let composer = PromptComposer::new(&b);
        let refs = ReferenceSet::default().with_identity(Some("https://cdn/sheet.png"));
        let layout = SlotLayout::assemble(&refs, SlotPhase::Cover, &ReferenceWeights::default());
        let PromptPayload::Structured(v) = composer.cover_prompt(&layout) else {
            panic!("cover prompt must be structured");
        };
        assert!(v["framing"].as_str().unwrap().contains("full body"));
        assert!(v["constraints"].to_string().contains("no grid"));
        assert_eq!(v["references"].as_array().unwrap().len(), 5);
        assert_eq!(v["references"][0]["weight"], 1.0);
    }

    #[test]
    fn test_safety_filter() {
        assert_eq!(
            apply_safety_filter("The knight draws a Sword to KILL the dragon"),
            "The knight draws a wooden stick to stop the dragon"
        );
        let b = book("Storm", "the small blue dragon");
        let composer = PromptComposer::new(&b);
        let prompt = composer.page_prompt(2, "a fight with blood everywhere", &page_layout()).render();
        assert!(!prompt.contains("blood"));
        assert!(prompt.contains("race with red paint everywhere"));
    }

    #[test]
    fn test_subject_prefers_dna_over_description() {
        let mut b = book("Storm", "the small blue dragon");
        b.character.description = Some("un dragon bleu".into());
        let composer = PromptComposer::new(&b);
        let subject = composer.subject_text();
        assert!(subject.contains("small blue dragon with a red scarf"));
        assert!(!subject.contains("bleu"));

        b.identity = Identity::Unlocked;
        let composer = PromptComposer::new(&b);
        assert_eq!(composer.subject_text(), "the small blue dragon, un dragon bleu");
    }
}
