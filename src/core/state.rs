use crate::core::dna::VisualDna;
use crate::core::phase::BookPhase;
use crate::core::seed::deserialize_lenient_seed;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Standard,
    Premium,
}

/// The protagonist as prompts see it. `descriptor` is what replaces `name` in
/// every art prompt.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub descriptor: String,
    /// Free text from the user. Only used when no Visual DNA exists.
    #[serde(default)]
    pub description: Option<String>,
}

/// Replaces the nullable `identity_prompt` / `character_sheet_url` pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Identity {
    #[default]
    Unlocked,
    Requested {
        prompt: String,
        #[serde(default)]
        dna_hint: Option<VisualDna>,
    },
    Locked {
        prompt: String,
        sheet_url: String,
        dna: VisualDna,
    },
}

impl Identity {
    pub fn sheet_url(&self) -> Option<&str> {
        match self {
            Identity::Locked { sheet_url, .. } => Some(sheet_url),
            _ => None,
        }
    }

    pub fn dna(&self) -> Option<&VisualDna> {
        match self {
            Identity::Locked { dna, .. } => Some(dna),
            Identity::Requested { dna_hint, .. } => dna_hint.as_ref(),
            Identity::Unlocked => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StoryPage {
    pub number: u32,
    pub text: String,
    #[serde(default)]
    pub art_prompt: String,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Overrides the book's environment reference for this page.
    #[serde(default)]
    pub environment_ref: Option<String>,
}

impl StoryPage {
    pub fn scene_environment(&self) -> Option<&str> {
        self.environment_ref.as_deref().filter(|u| !u.trim().is_empty())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StoryBook {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub age_band: String,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub character: Character,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub hero_photo_url: Option<String>,
    #[serde(default)]
    pub cover_prompt: String,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_seed")]
    pub character_seed: Option<u64>,
    #[serde(default)]
    pub tier: Tier,
    /// Optional scene references for slots 8 to 10 of page requests.
    #[serde(default)]
    pub environment_ref: Option<String>,
    #[serde(default)]
    pub prop_ref: Option<String>,
    #[serde(default)]
    pub lighting_ref: Option<String>,
    #[serde(default)]
    pub pages: Vec<StoryPage>,
}

impl StoryBook {
    /// Resting phase derived from the record.
    pub fn phase(&self) -> BookPhase {
        if matches!(self.identity, Identity::Requested { .. }) {
            return BookPhase::NoIdentity;
        }
        if self.cover_image.is_none() {
            return BookPhase::SheetReady;
        }
        let remaining = self.missing_pages().len();
        if remaining == 0 {
            BookPhase::Complete
        } else if remaining == self.pages.len() {
            BookPhase::CoverReady
        } else {
            BookPhase::PagesPending { remaining }
        }
    }

    pub fn missing_pages(&self) -> Vec<u32> {
        self.pages
            .iter()
            .filter(|p| p.image_url.is_none())
            .map(|p| p.number)
            .collect()
    }

    pub fn page(&self, number: u32) -> Option<&StoryPage> {
        self.pages.iter().find(|p| p.number == number)
    }

    pub fn page_mut(&mut self, number: u32) -> Option<&mut StoryPage> {
        self.pages.iter_mut().find(|p| p.number == number)
    }

    /// Image of the page immediately before `number`, if it has one yet.
    pub fn previous_page_image(&self, number: u32) -> Option<&str> {
        number
            .checked_sub(1)
            .and_then(|prev| self.page(prev))
            .and_then(|p| p.image_url.as_deref())
    }

    /// Sorts pages and renumbers them 1..=n.
    pub fn normalize_pages(&mut self) {
        self.pages.sort_by_key(|p| p.number);
        for (i, page) in self.pages.iter_mut().enumerate() {
            page.number = i as u32 + 1;
        }
    }
}

/// Global per-account state: energy and onboarding flags.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct AccountState {
    pub balance: u64,
    #[serde(default)]
    pub processed_events: BTreeSet<String>,
    #[serde(default)]
    pub seen_guides: BTreeSet<String>,
}
