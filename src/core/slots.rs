use serde::{Deserialize, Serialize};

pub const SLOT_COUNT: usize = 10;
pub const IDENTITY_SLOTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceRole {
    Identity,
    Style,
    Continuity,
    Environment,
    Prop,
    Lighting,
}

/// Which generation the references are assembled for. Identity is held
/// strictly on the sheet and cover and relaxed on pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Sheet,
    Cover,
    Page,
}

/// Blend weights per role. Empirical values, tuned against the image backbone.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReferenceWeights {
    #[serde(default = "default_identity_strict")]
    pub identity_strict: f64,
    #[serde(default = "default_identity_page")]
    pub identity_page: f64,
    #[serde(default = "default_style")]
    pub style: f64,
    #[serde(default = "default_continuity")]
    pub continuity: f64,
    #[serde(default = "default_environment")]
    pub environment: f64,
    #[serde(default = "default_prop")]
    pub prop: f64,
    #[serde(default = "default_lighting")]
    pub lighting: f64,
}

fn default_identity_strict() -> f64 {
    1.0
}
fn default_identity_page() -> f64 {
    0.6
}
fn default_style() -> f64 {
    0.85
}
fn default_continuity() -> f64 {
    0.7
}
fn default_environment() -> f64 {
    0.9
}
fn default_prop() -> f64 {
    1.0
}
fn default_lighting() -> f64 {
    0.6
}

impl Default for ReferenceWeights {
    fn default() -> Self {
        Self {
            identity_strict: default_identity_strict(),
            identity_page: default_identity_page(),
            style: default_style(),
            continuity: default_continuity(),
            environment: default_environment(),
            prop: default_prop(),
            lighting: default_lighting(),
        }
    }
}

impl ReferenceWeights {
    pub fn weight(&self, role: ReferenceRole, phase: SlotPhase) -> f64 {
        match role {
            ReferenceRole::Identity => match phase {
                SlotPhase::Page => self.identity_page,
                SlotPhase::Sheet | SlotPhase::Cover => self.identity_strict,
            },
            ReferenceRole::Style => self.style,
            ReferenceRole::Continuity => self.continuity,
            ReferenceRole::Environment => self.environment,
            ReferenceRole::Prop => self.prop,
            ReferenceRole::Lighting => self.lighting,
        }
    }
}

/// Named reference images available for one generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceSet {
    pub identity: Option<String>,
    pub style: Option<String>,
    pub continuity: Option<String>,
    pub environment: Option<String>,
    pub prop: Option<String>,
    pub lighting: Option<String>,
}

impl ReferenceSet {
    pub fn with_identity(mut self, url: Option<&str>) -> Self {
        self.identity = url.map(str::to_string);
        self
    }

    pub fn with_style(mut self, url: Option<&str>) -> Self {
        self.style = url.map(str::to_string);
        self
    }

    pub fn with_continuity(mut self, url: Option<&str>) -> Self {
        self.continuity = url.map(str::to_string);
        self
    }

    pub fn with_environment(mut self, url: Option<&str>) -> Self {
        self.environment = url.map(str::to_string);
        self
    }

    pub fn with_prop(mut self, url: Option<&str>) -> Self {
        self.prop = url.map(str::to_string);
        self
    }

    pub fn with_lighting(mut self, url: Option<&str>) -> Self {
        self.lighting = url.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    /// 1-based position in the external request.
    pub position: usize,
    pub role: ReferenceRole,
    pub weight: f64,
    pub url: String,
}

/// Exactly ten positions; `None` marks an empty slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotLayout {
    slots: [Option<Slot>; SLOT_COUNT],
}

fn present(url: &Option<String>) -> Option<&str> {
    url.as_deref().map(str::trim).filter(|u| !u.is_empty())
}

impl SlotLayout {
    pub fn assemble(refs: &ReferenceSet, phase: SlotPhase, weights: &ReferenceWeights) -> Self {
        let mut slots: [Option<Slot>; SLOT_COUNT] = Default::default();

        let mut put = |index: usize, role: ReferenceRole, url: &str| {
            slots[index] = Some(Slot {
                position: index + 1,
                role,
                weight: weights.weight(role, phase),
                url: url.to_string(),
            });
        };

        if let Some(identity) = present(&refs.identity) {
            for i in 0..IDENTITY_SLOTS {
                put(i, ReferenceRole::Identity, identity);
            }
        }
        let singles = [
            (5, ReferenceRole::Style, &refs.style),
            (6, ReferenceRole::Continuity, &refs.continuity),
            (7, ReferenceRole::Environment, &refs.environment),
            (8, ReferenceRole::Prop, &refs.prop),
            (9, ReferenceRole::Lighting, &refs.lighting),
        ];
        for (index, role, url) in singles {
            if let Some(url) = present(url) {
                put(index, role, url);
            }
        }

        Self { slots }
    }

    pub fn slot(&self, position: usize) -> Option<&Slot> {
        position
            .checked_sub(1)
            .and_then(|i| self.slots.get(i))
            .and_then(Option::as_ref)
    }

    /// Filled slots in positional order.
    pub fn filled(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().flatten()
    }

    /// The list sent to the image API: empty slots are dropped, not nulled.
    pub fn packed_urls(&self) -> Vec<String> {
        self.filled().map(|s| s.url.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.filled().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_only_fills_first_five() {
        let refs = ReferenceSet::default().with_identity(Some("https://cdn/sheet.png"));
        let layout = SlotLayout::assemble(&refs, SlotPhase::Cover, &ReferenceWeights::default());

        for pos in 1..=5 {
            let slot = layout.slot(pos).unwrap();
            assert_eq!(slot.url, "https://cdn/sheet.png");
            assert_eq!(slot.weight, 1.0);
        }
        for pos in 6..=10 {
            assert!(layout.slot(pos).is_none());
        }

        let packed = layout.packed_urls();
        assert_eq!(packed.len(), 5);
        assert!(packed.iter().all(|u| u == "https://cdn/sheet.png"));
    }

    #[test]
    fn test_page_layout_weights_and_packing() {
        let refs = ReferenceSet {
            identity: Some("sheet".into()),
            style: Some("cover".into()),
            continuity: None,
            environment: Some("forest".into()),
            prop: Some("  ".into()),
            lighting: Some("dusk".into()),
        };
        let layout = SlotLayout::assemble(&refs, SlotPhase::Page, &ReferenceWeights::default());

        assert_eq!(layout.slot(1).unwrap().weight, 0.6);
        assert_eq!(layout.slot(6).unwrap().weight, 0.85);
        assert!(layout.slot(7).is_none());
        assert_eq!(layout.slot(8).unwrap().weight, 0.9);
        assert!(layout.slot(9).is_none(), "blank url counts as missing");
        assert_eq!(layout.slot(10).unwrap().role, ReferenceRole::Lighting);

        assert_eq!(
            layout.packed_urls(),
            vec!["sheet", "sheet", "sheet", "sheet", "sheet", "cover", "forest", "dusk"]
        );
    }

    #[test]
    fn test_scene_builders_fill_last_three_slots() {
        let refs = ReferenceSet::default()
            .with_environment(Some("castle"))
            .with_prop(Some("lantern"))
            .with_lighting(Some("moonlight"));
        let layout = SlotLayout::assemble(&refs, SlotPhase::Page, &ReferenceWeights::default());

        let filled: Vec<(usize, ReferenceRole, f64)> =
            layout.filled().map(|s| (s.position, s.role, s.weight)).collect();
        assert_eq!(
            filled,
            vec![
                (8, ReferenceRole::Environment, 0.9),
                (9, ReferenceRole::Prop, 1.0),
                (10, ReferenceRole::Lighting, 0.6),
            ]
        );
        assert_eq!(layout.packed_urls(), vec!["castle", "lantern", "moonlight"]);
    }

    #[test]
    fn test_weights_serialize_as_written() {
        let refs = ReferenceSet::default().with_identity(Some("sheet"));
        let layout = SlotLayout::assemble(&refs, SlotPhase::Page, &ReferenceWeights::default());
        let json = serde_json::to_string(layout.slot(1).unwrap()).unwrap();
        assert!(json.contains(r#""weight":0.6"#), "{}", json);
        assert!(!json.contains("0.6000"), "{}", json);
    }

    #[test]
    fn test_empty_set() {
        let layout = SlotLayout::assemble(
            &ReferenceSet::default(),
            SlotPhase::Sheet,
            &ReferenceWeights::default(),
        );
        assert!(layout.is_empty());
        assert!(layout.packed_urls().is_empty());
        assert!(layout.slot(0).is_none());
    }
}
