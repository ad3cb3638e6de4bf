use crate::utils::text::strip_code_blocks;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Used when no DNA could be extracted and none was supplied.
pub const DEFAULT_DNA: &str =
    "a friendly storybook character with a consistent shape, face, outfit and color palette";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnaProfile {
    #[serde(default)]
    pub species: String,
    #[serde(default, alias = "distinguishing_features")]
    pub features: Vec<String>,
    #[serde(default)]
    pub clothing: String,
    #[serde(default, alias = "colors")]
    pub palette: Vec<String>,
}

impl DnaProfile {
    fn is_empty(&self) -> bool {
        self.species.trim().is_empty()
            && self.features.is_empty()
            && self.clothing.trim().is_empty()
            && self.palette.is_empty()
    }
}

/// Canonical English description of a character's fixed look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VisualDna {
    PlainText(String),
    Structured(DnaProfile),
}

impl VisualDna {
    /// Parses a text-service reply. JSON objects with recognised fields become
    /// `Structured`, a JSON string or anything else non-empty becomes
    /// `PlainText`. Blank input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let clean = strip_code_blocks(raw);
        let clean = clean.trim();
        if clean.is_empty() {
            return None;
        }

        match serde_json::from_str::<Value>(clean) {
            Ok(Value::Object(map)) => {
                let inner = map
                    .get("visual_dna")
                    .or_else(|| map.get("dna"))
                    .cloned()
                    .unwrap_or(Value::Object(map));
                match inner {
                    Value::String(s) => Self::parse(&s),
                    other => match serde_json::from_value::<DnaProfile>(other.clone()) {
                        Ok(profile) if !profile.is_empty() => Some(VisualDna::Structured(profile)),
                        _ => Some(VisualDna::PlainText(other.to_string())),
                    },
                }
            }
            Ok(Value::String(s)) if !s.trim().is_empty() => {
                Some(VisualDna::PlainText(s.trim().to_string()))
            }
            Ok(Value::String(_)) | Ok(Value::Null) => None,
            _ => Some(VisualDna::PlainText(clean.to_string())),
        }
    }

    pub fn placeholder() -> Self {
        VisualDna::PlainText(DEFAULT_DNA.to_string())
    }

    /// Subject anchor text for prompts.
    pub fn anchor_text(&self) -> String {
        match self {
            VisualDna::PlainText(s) => s.trim().to_string(),
            VisualDna::Structured(p) => {
                let mut parts = Vec::new();
                if !p.species.trim().is_empty() {
                    parts.push(p.species.trim().to_string());
                }
                if !p.features.is_empty() {
                    parts.push(format!("with {}", p.features.join(", ")));
                }
                if !p.clothing.trim().is_empty() {
                    parts.push(format!("wearing {}", p.clothing.trim()));
                }
                if !p.palette.is_empty() {
                    parts.push(format!("color palette: {}", p.palette.join(", ")));
                }
                parts.join("; ")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured() {
        let raw = r#"```json
        {"species": "small blue dragon", "features": ["round belly", "tiny wings"], "clothing": "red scarf", "palette": ["cobalt", "crimson"]}
        ```"#;
        let dna = VisualDna::parse(raw).unwrap();
        match &dna {
            VisualDna::Structured(p) => assert_eq!(p.species, "small blue dragon"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            dna.anchor_text(),
            "small blue dragon; with round belly, tiny wings; wearing red scarf; color palette: cobalt, crimson"
        );
    }

    #[test]
    fn test_parse_nested_string() {
        let dna = VisualDna::parse(r#"{"visual_dna": "a tall giraffe in a yellow raincoat"}"#).unwrap();
        assert_eq!(dna, VisualDna::PlainText("a tall giraffe in a yellow raincoat".into()));
    }

    #[test]
    fn test_parse_plain_and_blank() {
        assert_eq!(
            VisualDna::parse("a fluffy white cat").unwrap(),
            VisualDna::PlainText("a fluffy white cat".into())
        );
        assert!(VisualDna::parse("   ").is_none());
        assert!(VisualDna::parse("\"\"").is_none());
    }

    #[test]
    fn test_unknown_object_kept_as_text() {
        let dna = VisualDna::parse(r#"{"mood": "happy"}"#).unwrap();
        assert!(matches!(dna, VisualDna::PlainText(ref s) if s.contains("happy")));
    }
}
