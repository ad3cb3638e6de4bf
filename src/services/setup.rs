use crate::core::config::{Config, StoryConfig, StoryLength};
use crate::services::text::{StoryIdea, StoryWriter};
use anyhow::{anyhow, Result};
use inquire::{Select, Text};

const STYLES: &[&str] = &["watercolor", "3d", "anime", "clay", "pencil", "flat"];

const OWN_CHARACTER: &str = "Describe my own character";
const SUGGEST_CHARACTER: &str = "Let the storyteller suggest one";

pub async fn run_setup(config: &mut Config, writer: &StoryWriter) -> Result<()> {
    if config.story.is_complete() {
        return Ok(());
    }
    if config.unattended {
        return Err(anyhow!(
            "story.character_name and story.setting must be set in config.yml when running unattended"
        ));
    }

    if config.story.character_name.trim().is_empty() {
        let choice = Select::new(
            "Who is the hero of this story?",
            vec![OWN_CHARACTER, SUGGEST_CHARACTER],
        )
        .prompt()?;
        if choice == SUGGEST_CHARACTER {
            let idea = writer.generate_idea(&config.story).await?;
            println!("How about \"{}\"? {}", idea.title, idea.premise);
            apply_idea(&mut config.story, &idea);
        } else {
            config.story.character_name = Text::new("Character name:").prompt()?.trim().to_string();
            config.story.character_description =
                Text::new("What do they look like?").prompt()?.trim().to_string();
        }
    }

    if config.story.setting.trim().is_empty() {
        config.story.setting = Text::new("Where does the story happen?")
            .with_default("a faraway land")
            .prompt()?
            .trim()
            .to_string();
    }

    let style = Select::new("Art style:", STYLES.to_vec())
        .with_starting_cursor(style_cursor(&config.story.style))
        .prompt()?;
    config.story.style = style.to_string();

    let lengths = vec![StoryLength::Short, StoryLength::Medium, StoryLength::Long];
    let labels: Vec<String> = lengths
        .iter()
        .map(|l| format!("{:?} ({} pages)", l, l.page_count()))
        .collect();
    let picked = Select::new("Story length:", labels.clone())
        .with_starting_cursor(1)
        .prompt()?;
    if let Some(i) = labels.iter().position(|l| *l == picked) {
        config.story.length = lengths[i];
    }

    config.save()?;
    println!("Configuration saved.");
    Ok(())
}

/// Fills only what the user left blank.
fn apply_idea(story: &mut StoryConfig, idea: &StoryIdea) {
    if story.character_name.trim().is_empty() {
        story.character_name = idea.character_name.clone();
    }
    if story.character_description.trim().is_empty() {
        story.character_description = idea.character_description.clone();
    }
}

fn style_cursor(style: &str) -> usize {
    STYLES
        .iter()
        .position(|s| s.eq_ignore_ascii_case(style.trim()))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_idea_keeps_user_fields() {
        let mut story = StoryConfig {
            character_description: "a tall giraffe in a yellow raincoat".into(),
            ..Default::default()
        };
        let idea = StoryIdea {
            title: "T".into(),
            premise: "P".into(),
            character_name: "Pip".into(),
            character_description: "a small orange fox".into(),
        };
        apply_idea(&mut story, &idea);
        assert_eq!(story.character_name, "Pip");
        assert_eq!(story.character_description, "a tall giraffe in a yellow raincoat");
    }

    #[test]
    fn test_style_cursor() {
        assert_eq!(style_cursor("Anime"), 2);
        assert_eq!(style_cursor("oil painting"), 0);
    }
}
