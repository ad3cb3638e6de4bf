pub mod billing;
pub mod image;
pub mod llm;
pub mod prompt;
pub mod setup;
pub mod text;
pub mod workflow;
