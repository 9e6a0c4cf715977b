pub mod client;

pub use client::HttpOracle;

use crate::types::{RawStep, WorldContext};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A plan as drafted by the language model, before shaping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanDraft {
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub horizon: String,
    #[serde(default)]
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub rationale: String,
}

/// The plan/text generation capability. Consumed as an opaque collaborator;
/// tests inject scripted implementations.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn generate_plan(
        &self,
        prompt: &str,
        name: &str,
        context: &WorldContext,
        cycle: u64,
    ) -> Result<PlanDraft>;

    async fn generate_prophecy(&self, prompt: &str, name: &str, context: &WorldContext)
        -> Result<String>;

    async fn generate_scripture(
        &self,
        prompt: &str,
        name: &str,
        context: &WorldContext,
    ) -> Result<String>;
}

/// Pull the first JSON object out of a model reply, tolerating fenced code
/// blocks and surrounding prose.
pub fn extract_json(text: &str) -> Result<&str> {
    let trimmed = text.trim();
    let inner = if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        }
    } else {
        trimmed
    };

    let start = inner.find('{').context("No JSON object in model reply")?;
    let end = inner.rfind('}').context("Unterminated JSON object in model reply")?;
    Ok(&inner[start..=end])
}

/// Parse a model reply into a plan draft.
pub fn parse_plan(text: &str) -> Result<PlanDraft> {
    let json = extract_json(text)?;
    serde_json::from_str(json).context("Model reply is not a valid plan")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_bare_json_plan() {
        let reply = r#"{"objective": "expand", "horizon": "short", "rationale": "weak rivals",
            "steps": [{"type": "raid", "target": 3}, {"type": "talk_public", "message": "fear us"}]}"#;
        let draft = parse_plan(reply).unwrap();
        assert_eq!(draft.objective, "expand");
        assert_eq!(draft.steps.len(), 2);
        assert_eq!(draft.steps[0].step_type, "raid");
        assert_eq!(draft.steps[0].target, Some(3));
    }

    #[test]
    fn parses_a_fenced_plan_with_prose() {
        let reply = "Here is my plan:\n```json\n{\"objective\": \"survive\", \"steps\": [{\"type\": \"wait\"}]}\n```\nGood luck.";
        let draft = parse_plan(reply).unwrap();
        assert_eq!(draft.objective, "survive");
        assert_eq!(draft.steps.len(), 1);
    }

    #[test]
    fn rejects_a_reply_with_no_json() {
        assert!(parse_plan("I refuse to plan today.").is_err());
    }
}
