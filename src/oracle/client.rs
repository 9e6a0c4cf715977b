//! Plan/text generation via an OpenAI-compatible chat completion endpoint.

use crate::oracle::{parse_plan, Oracle, PlanDraft};
use crate::types::WorldContext;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// HTTP oracle speaking the chat-completions wire format.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    base_url: String,
    api_key: String,
    model: String,
    fallback_model: String,
    max_tokens: u32,
    http: reqwest::Client,
}

// -- Wire types -------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<MessagePayload<'a>>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct MessagePayload<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl HttpOracle {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        fallback_model: &str,
        max_tokens: u32,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            fallback_model: fallback_model.to_string(),
            max_tokens,
            http: reqwest::Client::new(),
        }
    }

    /// Call the primary model; fall back to the cheaper model on failure.
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        match self.chat_with(&self.model, system, user).await {
            Ok(reply) => Ok(reply),
            Err(e) if !self.fallback_model.is_empty() && self.fallback_model != self.model => {
                warn!(
                    "Oracle model {} failed, retrying with {}: {e}",
                    self.model, self.fallback_model
                );
                self.chat_with(&self.fallback_model, system, user).await
            }
            Err(e) => Err(e),
        }
    }

    async fn chat_with(&self, model: &str, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = ChatRequest {
            model,
            messages: vec![
                MessagePayload {
                    role: "system",
                    content: system,
                },
                MessagePayload {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: 0.8,
        };

        debug!("Oracle request to model: {model}");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Oracle request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Oracle call failed ({status}): {body}");
        }

        let body: ChatResponse = resp
            .json()
            .await
            .context("Failed to parse oracle response")?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("Oracle returned no content")
    }
}

/// Render the world context as prose for the model.
fn render_context(name: &str, context: &WorldContext, cycle: u64) -> String {
    let mut out = format!(
        "You lead the cult '{}' (treasury {:.2}, followers {}, record {}W/{}L). Cycle {cycle}.\n",
        name, context.own.treasury, context.own.followers, context.own.wins, context.own.losses,
    );
    if let Some(alliance) = &context.active_alliance {
        let partner = alliance.partner_of(context.own.cult_id).unwrap_or(-1);
        out.push_str(&format!("You hold an active alliance with cult {partner}.\n"));
    }
    out.push_str(&format!("Your instincts: {}.\n", context.traits_digest));
    out.push_str(&format!("History: {}\n", context.memory_digest));
    if let Some(counsel) = &context.counsel {
        out.push_str(&format!("Your advisors counsel: {counsel}.\n"));
    }
    out.push_str("Rival cults:\n");
    for rival in &context.rivals {
        out.push_str(&format!(
            "- id {} '{}': treasury {:.2}, followers {}, record {}W/{}L\n",
            rival.cult_id, rival.name, rival.treasury, rival.followers, rival.wins, rival.losses,
        ));
    }
    out
}

const PLAN_INSTRUCTIONS: &str = r#"
Reply with a single JSON object:
{"objective": "...", "horizon": "short|medium|long", "rationale": "...",
 "steps": [{"type": "raid|ally|betray|bribe|recruit|govern|coup|leak|meme|talk_public|talk_private|wait|idle",
            "target": <cult id, if applicable>, "amount": <number, for bribe>,
            "message": "<text, where applicable>"}]}
Give between 2 and 5 steps, ordered by execution."#;

#[async_trait]
impl Oracle for HttpOracle {
    async fn generate_plan(
        &self,
        prompt: &str,
        name: &str,
        context: &WorldContext,
        cycle: u64,
    ) -> Result<PlanDraft> {
        let user = format!(
            "{}\nProduce your next action plan.{}",
            render_context(name, context, cycle),
            PLAN_INSTRUCTIONS
        );
        let reply = self.chat(prompt, &user).await?;
        parse_plan(&reply)
    }

    async fn generate_prophecy(
        &self,
        prompt: &str,
        name: &str,
        context: &WorldContext,
    ) -> Result<String> {
        let user = format!(
            "{}\nProclaim a short prophecy (one or two sentences) your followers will rally behind.",
            render_context(name, context, 0)
        );
        self.chat(prompt, &user).await
    }

    async fn generate_scripture(
        &self,
        prompt: &str,
        name: &str,
        context: &WorldContext,
    ) -> Result<String> {
        let user = format!(
            "{}\nWrite a short verse of scripture in your cult's voice.",
            render_context(name, context, 0)
        );
        self.chat(prompt, &user).await
    }
}
