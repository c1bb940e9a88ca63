//! Optional LLM-backed classifier.
//!
//! Structured-output call to a chat-completions API with a strict
//! tool/function schema; the whole batch falls back to the heuristic
//! classifier on any parse/schema/transport/timeout failure. Enabled via the
//! `OPENAI_API_KEY`/`LLM_MODEL` environment variables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::config::Config;
use crate::model::{Classification, ClassificationSource, DjTags, ExtractedInfo, ItemKind, GENRES, VIBES};
use crate::services::rate_limiter::{ApiRateLimiter, RetryConfig, retry_async};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const TEMPERATURE: f64 = 0.2;

const TITLE_MAX: usize = 220;
const UPLOADER_MAX: usize = 120;
const DESCRIPTION_MAX: usize = 800;
const TAGS_MAX: usize = 25;
const CATEGORIES_MAX: usize = 8;

pub struct LlmClassifier {
    config: Arc<Config>,
    client: reqwest::Client,
    limiter: ApiRateLimiter,
    retry_config: RetryConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f64,
    messages: Vec<ChatMessage>,
    tools: Vec<ToolSpec>,
    tool_choice: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ToolSpec {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionSpec,
}

#[derive(Debug, Serialize)]
struct FunctionSpec {
    name: &'static str,
    description: &'static str,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: ToolCallFunction,
}

#[derive(Debug, Deserialize)]
struct ToolCallFunction {
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ClassifyArguments {
    results: Vec<RawLlmResult>,
}

#[derive(Debug, Deserialize)]
struct RawLlmResult {
    id: String,
    kind: ItemKind,
    genre: Option<String>,
    energy: Option<String>,
    time: Option<String>,
    vibe: Option<String>,
    confidence: f64,
    notes: Option<String>,
}

impl LlmClassifier {
    pub fn new(config: Arc<Config>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client for LLM classifier");
        LlmClassifier {
            config,
            client,
            limiter: ApiRateLimiter::for_llm(),
            retry_config: RetryConfig {
                max_retries: 2,
                ..RetryConfig::default()
            },
        }
    }

    pub fn is_available(&self) -> bool {
        self.config.openai_api_key.is_some() && self.config.llm_model.is_some()
    }

    /// `classify(items) -> Classification[]`. Returns `None` if the LLM is
    /// unavailable or any part of the request/parse fails, signalling the
    /// caller to fall back to the heuristic classifier for the whole batch.
    pub async fn classify(
        &self,
        items: &[(String, String, ExtractedInfo)],
    ) -> Option<Vec<(String, Classification)>> {
        let api_key = self.config.openai_api_key.as_ref()?;
        let model = self.config.llm_model.as_ref()?;

        match self.try_classify(api_key, model, items).await {
            Ok(results) => Some(results),
            Err(e) => {
                warn!(error = %e, "LLM classification failed; falling back to heuristic classifier");
                None
            }
        }
    }

    async fn try_classify(
        &self,
        api_key: &str,
        model: &str,
        items: &[(String, String, ExtractedInfo)],
    ) -> Result<Vec<(String, Classification)>> {
        let request = ChatRequest {
            model: model.to_string(),
            temperature: TEMPERATURE,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt(),
                },
                ChatMessage {
                    role: "user",
                    content: user_payload(items)?,
                },
            ],
            tools: vec![classify_tool_spec()],
            tool_choice: json!({"type": "function", "function": {"name": "classify_dj_tags"}}),
        };

        let parsed: ChatResponse = retry_async("llm-classify", &self.retry_config, || async {
            self.limiter.wait().await;
            let response = self
                .client
                .post("https://api.openai.com/v1/chat/completions")
                .bearer_auth(api_key)
                .json(&request)
                .send()
                .await
                .context("failed to send LLM classification request")?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("LLM API error {status}: {body}");
            }

            response.json::<ChatResponse>().await.context("failed to parse LLM chat-completions response")
        })
        .await?;

        let tool_call = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.tool_calls.into_iter().next())
            .context("LLM response contained no tool call")?;

        let args: ClassifyArguments = serde_json::from_str(&tool_call.function.arguments)
            .context("failed to parse classify_dj_tags tool-call arguments")?;

        let mut by_id: std::collections::HashMap<String, RawLlmResult> =
            args.results.into_iter().map(|r| (r.id.clone(), r)).collect();

        Ok(items
            .iter()
            .map(|(id, _, _)| {
                let classification = match by_id.remove(id) {
                    Some(raw) => raw.into_classification(),
                    None => Classification {
                        kind: ItemKind::Unknown,
                        tags: DjTags::default(),
                        confidence: 0.0,
                        notes: "No classification returned.".to_string(),
                        source: ClassificationSource::Llm,
                    },
                };
                (id.clone(), classification)
            })
            .collect())
    }
}

impl RawLlmResult {
    fn into_classification(self) -> Classification {
        Classification {
            kind: self.kind,
            tags: DjTags {
                genre: self.genre.unwrap_or_default(),
                energy: self.energy.unwrap_or_default(),
                time: self.time.unwrap_or_default(),
                vibe: self.vibe.unwrap_or_default(),
            },
            confidence: self.confidence.clamp(0.0, 1.0),
            notes: self.notes.unwrap_or_default(),
            source: ClassificationSource::Llm,
        }
    }
}

/// Built once from the fixed `GENRES`/`VIBES` taxonomies rather than
/// reformatted on every `classify` call.
static SYSTEM_PROMPT: Lazy<String> = Lazy::new(|| {
    format!(
        "You classify DJ source media into {{kind, tags: {{genre, energy, time, vibe}}, confidence, notes}}.\n\
         Allowed genres: {genres}.\n\
         Allowed energies: 1/5, 2/5, 3/5, 4/5, 5/5, or empty.\n\
         Allowed times: Warmup, Peak, Closing, or empty.\n\
         Allowed vibes (comma-joined subset): {vibes}.\n\
         Rules: map \"Techno\" or \"Melodic Techno\" mentions to \"Melodic House & Techno\" only when the \
         source explicitly uses that combined phrase; tutorials are kind=video even if they contain a demo \
         mix; unknown fields are returned as null, never guessed; if extracted info is missing or empty, \
         return kind=unknown, confidence=0, and note the fetch error in notes.",
        genres = GENRES.join(", "),
        vibes = VIBES.join(", "),
    )
});

fn system_prompt() -> String {
    SYSTEM_PROMPT.clone()
}

fn user_payload(items: &[(String, String, ExtractedInfo)]) -> Result<String> {
    let projected: Vec<_> = items
        .iter()
        .map(|(id, url, info)| {
            json!({
                "id": id,
                "url": url,
                "title": truncate(info.title.as_deref(), TITLE_MAX),
                "uploader": truncate(info.uploader.as_deref(), UPLOADER_MAX),
                "description": truncate(info.description.as_deref(), DESCRIPTION_MAX),
                "tags": info.tags.iter().take(TAGS_MAX).collect::<Vec<_>>(),
                "categories": info.categories.iter().take(CATEGORIES_MAX).collect::<Vec<_>>(),
            })
        })
        .collect();
    serde_json::to_string(&projected).context("failed to serialize LLM user payload")
}

fn truncate(s: Option<&str>, max: usize) -> String {
    let s = s.unwrap_or_default();
    if s.len() > max {
        s[..max].to_string()
    } else {
        s.to_string()
    }
}

fn classify_tool_spec() -> ToolSpec {
    ToolSpec {
        kind: "function",
        function: FunctionSpec {
            name: "classify_dj_tags",
            description: "Return DJ classification for each submitted item, in the same order as given ids.",
            parameters: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "results": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "additionalProperties": false,
                            "properties": {
                                "id": {"type": "string"},
                                "kind": {"type": "string", "enum": ["track", "set", "podcast", "video", "unknown"]},
                                "genre": {"type": ["string", "null"], "enum": GENRES.iter().map(|g| serde_json::Value::String(g.to_string())).chain(std::iter::once(serde_json::Value::Null)).collect::<Vec<_>>()},
                                "energy": {"type": ["string", "null"], "enum": ["1/5", "2/5", "3/5", "4/5", "5/5", "", null]},
                                "time": {"type": ["string", "null"], "enum": ["Warmup", "Peak", "Closing", "", null]},
                                "vibe": {"type": ["string", "null"]},
                                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                                "notes": {"type": ["string", "null"]},
                            },
                            "required": ["id", "kind", "confidence"],
                        },
                    },
                },
                "required": ["results"],
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_without_key_or_model() {
        let config = Arc::new(Config {
            port: 8787,
            inbox_dir: "./inbox".to_string(),
            extractor_path: None,
            ffmpeg_path: None,
            fpcalc_path: None,
            extractor_cookies_from_browser: None,
            extractor_cookies_path: None,
            acoustid_key: None,
            musicbrainz_ua: "test".to_string(),
            openai_api_key: None,
            llm_model: None,
            default_max_concurrent: 3,
            default_preset: crate::model::ProcessingPreset::default(),
        });
        assert!(!LlmClassifier::new(config).is_available());
    }

    #[test]
    fn truncate_respects_max_len() {
        assert_eq!(truncate(Some(&"x".repeat(10)), 5).len(), 5);
    }
}
