use std::io::{BufRead, BufReader};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use easel_contracts::prompts::PromptPair;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

use crate::error::truncate_text;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

const SYSTEM_PROMPT: &str = "You write prompts for a diffusion image model.
Expand the user's short request into a detailed, comma separated positive prompt
(subject, composition, lighting, style, camera, quality tags) and a negative prompt
listing artefacts to avoid. Stay within what the user asked for.
You may think first inside <think></think>.
Reply with exactly:
<positive_prompt>...</positive_prompt>
<negative_prompt>...</negative_prompt>";

/// Turns a short user request into a (positive, negative) prompt pair.
///
/// Implementations forward partial output to `sink` as it arrives; a
/// non-streaming implementation calls it once with the whole reply.
pub trait PromptExpander: Send + Sync {
    fn name(&self) -> &str;
    fn expand(&self, prompt_text: &str, sink: &mut dyn FnMut(&str)) -> Result<PromptPair>;
}

/// Streams `/api/chat` from a local Ollama server.
pub struct OllamaExpander {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl OllamaExpander {
    pub fn new(api_base: &str, model: &str) -> Result<Self> {
        Ok(Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            model: model.trim().to_string(),
            http: http_client()?,
        })
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/api/chat", self.api_base)
    }
}

impl PromptExpander for OllamaExpander {
    fn name(&self) -> &str {
        "ollama"
    }

    fn expand(&self, prompt_text: &str, sink: &mut dyn FnMut(&str)) -> Result<PromptPair> {
        let endpoint = self.chat_endpoint();
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({
                "model": self.model,
                "messages": chat_messages(prompt_text),
                "stream": true,
            }))
            .send()
            .with_context(|| format!("Ollama request failed ({endpoint})"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "Ollama request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }

        let mut reply = String::new();
        for line in BufReader::new(response).lines() {
            let line = line.context("Ollama stream read failed")?;
            if line.trim().is_empty() {
                continue;
            }
            let row: Value = serde_json::from_str(&line)
                .with_context(|| format!("Ollama returned invalid stream line: {line}"))?;
            if let Some(message) = row.get("error").and_then(Value::as_str) {
                bail!("Ollama error: {message}");
            }
            if let Some(chunk) = row.pointer("/message/content").and_then(Value::as_str) {
                if !chunk.is_empty() {
                    sink(chunk);
                    reply.push_str(chunk);
                }
            }
            if row.get("done").and_then(Value::as_bool) == Some(true) {
                break;
            }
        }
        parse_prompt_pair(&reply)
    }
}

/// Any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiExpander {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl OpenAiExpander {
    pub fn new(api_base: &str, api_key: Option<String>, model: &str) -> Result<Self> {
        Ok(Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key: api_key
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            model: model.trim().to_string(),
            http: http_client()?,
        })
    }
}

impl PromptExpander for OpenAiExpander {
    fn name(&self) -> &str {
        "openai"
    }

    fn expand(&self, prompt_text: &str, sink: &mut dyn FnMut(&str)) -> Result<PromptPair> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("OpenAI-compatible expander requires an API key");
        };
        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "messages": chat_messages(prompt_text),
                "stream": false,
            }))
            .send()
            .with_context(|| format!("chat completion request failed ({endpoint})"))?;
        let payload = response_json_or_error("chat completion", response)?;
        let reply = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("chat completion response had no message content"))?;
        sink(reply);
        parse_prompt_pair(reply)
    }
}

/// Deterministic offline expander; streams its reply word by word.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryrunExpander;

impl PromptExpander for DryrunExpander {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn expand(&self, prompt_text: &str, sink: &mut dyn FnMut(&str)) -> Result<PromptPair> {
        let text = prompt_text.trim();
        if text.is_empty() {
            bail!("cannot expand an empty prompt");
        }
        let reply = format!(
            "<positive_prompt>{text}, masterpiece, best quality, highly detailed, soft light</positive_prompt>\n\
             <negative_prompt>worst quality, low quality, blurry, watermark, text</negative_prompt>"
        );
        for word in reply.split_inclusive(' ') {
            sink(word);
        }
        parse_prompt_pair(&reply)
    }
}

/// Extracts the tagged prompt pair from a model reply, ignoring any
/// `<think>` section.
pub fn parse_prompt_pair(reply: &str) -> Result<PromptPair> {
    let visible = strip_think(reply);
    let positive = extract_tag(&visible, "positive_prompt")
        .ok_or_else(|| anyhow!("reply is missing a <positive_prompt> block"))?;
    let negative = extract_tag(&visible, "negative_prompt")
        .ok_or_else(|| anyhow!("reply is missing a <negative_prompt> block"))?;
    if positive.is_empty() {
        bail!("reply has an empty <positive_prompt> block");
    }
    Ok(PromptPair::new(positive, negative))
}

fn strip_think(reply: &str) -> String {
    let mut out = String::with_capacity(reply.len());
    let mut rest = reply;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].trim().to_string())
}

fn chat_messages(prompt_text: &str) -> Value {
    json!([
        {"role": "system", "content": SYSTEM_PROMPT},
        {"role": "user", "content": prompt_text},
    ])
}

pub(crate) fn http_client() -> Result<HttpClient> {
    HttpClient::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

pub(crate) fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!("{label} request failed ({code}): {}", truncate_text(&body, 512));
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON payload"))?;
    Ok(parsed)
}
