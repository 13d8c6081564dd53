//! LLM service used by the orchestration layer.
//!
//! Three calls: a summary of retrieved records for a query, an answer to a
//! free-form question grounded in retrieved records, and a short summary of
//! one regulation. Only retrieval context is supplied; prompt construction
//! stays minimal. When the service is disabled or a call fails, callers fall
//! back to the records' own text ([`raw_summary`]).

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::models::RegulationRecord;

/// Records included in a single prompt.
const MAX_CONTEXT_RECORDS: usize = 10;

const SYSTEM_PROMPT: &str =
    "You are an expert in FDA Title 21 regulations. Summarize only what the provided regulations say.";

#[async_trait]
pub trait LlmService: Send + Sync {
    fn name(&self) -> &str;

    /// Summarize `records` as they relate to `query`.
    async fn summarize(&self, query: &str, records: &[RegulationRecord]) -> Result<String>;

    /// Answer `question` from `records`. The reply follows the
    /// `ANSWER: ... REFERENCES: ...` layout read by [`parse_answer`].
    async fn answer(&self, question: &str, records: &[RegulationRecord]) -> Result<String>;

    /// Two or three sentences on what one regulation covers.
    async fn summarize_record(&self, record: &RegulationRecord) -> Result<String>;
}

/// Always errors; the orchestrator falls back to raw descriptions.
pub struct DisabledLlm;

#[async_trait]
impl LlmService for DisabledLlm {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn summarize(&self, _query: &str, _records: &[RegulationRecord]) -> Result<String> {
        bail!("LLM service is disabled")
    }

    async fn answer(&self, _question: &str, _records: &[RegulationRecord]) -> Result<String> {
        bail!("LLM service is disabled")
    }

    async fn summarize_record(&self, _record: &RegulationRecord) -> Result<String> {
        bail!("LLM service is disabled")
    }
}

/// Chat-completions client. Requires `OPENAI_API_KEY`.
pub struct OpenAiLlm {
    model: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

impl OpenAiLlm {
    /// One chat completion with retry on 429, 5xx and network errors.
    async fn chat(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": 0.3,
            "max_tokens": max_tokens,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_chat_response(&json);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => last_err = Some(e.into()),
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("chat completion failed after retries")))
    }
}

#[async_trait]
impl LlmService for OpenAiLlm {
    fn name(&self) -> &str {
        &self.model
    }

    async fn summarize(&self, query: &str, records: &[RegulationRecord]) -> Result<String> {
        let prompt = format!(
            "Question: {}\n\nRelevant regulations:\n{}\n\nSummarize what these regulations require, \
             referencing parts where relevant. Say so if the information is limited.",
            query,
            build_context(records)
        );
        self.chat(&prompt, 500).await
    }

    async fn answer(&self, question: &str, records: &[RegulationRecord]) -> Result<String> {
        let prompt = format!(
            "Answer the question based on the provided regulations.\n\n\
             Question: {}\n\nRelevant regulations:\n{}\n\n\
             Give a direct answer, reference specific parts where relevant and note if the \
             information is limited. Format the response as:\n\
             ANSWER: [your answer]\nREFERENCES: [one part or section per line]",
            question,
            build_context(records)
        );
        self.chat(&prompt, 500).await
    }

    async fn summarize_record(&self, record: &RegulationRecord) -> Result<String> {
        let content: String = record
            .content_summary
            .as_deref()
            .unwrap_or("None")
            .chars()
            .take(2000)
            .collect();
        let prompt = format!(
            "Regulation: {} {}\nDescription: {}\nURL: {}\nContent: {}\n\n\
             Provide a concise, clear summary (2-3 sentences) of what this regulation covers \
             and its key requirements.",
            record.part, record.section_range, record.description, record.source_url, content
        );
        self.chat(&prompt, 200).await
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing message content"))?;
    let content = content.trim();
    if content.is_empty() {
        bail!("Invalid chat response: empty message content");
    }
    Ok(content.to_string())
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledLlm)),
        "openai" => Ok(Box::new(OpenAiLlm::new(config)?)),
        other => bail!("Unknown LLM provider: '{}'", other),
    }
}

/// Numbered context block, one entry per record.
pub fn build_context(records: &[RegulationRecord]) -> String {
    if records.is_empty() {
        return "No relevant regulations found.".to_string();
    }
    records
        .iter()
        .take(MAX_CONTEXT_RECORDS)
        .enumerate()
        .map(|(i, r)| {
            let mut locator = Vec::new();
            if !r.chapter.is_empty() {
                locator.push(format!("Chapter: {}", r.chapter));
            }
            if !r.subchapter.is_empty() {
                locator.push(format!("Subchapter: {}", r.subchapter));
            }
            if !r.part.is_empty() {
                locator.push(format!("Part: {}", r.part));
            }
            format!(
                "{}. {}\n   Description: {}\n   Status: {}",
                i + 1,
                locator.join(" | "),
                r.description,
                r.status
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split a reply into the answer text and its reference lines. A reply
/// without the `ANSWER:` marker is taken whole.
pub fn parse_answer(reply: &str) -> (String, Vec<String>) {
    let (body, references) = match reply.split_once("REFERENCES:") {
        Some((body, refs)) => (
            body,
            refs.lines()
                .map(|l| l.trim().trim_start_matches(['-', '*']).trim())
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        None => (reply, Vec::new()),
    };
    let answer = match body.split_once("ANSWER:") {
        Some((_, answer)) => answer,
        None => body,
    };
    (answer.trim().to_string(), references)
}

/// Summary used when no LLM is available: the descriptions, unmodified.
pub fn raw_summary(records: &[RegulationRecord]) -> String {
    records
        .iter()
        .map(|r| r.description.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
