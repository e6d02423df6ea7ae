//! Classifier backed by an OpenAI-compatible chat completion endpoint.
//!
//! Each chunk sample is sent as one request listing the sampled rows. The
//! model answers with a JSON object of per-row labels:
//!
//! ```json
//! {"rows": [{"row": 12, "main": "Office Supplies", "sub": "Pens", "item": "Gel Pen"}]}
//! ```
//!
//! Rows the model leaves out are assigned later by label matching. Transport
//! and parse failures surface as [`GroupingError::Extractor`], which the
//! pipeline turns into a failed chunk.

use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::extractor::{sample_item_name, Classifier, LabelTriple};
use crate::sampler::ChunkSample;
use crate::{GroupingError, Result};

const MAX_RETRIES: u32 = 2;

/// Endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClassifierConfig {
    /// Full URL of the chat completions endpoint.
    /// Default: https://api.openai.com/v1/chat/completions
    pub endpoint: String,

    /// Bearer token. Empty sends no Authorization header.
    pub api_key: String,

    /// Default: gpt-4
    pub model: String,

    /// Default: 0.2
    pub temperature: f32,

    /// Default: 2500
    pub max_tokens: u32,

    /// Per-request HTTP timeout.
    /// Default: 30 s
    pub request_timeout_secs: u64,
}

impl Default for HttpClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "gpt-4".to_string(),
            temperature: 0.2,
            max_tokens: 2500,
            request_timeout_secs: 30,
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct RowLabels {
    rows: Vec<RowLabel>,
}

#[derive(Debug, Deserialize)]
struct RowLabel {
    row: usize,
    main: String,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    item: Option<String>,
}

const SYSTEM_PROMPT: &str = "You are a product categorization specialist. \
Group rows by core product type into main groups and sub-groups. \
Ignore brands, colours, sizes and packaging. Reuse the same label for the same kind of product.";

/// Build the user prompt for one chunk sample.
fn build_prompt(sample: &ChunkSample) -> String {
    let mut prompt = format!(
        "Columns: {}\nLabel each row below with a main group, a sub-group and a short item name.\n\nRows:\n",
        sample.columns.join(", ")
    );
    for row in &sample.sample {
        prompt.push_str(&format!("{}: {}\n", row.row, row.values.join(" | ")));
    }
    prompt.push_str(
        "\nReturn only JSON: {\"rows\": [{\"row\": <row number>, \"main\": \"...\", \"sub\": \"...\", \"item\": \"...\"}]}",
    );
    prompt
}

/// Extract the outermost JSON object from a model reply and convert it to triples.
fn parse_reply(sample: &ChunkSample, reply: &str) -> Result<Vec<LabelTriple>> {
    let parse_error = |message: String| GroupingError::Extractor {
        chunk_index: sample.chunk_index,
        message,
    };

    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &reply[s..=e],
        _ => return Err(parse_error("no JSON object in reply".to_string())),
    };
    let labels: RowLabels =
        serde_json::from_str(json).map_err(|e| parse_error(format!("bad reply: {}", e)))?;

    Ok(labels
        .rows
        .into_iter()
        .filter(|l| !l.main.trim().is_empty())
        .filter_map(|l| {
            let sampled = sample.sample.iter().find(|s| s.row == l.row)?;
            let item_name = match l.item.as_deref().map(str::trim) {
                Some(item) if !item.is_empty() => item.to_string(),
                _ => sample_item_name(sample, sampled),
            };
            Some(LabelTriple {
                row: l.row,
                main_label: l.main.trim().to_string(),
                sub_label: l
                    .sub
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                item_name,
            })
        })
        .collect())
}

/// Chat-completion classifier.
pub struct HttpClassifier {
    config: HttpClassifierConfig,
    client: Client,
}

impl HttpClassifier {
    pub fn new(config: HttpClassifierConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GroupingError::Dataset(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn complete(&self, chunk_index: usize, prompt: String) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let fail = |message: String| GroupingError::Extractor {
            chunk_index,
            message,
        };

        let mut retries = 0;
        loop {
            let mut builder = self.client.post(&self.config.endpoint).json(&request);
            if !self.config.api_key.is_empty() {
                builder = builder.bearer_auth(&self.config.api_key);
            }

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS && retries < MAX_RETRIES {
                        retries += 1;
                        let backoff = Duration::from_millis(1000 * (1 << retries));
                        warn!(
                            "[HttpClassifier] 429 for chunk {}, retry {} after {:?}",
                            chunk_index, retries, backoff
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    if !status.is_success() {
                        return Err(fail(format!("HTTP {}", status)));
                    }

                    let body: ChatResponse = resp
                        .json()
                        .await
                        .map_err(|e| fail(format!("Parse error: {}", e)))?;
                    return body
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| fail("empty completion".to_string()));
                }
                Err(e) if retries < MAX_RETRIES && !e.is_timeout() => {
                    retries += 1;
                    let backoff = Duration::from_millis(500 * (1 << retries));
                    warn!(
                        "[HttpClassifier] Error for chunk {}: {}, retry {} after {:?}",
                        chunk_index, e, retries, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(fail(format!("Request error: {}", e))),
            }
        }
    }
}

impl Classifier for HttpClassifier {
    fn classify(&self, sample: &ChunkSample) -> Result<Vec<LabelTriple>> {
        if sample.sample.is_empty() {
            return Ok(Vec::new());
        }

        // Create a runtime for this call; classify runs on extractor threads
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| GroupingError::Extractor {
                chunk_index: sample.chunk_index,
                message: format!("Runtime error: {}", e),
            })?;

        let reply = rt.block_on(self.complete(sample.chunk_index, build_prompt(sample)))?;
        debug!(
            "[HttpClassifier] Chunk {} reply: {} chars",
            sample.chunk_index,
            reply.len()
        );
        parse_reply(sample, &reply)
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ResolvedColumns;
    use crate::sampler::SampleRow;

    fn sample() -> ChunkSample {
        ChunkSample {
            chunk_index: 3,
            rows: 10..13,
            columns: vec!["Product".into(), "Price".into()],
            roles: ResolvedColumns {
                item_name: Some(0),
                ..Default::default()
            },
            sample: vec![
                SampleRow {
                    row: 10,
                    values: vec!["Gel Pen Blue".into(), "1.20".into()],
                },
                SampleRow {
                    row: 12,
                    values: vec!["A4 Paper".into(), "4.00".into()],
                },
            ],
        }
    }

    #[test]
    fn test_prompt_lists_sampled_rows() {
        let prompt = build_prompt(&sample());
        assert!(prompt.contains("Columns: Product, Price"));
        assert!(prompt.contains("10: Gel Pen Blue | 1.20"));
        assert!(prompt.contains("12: A4 Paper | 4.00"));
    }

    #[test]
    fn test_parse_reply_with_surrounding_text() {
        let reply = r#"Sure! {"rows": [
            {"row": 10, "main": "Office Supplies", "sub": "Pens", "item": "Gel Pen"},
            {"row": 12, "main": "Office Supplies", "sub": ""},
            {"row": 99, "main": "Ghost", "sub": "Row"},
            {"row": 11, "main": "  "}
        ]} Hope this helps."#;
        let triples = parse_reply(&sample(), reply).unwrap();

        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0].item_name, "Gel Pen");
        assert_eq!(triples[0].sub_label.as_deref(), Some("Pens"));
        assert_eq!(triples[1].row, 12);
        assert_eq!(triples[1].sub_label, None);
        assert_eq!(triples[1].item_name, "A4 Paper");
    }

    #[test]
    fn test_parse_reply_without_json_fails() {
        let err = parse_reply(&sample(), "I cannot help with that").unwrap_err();
        assert!(matches!(err, GroupingError::Extractor { chunk_index: 3, .. }));
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: HttpClassifierConfig =
            serde_json::from_str(r#"{"model": "gpt-4o-mini", "api_key": "k"}"#).unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.max_tokens, 2500);
        assert!(config.endpoint.ends_with("/chat/completions"));
    }
}
