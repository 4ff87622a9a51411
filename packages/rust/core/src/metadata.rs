//! Semantic name and description generation for one bookmark.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use markwise_shared::{GeneratedMetadata, MarkwiseError, Result, ScrapeResult};

use crate::llm::{CompletionRequest, LlmClient, complete_json};
use crate::retry::RetryPolicy;

/// Page text beyond this is cut before prompting.
pub const MAX_PROMPT_CONTENT_CHARS: usize = 8_000;
pub const MAX_NAME_CHARS: usize = 80;
pub const MAX_DESCRIPTION_CHARS: usize = 200;

const MAX_REPLY_TOKENS: u32 = 300;

const SYSTEM_PROMPT: &str = "You name and describe web bookmarks. \
Always answer with a single JSON object of the form \
{\"name\": string, \"description\": string} and nothing else.";

#[derive(Debug, Deserialize)]
struct RawMetadata {
    name: String,
    description: String,
}

/// Turns a scrape into a [`GeneratedMetadata`] through the LLM.
pub struct MetadataGenerator {
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
}

impl MetadataGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    /// Generate metadata for `scrape`. `original_title` is the bookmark's
    /// existing display name, given to the model as a hint.
    ///
    /// A reply that is still invalid after one repair prompt is a
    /// [`MarkwiseError::Schema`] error.
    #[instrument(skip_all, fields(url = %scrape.url, title_only = scrape.title_only))]
    pub async fn generate(
        &self,
        original_title: &str,
        scrape: &ScrapeResult,
        cancel: &CancellationToken,
    ) -> Result<GeneratedMetadata> {
        let request = CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(original_title, scrape),
            max_tokens: MAX_REPLY_TOKENS,
        };

        let reply = complete_json(
            self.llm.as_ref(),
            &self.retry,
            &request,
            parse_metadata,
            cancel,
        )
        .await?;
        let raw = reply.parsed?;

        debug!(tokens = reply.tokens_used, name = %raw.name, "metadata generated");

        Ok(GeneratedMetadata {
            url: scrape.url.clone(),
            name: raw.name,
            description: raw.description,
            cost_units: reply.tokens_used,
            title_only: scrape.title_only,
        })
    }
}

fn build_prompt(original_title: &str, scrape: &ScrapeResult) -> String {
    let mut prompt = String::new();
    prompt.push_str("Write a concise name and a one-sentence description for this bookmark.\n");
    prompt.push_str(&format!(
        "The name must be at most {MAX_NAME_CHARS} characters and the description at most {MAX_DESCRIPTION_CHARS}.\n\n"
    ));
    prompt.push_str(&format!("URL: {}\n", scrape.url));
    if !original_title.trim().is_empty() {
        prompt.push_str(&format!("Bookmark title: {}\n", original_title.trim()));
    }
    if !scrape.source_title.is_empty() {
        prompt.push_str(&format!("Page title: {}\n", scrape.source_title));
    }

    if scrape.title_only {
        prompt.push_str(
            "\nThe page content could not be retrieved. Work from the URL and titles only.\n",
        );
    } else {
        let content: String = scrape.text.chars().take(MAX_PROMPT_CONTENT_CHARS).collect();
        prompt.push_str("\nPage content:\n");
        prompt.push_str(&content);
        prompt.push('\n');
    }
    prompt
}

fn parse_metadata(text: &str) -> Result<RawMetadata> {
    let raw: RawMetadata = serde_json::from_str(text)
        .map_err(|e| MarkwiseError::schema(format!("expected {{name, description}}: {e}")))?;

    let name = raw.name.trim();
    let description = raw.description.trim();
    if name.is_empty() {
        return Err(MarkwiseError::schema("name is empty"));
    }
    if description.is_empty() {
        return Err(MarkwiseError::schema("description is empty"));
    }

    Ok(RawMetadata {
        name: cap_chars(name, MAX_NAME_CHARS),
        description: cap_chars(description, MAX_DESCRIPTION_CHARS),
    })
}

fn cap_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].trim_end().to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedLlm, fast_retry, reply};

    fn scrape(title_only: bool) -> ScrapeResult {
        ScrapeResult {
            url: "https://docs.rs/tokio".into(),
            text: if title_only { "tokio".into() } else { "An async runtime for Rust.".into() },
            source_title: "tokio".into(),
            title_only,
        }
    }

    fn generator(llm: ScriptedLlm) -> (Arc<ScriptedLlm>, MetadataGenerator) {
        let llm = Arc::new(llm);
        (llm.clone(), MetadataGenerator::new(llm, fast_retry()))
    }

    #[tokio::test]
    async fn generates_from_page_content() {
        let (llm, generator) = generator(ScriptedLlm::sequence(vec![Ok(reply(
            r#"{"name":"Tokio docs","description":"API reference for the Tokio runtime."}"#,
            42,
        ))]));

        let out = generator
            .generate("tokio - Rust", &scrape(false), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.name, "Tokio docs");
        assert_eq!(out.cost_units, 42);
        assert!(!out.title_only);

        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("URL: https://docs.rs/tokio"));
        assert!(prompt.contains("Bookmark title: tokio - Rust"));
        assert!(prompt.contains("An async runtime for Rust."));
    }

    #[tokio::test]
    async fn title_only_scrape_is_flagged_in_prompt_and_output() {
        let (llm, generator) = generator(ScriptedLlm::sequence(vec![Ok(reply(
            r#"{"name":"Tokio","description":"Async runtime."}"#,
            5,
        ))]));

        let out = generator
            .generate("", &scrape(true), &CancellationToken::new())
            .await
            .unwrap();

        assert!(out.title_only);
        assert!(llm.prompts()[0].contains("could not be retrieved"));
        assert!(!llm.prompts()[0].contains("Bookmark title"));
    }

    #[tokio::test]
    async fn long_fields_are_capped() {
        let long = "x".repeat(500);
        let body = serde_json::json!({ "name": long, "description": long }).to_string();
        let (_, generator) = generator(ScriptedLlm::sequence(vec![Ok(reply(&body, 1))]));

        let out = generator
            .generate("", &scrape(false), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.name.chars().count(), MAX_NAME_CHARS);
        assert_eq!(out.description.chars().count(), MAX_DESCRIPTION_CHARS);
    }

    #[tokio::test]
    async fn empty_name_is_repaired() {
        let (llm, generator) = generator(ScriptedLlm::sequence(vec![
            Ok(reply(r#"{"name":"  ","description":"d"}"#, 3)),
            Ok(reply(r#"{"name":"Fixed","description":"d"}"#, 4)),
        ]));

        let out = generator
            .generate("", &scrape(false), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.name, "Fixed");
        assert_eq!(out.cost_units, 7);
        assert!(llm.prompts()[1].contains("name is empty"));
    }

    #[tokio::test]
    async fn persistent_schema_violation_fails() {
        let (llm, generator) = generator(ScriptedLlm::sequence(vec![
            Ok(reply(r#"{"title":"wrong key"}"#, 1)),
            Ok(reply(r#"{"title":"still wrong"}"#, 1)),
        ]));

        let err = generator
            .generate("", &scrape(false), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "schema");
        assert_eq!(llm.calls(), 2);
    }

    #[test]
    fn prompt_content_is_bounded() {
        let mut s = scrape(false);
        s.text = "y".repeat(MAX_PROMPT_CONTENT_CHARS * 2);
        let prompt = build_prompt("", &s);
        assert!(prompt.chars().filter(|c| *c == 'y').count() <= MAX_PROMPT_CONTENT_CHARS);
    }

    #[test]
    fn cap_respects_char_boundaries() {
        assert_eq!(cap_chars("héllo wörld", 5), "héllo");
        assert_eq!(cap_chars("short", 80), "short");
    }
}
