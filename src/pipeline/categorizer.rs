//! LLM categorizer: prompt the model, parse its JSON, or fall back.
//!
//! [`LlmCategorizer::categorize`] always returns a valid classification.
//! Backend errors, unparseable output and answers outside the taxonomy all
//! collapse into the fallback category with priority `low`, the reason kept
//! in `analysis`. There are no retries here.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::config::{HeuristicsConfig, SorterConfig, Taxonomy};
use crate::llm::{ChatMessage, CompletionRequest, FinishReason, LlmProvider};
use crate::pipeline::sanitizer::truncate_chars;
use crate::pipeline::types::{ClassificationResult, ClassificationSource, Email, Priority};

/// Deterministic output for classification.
const CATEGORIZE_TEMPERATURE: f32 = 0.0;

/// Upper bound on recovery attempts for a truncated object.
const MAX_RECOVERY_STEPS: usize = 200;

/// Calls the model for emails no heuristic claimed.
pub struct LlmCategorizer {
    llm: Arc<dyn LlmProvider>,
    taxonomy: Taxonomy,
    fallback_category: String,
    system_prompt: String,
    prompt_body_chars: usize,
    max_tokens: u32,
}

impl LlmCategorizer {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &SorterConfig) -> Self {
        Self {
            llm,
            system_prompt: build_system_prompt(&config.taxonomy, &config.heuristics),
            taxonomy: config.taxonomy.clone(),
            fallback_category: config.fallback_category().to_string(),
            prompt_body_chars: config.prompt_body_chars,
            max_tokens: config.llm_max_tokens,
        }
    }

    /// Classify one email. Never fails.
    pub async fn categorize(&self, email: &Email, sanitized_body: &str) -> ClassificationResult {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(build_user_prompt(email, sanitized_body, self.prompt_body_chars)),
        ])
        .with_temperature(CATEGORIZE_TEMPERATURE)
        .with_max_tokens(self.max_tokens);

        let response = match self.llm.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    id = %email.id,
                    model = self.llm.model_name(),
                    error = %e,
                    "LLM call failed, falling back"
                );
                return self.fallback(format!("LLM call failed: {e}"));
            }
        };

        if response.finish_reason == FinishReason::Length {
            debug!(id = %email.id, "LLM output hit the token limit, attempting recovery");
        }

        match parse_classification(&response.content, &self.taxonomy) {
            Ok(result) => {
                info!(
                    id = %email.id,
                    category = %result.label(),
                    priority = result.priority.as_str(),
                    "Categorized by model"
                );
                result
            }
            Err(reason) => {
                warn!(
                    id = %email.id,
                    raw_response = %truncate_chars(&response.content, 300),
                    error = %reason,
                    "Unusable LLM response, falling back"
                );
                self.fallback(format!("LLM response rejected: {reason}"))
            }
        }
    }

    /// The safe default classification.
    pub fn fallback(&self, reason: impl Into<String>) -> ClassificationResult {
        ClassificationResult {
            category: self.fallback_category.clone(),
            sub_category: None,
            priority: Priority::Low,
            analysis: reason.into(),
            sender_goal: String::new(),
            source: ClassificationSource::Fallback,
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the categorization system prompt.
pub fn build_system_prompt(taxonomy: &Taxonomy, heuristics: &HeuristicsConfig) -> String {
    let mut prompt = String::with_capacity(2048);

    prompt.push_str(
        "You are an email categorization engine for a busy professional. \
         The email to categorize is given as JSON inside <email> tags.\n\n",
    );

    prompt.push_str("Categories, in decision order (pick the first one that fits):\n");
    for (i, category) in taxonomy.categories().iter().enumerate() {
        if category.description.is_empty() {
            prompt.push_str(&format!("{}. {}\n", i + 1, category.name));
        } else {
            prompt.push_str(&format!("{}. {}: {}\n", i + 1, category.name, category.description));
        }
    }

    let mut context = Vec::new();
    if let Some(boss) = &heuristics.boss_email {
        context.push(format!("- Boss: {boss}"));
    }
    if let Some(domain) = &heuristics.company_domain {
        context.push(format!("- Company domain: {domain}"));
    }
    if !heuristics.management_emails.is_empty() {
        context.push(format!("- Management: {}", heuristics.management_emails.join(", ")));
    }
    if !heuristics.direct_report_emails.is_empty() {
        context.push(format!(
            "- Direct reports: {}",
            heuristics.direct_report_emails.join(", ")
        ));
    }
    if !context.is_empty() {
        prompt.push_str("\nOrganisation:\n");
        prompt.push_str(&context.join("\n"));
        prompt.push('\n');
    }

    prompt.push_str(
        "\nRules:\n\
         - Use the subject, body, addresses and importance\n\
         - Mail from management or direct reports that needs a decision is Action\n\
         - Emojis in the subject and business development pitches usually mean Junk\n\
         - subCategory is optional, one short name (a sender, brand or topic), never a path\n\
         - priority is exactly one of: high, medium, low\n\n\
         Respond with ONLY a JSON object, no Markdown fences:\n\
         {\"category\": \"...\", \"subCategory\": null, \"priority\": \"low\", \
         \"analysis\": \"1-2 sentences\", \"senderGoal\": \"3-8 words\"}",
    );

    prompt
}

/// Build the user prompt embedding the email as JSON.
pub fn build_user_prompt(email: &Email, sanitized_body: &str, max_body_chars: usize) -> String {
    let body: String = sanitized_body.chars().take(max_body_chars).collect();
    let data = json!({
        "id": email.id,
        "subject": email.subject,
        "sender": email.sender,
        "from": email.from,
        "importance": email.importance,
        "body": body,
    });
    let data = serde_json::to_string_pretty(&data).unwrap_or_default();
    format!(
        "Categorize the following email:\n<email>\n{data}\n</email>\n\n\
         Return a single JSON object only."
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// Parse and validate a model response.
pub fn parse_classification(raw: &str, taxonomy: &Taxonomy) -> Result<ClassificationResult, String> {
    let object = extract_json_object(raw).ok_or("no JSON object in response")?;

    let category = string_field(&object, &["category"]).ok_or("missing category")?;
    let category = taxonomy
        .canonical(&category)
        .ok_or_else(|| format!("category {category:?} is not in the taxonomy"))?
        .to_string();

    let priority_raw = string_field(&object, &["priority"]).ok_or("missing priority")?;
    let priority =
        Priority::parse(&priority_raw).ok_or_else(|| format!("invalid priority {priority_raw:?}"))?;

    let sub_category = string_field(&object, &["subCategory", "sub_category", "subcategory"])
        .and_then(|s| clean_sub_category(&s));

    Ok(ClassificationResult {
        category,
        sub_category,
        priority,
        analysis: string_field(&object, &["analysis"]).unwrap_or_default(),
        sender_goal: string_field(&object, &["senderGoal", "sender_goal"]).unwrap_or_default(),
        source: ClassificationSource::Model,
    })
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| object.get(*k))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Blank and placeholder values become `None`; path separators become spaces.
fn clean_sub_category(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if ["null", "none", "n/a", "-"]
        .iter()
        .any(|p| trimmed.eq_ignore_ascii_case(p))
    {
        return None;
    }
    let cleaned = trimmed
        .replace(['/', '\\'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Find the first JSON object in model output.
///
/// Strips Markdown fences, skips surrounding prose, and as a last resort
/// repairs an object cut off mid-field.
pub fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    let cleaned = strip_code_fences(raw);

    for (start, _) in cleaned.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&cleaned[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(object))) = stream.next() {
            return Some(object);
        }
    }

    recover_truncated_object(&cleaned)
}

fn strip_code_fences(text: &str) -> String {
    text.replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "")
}

/// Trim back to a field boundary and close open braces until the text parses.
fn recover_truncated_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let mut candidate = &text[start..];

    for _ in 0..MAX_RECOVERY_STEPS {
        let snippet = candidate.trim_end();
        if snippet.len() < 2 {
            return None;
        }

        let missing = snippet
            .matches('{')
            .count()
            .saturating_sub(snippet.matches('}').count());
        let body = snippet.trim_end_matches(',');
        let attempt = format!("{body}{}", "}".repeat(missing));

        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&attempt) {
            debug!(recovered_len = attempt.len(), "Recovered truncated JSON object");
            return Some(object);
        }

        let cut = candidate.rfind(['\n', ',']).unwrap_or(0);
        candidate = if cut == 0 {
            let mut chars = candidate.chars();
            chars.next_back();
            chars.as_str()
        } else {
            &candidate[..cut]
        };
    }
    None
}
