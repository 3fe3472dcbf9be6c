use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::sync::Arc;

use crate::error::{HuntError, Result};
use crate::feedback::InsightSynthesizer;
use crate::models::{JobId, MatchRecord, RejectionReason};
use crate::scorer::{Assessment, JobContext, ScoringOracle, UserContext};

/// Longest job description passed to a prompt, in characters.
const MAX_DESCRIPTION_CHARS: usize = 1000;

// --- Provider trait ---

#[async_trait]
pub trait AIProvider: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

pub fn resolve_model(name: &str) -> anyhow::Result<ModelSpec> {
    let (provider, model_id, short_name) = match name {
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-4o-mini" | "mini" => (ProviderKind::OpenAI, "gpt-4o-mini", "gpt-4o-mini"),
        "gpt-4o" => (ProviderKind::OpenAI, "gpt-4o", "gpt-4o"),
        "gpt-5.2" | "gpt5" => (ProviderKind::OpenAI, "gpt-5.2", "gpt-5.2"),
        // Anthropic (requires ANTHROPIC_API_KEY)
        "api-haiku" | "haiku" => (ProviderKind::Anthropic, "claude-haiku-4-5-20251001", "api-haiku"),
        "api-sonnet" | "sonnet" => (ProviderKind::Anthropic, "claude-sonnet-4-5-20250929", "api-sonnet"),
        _ => {
            return Err(anyhow!(
                "Unknown model '{}'. Available: gpt-4o-mini (default), gpt-4o, gpt-5.2, api-haiku, api-sonnet",
                name
            ));
        }
    };
    Ok(ModelSpec {
        provider,
        model_id: model_id.to_string(),
        short_name: short_name.to_string(),
    })
}

pub fn create_provider(spec: &ModelSpec) -> anyhow::Result<Arc<dyn AIProvider>> {
    match spec.provider {
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicProvider::new(spec.model_id.clone())?)),
        ProviderKind::OpenAI => Ok(Arc::new(OpenAIProvider::new(spec.model_id.clone())?)),
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> anyhow::Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here")?;
        Ok(Self {
            api_key,
            model_id,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl AIProvider for AnthropicProvider {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: &self.model_id,
            max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic API response")?;

        api_response
            .content
            .into_iter()
            .next()
            .map(|block| block.text)
            .ok_or_else(|| anyhow!("No content in Anthropic API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String) -> anyhow::Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set. Set it with: export OPENAI_API_KEY=your-key-here")?;
        Ok(Self {
            api_key,
            model_id,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl AIProvider for OpenAIProvider {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: &self.model_id,
            max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "OpenAI API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: OpenAIResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI API response")?;

        api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("No choices in OpenAI API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Scoring oracle ---

pub struct LlmScoringOracle {
    provider: Arc<dyn AIProvider>,
}

impl LlmScoringOracle {
    pub fn new(provider: Arc<dyn AIProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ScoringOracle for LlmScoringOracle {
    async fn score(&self, user: &UserContext, job: &JobContext) -> Result<Assessment> {
        let prompt = scoring_prompt(user, job)?;
        let raw = self
            .provider
            .complete(&prompt, 1024)
            .await
            .map_err(|e| HuntError::OracleFailure {
                job_id: job.job_id,
                reason: format!("{:#}", e),
            })?;
        parse_assessment(job.job_id, &raw)
    }
}

fn scoring_prompt(user: &UserContext, job: &JobContext) -> Result<String> {
    let candidate = serde_json::to_string_pretty(user)?;
    let job = JobContext {
        description: truncate_chars(&job.description, MAX_DESCRIPTION_CHARS),
        ..job.clone()
    };
    let listing = serde_json::to_string_pretty(&job)?;
    Ok(format!(
        "You are a career advisor scoring how well a job fits a candidate.\n\n\
        Return ONLY a JSON object with exactly these fields:\n\
        {{\"matchScore\": <integer 0-100>, \"verdict\": \"<short label>\", \
        \"reasoning\": \"<2-3 sentences addressed to the candidate as 'you'>\"}}\n\n\
        Weigh skills and experience most, then role level, location and salary \
        preferences. Take any learned preferences into account.\n\n\
        Candidate:\n{}\n\n\
        Job:\n{}",
        candidate, listing
    ))
}

/// Extracts and validates the oracle's JSON verdict from free-form output.
pub fn parse_assessment(job_id: JobId, raw: &str) -> Result<Assessment> {
    let invalid = |reason: String| HuntError::OracleFailure { job_id, reason };
    let doc = extract_json(raw).map_err(invalid)?;

    let score = doc
        .get("matchScore")
        .and_then(Value::as_f64)
        .ok_or_else(|| invalid("missing numeric matchScore".into()))?;
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(invalid(format!("matchScore {} outside 0-100", score)));
    }

    let verdict = doc
        .get("verdict")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| invalid("missing verdict".into()))?;

    let reasoning = doc
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(String::from);

    Ok(Assessment {
        score: score.round() as u8,
        verdict: verdict.to_string(),
        reasoning,
    })
}

/// First JSON object in free-form output. Anything after it is ignored, and
/// brace-delimited prose before it is skipped.
fn extract_json(raw: &str) -> std::result::Result<Value, String> {
    let object_start = regex::Regex::new(r#"\{\s*""#).map_err(|e| e.to_string())?;
    let mut first_error = None;
    for start in object_start.find_iter(raw).map(|m| m.start()) {
        let mut values = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => return Ok(value),
            Some(Err(e)) => {
                first_error.get_or_insert(e);
            }
            None => {}
        }
    }
    match first_error {
        Some(e) => Err(format!("malformed JSON: {}", e)),
        None => Err("no JSON object in oracle output".to_string()),
    }
}

// --- Preference insights ---

pub struct LlmInsightSynthesizer {
    provider: Arc<dyn AIProvider>,
}

impl LlmInsightSynthesizer {
    pub fn new(provider: Arc<dyn AIProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl InsightSynthesizer for LlmInsightSynthesizer {
    async fn synthesize(
        &self,
        user: &UserContext,
        job: &JobContext,
        record: &MatchRecord,
        reason: &RejectionReason,
    ) -> Result<String> {
        let prompt = insight_prompt(user, job, record, reason);
        let raw = self
            .provider
            .complete(&prompt, 1024)
            .await
            .map_err(|e| HuntError::OracleFailure {
                job_id: job.job_id,
                reason: format!("{:#}", e),
            })?;
        parse_insights(&raw).map_err(|reason| HuntError::OracleFailure {
            job_id: job.job_id,
            reason,
        })
    }
}

fn insight_prompt(
    user: &UserContext,
    job: &JobContext,
    record: &MatchRecord,
    reason: &RejectionReason,
) -> String {
    let existing = user
        .learned_insights
        .as_deref()
        .unwrap_or("No insights yet.");
    format!(
        "You maintain a short summary of what a job seeker does and does not want.\n\n\
        Current summary:\n{existing}\n\n\
        The user rejected this job:\n\
        Title: {title}\nCompany: {company}\nLocation: {location}\n\
        Description: {description}\n\n\
        Our assessment was {score}/100 ({verdict}): {reasoning}\n\n\
        Their reason: {label}{details}\n\n\
        Update the summary with what this rejection teaches. Keep it under 150 words \
        and keep earlier insights that still hold.\n\
        Return ONLY a JSON object: {{\"updatedInsights\": \"<summary>\"}}",
        title = job.title,
        company = job.company,
        location = job.location,
        description = truncate_chars(&job.description, MAX_DESCRIPTION_CHARS),
        score = record.score,
        verdict = record.verdict,
        reasoning = record.reasoning,
        label = reason.category.label(),
        details = reason
            .details
            .as_deref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default(),
    )
}

pub fn parse_insights(raw: &str) -> std::result::Result<String, String> {
    let doc = extract_json(raw)?;
    doc.get("updatedInsights")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| "missing updatedInsights".to_string())
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::listing;
    use crate::models::{AppliedState, Freshness, RejectionCategory, UserProfile};

    #[test]
    fn test_resolve_model() {
        let spec = resolve_model("gpt-4o-mini").unwrap();
        assert_eq!(spec.provider, ProviderKind::OpenAI);
        assert_eq!(resolve_model("mini").unwrap().model_id, "gpt-4o-mini");

        let spec = resolve_model("haiku").unwrap();
        assert_eq!(spec.provider, ProviderKind::Anthropic);
        assert_eq!(spec.short_name, "api-haiku");

        let err = resolve_model("gpt-3").unwrap_err();
        assert!(err.to_string().contains("Available"));
    }

    #[test]
    fn test_openai_provider_requires_api_key() {
        let original = env::var("OPENAI_API_KEY").ok();
        unsafe { env::remove_var("OPENAI_API_KEY"); }

        let result = OpenAIProvider::new("gpt-4o-mini".to_string());

        if let Some(val) = original {
            unsafe { env::set_var("OPENAI_API_KEY", val); }
        }

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_parse_assessment_from_chatty_output() {
        let raw = "Sure! Here is the result:\n```json\n{\"matchScore\": 72.6, \"verdict\": \" Good match \", \"reasoning\": \"You have the Rust experience.\"}\n```";
        let a = parse_assessment(7, raw).unwrap();
        assert_eq!(a.score, 73);
        assert_eq!(a.verdict, "Good match");
        assert_eq!(a.reasoning.as_deref(), Some("You have the Rust experience."));
    }

    #[test]
    fn test_parse_assessment_ignores_braces_after_the_object() {
        let raw = "{\"matchScore\": 80, \"verdict\": \"Good\", \"reasoning\": \"x\"}\nNote: weights were {skills: high}";
        let a = parse_assessment(1, raw).unwrap();
        assert_eq!(a.score, 80);
        assert_eq!(a.verdict, "Good");

        let raw = "Scoring {roughly}: {\"matchScore\": 40, \"verdict\": \"Fair\"} then {\"matchScore\": 99}";
        let a = parse_assessment(1, raw).unwrap();
        assert_eq!(a.score, 40);
        assert_eq!(a.verdict, "Fair");
    }

    #[test]
    fn test_parse_assessment_reasoning_is_optional() {
        let a = parse_assessment(1, r#"{"matchScore": 0, "verdict": "Poor", "reasoning": "  "}"#).unwrap();
        assert_eq!(a.score, 0);
        assert_eq!(a.reasoning, None);
    }

    #[test]
    fn test_parse_assessment_rejects_bad_output() {
        for raw in [
            "no json here",
            r#"{"matchScore": "high", "verdict": "x"}"#,
            r#"{"matchScore": 101, "verdict": "x"}"#,
            r#"{"matchScore": -1, "verdict": "x"}"#,
            r#"{"matchScore": 50, "verdict": ""}"#,
            r#"{"matchScore": 50}"#,
            r#"{"matchScore": 50, "verdict": "x""#,
        ] {
            let err = parse_assessment(3, raw).unwrap_err();
            assert!(
                matches!(err, HuntError::OracleFailure { job_id: 3, .. }),
                "accepted {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_parse_insights() {
        assert_eq!(
            parse_insights("{\"updatedInsights\": \"Prefers remote work.\"}").unwrap(),
            "Prefers remote work."
        );
        assert!(parse_insights("{\"insights\": \"x\"}").is_err());
        assert_eq!(
            parse_insights("{\"updatedInsights\": \"Avoids agencies.\"} (kept {tone} neutral)").unwrap(),
            "Avoids agencies."
        );
    }

    #[test]
    fn test_prompts_truncate_long_descriptions() {
        let mut job = JobContext::from(&listing(1));
        job.description = "é".repeat(5000);
        let user = UserContext {
            user_id: 1,
            name: None,
            profile: UserProfile::default(),
            learned_insights: None,
        };
        let prompt = scoring_prompt(&user, &job).unwrap();
        assert!(prompt.matches('é').count() == MAX_DESCRIPTION_CHARS);

        let record = MatchRecord {
            id: 1,
            user_id: 1,
            job_id: 1,
            score: 70,
            verdict: "Good match".into(),
            reasoning: "r".into(),
            freshness: Freshness::Recent,
            clicked: false,
            skipped: true,
            skip_reason: None,
            applied: AppliedState::Unknown,
            applied_reason: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let reason = RejectionReason {
            category: RejectionCategory::Salary,
            details: Some("need 150k".into()),
        };
        let prompt = insight_prompt(&user, &job, &record, &reason);
        assert!(prompt.contains("Salary/compensation too low (need 150k)"));
        assert!(prompt.contains("No insights yet."));
        assert_eq!(prompt.matches('é').count(), MAX_DESCRIPTION_CHARS);
    }
}
