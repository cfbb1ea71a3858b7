use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::answer_cache::is_placeholder;
use crate::models::JobRecord;
use crate::profile::CandidateProfile;

// --- Provider trait ---

/// Text completion backend. Implementations must give up once `timeout` has
/// elapsed; the form loop relies on every call being bounded.
pub trait AIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32, timeout: Duration) -> Result<String>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
    ClaudeCode,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

// (aliases, provider, model id, short name)
const MODELS: &[(&[&str], ProviderKind, &str, &str)] = &[
    // `claude` CLI, no API key needed
    (&["claude-sonnet", "sonnet"], ProviderKind::ClaudeCode, "claude-sonnet-4-5-20250929", "claude-sonnet"),
    (&["claude-haiku", "haiku"], ProviderKind::ClaudeCode, "claude-haiku-4-5-20251001", "claude-haiku"),
    // Anthropic API (ANTHROPIC_API_KEY)
    (&["api-sonnet"], ProviderKind::Anthropic, "claude-sonnet-4-5-20250929", "api-sonnet"),
    (&["api-haiku"], ProviderKind::Anthropic, "claude-haiku-4-5-20251001", "api-haiku"),
    // OpenAI API (OPENAI_API_KEY)
    (&["gpt-4o"], ProviderKind::OpenAI, "gpt-4o", "gpt-4o"),
    (&["gpt-4o-mini"], ProviderKind::OpenAI, "gpt-4o-mini", "gpt-4o-mini"),
];

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    MODELS
        .iter()
        .find(|(aliases, ..)| aliases.contains(&name))
        .map(|(_, provider, model_id, short_name)| ModelSpec {
            provider: *provider,
            model_id: model_id.to_string(),
            short_name: short_name.to_string(),
        })
        .ok_or_else(|| {
            let available: Vec<&str> = MODELS.iter().map(|(aliases, ..)| aliases[0]).collect();
            anyhow!("Unknown model '{}'. Available: {}", name, available.join(", "))
        })
}

pub fn create_provider(spec: &ModelSpec) -> Result<Box<dyn AIProvider>> {
    match spec.provider {
        ProviderKind::ClaudeCode => Ok(Box::new(ClaudeCodeProvider::new(spec.model_id.clone())?)),
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(spec.model_id.clone())?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAIProvider::new(spec.model_id.clone())?)),
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
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set. Set it with: export ANTHROPIC_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32, timeout: Duration) -> Result<String> {
        let request = ChatRequest {
            model: &self.model_id,
            max_tokens,
            messages: vec![ChatMessage { role: "user", content: prompt }],
        };

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .timeout(timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: AnthropicResponse = response
            .json()
            .context("Failed to parse Anthropic API response")?;

        api_response
            .content
            .into_iter()
            .find(|block| block.content_type == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| anyhow!("No text content in Anthropic API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Claude Code provider (shells out to `claude` CLI) ---

#[derive(Debug)]
pub struct ClaudeCodeProvider {
    model_id: String,
}

impl ClaudeCodeProvider {
    pub fn new(model_id: String) -> Result<Self> {
        Command::new("claude")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("'claude' CLI not found. Install it or use api-sonnet/gpt-4o instead.")?;
        Ok(Self { model_id })
    }
}

impl AIProvider for ClaudeCodeProvider {
    fn complete(&self, prompt: &str, _max_tokens: u32, timeout: Duration) -> Result<String> {
        let mut child = Command::new("claude")
            .arg("-p")
            .arg(prompt)
            .arg("--model")
            .arg(&self.model_id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to run 'claude' CLI")?;

        // Drain stdout on a thread so a full pipe cannot stall the child.
        let mut stdout = child.stdout.take().context("claude CLI stdout not captured")?;
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = String::new();
            let result = stdout.read_to_string(&mut buf).map(|_| buf);
            let _ = tx.send(result);
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait().context("Failed to poll claude CLI")? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("claude CLI timed out after {}s", timeout.as_secs()));
            }
            std::thread::sleep(Duration::from_millis(50));
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(anyhow!("claude CLI failed: {}", stderr.trim()));
        }

        let response = rx
            .recv_timeout(Duration::from_secs(1))
            .context("claude CLI output was not readable")?
            .context("Invalid UTF-8 in claude CLI output")?;

        if response.trim().is_empty() {
            return Err(anyhow!("Empty response from claude CLI"));
        }

        Ok(response)
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
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
    client: reqwest::blocking::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set. Set it with: export OPENAI_API_KEY=your-key-here")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for OpenAIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32, timeout: Duration) -> Result<String> {
        let request = ChatRequest {
            model: &self.model_id,
            max_tokens,
            messages: vec![ChatMessage { role: "user", content: prompt }],
        };

        let response = self
            .client
            .post(OPENAI_API_URL)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "OpenAI API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: OpenAIResponse = response
            .json()
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

// --- Answer parsing ---

/// A usable answer extracted from a model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAnswer {
    pub answer: String,
}

/// Why a model response could not be used as a field answer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseFailure {
    #[error("model returned an empty response")]
    Empty,

    #[error("response is not a JSON object: {0}")]
    NotJson(String),

    #[error("response has no string \"answer\" field")]
    MissingAnswer,

    #[error("model declined to answer ({0:?})")]
    Placeholder(String),
}

#[derive(Debug, Deserialize)]
struct AnswerPayload {
    answer: Option<serde_json::Value>,
}

/// Strict parse of `{"answer": "..."}`. Code fences are tolerated; prose,
/// missing keys and placeholder answers are not.
pub fn parse_answer(raw: &str) -> std::result::Result<ParsedAnswer, ParseFailure> {
    let text = strip_json_fences(raw);
    if text.is_empty() {
        return Err(ParseFailure::Empty);
    }

    let payload: AnswerPayload =
        serde_json::from_str(text).map_err(|e| ParseFailure::NotJson(e.to_string()))?;

    let answer = match payload.answer {
        Some(serde_json::Value::String(s)) => s,
        // numeric fields are often answered with a bare JSON number
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::Bool(b)) => if b { "Yes" } else { "No" }.to_string(),
        _ => return Err(ParseFailure::MissingAnswer),
    };

    let answer = answer.trim().to_string();
    if is_placeholder(&answer) {
        return Err(ParseFailure::Placeholder(answer));
    }
    Ok(ParsedAnswer { answer })
}

/// Strips ```json ... ``` or ``` ... ``` code fences from model output.
fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    let inner = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"));
    match inner {
        Some(stripped) => {
            let stripped = stripped.trim_start();
            stripped
                .strip_suffix("```")
                .map(str::trim)
                .unwrap_or(stripped)
        }
        None => text,
    }
}

// --- Fit screening ---

#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    /// 0.0 (no fit) to 1.0 (near-perfect fit).
    pub fit_score: f64,
    pub strong_matches: Vec<String>,
    pub gaps: Vec<String>,
    pub reasoning: String,
}

impl FitResult {
    /// One-paragraph note stored with the job.
    pub fn summary(&self) -> String {
        let mut note = self.reasoning.clone();
        if !self.strong_matches.is_empty() {
            note.push_str(&format!("\nMatches: {}", self.strong_matches.join(", ")));
        }
        if !self.gaps.is_empty() {
            note.push_str(&format!("\nGaps: {}", self.gaps.join(", ")));
        }
        note.trim().to_string()
    }
}

/// Scores how well a posting fits the candidate. Fails when the posting has
/// no description or the model's reply carries no usable score.
pub fn score_fit(
    provider: &dyn AIProvider,
    profile: &CandidateProfile,
    job: &JobRecord,
    timeout: Duration,
) -> Result<FitResult> {
    let description = job
        .detail_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| anyhow!("Job {} has no description to screen", job.id))?;

    let prompt = format!(
        "Evaluate how well this job matches the candidate's profile.\n\n\
        Return EXACTLY in this format:\n\
        SCORE: <number 0.0-1.0>\n\
        STRONG_MATCHES: item1, item2, item3\n\
        GAPS: item1, item2, item3\n\
        REASONING:\n\
        <2-3 sentences on the key matches or mismatches>\n\n\
        Scale: 0.0-0.3 poor fit (role, skills or level mismatch), 0.4-0.6 moderate fit \
        (significant gaps), 0.7-0.8 good fit (minor concerns), 0.9-1.0 excellent fit.\n\
        Consider role level, skills, years of experience, domain, location and work mode.\n\n\
        Candidate:\n{}\n\n\
        Job Title: {}\nCompany: {}\nLocation: {}\nWork Mode: {}\nCompensation: {}\n\n\
        Job Posting:\n{}",
        profile.summary(),
        job.title,
        job.company.as_deref().unwrap_or("Unknown"),
        job.location.as_deref().unwrap_or("Unknown"),
        job.work_mode.as_deref().unwrap_or("Unknown"),
        job.compensation.as_deref().unwrap_or("Not specified"),
        description
    );

    let response = provider
        .complete(&prompt, 1024, timeout)
        .with_context(|| format!("{} fit screening failed", provider.model_name()))?;
    parse_fit(&response)
}

fn parse_fit(response: &str) -> Result<FitResult> {
    let mut fit_score = None;
    let mut strong_matches = Vec::new();
    let mut gaps = Vec::new();
    let mut reasoning = String::new();
    let mut in_reasoning = false;

    for line in response.lines() {
        let line_trimmed = line.trim();

        if in_reasoning {
            if !reasoning.is_empty() {
                reasoning.push('\n');
            }
            reasoning.push_str(line_trimmed);
            continue;
        }

        if let Some(rest) = line_trimmed.strip_prefix("SCORE:") {
            fit_score = parse_score(rest);
        } else if let Some(rest) = line_trimmed.strip_prefix("STRONG_MATCHES:") {
            strong_matches = split_list(rest);
        } else if let Some(rest) = line_trimmed.strip_prefix("GAPS:") {
            gaps = split_list(rest);
        } else if let Some(rest) = line_trimmed.strip_prefix("REASONING:") {
            reasoning = rest.trim().to_string();
            in_reasoning = true;
        }
    }

    let fit_score = fit_score.ok_or_else(|| {
        let head: String = response.chars().take(120).collect();
        anyhow!("No fit score in model response: {:?}", head)
    })?;

    Ok(FitResult {
        fit_score,
        strong_matches,
        gaps,
        reasoning: reasoning.trim().to_string(),
    })
}

/// Accepts "0.75", "0.75/1.0" and percent-style "75"; clamps to 0.0..=1.0.
fn parse_score(text: &str) -> Option<f64> {
    let first = text.trim().split(['/', ' ']).next()?;
    let value = first.trim_end_matches('%').parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let value = if value > 1.0 { value / 100.0 } else { value };
    Some(value.min(1.0))
}

fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_model_claude_code() {
        let spec = resolve_model("claude-sonnet").unwrap();
        assert_eq!(spec.model_id, "claude-sonnet-4-5-20250929");
        assert_eq!(spec.provider, ProviderKind::ClaudeCode);

        let spec = resolve_model("haiku").unwrap();
        assert_eq!(spec.short_name, "claude-haiku");
    }

    #[test]
    fn test_resolve_model_api_providers() {
        assert_eq!(resolve_model("api-sonnet").unwrap().provider, ProviderKind::Anthropic);
        assert_eq!(resolve_model("gpt-4o").unwrap().provider, ProviderKind::OpenAI);
    }

    #[test]
    fn test_resolve_model_unknown() {
        let err = resolve_model("gpt-3").unwrap_err().to_string();
        assert!(err.contains("Unknown model"));
        assert!(err.contains("claude-sonnet"));
    }

    #[test]
    fn test_anthropic_provider_requires_api_key() {
        let original = env::var("ANTHROPIC_API_KEY").ok();
        unsafe { env::remove_var("ANTHROPIC_API_KEY"); }

        let result = AnthropicProvider::new("claude-sonnet-4-5-20250929".to_string());

        if let Some(val) = original {
            unsafe { env::set_var("ANTHROPIC_API_KEY", val); }
        }

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_openai_provider_requires_api_key() {
        let original = env::var("OPENAI_API_KEY").ok();
        unsafe { env::remove_var("OPENAI_API_KEY"); }

        let result = OpenAIProvider::new("gpt-4o".to_string());

        if let Some(val) = original {
            unsafe { env::set_var("OPENAI_API_KEY", val); }
        }

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_parse_answer_plain_json() {
        let parsed = parse_answer(r#"{"answer": " 90 "}"#).unwrap();
        assert_eq!(parsed.answer, "90");
    }

    #[test]
    fn test_parse_answer_fenced_json() {
        let parsed = parse_answer("```json\n{\"answer\": \"Yes\"}\n```").unwrap();
        assert_eq!(parsed.answer, "Yes");
    }

    #[test]
    fn test_parse_answer_number_and_bool() {
        assert_eq!(parse_answer(r#"{"answer": 12}"#).unwrap().answer, "12");
        assert_eq!(parse_answer(r#"{"answer": false}"#).unwrap().answer, "No");
    }

    #[test]
    fn test_parse_answer_failures() {
        assert_eq!(parse_answer("   "), Err(ParseFailure::Empty));
        assert!(matches!(parse_answer("Sure! The answer is 90."), Err(ParseFailure::NotJson(_))));
        assert_eq!(parse_answer(r#"{"value": "90"}"#), Err(ParseFailure::MissingAnswer));
        assert_eq!(parse_answer(r#"{"answer": null}"#), Err(ParseFailure::MissingAnswer));
        assert_eq!(
            parse_answer(r#"{"answer": "N/A"}"#),
            Err(ParseFailure::Placeholder("N/A".to_string()))
        );
    }

    #[test]
    fn test_parse_fit_response() {
        let fit = parse_fit(
            "SCORE: 0.75\n\
             STRONG_MATCHES: Python, team leadership\n\
             GAPS: Kubernetes\n\
             REASONING:\n\
             Strong backend match.\n\
             Light on platform work.",
        )
        .unwrap();
        assert_eq!(fit.fit_score, 0.75);
        assert_eq!(fit.strong_matches, vec!["Python", "team leadership"]);
        assert_eq!(fit.gaps, vec!["Kubernetes"]);
        assert_eq!(fit.reasoning, "Strong backend match.\nLight on platform work.");
        assert!(fit.summary().ends_with("Gaps: Kubernetes"));
    }

    #[test]
    fn test_parse_score_forms() {
        assert_eq!(parse_score(" 0.8"), Some(0.8));
        assert_eq!(parse_score("0.8/1.0"), Some(0.8));
        assert_eq!(parse_score("65"), Some(0.65));
        assert_eq!(parse_score("70%"), Some(0.7));
        assert_eq!(parse_score("high"), None);
        assert_eq!(parse_score("-1"), None);
    }

    #[test]
    fn test_parse_fit_without_score_is_an_error() {
        let err = parse_fit("Looks like a great fit!").unwrap_err();
        assert!(err.to_string().contains("No fit score"));
    }

    #[test]
    fn test_score_fit_needs_a_description() {
        use crate::answering::tests::{profile, ScriptedProvider};
        use crate::db::Database;
        use crate::models::NewJob;

        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        let id = db
            .add_job(&NewJob { external_id: "li-1".into(), title: "SRE".into(), ..Default::default() })
            .unwrap();
        let job = db.get_job(id).unwrap().unwrap();
        let (provider, prompts) = ScriptedProvider::new(vec![Ok("SCORE: 0.9".to_string())]);

        let err = score_fit(&provider, &profile(), &job, Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("no description"));
        assert!(prompts.borrow().is_empty());
    }

    #[test]
    fn test_strip_json_fences_without_tag() {
        assert_eq!(strip_json_fences("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_json_fences("{\"a\": 1}"), "{\"a\": 1}");
    }
}
