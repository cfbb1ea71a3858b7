use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ai::{parse_answer, AIProvider, ParseFailure};
use crate::answer_cache::{AnswerCache, SimilarAnswer};
use crate::classifier::{classify, fallback_answer, numeric_part, Category};
use crate::models::{FieldType, JobRecord};
use crate::profile::CandidateProfile;

/// A form question awaiting an answer.
#[derive(Debug, Clone)]
pub struct Question<'a> {
    pub text: &'a str,
    pub field_type: FieldType,
    /// Offered choices for select/radio fields; empty for free input.
    pub options: &'a [String],
}

/// The posting being applied to, for prompt context.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
}

impl From<&JobRecord> for JobContext {
    fn from(job: &JobRecord) -> Self {
        Self {
            title: job.title.clone(),
            company: job.company.clone(),
            location: job.location.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerSource {
    Cache,
    Ai,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Resolved { value: String, source: AnswerSource },
    Unanswered,
}

impl Answer {
    pub fn value(&self) -> Option<&str> {
        match self {
            Answer::Resolved { value, .. } => Some(value),
            Answer::Unanswered => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnswerStats {
    pub cache_hits: u32,
    pub ai_answers: u32,
    pub ai_failures: u32,
    pub fallbacks: u32,
    pub unanswered: u32,
}

#[derive(Debug, Clone)]
pub struct AnswerSettings {
    pub timeout: Duration,
    pub max_tokens: u32,
    pub few_shot_limit: usize,
}

impl Default for AnswerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_tokens: 200,
            few_shot_limit: 3,
        }
    }
}

/// A previous answer the form rejected, fed back on a corrective pass.
#[derive(Debug, Clone, Copy)]
pub struct Rejection<'a> {
    pub value: &'a str,
    pub error: &'a str,
}

/// Resolves form questions: cache, then AI, then the deterministic fallback.
pub struct AnswerEngine {
    cache: AnswerCache,
    provider: Option<Box<dyn AIProvider>>,
    profile: CandidateProfile,
    settings: AnswerSettings,
    stats: AnswerStats,
}

impl AnswerEngine {
    pub fn new(
        cache: AnswerCache,
        provider: Option<Box<dyn AIProvider>>,
        profile: CandidateProfile,
        settings: AnswerSettings,
    ) -> Self {
        Self {
            cache,
            provider,
            profile,
            settings,
            stats: AnswerStats::default(),
        }
    }

    pub fn stats(&self) -> AnswerStats {
        self.stats
    }

    pub fn profile(&self) -> &CandidateProfile {
        &self.profile
    }

    pub fn answer(&mut self, question: &Question, job: &JobContext) -> Answer {
        if let Some(cached) = self.cache.lookup_exact(question.text, question.field_type) {
            debug!(question = question.text, "answer cache hit");
            self.stats.cache_hits += 1;
            return Answer::Resolved { value: cached, source: AnswerSource::Cache };
        }
        self.generate(question, job, None)
    }

    /// Re-answers a question whose previous answer failed form validation.
    /// Skips the exact cache, which may hold the rejected value.
    pub fn answer_with_feedback(
        &mut self,
        question: &Question,
        job: &JobContext,
        rejection: Rejection,
    ) -> Answer {
        self.generate(question, job, Some(rejection))
    }

    /// The form accepted `corrected` after rejecting each of `rejected`:
    /// the rejected values leave the cache and the accepted one takes the slot.
    pub fn confirm_correction(&mut self, question: &Question, rejected: &[String], corrected: &str) {
        for value in rejected.iter().filter(|v| v.as_str() != corrected) {
            self.cache.discard(question.text, question.field_type, value);
        }
        self.cache.store(question.text, question.field_type, corrected);
        info!(question = question.text, "cached corrected answer");
    }

    fn generate(&mut self, question: &Question, job: &JobContext, rejection: Option<Rejection>) -> Answer {
        let category = classify(question.text);

        if self.provider.is_some() {
            match self.ask_ai(question, job, category, rejection) {
                Ok(value) => {
                    info!(question = question.text, category = %category, "answered by AI");
                    self.cache.store(question.text, question.field_type, &value);
                    self.stats.ai_answers += 1;
                    return Answer::Resolved { value, source: AnswerSource::Ai };
                }
                Err(reason) => {
                    warn!(question = question.text, "AI answer unusable, falling back: {reason}");
                    self.stats.ai_failures += 1;
                }
            }
        }

        let fallback = fallback_answer(question.text, question.field_type, &self.profile)
            .filter(|value| rejection.map(|r| r.value != value).unwrap_or(true));
        match fallback {
            Some(value) => {
                debug!(question = question.text, category = %category, "answered by fallback rule");
                self.stats.fallbacks += 1;
                Answer::Resolved { value, source: AnswerSource::Fallback }
            }
            None => {
                info!(question = question.text, "question left unanswered");
                self.stats.unanswered += 1;
                Answer::Unanswered
            }
        }
    }

    fn ask_ai(
        &self,
        question: &Question,
        job: &JobContext,
        category: Category,
        rejection: Option<Rejection>,
    ) -> Result<String, String> {
        let Some(provider) = self.provider.as_ref() else {
            return Err("no AI provider configured".to_string());
        };

        let examples = self.cache.lookup_similar(category, self.settings.few_shot_limit);
        let prompt = build_prompt(&self.profile, job, question, &examples, rejection);

        let raw = provider
            .complete(&prompt, self.settings.max_tokens, self.settings.timeout)
            .map_err(|e| format!("{} call failed: {e:#}", provider.model_name()))?;

        let parsed = parse_answer(&raw).map_err(|e: ParseFailure| e.to_string())?;
        conform_to_field_type(&parsed.answer, question.field_type)
            .ok_or_else(|| format!("answer {:?} does not fit a {} field", parsed.answer, question.field_type))
    }
}

/// Coerces an AI answer into the field's input constraint, or rejects it.
fn conform_to_field_type(answer: &str, field_type: FieldType) -> Option<String> {
    match field_type {
        FieldType::Number => numeric_part(answer),
        FieldType::Email => (answer.contains('@') && !answer.contains(' ')).then(|| answer.to_string()),
        FieldType::Url => (answer.starts_with("http://") || answer.starts_with("https://"))
            .then(|| answer.to_string()),
        FieldType::Text | FieldType::Unset => Some(answer.to_string()),
    }
}

fn field_type_instruction(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Number => "The field accepts numbers only. Answer with digits only: no units, words or ranges.",
        FieldType::Email => "The field requires a valid email address.",
        FieldType::Url => "The field requires a valid URL starting with https://.",
        FieldType::Text | FieldType::Unset => "Answer briefly: a short phrase or one sentence.",
    }
}

fn build_prompt(
    profile: &CandidateProfile,
    job: &JobContext,
    question: &Question,
    examples: &[SimilarAnswer],
    rejection: Option<Rejection>,
) -> String {
    let mut job_line = job.title.clone();
    if let Some(company) = &job.company {
        job_line.push_str(&format!(" at {}", company));
    }
    if let Some(location) = &job.location {
        job_line.push_str(&format!(" ({})", location));
    }

    let mut prompt = format!(
        r#"You are filling in a job application form on behalf of the candidate below. Answer truthfully from the profile; when the profile is silent, give the most reasonable answer for this candidate.

CANDIDATE PROFILE:
{profile}

JOB: {job}

QUESTION: {question}
{instruction}
"#,
        profile = profile.summary(),
        job = job_line,
        question = question.text.trim(),
        instruction = field_type_instruction(question.field_type),
    );

    if !question.options.is_empty() {
        prompt.push_str(&format!(
            "Choose exactly one of these options: {}\n",
            question.options.join(" | ")
        ));
    }

    if !examples.is_empty() {
        prompt.push_str("\nANSWERS GIVEN TO SIMILAR QUESTIONS:\n");
        for example in examples {
            prompt.push_str(&format!("- Q: {} ({}) A: {}\n", example.question_text, example.field_type, example.answer));
        }
    }

    if let Some(rejection) = rejection {
        prompt.push_str(&format!(
            "\nThe previous answer {:?} was rejected by the form with: {}\nGive a corrected answer.\n",
            rejection.value, rejection.error
        ));
    }

    prompt.push_str("\nRespond with JSON only, no other text:\n{\"answer\": \"<your answer>\"}");
    prompt
}
