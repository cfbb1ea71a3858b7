use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};

/// Lifecycle of a job posting through discovery, enrichment, screening and
/// application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    Enriched,
    Screened,
    ReadyToApply,
    Applied,
    Skipped,
    Closed,
    Invalid,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::New,
        JobStatus::Enriched,
        JobStatus::Screened,
        JobStatus::ReadyToApply,
        JobStatus::Applied,
        JobStatus::Skipped,
        JobStatus::Closed,
        JobStatus::Invalid,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "NEW",
            JobStatus::Enriched => "ENRICHED",
            JobStatus::Screened => "SCREENED",
            JobStatus::ReadyToApply => "READY_TO_APPLY",
            JobStatus::Applied => "APPLIED",
            JobStatus::Skipped => "SKIPPED",
            JobStatus::Closed => "CLOSED",
            JobStatus::Invalid => "INVALID",
            JobStatus::Failed => "FAILED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::New => 0,
            JobStatus::Enriched => 1,
            JobStatus::Screened => 2,
            JobStatus::ReadyToApply => 3,
            _ => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// Statuses only move forward; a terminal status is final.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase().replace(['-', ' '], "_");
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| anyhow!("Unknown job status '{}'", s))
    }
}

/// Input constraint of a form field. Part of the answer cache key: the same
/// question renders differently for a numeric input and a free-text input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Email,
    Url,
    Unset,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Email => "email",
            FieldType::Url => "url",
            FieldType::Unset => "unset",
        }
    }

    /// Maps an HTML `type` attribute onto a field type.
    pub fn from_html_type(html_type: &str) -> Self {
        match html_type.trim().to_lowercase().as_str() {
            "number" | "range" => FieldType::Number,
            "email" => FieldType::Email,
            "url" => FieldType::Url,
            "text" | "textarea" | "search" | "tel" => FieldType::Text,
            _ => FieldType::Unset,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(FieldType::Text),
            "number" | "numeric" => Ok(FieldType::Number),
            "email" => Ok(FieldType::Email),
            "url" => Ok(FieldType::Url),
            "unset" | "" => Ok(FieldType::Unset),
            _ => Err(anyhow!(
                "Unknown field type '{}'. Expected text, number, email, url or unset",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub external_id: String,
    pub source: String,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub detail_text: Option<String>,
    pub compensation: Option<String>,
    pub work_mode: Option<String>,
    pub apply_type: Option<String>, // "Easy Apply", "External"
    pub status: JobStatus,
    pub fit_score: Option<f64>,
    pub fit_reasoning: Option<String>,
    pub apply_attempts: u32,
    pub last_apply_result: Option<String>,
    pub last_attempt_at: Option<String>,
    pub discovered_at: String,
    pub enriched_at: Option<String>,
    pub screened_at: Option<String>,
    pub applied_at: Option<String>,
    pub updated_at: String,
}

impl JobRecord {
    pub fn has_easy_apply(&self) -> bool {
        self.apply_type
            .as_deref()
            .map(|t| t.eq_ignore_ascii_case("easy apply"))
            .unwrap_or(false)
    }
}

/// Fields supplied when a posting is first recorded.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub external_id: String,
    pub source: String,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub detail_text: Option<String>,
    pub compensation: Option<String>,
    pub work_mode: Option<String>,
    pub apply_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Submitted,
    ValidationError,
    StuckOnForm,
    NoEasyApply,
    Failed,
    Aborted,
    DryRunComplete,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Submitted => "submitted",
            OutcomeStatus::ValidationError => "validation_error",
            OutcomeStatus::StuckOnForm => "stuck_on_form",
            OutcomeStatus::NoEasyApply => "no_easy_apply",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Aborted => "aborted",
            OutcomeStatus::DryRunComplete => "dry_run_complete",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Result of one application attempt against one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationOutcome {
    pub status: OutcomeStatus,
    pub detail: String,
    pub screenshot: Option<String>,
    pub steps_completed: u32,
    pub unfilled_count: u32,
    pub unanswered_questions: Vec<String>,
    /// Audit trail, one "From -> To" entry per state change.
    pub transitions: Vec<String>,
}

impl ApplicationOutcome {
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            detail: detail.into(),
            screenshot: None,
            steps_completed: 0,
            unfilled_count: 0,
            unanswered_questions: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// One-line note stored as the job's last result.
    pub fn summary_line(&self) -> String {
        let mut line = format!("{}: {}", self.status, self.detail);
        if self.unfilled_count > 0 {
            line.push_str(&format!(" ({} unfilled)", self.unfilled_count));
        }
        if let Some(shot) = &self.screenshot {
            line.push_str(&format!(" [screenshot: {}]", shot));
        }
        line
    }
}
