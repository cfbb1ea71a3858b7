use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::answering::{AnswerEngine, JobContext, Question, Rejection};
use crate::browser::{BrowserAutomation, BrowserError, BrowserResult};
use crate::form::{match_option, ButtonRole, FieldDescriptor, FieldKind, FormStepSnapshot};
use crate::models::FieldType;

/// Shared cancellation flag, checked at the top of every form step and
/// between jobs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormState {
    Initiating,
    AwaitingStep,
    Filling,
    Validating,
    Advancing,
    Submitted,
    Stuck,
    ValidationFailed,
    NoApplyChannel,
    Aborted,
    DryRunComplete,
}

impl FormState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormState::Initiating => "Initiating",
            FormState::AwaitingStep => "AwaitingStep",
            FormState::Filling => "Filling",
            FormState::Validating => "Validating",
            FormState::Advancing => "Advancing",
            FormState::Submitted => "Submitted",
            FormState::Stuck => "Stuck",
            FormState::ValidationFailed => "ValidationFailed",
            FormState::NoApplyChannel => "NoApplyChannel",
            FormState::Aborted => "Aborted",
            FormState::DryRunComplete => "DryRunComplete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FormState::Submitted
                | FormState::Stuck
                | FormState::ValidationFailed
                | FormState::NoApplyChannel
                | FormState::Aborted
                | FormState::DryRunComplete
        )
    }
}

impl fmt::Display for FormState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Form steps (AwaitingStep cycles) allowed before giving up.
    pub max_steps: u32,
    /// Identical consecutive fingerprints that count as no progress.
    pub stuck_after: u32,
    /// Corrective re-fill passes per step.
    pub max_corrections: u32,
    pub retry_attempts: u32,
    pub retry_pause: Duration,
    pub dry_run: bool,
    pub resume_path: Option<PathBuf>,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            max_steps: 10,
            stuck_after: 3,
            max_corrections: 3,
            retry_attempts: 3,
            retry_pause: Duration::from_millis(500),
            dry_run: false,
            resume_path: None,
        }
    }
}

/// How a form run ended.
#[derive(Debug, Clone)]
pub struct FormRun {
    pub terminal: FormState,
    pub detail: String,
    pub screenshot: Option<String>,
    pub steps_completed: u32,
    pub unanswered_questions: Vec<String>,
    pub transitions: Vec<String>,
}

impl FormRun {
    pub fn unfilled_count(&self) -> u32 {
        self.unanswered_questions.len() as u32
    }
}

/// Drives one Easy Apply form from the job page to a terminal state.
///
/// The browser must already be on the job detail page. Fatal browser errors
/// (lost session, blocked navigation) are returned as `Err`; everything else
/// ends in a terminal state.
pub struct FormMachine<'a, B: BrowserAutomation + ?Sized> {
    browser: &'a mut B,
    answers: &'a mut AnswerEngine,
    job: &'a JobContext,
    settings: &'a MachineSettings,
    cancel: &'a CancelToken,
    screenshot_name: String,

    state: FormState,
    transitions: Vec<String>,
    detail: String,
    screenshot: Option<String>,
    snapshot: FormStepSnapshot,
    last_fingerprint: Option<String>,
    repeat_count: u32,
    cycles: u32,
    corrections: u32,
    correcting: bool,
    steps_completed: u32,
    /// Values we typed, by field ref, fed back when the form rejects one.
    filled: HashMap<String, String>,
    /// Values the form rejected on this step, by field ref, with the label
    /// and field type they were asked under.
    rejected: HashMap<String, (String, FieldType, Vec<String>)>,
    unanswered: Vec<String>,
}

impl<'a, B: BrowserAutomation + ?Sized> FormMachine<'a, B> {
    pub fn new(
        browser: &'a mut B,
        answers: &'a mut AnswerEngine,
        job: &'a JobContext,
        settings: &'a MachineSettings,
        cancel: &'a CancelToken,
        screenshot_name: impl Into<String>,
    ) -> Self {
        Self {
            browser,
            answers,
            job,
            settings,
            cancel,
            screenshot_name: screenshot_name.into(),
            state: FormState::Initiating,
            transitions: Vec::new(),
            detail: String::new(),
            screenshot: None,
            snapshot: FormStepSnapshot::default(),
            last_fingerprint: None,
            repeat_count: 0,
            cycles: 0,
            corrections: 0,
            correcting: false,
            steps_completed: 0,
            filled: HashMap::new(),
            rejected: HashMap::new(),
            unanswered: Vec::new(),
        }
    }

    pub fn run(mut self) -> BrowserResult<FormRun> {
        while !self.state.is_terminal() {
            let next = match self.state {
                FormState::Initiating => self.initiate()?,
                FormState::AwaitingStep => self.await_step()?,
                FormState::Filling => self.fill_step()?,
                FormState::Validating => self.validate()?,
                FormState::Advancing => self.advance()?,
                terminal => terminal,
            };
            self.transition(next);
        }

        info!(
            terminal = %self.state,
            steps = self.steps_completed,
            unfilled = self.unanswered.len(),
            "form run finished: {}",
            self.detail
        );
        Ok(FormRun {
            terminal: self.state,
            detail: self.detail,
            screenshot: self.screenshot,
            steps_completed: self.steps_completed,
            unanswered_questions: self.unanswered,
            transitions: self.transitions,
        })
    }

    fn transition(&mut self, next: FormState) {
        debug!(from = %self.state, to = %next, "form transition");
        self.transitions.push(format!("{} -> {}", self.state, next));
        self.state = next;
    }

    fn finish(&mut self, terminal: FormState, detail: impl Into<String>) -> FormState {
        self.detail = detail.into();
        if matches!(terminal, FormState::Stuck | FormState::ValidationFailed) {
            let name = format!("{}-{}", self.screenshot_name, terminal.as_str().to_lowercase());
            match self.browser.screenshot(&name) {
                Ok(reference) => self.screenshot = Some(reference),
                Err(e) => warn!("Failed to capture screenshot: {e}"),
            }
        }
        terminal
    }

    /// Runs a browser call, retrying transient failures in place. The outer
    /// `Err` is fatal; the inner one is a non-fatal failure left to the caller.
    fn call<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut(&mut B) -> BrowserResult<T>,
    ) -> BrowserResult<BrowserResult<T>> {
        let mut attempt = 1;
        loop {
            match op(&mut *self.browser) {
                Ok(value) => return Ok(Ok(value)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.is_transient() && attempt < self.settings.retry_attempts => {
                    warn!(attempt, "{what} failed, retrying: {e}");
                    if !self.settings.retry_pause.is_zero() {
                        std::thread::sleep(self.settings.retry_pause);
                    }
                    attempt += 1;
                }
                Err(e) => return Ok(Err(e)),
            }
        }
    }

    fn initiate(&mut self) -> BrowserResult<FormState> {
        let page = match self.call("job page snapshot", |b| b.snapshot())? {
            Ok(page) => page,
            Err(e) => return Ok(self.finish(FormState::Stuck, format!("cannot read job page: {e}"))),
        };

        let Some(button) = page.enabled_button(ButtonRole::EasyApply) else {
            return Ok(self.finish(FormState::NoApplyChannel, "no Easy Apply control on job page"));
        };
        let control = button.control_ref.clone();

        match self.call("open Easy Apply", |b| b.click(&control))? {
            Ok(()) => Ok(FormState::AwaitingStep),
            Err(e) => Ok(self.finish(FormState::Stuck, format!("cannot open Easy Apply: {e}"))),
        }
    }

    fn await_step(&mut self) -> BrowserResult<FormState> {
        if self.cancel.is_cancelled() {
            return Ok(self.finish(FormState::Aborted, "cancelled"));
        }

        self.cycles += 1;
        if self.cycles > self.settings.max_steps {
            return Ok(self.finish(
                FormState::Stuck,
                format!("no submission after {} form steps", self.settings.max_steps),
            ));
        }

        let snapshot = match self.call("step snapshot", |b| b.snapshot())? {
            Ok(snapshot) => snapshot,
            Err(e) => return Ok(self.finish(FormState::Stuck, format!("cannot read form step: {e}"))),
        };

        let fingerprint = snapshot.fingerprint();
        if self.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            self.repeat_count += 1;
        } else {
            self.repeat_count = 1;
            self.last_fingerprint = Some(fingerprint);
        }
        if self.repeat_count >= self.settings.stuck_after {
            return Ok(self.finish(
                FormState::Stuck,
                format!("form did not change for {} consecutive steps", self.repeat_count),
            ));
        }

        self.snapshot = snapshot;
        Ok(FormState::Filling)
    }

    fn fill_step(&mut self) -> BrowserResult<FormState> {
        let correcting = self.correcting;
        let targets: Vec<FieldDescriptor> = self
            .snapshot
            .fields
            .iter()
            .filter(|f| f.needs_answer() || (correcting && f.error.is_some()))
            .cloned()
            .collect();

        for field in &targets {
            self.fill_field(field)?;
        }
        Ok(FormState::Validating)
    }

    fn fill_field(&mut self, field: &FieldDescriptor) -> BrowserResult<()> {
        if field.kind == FieldKind::File {
            let Some(resume) = self.settings.resume_path.clone() else {
                self.mark_unfilled(&field.label);
                return Ok(());
            };
            return match self.call("upload", |b| b.upload(&field.field_ref, &resume))? {
                Ok(()) => {
                    self.mark_filled(field, resume.display().to_string());
                    Ok(())
                }
                Err(e) => {
                    warn!(field = %field.label, "upload failed: {e}");
                    self.mark_unfilled(&field.label);
                    Ok(())
                }
            };
        }

        let Some(value) = self.choose_value(field) else {
            self.mark_unfilled(&field.label);
            return Ok(());
        };

        match self.call("fill", |b| b.fill(&field.field_ref, &value))? {
            Ok(()) => self.mark_filled(field, value),
            Err(e) => {
                warn!(field = %field.label, "fill failed: {e}");
                self.mark_unfilled(&field.label);
            }
        }
        Ok(())
    }

    /// The value to put into a field, already mapped onto an offered option
    /// for choice fields.
    fn choose_value(&mut self, field: &FieldDescriptor) -> Option<String> {
        // A required checkbox can only be satisfied one way.
        if field.kind == FieldKind::Checkbox && field.options.is_empty() {
            return Some("Yes".to_string());
        }

        let options = if field.is_choice() { field.answer_options() } else { Vec::new() };
        let question = Question {
            text: &field.label,
            field_type: field.field_type,
            options: &options,
        };

        let rejected = self
            .filled
            .get(&field.field_ref.0)
            .cloned()
            .or_else(|| Some(field.value.clone()).filter(|v| !v.trim().is_empty()));

        let answer = match (&field.error, rejected) {
            (Some(error), Some(previous)) if self.correcting => {
                let answer = self.answers.answer_with_feedback(
                    &question,
                    self.job,
                    Rejection { value: &previous, error },
                );
                self.rejected
                    .entry(field.field_ref.0.clone())
                    .or_insert_with(|| (field.label.clone(), field.field_type, Vec::new()))
                    .2
                    .push(previous);
                answer
            }
            _ => self.answers.answer(&question, self.job),
        };

        let value = answer.value()?;
        if options.is_empty() {
            return Some(value.to_string());
        }
        let chosen = match_option(value, &options);
        if chosen.is_none() {
            warn!(field = %field.label, answer = value, "answer matches none of the offered options");
        }
        chosen
    }

    fn mark_filled(&mut self, field: &FieldDescriptor, value: String) {
        debug!(field = %field.label, value = %value, "filled");
        self.unanswered.retain(|q| q != &field.label);
        self.filled.insert(field.field_ref.0.clone(), value);
    }

    fn mark_unfilled(&mut self, label: &str) {
        if !self.unanswered.iter().any(|q| q == label) {
            self.unanswered.push(label.to_string());
        }
    }

    fn validate(&mut self) -> BrowserResult<FormState> {
        let snapshot = match self.call("validation snapshot", |b| b.snapshot())? {
            Ok(snapshot) => snapshot,
            Err(e) => return Ok(self.finish(FormState::Stuck, format!("cannot read form step: {e}"))),
        };
        let issues = snapshot.validation_issues();
        self.snapshot = snapshot;

        if issues.is_empty() {
            self.correcting = false;
            self.confirm_corrections();
            return Ok(FormState::Advancing);
        }
        if self.corrections >= self.settings.max_corrections {
            return Ok(self.finish(
                FormState::ValidationFailed,
                format!(
                    "form rejected answers after {} corrections: {}",
                    self.corrections,
                    issues.join("; ")
                ),
            ));
        }

        self.corrections += 1;
        self.correcting = true;
        debug!(pass = self.corrections, ?issues, "correcting form step");
        Ok(FormState::Filling)
    }

    /// The step validated, so every corrected value is known good.
    fn confirm_corrections(&mut self) {
        for (field_ref, (label, field_type, rejected)) in std::mem::take(&mut self.rejected) {
            let Some(corrected) = self.filled.get(&field_ref) else {
                continue;
            };
            let question = Question { text: &label, field_type, options: &[] };
            self.answers.confirm_correction(&question, &rejected, corrected);
        }
    }

    fn advance(&mut self) -> BrowserResult<FormState> {
        let Some((role, control, label)) = self
            .snapshot
            .advance_control()
            .map(|(role, b)| (role, b.control_ref.clone(), b.label.clone()))
        else {
            debug!("no enabled submit, review or next control");
            return Ok(FormState::AwaitingStep);
        };

        if role == ButtonRole::Submit && self.settings.dry_run {
            return Ok(self.finish(FormState::DryRunComplete, "reached submit; dry run, not submitted"));
        }

        if let Err(e) = self.call("advance", |b| b.click(&control))? {
            return Ok(self.finish(FormState::Stuck, format!("cannot click {:?}: {e}", label)));
        }
        self.steps_completed += 1;
        self.corrections = 0;
        self.correcting = false;

        if role == ButtonRole::Submit {
            return Ok(self.finish(FormState::Submitted, "application submitted"));
        }
        Ok(FormState::AwaitingStep)
    }
}
