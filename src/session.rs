use anyhow::{anyhow, Context, Result};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::answering::{AnswerEngine, AnswerStats, JobContext};
use crate::browser::BrowserAutomation;
use crate::db::Database;
use crate::form_machine::{CancelToken, FormMachine, FormRun, FormState, MachineSettings};
use crate::models::{ApplicationOutcome, JobRecord, JobStatus, OutcomeStatus};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Counted attempts after which a job is marked FAILED.
    pub max_attempts: u32,
    /// Jittered pause between jobs in a batch.
    pub pace_min: Duration,
    pub pace_max: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            pace_min: Duration::from_secs(20),
            pace_max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub attempted: u32,
    pub submitted: u32,
    pub failed: u32,
    pub skipped: u32,
    pub dry_runs: u32,
    pub aborted: bool,
    pub results: Vec<(i64, String, ApplicationOutcome)>,
    pub answers: AnswerStats,
}

impl BatchSummary {
    fn record(&mut self, job: &JobRecord, outcome: ApplicationOutcome) {
        self.attempted += 1;
        match outcome.status {
            OutcomeStatus::Submitted => self.submitted += 1,
            OutcomeStatus::NoEasyApply => self.skipped += 1,
            OutcomeStatus::DryRunComplete => self.dry_runs += 1,
            OutcomeStatus::Aborted => self.aborted = true,
            OutcomeStatus::ValidationError | OutcomeStatus::StuckOnForm | OutcomeStatus::Failed => {
                self.failed += 1
            }
        }
        self.results.push((job.id, job.title.clone(), outcome));
    }
}

/// Applies to jobs one at a time over a single browser session and keeps the
/// job records in step with the outcomes.
pub struct ApplicationSession<'a, B: BrowserAutomation> {
    db: &'a Database,
    browser: B,
    answers: AnswerEngine,
    machine: MachineSettings,
    settings: SessionSettings,
    cancel: CancelToken,
}

impl<'a, B: BrowserAutomation> ApplicationSession<'a, B> {
    pub fn new(
        db: &'a Database,
        browser: B,
        answers: AnswerEngine,
        machine: MachineSettings,
        settings: SessionSettings,
        cancel: CancelToken,
    ) -> Self {
        Self { db, browser, answers, machine, settings, cancel }
    }

    pub fn into_browser(self) -> B {
        self.browser
    }

    pub fn answer_stats(&self) -> AnswerStats {
        self.answers.stats()
    }

    /// One application attempt. Never fails: every error ends up as a FAILED
    /// outcome with the error chain as its detail.
    pub fn apply(&mut self, job: &JobRecord) -> ApplicationOutcome {
        if job.status.is_terminal() {
            return ApplicationOutcome::failed(format!(
                "job #{} is already {}; not applying again",
                job.id, job.status
            ));
        }

        info!(job = job.id, title = %job.title, "applying");
        let outcome = match self.attempt(job) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job = job.id, "application attempt failed: {e:#}");
                ApplicationOutcome::failed(format!("{e:#}"))
            }
        };

        if let Err(e) = self.record(job, &outcome) {
            error!(job = job.id, "Failed to record application outcome: {e:#}");
        }
        info!(job = job.id, status = %outcome.status, "{}", outcome.detail);
        outcome
    }

    fn attempt(&mut self, job: &JobRecord) -> Result<ApplicationOutcome> {
        let url = job
            .url
            .as_deref()
            .ok_or_else(|| anyhow!("job #{} has no url", job.id))?;

        if job.apply_type.is_some() && !job.has_easy_apply() {
            let mut outcome = ApplicationOutcome::failed(format!(
                "listing applies via {}",
                job.apply_type.as_deref().unwrap_or_default()
            ));
            outcome.status = OutcomeStatus::NoEasyApply;
            return Ok(outcome);
        }

        self.browser
            .navigate(url)
            .with_context(|| format!("Failed to open {}", url))?;

        let context = JobContext::from(job);
        let run = FormMachine::new(
            &mut self.browser,
            &mut self.answers,
            &context,
            &self.machine,
            &self.cancel,
            format!("job-{}", job.id),
        )
        .run()
        .context("Browser session failed during the application form")?;

        Ok(outcome_from_run(run))
    }

    fn record(&self, job: &JobRecord, outcome: &ApplicationOutcome) -> Result<()> {
        let (status, counted) = match outcome.status {
            OutcomeStatus::Submitted => (JobStatus::Applied, true),
            OutcomeStatus::NoEasyApply => (JobStatus::Skipped, true),
            OutcomeStatus::DryRunComplete | OutcomeStatus::Aborted => (job.status, false),
            OutcomeStatus::ValidationError | OutcomeStatus::StuckOnForm | OutcomeStatus::Failed => {
                if job.apply_attempts + 1 >= self.settings.max_attempts {
                    (JobStatus::Failed, true)
                } else {
                    (job.status, true)
                }
            }
        };
        self.db
            .record_attempt(job.id, status, &outcome.summary_line(), counted)
    }

    /// Applies to up to `limit` queued Easy Apply jobs, best fit first.
    pub fn run_batch(&mut self, limit: usize) -> Result<BatchSummary> {
        let jobs = self.db.jobs_ready_to_apply(limit)?;
        info!(count = jobs.len(), "starting application batch");

        let mut summary = BatchSummary::default();
        for (i, job) in jobs.iter().enumerate() {
            if i > 0 {
                self.pace();
            }
            if self.cancel.is_cancelled() {
                info!("batch cancelled");
                summary.aborted = true;
                break;
            }
            let outcome = self.apply(job);
            summary.record(job, outcome);
        }

        summary.answers = self.answers.stats();
        Ok(summary)
    }

    /// Sleeps a random interval between jobs, waking early on cancellation.
    fn pace(&self) {
        let (min, max) = (self.settings.pace_min, self.settings.pace_max);
        if max.is_zero() {
            return;
        }
        let wait = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        info!("waiting {}s before the next job", wait.as_secs());

        let deadline = Instant::now() + wait;
        while Instant::now() < deadline && !self.cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(200).min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

fn outcome_from_run(run: FormRun) -> ApplicationOutcome {
    let status = match run.terminal {
        FormState::Submitted => OutcomeStatus::Submitted,
        FormState::Stuck => OutcomeStatus::StuckOnForm,
        FormState::ValidationFailed => OutcomeStatus::ValidationError,
        FormState::NoApplyChannel => OutcomeStatus::NoEasyApply,
        FormState::Aborted => OutcomeStatus::Aborted,
        FormState::DryRunComplete => OutcomeStatus::DryRunComplete,
        other => {
            warn!(state = %other, "form run ended in a non-terminal state");
            OutcomeStatus::Failed
        }
    };
    let unfilled_count = run.unfilled_count();
    ApplicationOutcome {
        status,
        detail: run.detail,
        screenshot: run.screenshot,
        steps_completed: run.steps_completed,
        unfilled_count,
        unanswered_questions: run.unanswered_questions,
        transitions: run.transitions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answering::tests::engine;
    use crate::browser::BrowserError;
    use crate::form::tests::{button, text_field};
    use crate::form_machine::tests::{job_page, page, three_step_form, FakeBrowser};
    use crate::models::NewJob;

    fn db_with_job(url: &str) -> (Database, JobRecord) {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        let id = db
            .add_job(&NewJob {
                external_id: format!("li-{url}"),
                source: "linkedin".into(),
                title: "Engineering Manager".into(),
                company: Some("Acme".into()),
                url: Some(url.to_string()),
                apply_type: Some("Easy Apply".into()),
                ..Default::default()
            })
            .unwrap();
        db.mark_ready(id).unwrap();
        let job = db.get_job(id).unwrap().unwrap();
        (db, job)
    }

    fn session(db: &Database, browser: FakeBrowser) -> ApplicationSession<'_, FakeBrowser> {
        session_with(db, browser, MachineSettings { retry_pause: Duration::ZERO, ..Default::default() })
    }

    fn session_with(db: &Database, browser: FakeBrowser, machine: MachineSettings) -> ApplicationSession<'_, FakeBrowser> {
        let settings = SessionSettings {
            pace_min: Duration::ZERO,
            pace_max: Duration::ZERO,
            ..Default::default()
        };
        ApplicationSession::new(db, browser, engine(None), machine, settings, CancelToken::new())
    }

    fn stuck_form() -> FakeBrowser {
        FakeBrowser::new(vec![
            job_page(),
            page(vec![text_field("first", "First name", true)], vec![button("next", "Next")]),
        ])
        .link("apply", 1)
    }

    #[test]
    fn test_submitted_marks_job_applied() {
        let (db, job) = db_with_job("https://jobs.example/1");
        let mut session = session(&db, three_step_form());

        let outcome = session.apply(&job);

        assert_eq!(outcome.status, OutcomeStatus::Submitted);
        assert_eq!(session.into_browser().navigations, vec!["https://jobs.example/1".to_string()]);
        let job = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Applied);
        assert!(job.applied_at.is_some());
        assert_eq!(job.apply_attempts, 1);
        assert_eq!(job.last_apply_result.as_deref(), Some("submitted: application submitted"));
    }

    #[test]
    fn test_no_easy_apply_marks_job_skipped() {
        let (db, job) = db_with_job("https://jobs.example/1");
        let browser = FakeBrowser::new(vec![page(vec![], vec![button("ext", "Apply")])]);
        let mut session = session(&db, browser);

        let outcome = session.apply(&job);

        assert_eq!(outcome.status, OutcomeStatus::NoEasyApply);
        assert!(outcome.transitions.iter().all(|t| !t.contains("Filling")));
        assert_eq!(db.get_job(job.id).unwrap().unwrap().status, JobStatus::Skipped);
    }

    #[test]
    fn test_external_apply_listing_is_skipped_without_navigating() {
        let (db, mut job) = db_with_job("https://jobs.example/1");
        job.apply_type = Some("Apply on company website".into());
        let mut session = session(&db, three_step_form());

        let outcome = session.apply(&job);

        assert_eq!(outcome.status, OutcomeStatus::NoEasyApply);
        assert!(outcome.detail.contains("company website"));
        assert!(session.into_browser().navigations.is_empty());
        let job = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Skipped);
        assert_eq!(job.apply_attempts, 1);
    }

    #[test]
    fn test_repeated_failures_mark_job_failed() {
        let (db, job) = db_with_job("https://jobs.example/1");
        let mut session = session(&db, stuck_form());

        for attempt in 1..=3 {
            let current = db.get_job(job.id).unwrap().unwrap();
            let outcome = session.apply(&current);
            assert_eq!(outcome.status, OutcomeStatus::StuckOnForm);
            assert!(outcome.screenshot.is_some());

            let after = db.get_job(job.id).unwrap().unwrap();
            assert_eq!(after.apply_attempts, attempt);
            let expected = if attempt < 3 { JobStatus::ReadyToApply } else { JobStatus::Failed };
            assert_eq!(after.status, expected);
        }
        assert_eq!(session.into_browser().screenshots.len(), 3);
    }

    #[test]
    fn test_dry_run_leaves_job_untouched() {
        let (db, job) = db_with_job("https://jobs.example/1");
        let machine = MachineSettings { dry_run: true, retry_pause: Duration::ZERO, ..Default::default() };
        let mut session = session_with(&db, three_step_form(), machine);

        let outcome = session.apply(&job);

        assert_eq!(outcome.status, OutcomeStatus::DryRunComplete);
        let job = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::ReadyToApply);
        assert_eq!(job.apply_attempts, 0);
        assert!(job.last_apply_result.unwrap().starts_with("dry_run_complete"));
    }

    #[test]
    fn test_blocked_navigation_becomes_failed_outcome() {
        let (db, job) = db_with_job("https://jobs.example/1");
        let mut browser = three_step_form();
        browser.navigate_error = Some(BrowserError::NavigationBlocked("redirected to /login".into()));
        let mut session = session(&db, browser);

        let outcome = session.apply(&job);

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.detail.contains("navigation blocked"));
        let job = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::ReadyToApply);
        assert_eq!(job.apply_attempts, 1);
    }

    #[test]
    fn test_lost_session_mid_form_becomes_failed_outcome() {
        let (db, job) = db_with_job("https://jobs.example/1");
        let mut browser = three_step_form();
        browser.click_errors.push_back(BrowserError::SessionLost("chrome exited".into()));
        let mut session = session(&db, browser);

        let outcome = session.apply(&job);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.detail.contains("chrome exited"));
    }

    #[test]
    fn test_missing_url_becomes_failed_outcome() {
        let (db, mut job) = db_with_job("https://jobs.example/1");
        job.url = None;
        let mut session = session(&db, three_step_form());

        let outcome = session.apply(&job);
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.detail.contains("has no url"));
        assert!(session.into_browser().navigations.is_empty());
    }

    #[test]
    fn test_terminal_job_is_not_reapplied() {
        let (db, job) = db_with_job("https://jobs.example/1");
        db.record_attempt(job.id, JobStatus::Applied, "submitted: earlier", true).unwrap();
        let job = db.get_job(job.id).unwrap().unwrap();
        let mut session = session(&db, three_step_form());

        let outcome = session.apply(&job);

        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(session.into_browser().navigations.is_empty());
        let job = db.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.last_apply_result.as_deref(), Some("submitted: earlier"));
    }

    #[test]
    fn test_batch_applies_best_fit_first() {
        let (db, first) = db_with_job("https://jobs.example/1");
        let second_id = db
            .add_job(&NewJob {
                external_id: "li-2".into(),
                title: "Staff Engineer".into(),
                url: Some("https://jobs.example/2".into()),
                apply_type: Some("Easy Apply".into()),
                ..Default::default()
            })
            .unwrap();
        db.record_screening(second_id, 0.9, None).unwrap();
        db.mark_ready(second_id).unwrap();

        // job 2 has no Easy Apply button, job 1 is the three-step form
        let mut browser = three_step_form().route("https://jobs.example/2", 4);
        browser.pages.push(page(vec![], vec![button("ext", "Apply on company site")]));
        let mut session = session(&db, browser);

        let summary = session.run_batch(10).unwrap();

        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.submitted, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.results[0].0, second_id);
        assert_eq!(summary.results[1].0, first.id);
        assert_eq!(summary.answers.fallbacks, 2);
        assert_eq!(db.get_job(first.id).unwrap().unwrap().status, JobStatus::Applied);
        assert_eq!(db.get_job(second_id).unwrap().unwrap().status, JobStatus::Skipped);
    }

    #[test]
    fn test_cancelled_batch_attempts_nothing() {
        let (db, job) = db_with_job("https://jobs.example/1");
        let cancel = CancelToken::new();
        cancel.cancel();
        let settings = SessionSettings { pace_min: Duration::ZERO, pace_max: Duration::ZERO, ..Default::default() };
        let mut session = ApplicationSession::new(
            &db,
            three_step_form(),
            engine(None),
            MachineSettings::default(),
            settings,
            cancel,
        );

        let summary = session.run_batch(10).unwrap();

        assert_eq!(summary.attempted, 0);
        assert!(summary.aborted);
        assert_eq!(db.get_job(job.id).unwrap().unwrap().apply_attempts, 0);
    }
}
