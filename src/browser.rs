use std::path::Path;
use thiserror::Error;

use crate::form::FormStepSnapshot;

/// Opaque handle to a form field, issued by the browser in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef(pub String);

/// Opaque handle to a clickable control (button or link).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlRef(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrowserError {
    #[error("browser operation timed out: {0}")]
    Timeout(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("navigation blocked: {0}")]
    NavigationBlocked(String),

    #[error("element detached from page: {0}")]
    Detached(String),

    #[error("browser session lost: {0}")]
    SessionLost(String),
}

impl BrowserError {
    /// Worth retrying in place: the page is still there, the call just lost a race.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrowserError::Timeout(_) | BrowserError::Detached(_))
    }

    /// The session cannot continue with this job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrowserError::SessionLost(_) | BrowserError::NavigationBlocked(_))
    }
}

pub type BrowserResult<T> = std::result::Result<T, BrowserError>;

/// What the form engine needs from a browser. Implementations own the page
/// markup; callers only ever see structured snapshots and opaque refs.
pub trait BrowserAutomation {
    fn navigate(&mut self, url: &str) -> BrowserResult<()>;

    /// Visible fields, buttons and validation messages of the current page.
    fn snapshot(&mut self) -> BrowserResult<FormStepSnapshot>;

    /// Sets a field's value. For select and radio fields `value` is the label
    /// of the option to pick; for checkboxes "Yes"/"No".
    fn fill(&mut self, field: &FieldRef, value: &str) -> BrowserResult<()>;

    fn click(&mut self, control: &ControlRef) -> BrowserResult<()>;

    fn upload(&mut self, field: &FieldRef, file: &Path) -> BrowserResult<()>;

    /// Captures the page and returns a reference (usually a file path).
    fn screenshot(&mut self, name: &str) -> BrowserResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(BrowserError::Timeout("click".into()).is_transient());
        assert!(BrowserError::Detached("field".into()).is_transient());
        assert!(!BrowserError::SessionLost("gone".into()).is_transient());
        assert!(!BrowserError::ElementNotFound("submit".into()).is_transient());
        assert!(!BrowserError::ElementNotFound("submit".into()).is_fatal());
        assert!(BrowserError::NavigationBlocked("login".into()).is_fatal());
        assert!(!BrowserError::Timeout("click".into()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = BrowserError::SessionLost("chrome exited".into());
        assert_eq!(err.to_string(), "browser session lost: chrome exited");
    }
}
