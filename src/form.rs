use sha2::{Digest, Sha256};

use crate::browser::{ControlRef, FieldRef};
use crate::models::FieldType;

/// Below this similarity an answer is not mapped onto an option.
const OPTION_MATCH_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Input,
    TextArea,
    Select,
    Radio,
    Checkbox,
    File,
}

impl FieldKind {
    pub fn parse(kind: &str) -> Self {
        match kind.trim().to_lowercase().as_str() {
            "textarea" => FieldKind::TextArea,
            "select" | "select-one" => FieldKind::Select,
            "radio" => FieldKind::Radio,
            "checkbox" => FieldKind::Checkbox,
            "file" => FieldKind::File,
            _ => FieldKind::Input,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub field_ref: FieldRef,
    pub label: String,
    pub field_type: FieldType,
    pub kind: FieldKind,
    pub value: String,
    pub required: bool,
    pub options: Vec<String>,
    pub error: Option<String>,
}

impl FieldDescriptor {
    pub fn is_empty(&self) -> bool {
        let value = self.value.trim();
        value.is_empty() || (self.kind == FieldKind::Select && is_prompt_option(value))
    }

    pub fn is_choice(&self) -> bool {
        matches!(self.kind, FieldKind::Select | FieldKind::Radio | FieldKind::Checkbox)
    }

    pub fn needs_answer(&self) -> bool {
        self.required && self.is_empty()
    }

    /// Options an answer can be mapped onto, minus "Select an option" prompts.
    pub fn answer_options(&self) -> Vec<String> {
        if self.kind == FieldKind::Checkbox && self.options.is_empty() {
            return vec!["Yes".to_string(), "No".to_string()];
        }
        self.options
            .iter()
            .filter(|o| !is_prompt_option(o))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ButtonDescriptor {
    pub control_ref: ControlRef,
    pub label: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonRole {
    EasyApply,
    Submit,
    Review,
    Next,
    Other,
}

pub fn button_role(label: &str) -> ButtonRole {
    let label = label.trim().to_lowercase();
    if label.contains("easy apply") {
        ButtonRole::EasyApply
    } else if label.contains("submit") {
        ButtonRole::Submit
    } else if label.contains("review") {
        ButtonRole::Review
    } else if label.contains("next") || label.contains("continue") {
        ButtonRole::Next
    } else {
        ButtonRole::Other
    }
}

/// One step of a multi-step application form as the browser sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormStepSnapshot {
    pub fields: Vec<FieldDescriptor>,
    pub buttons: Vec<ButtonDescriptor>,
    /// Page-level validation messages (banners, alerts).
    pub errors: Vec<String>,
}

impl FormStepSnapshot {
    /// Stable identity of the step: same labels, buttons and field count means
    /// the page did not move.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for field in &self.fields {
            hasher.update(field.label.trim().as_bytes());
            hasher.update(b"|");
        }
        hasher.update(b"#");
        for button in &self.buttons {
            hasher.update(button.label.trim().as_bytes());
            hasher.update(b"|");
        }
        hasher.update(self.fields.len().to_string().as_bytes());
        hasher.finalize()[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn enabled_button(&self, role: ButtonRole) -> Option<&ButtonDescriptor> {
        self.buttons
            .iter()
            .find(|b| b.enabled && button_role(&b.label) == role)
    }

    /// The control that moves the form forward: submit, then review, then next.
    pub fn advance_control(&self) -> Option<(ButtonRole, &ButtonDescriptor)> {
        [ButtonRole::Submit, ButtonRole::Review, ButtonRole::Next]
            .into_iter()
            .find_map(|role| self.enabled_button(role).map(|b| (role, b)))
    }

    /// Everything that blocks the step: inline field errors, page messages and
    /// required fields that are still empty.
    pub fn validation_issues(&self) -> Vec<String> {
        let mut issues: Vec<String> = self
            .fields
            .iter()
            .filter_map(|f| f.error.as_ref().map(|e| format!("{}: {}", f.label, e)))
            .collect();
        issues.extend(self.errors.iter().cloned());
        issues.extend(
            self.fields
                .iter()
                .filter(|f| f.needs_answer() && f.error.is_none())
                .map(|f| format!("{}: required field is empty", f.label)),
        );
        issues
    }
}

fn is_prompt_option(option: &str) -> bool {
    let lower = option.trim().to_lowercase();
    lower.is_empty() || lower.starts_with("select") || lower.starts_with("choose") || lower == "--"
}

/// Maps a free-form answer onto the closest offered option.
pub fn match_option(answer: &str, options: &[String]) -> Option<String> {
    let wanted = answer.trim().to_lowercase();
    if wanted.is_empty() || options.is_empty() {
        return None;
    }

    if let Some(exact) = options.iter().find(|o| o.trim().to_lowercase() == wanted) {
        return Some(exact.clone());
    }

    // "Yes" against "Yes, I am authorized to work"
    if let Some(prefixed) = options.iter().find(|o| {
        let option = o.trim().to_lowercase();
        option.starts_with(&format!("{wanted} ")) || option.starts_with(&format!("{wanted},"))
    }) {
        return Some(prefixed.clone());
    }

    options
        .iter()
        .map(|o| {
            let option = o.trim().to_lowercase();
            let score = strsim::jaro_winkler(&wanted, &option)
                .max(strsim::normalized_levenshtein(&wanted, &option));
            (o, score)
        })
        .filter(|(_, score)| *score >= OPTION_MATCH_THRESHOLD)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(o, _)| o.clone())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn text_field(id: &str, label: &str, required: bool) -> FieldDescriptor {
        FieldDescriptor {
            field_ref: FieldRef(id.to_string()),
            label: label.to_string(),
            field_type: FieldType::Text,
            kind: FieldKind::Input,
            value: String::new(),
            required,
            options: Vec::new(),
            error: None,
        }
    }

    pub fn button(id: &str, label: &str) -> ButtonDescriptor {
        ButtonDescriptor {
            control_ref: ControlRef(id.to_string()),
            label: label.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn test_button_roles() {
        assert_eq!(button_role("Easy Apply to Acme"), ButtonRole::EasyApply);
        assert_eq!(button_role("Submit application"), ButtonRole::Submit);
        assert_eq!(button_role("Review your application"), ButtonRole::Review);
        assert_eq!(button_role("Continue to next step"), ButtonRole::Next);
        assert_eq!(button_role("Dismiss"), ButtonRole::Other);
    }

    #[test]
    fn test_advance_control_priority() {
        let mut snapshot = FormStepSnapshot {
            buttons: vec![button("b1", "Next"), button("b2", "Review"), button("b3", "Submit application")],
            ..Default::default()
        };
        assert_eq!(snapshot.advance_control().unwrap().0, ButtonRole::Submit);

        snapshot.buttons[2].enabled = false;
        assert_eq!(snapshot.advance_control().unwrap().0, ButtonRole::Review);

        snapshot.buttons = vec![button("b1", "Dismiss")];
        assert!(snapshot.advance_control().is_none());
    }

    #[test]
    fn test_fingerprint_tracks_structure_not_values() {
        let mut a = FormStepSnapshot {
            fields: vec![text_field("f1", "Phone", true)],
            buttons: vec![button("b1", "Next")],
            errors: Vec::new(),
        };
        let before = a.fingerprint();
        a.fields[0].value = "555-0100".to_string();
        assert_eq!(a.fingerprint(), before);

        a.fields.push(text_field("f2", "City", false));
        assert_ne!(a.fingerprint(), before);
    }

    #[test]
    fn test_validation_issues() {
        let mut phone = text_field("f1", "Phone", true);
        phone.error = Some("Enter a valid phone number".to_string());
        let snapshot = FormStepSnapshot {
            fields: vec![phone, text_field("f2", "City", true), text_field("f3", "Website", false)],
            buttons: Vec::new(),
            errors: vec!["Please make a selection".to_string()],
        };
        let issues = snapshot.validation_issues();
        assert_eq!(
            issues,
            vec![
                "Phone: Enter a valid phone number".to_string(),
                "Please make a selection".to_string(),
                "City: required field is empty".to_string(),
            ]
        );
    }

    #[test]
    fn test_select_prompt_counts_as_empty() {
        let mut field = text_field("f1", "Country", true);
        field.kind = FieldKind::Select;
        field.value = "Select an option".to_string();
        field.options = vec!["Select an option".into(), "India".into(), "Germany".into()];
        assert!(field.needs_answer());
        assert_eq!(field.answer_options(), vec!["India".to_string(), "Germany".to_string()]);
    }

    #[test]
    fn test_match_option() {
        let options: Vec<String> = vec!["Yes, I am authorized".into(), "No".into()];
        assert_eq!(match_option("yes", &options).as_deref(), Some("Yes, I am authorized"));
        assert_eq!(match_option("No", &options).as_deref(), Some("No"));

        let countries: Vec<String> = vec!["India".into(), "Indonesia".into(), "Germany".into()];
        assert_eq!(match_option("india", &countries).as_deref(), Some("India"));
        assert_eq!(match_option("Germny", &countries).as_deref(), Some("Germany"));
        assert_eq!(match_option("Brazil", &countries), None);
        assert_eq!(match_option("", &countries), None);
    }
}
