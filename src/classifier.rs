use anyhow::{anyhow, Error};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::models::FieldType;
use crate::profile::{yes_no, CandidateProfile};

/// Semantic category of an application question. Used to pick a fallback
/// rule and to group previously answered questions for few-shot prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Salary,
    NoticePeriod,
    ExperienceYears,
    WorkAuthorization,
    Availability,
    Relocation,
    RemoteWork,
    RatingScale,
    ContactLink,
    Location,
    General,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Salary => "salary",
            Category::NoticePeriod => "notice_period",
            Category::ExperienceYears => "experience_years",
            Category::WorkAuthorization => "yes_no_authorization",
            Category::Availability => "availability",
            Category::Relocation => "relocation",
            Category::RemoteWork => "remote_work",
            Category::RatingScale => "rating_scale",
            Category::ContactLink => "contact_link",
            Category::Location => "location",
            Category::General => "general",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RULES
            .iter()
            .map(|(category, _)| *category)
            .chain(std::iter::once(Category::General))
            .find(|category| category.as_str() == s.trim())
            .ok_or_else(|| anyhow!("Unknown question category '{}'", s))
    }
}

// Order matters: "rate your experience" is a rating question, not an
// experience question, and "relocate" must win over "location".
static RULES: LazyLock<Vec<(Category, Regex)>> = LazyLock::new(|| {
    [
        (
            Category::RatingScale,
            r"scale of|on a scale|rate (yourself|your)|how would you rate|proficiency level|\b(1|one)\s*(-|to)\s*(5|10|five|ten)\b|out of (5|10)\b",
        ),
        (
            Category::Salary,
            r"\b(salary|compensation|ctc|lpa|remuneration|pay|package)\b|cost to company",
        ),
        (
            Category::NoticePeriod,
            r"\bnotice\b|how soon can you join|serving notice",
        ),
        (
            Category::ExperienceYears,
            r"years? of (\w+ )?experience|how many years|how long have you (worked|been)|total experience|experience\b.*\byears?\b",
        ),
        (
            Category::WorkAuthorization,
            r"authori[sz]ed to work|work authori[sz]ation|legally (able|allowed|permitted|eligible) to work|sponsorship|\bvisa\b|right to work|work permit",
        ),
        (
            Category::Availability,
            r"start date|when can you (start|join)|earliest .*(start|join)|available to (start|join)|availability|date of joining",
        ),
        (Category::Relocation, r"relocat|willing to (move|shift)"),
        (
            Category::RemoteWork,
            r"\bremote\b|work from home|\bwfh\b|\bhybrid\b|on-?site|in[- ]office|commut",
        ),
        (
            Category::ContactLink,
            r"linkedin|github|portfolio|website|personal site|profile url",
        ),
        (
            Category::Location,
            r"\blocation\b|which city|current city|where are you (based|located)|\bbased in\b",
        ),
    ]
    .into_iter()
    .map(|(category, pattern)| {
        let regex = Regex::new(pattern).expect("classifier patterns are valid regexes");
        (category, regex)
    })
    .collect()
});

/// A number with optional digit-group separators ("1,500,000", "15,00,000",
/// "1_000", "1 500 000") and an optional fraction.
static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-?\d+(?:[,_ ]\d+)*(?:\.\d+)?").expect("number pattern is a valid regex")
});

static FIVE_POINT_SCALE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(1|one)\s*(-|to)\s*(5|five)\b|out of (5|five)\b")
        .expect("scale pattern is a valid regex")
});

/// Maps question text to a category. First matching rule wins.
pub fn classify(question: &str) -> Category {
    let lower = question.to_lowercase();
    RULES
        .iter()
        .find(|(_, regex)| regex.is_match(&lower))
        .map(|(category, _)| *category)
        .unwrap_or(Category::General)
}

/// Deterministic, profile-derived answer used when the cache and the AI both
/// fail. `None` means no rule applies or the profile lacks the value.
pub fn fallback_answer(
    question: &str,
    field_type: FieldType,
    profile: &CandidateProfile,
) -> Option<String> {
    let lower = question.to_lowercase();

    match field_type {
        FieldType::Email | FieldType::Url if asks_about_someone_else(&lower) => return None,
        FieldType::Email => return profile.email.clone(),
        FieldType::Url => return link_for(&lower, profile),
        _ => {}
    }

    match classify(question) {
        Category::Salary => salary_answer(&lower, field_type, profile),
        Category::NoticePeriod => profile
            .notice_period_days
            .map(|days| with_unit(days, "days", field_type)),
        Category::ExperienceYears => {
            let years = profile
                .skill_years_in(question)
                .or(profile.experience_years)?;
            Some(with_unit(years, "years", field_type))
        }
        Category::WorkAuthorization => {
            if lower.contains("sponsor") || lower.contains("visa") {
                profile.requires_sponsorship.map(|flag| yes_no(flag).to_string())
            } else {
                profile.work_authorized.map(|flag| yes_no(flag).to_string())
            }
        }
        Category::Availability => {
            let days = profile.notice_period_days?;
            Some(match field_type {
                FieldType::Number => days.to_string(),
                _ if days == 0 => "Immediately".to_string(),
                _ => format!("Within {} days", days),
            })
        }
        Category::Relocation => profile.open_to_relocation.map(|flag| yes_no(flag).to_string()),
        Category::RemoteWork => profile.open_to_remote.map(|flag| yes_no(flag).to_string()),
        Category::RatingScale => Some(rating_answer(&lower)),
        Category::ContactLink => link_for(&lower, profile),
        Category::Location => profile.location.clone(),
        Category::General => general_answer(&lower, question, profile),
    }
}

fn salary_answer(lower: &str, field_type: FieldType, profile: &CandidateProfile) -> Option<String> {
    let asks_current = ["current", "present", "drawn", "last"]
        .iter()
        .any(|word| lower.contains(word));
    let value = if asks_current {
        profile.compensation.current.as_ref()
    } else {
        profile.compensation.expected.as_ref()
    }?;

    let number = numeric_part(value)?;
    match field_type {
        FieldType::Number => Some(number),
        _ => match &profile.compensation.unit {
            Some(unit) if !value.contains(unit.as_str()) => Some(format!("{} {}", value.trim(), unit)),
            _ => Some(value.trim().to_string()),
        },
    }
}

fn rating_answer(lower: &str) -> String {
    if FIVE_POINT_SCALE.is_match(lower) {
        return "4".to_string();
    }
    let senior_topic = ["architect", "system design", "lead", "manage", "mentor"]
        .iter()
        .any(|topic| lower.contains(topic));
    let rating = if senior_topic { "9" } else { "8" };
    rating.to_string()
}

fn link_for(lower: &str, profile: &CandidateProfile) -> Option<String> {
    let links = &profile.links;
    if lower.contains("github") {
        return links.github.clone();
    }
    if lower.contains("portfolio") || lower.contains("website") || lower.contains("site") {
        return links.portfolio.clone().or_else(|| links.github.clone());
    }
    links.linkedin.clone()
}

fn general_answer(lower: &str, question: &str, profile: &CandidateProfile) -> Option<String> {
    if asks_about_someone_else(lower) {
        return None;
    }
    if lower.contains("phone") || lower.contains("mobile") {
        return profile.phone.clone();
    }
    if lower.contains("email") || lower.contains("e-mail") {
        return profile.email.clone();
    }
    if lower.contains("first name") || lower.contains("given name") {
        return profile.first_name().map(str::to_string);
    }
    if lower.contains("last name") || lower.contains("surname") || lower.contains("family name") {
        return profile.last_name().map(str::to_string);
    }
    if lower.contains("full name") || lower.contains("your name") {
        return Some(profile.name.clone()).filter(|name| !name.is_empty());
    }
    if lower.contains("current company") || lower.contains("current employer") {
        return profile.current_company.clone();
    }
    if lower.contains("current title") || lower.contains("current role") || lower.contains("designation") {
        return profile.current_role.clone();
    }
    if lower.starts_with("do you have") && lower.contains("experience") {
        return profile.skill_years_in(question).map(|_| "Yes".to_string());
    }
    None
}

/// Contact questions about a third party (referrer, reference, manager).
/// The candidate's own details would be a wrong answer there.
fn asks_about_someone_else(lower: &str) -> bool {
    ["referr", "reference", "referee", "manager", "supervisor", "recruiter", "colleague", "emergency contact"]
        .iter()
        .any(|who| lower.contains(who))
}

fn with_unit(value: u32, unit: &str, field_type: FieldType) -> String {
    match field_type {
        FieldType::Number => value.to_string(),
        _ => format!("{} {}", value, unit),
    }
}

/// First number in `value` with group separators removed.
pub(crate) fn numeric_part(value: &str) -> Option<String> {
    NUMBER
        .find(value)
        .map(|m| m.as_str().chars().filter(|c| !matches!(c, ',' | '_' | ' ')).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Compensation, ContactLinks};

    fn profile() -> CandidateProfile {
        CandidateProfile {
            name: "Asha Menon".to_string(),
            email: Some("asha@example.com".to_string()),
            phone: Some("+91 98450 00000".to_string()),
            location: Some("Bengaluru, India".to_string()),
            experience_years: Some(12),
            skills: [("python".to_string(), 8), ("kubernetes".to_string(), 4)]
                .into_iter()
                .collect(),
            compensation: Compensation {
                current: Some("70".to_string()),
                expected: Some("90".to_string()),
                unit: Some("LPA".to_string()),
            },
            notice_period_days: Some(30),
            work_authorized: Some(true),
            requires_sponsorship: Some(false),
            open_to_relocation: Some(true),
            open_to_remote: Some(true),
            links: ContactLinks {
                linkedin: Some("https://linkedin.com/in/asha".to_string()),
                github: Some("https://github.com/asha".to_string()),
                portfolio: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_table() {
        let cases = [
            ("Expected CTC?", Category::Salary),
            ("What is your current compensation (in LPA)?", Category::Salary),
            ("What is your notice period?", Category::NoticePeriod),
            ("How many years of experience do you have with Python?", Category::ExperienceYears),
            ("Are you legally authorized to work in India?", Category::WorkAuthorization),
            ("Will you now or in the future require visa sponsorship?", Category::WorkAuthorization),
            ("When can you start?", Category::Availability),
            ("Are you willing to relocate to Pune?", Category::Relocation),
            ("Are you comfortable working from a hybrid setup?", Category::RemoteWork),
            ("On a scale of 1-10, rate your experience with AWS", Category::RatingScale),
            ("LinkedIn Profile", Category::ContactLink),
            ("What is your preferred location?", Category::Location),
            ("Why do you want to join us?", Category::General),
        ];
        for (question, expected) in cases {
            assert_eq!(classify(question), expected, "question: {}", question);
        }
    }

    #[test]
    fn test_classify_is_idempotent() {
        let question = "How would you rate your Kubernetes skills?";
        let first = classify(question);
        for _ in 0..5 {
            assert_eq!(classify(question), first);
        }
    }

    #[test]
    fn test_pay_is_matched_as_word() {
        assert_eq!(classify("Do you use PayPal?"), Category::General);
    }

    #[test]
    fn test_category_round_trips_through_str() {
        assert_eq!("yes_no_authorization".parse::<Category>().unwrap(), Category::WorkAuthorization);
        assert_eq!("general".parse::<Category>().unwrap(), Category::General);
        assert!("salaryish".parse::<Category>().is_err());
    }

    #[test]
    fn test_salary_formats_per_field_type() {
        let p = profile();
        assert_eq!(fallback_answer("Expected CTC?", FieldType::Number, &p).as_deref(), Some("90"));
        assert_eq!(fallback_answer("Expected CTC?", FieldType::Text, &p).as_deref(), Some("90 LPA"));
        assert_eq!(fallback_answer("Current CTC?", FieldType::Number, &p).as_deref(), Some("70"));
    }

    #[test]
    fn test_numeric_part_drops_group_separators() {
        assert_eq!(numeric_part("1,500,000").as_deref(), Some("1500000"));
        assert_eq!(numeric_part("15,00,000").as_deref(), Some("1500000"));
        assert_eq!(numeric_part("$120,000/yr").as_deref(), Some("120000"));
        assert_eq!(numeric_part("1 500 000 EUR").as_deref(), Some("1500000"));
        assert_eq!(numeric_part("about 8.5 years").as_deref(), Some("8.5"));
        assert_eq!(numeric_part("-3").as_deref(), Some("-3"));
        assert_eq!(numeric_part("12, 15 or 20").as_deref(), Some("12"));
        assert_eq!(numeric_part("none"), None);
    }

    #[test]
    fn test_salary_with_indian_grouping() {
        let mut p = profile();
        p.compensation.expected = Some("15,00,000".to_string());
        p.compensation.unit = Some("INR".to_string());
        assert_eq!(
            fallback_answer("Expected CTC?", FieldType::Number, &p).as_deref(),
            Some("1500000")
        );
        assert_eq!(
            fallback_answer("Expected CTC?", FieldType::Text, &p).as_deref(),
            Some("15,00,000 INR")
        );
    }

    #[test]
    fn test_salary_without_profile_value_is_none() {
        let mut p = profile();
        p.compensation = Compensation::default();
        assert_eq!(fallback_answer("Expected salary?", FieldType::Text, &p), None);
    }

    #[test]
    fn test_experience_prefers_skill_years() {
        let p = profile();
        assert_eq!(
            fallback_answer("How many years of experience do you have with Python?", FieldType::Number, &p)
                .as_deref(),
            Some("8")
        );
        assert_eq!(
            fallback_answer("Total years of experience", FieldType::Text, &p).as_deref(),
            Some("12 years")
        );
    }

    #[test]
    fn test_experience_ignores_skill_inside_other_word() {
        let mut p = profile();
        p.skills.insert("go".to_string(), 3);
        assert_eq!(
            fallback_answer(
                "How many years of experience do you have with Google Cloud?",
                FieldType::Number,
                &p
            )
            .as_deref(),
            Some("12")
        );
    }

    #[test]
    fn test_third_party_contact_is_not_the_candidate() {
        let p = profile();
        assert_eq!(fallback_answer("Referrer's email", FieldType::Email, &p), None);
        assert_eq!(fallback_answer("Email of your reporting manager", FieldType::Text, &p), None);
        assert_eq!(fallback_answer("Reference phone number", FieldType::Text, &p), None);
        assert_eq!(fallback_answer("Referrer's LinkedIn profile", FieldType::Url, &p), None);
        assert_eq!(fallback_answer("Your email", FieldType::Email, &p).as_deref(), Some("asha@example.com"));
    }

    #[test]
    fn test_authorization_and_sponsorship() {
        let p = profile();
        assert_eq!(
            fallback_answer("Are you legally authorized to work here?", FieldType::Unset, &p).as_deref(),
            Some("Yes")
        );
        assert_eq!(
            fallback_answer("Do you require visa sponsorship?", FieldType::Unset, &p).as_deref(),
            Some("No")
        );
    }

    #[test]
    fn test_rating_scale_defaults() {
        let p = profile();
        assert_eq!(
            fallback_answer("On a scale of 1-10, rate your Docker skills", FieldType::Number, &p).as_deref(),
            Some("8")
        );
        assert_eq!(
            fallback_answer("Rate your system design ability on a scale of 1-10", FieldType::Number, &p)
                .as_deref(),
            Some("9")
        );
        assert_eq!(
            fallback_answer("Rate yourself from 1 to 5 in SQL", FieldType::Number, &p).as_deref(),
            Some("4")
        );
    }

    #[test]
    fn test_contact_fields() {
        let p = profile();
        assert_eq!(
            fallback_answer("LinkedIn Profile", FieldType::Text, &p).as_deref(),
            Some("https://linkedin.com/in/asha")
        );
        assert_eq!(
            fallback_answer("GitHub URL", FieldType::Url, &p).as_deref(),
            Some("https://github.com/asha")
        );
        assert_eq!(
            fallback_answer("Email address", FieldType::Email, &p).as_deref(),
            Some("asha@example.com")
        );
        assert_eq!(fallback_answer("Mobile phone number", FieldType::Text, &p).as_deref(), Some("+91 98450 00000"));
        assert_eq!(fallback_answer("First name", FieldType::Text, &p).as_deref(), Some("Asha"));
    }

    #[test]
    fn test_availability_and_notice() {
        let p = profile();
        assert_eq!(fallback_answer("Notice period (in days)", FieldType::Number, &p).as_deref(), Some("30"));
        assert_eq!(fallback_answer("When can you start?", FieldType::Text, &p).as_deref(), Some("Within 30 days"));
    }

    #[test]
    fn test_no_rule_returns_none() {
        let p = profile();
        assert_eq!(fallback_answer("Why do you want to join us?", FieldType::Text, &p), None);
        assert_eq!(
            fallback_answer("Do you have experience with Erlang?", FieldType::Unset, &p),
            None
        );
    }

    #[test]
    fn test_fallback_is_deterministic() {
        let p = profile();
        let first = fallback_answer("Are you willing to relocate?", FieldType::Text, &p);
        for _ in 0..3 {
            assert_eq!(fallback_answer("Are you willing to relocate?", FieldType::Text, &p), first);
        }
    }
}
