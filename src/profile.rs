use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Read-only candidate record used to ground answers. Loaded once per session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateProfile {
    pub name: String,
    pub title: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub current_company: Option<String>,
    pub current_role: Option<String>,
    pub experience_years: Option<u32>,
    /// Skill name (lowercase) to years of hands-on experience.
    pub skills: BTreeMap<String, u32>,
    pub compensation: Compensation,
    pub notice_period_days: Option<u32>,
    pub work_authorized: Option<bool>,
    pub requires_sponsorship: Option<bool>,
    pub open_to_relocation: Option<bool>,
    pub open_to_remote: Option<bool>,
    pub links: ContactLinks,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Compensation {
    pub current: Option<String>,
    pub expected: Option<String>,
    /// Unit appended for free-text answers, e.g. "LPA" or "USD".
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactLinks {
    pub linkedin: Option<String>,
    pub github: Option<String>,
    pub portfolio: Option<String>,
}

impl CandidateProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read candidate profile: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse candidate profile: {}", path.display()))
    }

    pub fn first_name(&self) -> Option<&str> {
        self.name.split_whitespace().next()
    }

    pub fn last_name(&self) -> Option<&str> {
        let mut parts = self.name.split_whitespace();
        parts.next()?;
        parts.last()
    }

    /// Years of experience with a skill named in `question`, if the profile
    /// lists one.
    pub fn skill_years_in(&self, question: &str) -> Option<u32> {
        let lower = question.to_lowercase();
        self.skills
            .iter()
            .filter(|(skill, _)| mentions_word(&lower, &skill.to_lowercase()))
            // prefer the longest (most specific) skill name
            .max_by_key(|(skill, _)| skill.len())
            .map(|(_, years)| *years)
    }

    /// Compact profile description for AI prompts.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        let name = if self.name.is_empty() { "Candidate" } else { &self.name };
        lines.push(format!("- Name: {}", name));
        if let Some(title) = &self.title {
            lines.push(format!("- Title: {}", title));
        }
        if let Some(years) = self.experience_years {
            lines.push(format!("- Years of Experience: {}", years));
        }
        match (&self.current_role, &self.current_company) {
            (Some(role), Some(company)) => lines.push(format!("- Current Role: {} at {}", role, company)),
            (Some(role), None) => lines.push(format!("- Current Role: {}", role)),
            (None, Some(company)) => lines.push(format!("- Current Company: {}", company)),
            (None, None) => {}
        }
        if let Some(location) = &self.location {
            lines.push(format!("- Location: {}", location));
        }
        if !self.skills.is_empty() {
            let skills: Vec<String> = self
                .skills
                .iter()
                .map(|(skill, years)| format!("{} ({}y)", skill, years))
                .collect();
            lines.push(format!("- Skills: {}", skills.join(", ")));
        }
        if let Some(days) = self.notice_period_days {
            lines.push(format!("- Notice Period: {} days", days));
        }
        let unit = self.compensation.unit.as_deref().unwrap_or("");
        if let Some(current) = &self.compensation.current {
            lines.push(format!("- Current Compensation: {} {}", current, unit).trim_end().to_string());
        }
        if let Some(expected) = &self.compensation.expected {
            lines.push(format!("- Expected Compensation: {} {}", expected, unit).trim_end().to_string());
        }
        if let Some(authorized) = self.work_authorized {
            lines.push(format!("- Authorized to Work: {}", yes_no(authorized)));
        }
        if let Some(sponsorship) = self.requires_sponsorship {
            lines.push(format!("- Requires Sponsorship: {}", yes_no(sponsorship)));
        }
        if let Some(relocate) = self.open_to_relocation {
            lines.push(format!("- Open to Relocation: {}", yes_no(relocate)));
        }
        if let Some(remote) = self.open_to_remote {
            lines.push(format!("- Open to Remote/Hybrid: {}", yes_no(remote)));
        }
        if let Some(email) = &self.email {
            lines.push(format!("- Email: {}", email));
        }
        if let Some(linkedin) = &self.links.linkedin {
            lines.push(format!("- LinkedIn: {}", linkedin));
        }
        lines.join("\n")
    }
}

/// True when `term` occurs in `text` not glued to other letters or digits,
/// so "go" is not found in "google" and "java" not in "javascript".
fn mentions_word(text: &str, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    text.match_indices(term).any(|(start, _)| {
        let before = text[..start].chars().next_back();
        let after = text[start + term.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

pub fn yes_no(flag: bool) -> &'static str {
    if flag { "Yes" } else { "No" }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CandidateProfile {
        serde_json::from_str(
            r#"{
                "name": "Asha Rao Menon",
                "title": "Engineering Manager",
                "experience_years": 12,
                "skills": {"python": 8, "aws": 6, "rust": 2},
                "compensation": {"expected": "90", "unit": "LPA"},
                "notice_period_days": 30,
                "work_authorized": true,
                "links": {"linkedin": "https://linkedin.com/in/asha"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_partial_profile_deserializes() {
        let profile = sample();
        assert_eq!(profile.experience_years, Some(12));
        assert_eq!(profile.compensation.expected.as_deref(), Some("90"));
        assert!(profile.compensation.current.is_none());
        assert!(profile.open_to_relocation.is_none());
    }

    #[test]
    fn test_names() {
        let profile = sample();
        assert_eq!(profile.first_name(), Some("Asha"));
        assert_eq!(profile.last_name(), Some("Menon"));

        let mono = CandidateProfile { name: "Prince".into(), ..Default::default() };
        assert_eq!(mono.last_name(), None);
    }

    #[test]
    fn test_skill_years_in() {
        let profile = sample();
        assert_eq!(profile.skill_years_in("How many years of Python experience?"), Some(8));
        assert_eq!(profile.skill_years_in("Years with Kubernetes?"), None);
    }

    #[test]
    fn test_skill_years_match_whole_words() {
        let profile = CandidateProfile {
            skills: [("go".to_string(), 3), ("java".to_string(), 5), ("rust".to_string(), 2), ("c++".to_string(), 4)]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        assert_eq!(profile.skill_years_in("Years of experience with Google Cloud?"), None);
        assert_eq!(profile.skill_years_in("How many years of JavaScript?"), None);
        assert_eq!(profile.skill_years_in("Do you build systems people trust?"), None);
        assert_eq!(profile.skill_years_in("Years of Go (Golang) experience?"), Some(3));
        assert_eq!(profile.skill_years_in("Experience with Rust/WebAssembly"), Some(2));
        assert_eq!(profile.skill_years_in("How many years of C++?"), Some(4));
    }

    #[test]
    fn test_summary_mentions_key_facts() {
        let summary = sample().summary();
        assert!(summary.contains("Asha Rao Menon"));
        assert!(summary.contains("Expected Compensation: 90 LPA"));
        assert!(summary.contains("Notice Period: 30 days"));
        assert!(summary.contains("Authorized to Work: Yes"));
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = CandidateProfile::load(Path::new("/nonexistent/profile.json"));
        assert!(result.is_err());
    }
}
