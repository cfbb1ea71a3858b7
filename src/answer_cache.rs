use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::classifier::{classify, Category};
use crate::models::FieldType;

/// Answers that mean "no answer". They are never stored and read back as a
/// miss if an older database contains them.
const PLACEHOLDERS: [&str; 5] = ["n/a", "unknown", "null", "undefined", "unanswered"];

pub(crate) const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS question_answers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        question_hash TEXT NOT NULL,
        question_text TEXT NOT NULL,
        category TEXT NOT NULL,
        field_type TEXT NOT NULL DEFAULT 'unset',
        answer TEXT NOT NULL,
        reuse_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        last_used_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE (question_hash, field_type, answer)
    );

    CREATE INDEX IF NOT EXISTS idx_answers_slot ON question_answers(question_hash, field_type);
    CREATE INDEX IF NOT EXISTS idx_answers_category ON question_answers(category);
"#;

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub id: i64,
    pub question_hash: String,
    pub question_text: String,
    pub category: String,
    pub field_type: String,
    pub answer: String,
    pub reuse_count: i64,
    pub created_at: String,
    pub last_used_at: String,
}

/// A previously answered question offered to the AI as a few-shot example.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarAnswer {
    pub question_text: String,
    pub field_type: String,
    pub answer: String,
    pub reuse_count: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: i64,
    pub distinct_questions: i64,
    pub total_reuses: i64,
    pub by_category: Vec<(String, i64)>,
}

/// Persistent answer store keyed by (normalized question, field type).
///
/// Reads and writes never fail from the caller's point of view: storage
/// errors are logged and treated as a miss or a skipped write, so a broken
/// cache only costs an extra AI call.
pub struct AnswerCache {
    conn: Connection,
}

impl AnswerCache {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open answer cache at {}", path.display()))?;
        // Parallel sessions share the file; wait for the writer instead of failing.
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create question_answers table")?;
        Ok(Self { conn })
    }

    pub fn lookup_exact(&self, question: &str, field_type: FieldType) -> Option<String> {
        match self.try_lookup_exact(question, field_type) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Answer cache lookup failed, treating as miss: {e}");
                None
            }
        }
    }

    fn try_lookup_exact(&self, question: &str, field_type: FieldType) -> rusqlite::Result<Option<String>> {
        let hash = question_hash(question);
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, answer FROM question_answers
                 WHERE question_hash = ?1 AND field_type = ?2
                 ORDER BY reuse_count DESC, last_used_at DESC, id DESC
                 LIMIT 1",
                params![hash, field_type.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, answer)) = row else {
            return Ok(None);
        };
        if is_placeholder(&answer) {
            return Ok(None);
        }

        self.conn.execute(
            "UPDATE question_answers
             SET reuse_count = reuse_count + 1, last_used_at = datetime('now')
             WHERE id = ?1",
            [id],
        )?;
        debug!("Answer cache hit for '{}' ({})", truncate(question, 50), field_type);
        Ok(Some(answer))
    }

    /// Entries of one category, most reused first. Context for prompts, not a
    /// substitute for an exact hit.
    pub fn lookup_similar(&self, category: Category, limit: usize) -> Vec<SimilarAnswer> {
        match self.try_lookup_similar(category, limit) {
            Ok(similar) => similar,
            Err(e) => {
                warn!("Similar-answer lookup failed: {e}");
                Vec::new()
            }
        }
    }

    fn try_lookup_similar(&self, category: Category, limit: usize) -> rusqlite::Result<Vec<SimilarAnswer>> {
        let mut stmt = self.conn.prepare(
            "SELECT question_text, field_type, answer, reuse_count
             FROM question_answers
             WHERE category = ?1
             ORDER BY reuse_count DESC, last_used_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([category.as_str()], |row| {
            Ok(SimilarAnswer {
                question_text: row.get(0)?,
                field_type: row.get(1)?,
                answer: row.get(2)?,
                reuse_count: row.get(3)?,
            })
        })?;

        let mut similar = Vec::new();
        for row in rows {
            let entry = row?;
            if is_placeholder(&entry.answer) {
                continue;
            }
            similar.push(entry);
            if similar.len() >= limit {
                break;
            }
        }
        Ok(similar)
    }

    /// Records an answer. Empty and placeholder answers are ignored; storing
    /// an answer already present for the slot bumps its reuse count.
    pub fn store(&self, question: &str, field_type: FieldType, answer: &str) {
        let answer = answer.trim();
        if answer.is_empty() || is_placeholder(answer) {
            debug!("Not caching placeholder answer for '{}'", truncate(question, 50));
            return;
        }
        if let Err(e) = self.try_store(question, field_type, answer) {
            warn!("Failed to cache answer for '{}': {e}", truncate(question, 50));
        }
    }

    fn try_store(&self, question: &str, field_type: FieldType, answer: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO question_answers (question_hash, question_text, category, field_type, answer)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (question_hash, field_type, answer) DO UPDATE SET
                 reuse_count = reuse_count + 1,
                 last_used_at = datetime('now')",
            params![
                question_hash(question),
                question.trim(),
                classify(question).as_str(),
                field_type.as_str(),
                answer
            ],
        )?;
        Ok(())
    }

    /// Drops one answer from a slot, e.g. after a form rejected it.
    pub fn discard(&self, question: &str, field_type: FieldType, answer: &str) {
        let result = self.conn.execute(
            "DELETE FROM question_answers
             WHERE question_hash = ?1 AND field_type = ?2 AND answer = ?3",
            params![question_hash(question), field_type.as_str(), answer.trim()],
        );
        match result {
            Ok(0) => {}
            Ok(_) => debug!("Discarded rejected answer for '{}'", truncate(question, 50)),
            Err(e) => warn!("Failed to discard answer for '{}': {e}", truncate(question, 50)),
        }
    }

    /// Removes every answer for one (question, field type) slot.
    pub fn forget(&self, question: &str, field_type: FieldType) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM question_answers WHERE question_hash = ?1 AND field_type = ?2",
            params![question_hash(question), field_type.as_str()],
        )?;
        Ok(removed)
    }

    pub fn entries(&self, category: Option<Category>, limit: usize) -> Result<Vec<CacheEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, question_hash, question_text, category, field_type, answer,
                    reuse_count, created_at, last_used_at
             FROM question_answers
             WHERE ?1 IS NULL OR category = ?1
             ORDER BY reuse_count DESC, last_used_at DESC, id DESC
             LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(
                params![category.map(|c| c.as_str()), limit as i64],
                Self::row_to_entry,
            )?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list cached answers")?;
        Ok(entries)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let (entries, distinct_questions, total_reuses): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT question_hash), COALESCE(SUM(reuse_count), 0)
             FROM question_answers",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT category, COUNT(*) FROM question_answers
             GROUP BY category ORDER BY COUNT(*) DESC, category",
        )?;
        let by_category: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CacheStats {
            entries,
            distinct_questions,
            total_reuses,
            by_category,
        })
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<CacheEntry> {
        Ok(CacheEntry {
            id: row.get(0)?,
            question_hash: row.get(1)?,
            question_text: row.get(2)?,
            category: row.get(3)?,
            field_type: row.get(4)?,
            answer: row.get(5)?,
            reuse_count: row.get(6)?,
            created_at: row.get(7)?,
            last_used_at: row.get(8)?,
        })
    }
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize_question(question: &str) -> String {
    let stripped: String = question
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn question_hash(question: &str) -> String {
    let digest = Sha256::digest(normalize_question(question).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn is_placeholder(answer: &str) -> bool {
    let answer = answer.trim();
    answer.is_empty() || PLACEHOLDERS.iter().any(|p| answer.eq_ignore_ascii_case(p))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> AnswerCache {
        AnswerCache::in_memory().unwrap()
    }

    #[test]
    fn test_normalize_question() {
        assert_eq!(normalize_question("  Expected   CTC? "), "expected ctc");
        assert_eq!(normalize_question("LinkedIn profile (URL):"), "linkedin profile url");
        assert_eq!(question_hash("Expected CTC?"), question_hash("expected ctc"));
        assert_ne!(question_hash("Expected CTC?"), question_hash("Current CTC?"));
        assert_eq!(question_hash("x").len(), 64);
    }

    #[test]
    fn test_type_aware_slots_are_independent() {
        let c = cache();
        c.store("Expected salary?", FieldType::Number, "90");
        c.store("Expected salary?", FieldType::Text, "90 LPA");
        assert_eq!(c.lookup_exact("Expected salary?", FieldType::Number).as_deref(), Some("90"));
        assert_eq!(c.lookup_exact("Expected salary?", FieldType::Text).as_deref(), Some("90 LPA"));
        assert_eq!(c.lookup_exact("Expected salary?", FieldType::Email), None);

        // reverse insertion order gives the same result
        let c = cache();
        c.store("Expected salary?", FieldType::Text, "90 LPA");
        c.store("Expected salary?", FieldType::Number, "90");
        assert_eq!(c.lookup_exact("Expected salary?", FieldType::Number).as_deref(), Some("90"));
        assert_eq!(c.lookup_exact("Expected salary?", FieldType::Text).as_deref(), Some("90 LPA"));
    }

    #[test]
    fn test_lookup_uses_normalized_text() {
        let c = cache();
        c.store("What is your notice period?", FieldType::Text, "30 days");
        assert_eq!(
            c.lookup_exact("what is your NOTICE period", FieldType::Text).as_deref(),
            Some("30 days")
        );
    }

    #[test]
    fn test_placeholders_are_never_stored() {
        let c = cache();
        c.store("Why us?", FieldType::Text, "N/A");
        c.store("Why us?", FieldType::Text, "   ");
        c.store("Why us?", FieldType::Text, "unknown");
        assert_eq!(c.lookup_exact("Why us?", FieldType::Text), None);
        assert_eq!(c.stats().unwrap().entries, 0);
    }

    #[test]
    fn test_placeholder_rows_read_as_miss() {
        let c = cache();
        c.conn
            .execute(
                "INSERT INTO question_answers (question_hash, question_text, category, field_type, answer)
                 VALUES (?1, 'Why us?', 'general', 'text', 'N/A')",
                [question_hash("Why us?")],
            )
            .unwrap();
        assert_eq!(c.lookup_exact("Why us?", FieldType::Text), None);
        assert!(c.lookup_similar(Category::General, 5).is_empty());
    }

    #[test]
    fn test_repeat_store_bumps_reuse_count() {
        let c = cache();
        c.store("Expected CTC?", FieldType::Number, "90");
        c.store("Expected CTC?", FieldType::Number, "90");
        let entries = c.entries(None, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reuse_count, 1);
        assert_eq!(entries[0].category, "salary");
    }

    #[test]
    fn test_hit_bumps_reuse_count() {
        let c = cache();
        c.store("Expected CTC?", FieldType::Number, "90");
        c.lookup_exact("Expected CTC?", FieldType::Number);
        c.lookup_exact("Expected CTC?", FieldType::Number);
        assert_eq!(c.entries(None, 10).unwrap()[0].reuse_count, 2);
    }

    #[test]
    fn test_distinct_answers_coexist_and_most_reused_wins() {
        let c = cache();
        c.store("Expected CTC?", FieldType::Number, "85");
        c.store("Expected CTC?", FieldType::Number, "90");
        c.store("Expected CTC?", FieldType::Number, "90");
        assert_eq!(c.entries(None, 10).unwrap().len(), 2);
        assert_eq!(c.lookup_exact("Expected CTC?", FieldType::Number).as_deref(), Some("90"));
    }

    #[test]
    fn test_lookup_similar_orders_by_reuse_and_filters_category() {
        let c = cache();
        c.store("Expected CTC?", FieldType::Number, "90");
        c.store("Desired salary", FieldType::Text, "90 LPA");
        c.store("Desired salary", FieldType::Text, "90 LPA");
        c.store("Desired salary", FieldType::Text, "90 LPA");
        c.store("Notice period?", FieldType::Number, "30");

        let similar = c.lookup_similar(Category::Salary, 5);
        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].question_text, "Desired salary");
        assert_eq!(similar[0].reuse_count, 2);
        assert_eq!(similar[1].answer, "90");

        assert_eq!(c.lookup_similar(Category::Salary, 1).len(), 1);
        assert!(c.lookup_similar(Category::Relocation, 5).is_empty());
    }

    #[test]
    fn test_forget_clears_slot() {
        let c = cache();
        c.store("Expected CTC?", FieldType::Number, "90");
        c.store("Expected CTC?", FieldType::Text, "90 LPA");
        assert_eq!(c.forget("expected ctc", FieldType::Number).unwrap(), 1);
        assert_eq!(c.lookup_exact("Expected CTC?", FieldType::Number), None);
        assert!(c.lookup_exact("Expected CTC?", FieldType::Text).is_some());
    }

    #[test]
    fn test_discard_drops_only_the_rejected_answer() {
        let c = cache();
        c.store("Expected CTC?", FieldType::Number, "90");
        c.store("Expected CTC?", FieldType::Number, "90");
        c.store("Expected CTC?", FieldType::Number, "45");
        c.store("Expected CTC?", FieldType::Text, "90");
        c.discard("expected ctc", FieldType::Number, "90");
        assert_eq!(c.lookup_exact("Expected CTC?", FieldType::Number).as_deref(), Some("45"));
        assert_eq!(c.lookup_exact("Expected CTC?", FieldType::Text).as_deref(), Some("90"));
        c.discard("Expected CTC?", FieldType::Number, "never stored");
        assert_eq!(c.stats().unwrap().entries, 2);
    }

    #[test]
    fn test_entries_limit_and_category() {
        let c = cache();
        c.store("Expected CTC?", FieldType::Number, "90");
        c.store("Current CTC?", FieldType::Number, "70");
        c.store("Current CTC?", FieldType::Number, "70");
        c.store("Notice period?", FieldType::Number, "30");

        let top = c.entries(None, 2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].question_text, "Current CTC?");

        let salary = c.entries(Some(Category::Salary), 10).unwrap();
        assert_eq!(salary.len(), 2);
        assert!(salary.iter().all(|e| e.category == "salary"));
        assert!(c.entries(Some(Category::Relocation), 10).unwrap().is_empty());
    }

    #[test]
    fn test_storage_errors_degrade_to_miss() {
        let c = cache();
        c.store("Expected CTC?", FieldType::Number, "90");
        c.conn.execute_batch("DROP TABLE question_answers").unwrap();
        assert_eq!(c.lookup_exact("Expected CTC?", FieldType::Number), None);
        assert!(c.lookup_similar(Category::Salary, 3).is_empty());
        c.store("Expected CTC?", FieldType::Number, "90");
    }

    #[test]
    fn test_two_handles_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("answers.db");
        let first = AnswerCache::open(&path).unwrap();
        let second = AnswerCache::open(&path).unwrap();

        first.store("Expected CTC?", FieldType::Number, "90");
        second.store("Expected CTC?", FieldType::Number, "90");
        assert_eq!(second.lookup_exact("Expected CTC?", FieldType::Number).as_deref(), Some("90"));
        assert_eq!(first.entries(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_stats() {
        let c = cache();
        c.store("Expected CTC?", FieldType::Number, "90");
        c.store("Expected CTC?", FieldType::Text, "90 LPA");
        c.store("Notice period?", FieldType::Number, "30");
        let stats = c.stats().unwrap();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.distinct_questions, 2);
        assert_eq!(stats.by_category[0], ("salary".to_string(), 2));
    }
}
