//! TOML question-bank parser.
//!
//! Loads question sets from TOML files and directories, and validates them.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{BaseQuestion, Discipline, Letter};

/// A named group of bank questions, one per TOML file.
#[derive(Debug, Clone)]
pub struct QuestionSet {
    pub id: String,
    pub name: String,
    pub description: String,
    pub questions: Vec<BaseQuestion>,
}

/// Intermediate TOML structure for parsing bank files.
#[derive(Debug, Deserialize)]
struct TomlBankFile {
    bank: TomlBankHeader,
    #[serde(default)]
    questions: Vec<TomlQuestion>,
}

#[derive(Debug, Deserialize)]
struct TomlBankHeader {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_difficulty")]
    default_difficulty: f64,
}

fn default_difficulty() -> f64 {
    0.5
}

#[derive(Debug, Deserialize)]
struct TomlQuestion {
    id: String,
    discipline: String,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    subtopic: Option<String>,
    statement: String,
    alternatives: Vec<String>,
    correct: String,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    difficulty: Option<f64>,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_true() -> bool {
    true
}

/// Parse a single TOML file into a `QuestionSet`.
pub fn parse_bank(path: &Path) -> Result<QuestionSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bank file: {}", path.display()))?;

    parse_bank_str(&content, path)
}

/// Parse a TOML string into a `QuestionSet` (useful for testing).
pub fn parse_bank_str(content: &str, source_path: &Path) -> Result<QuestionSet> {
    let parsed: TomlBankFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let default_difficulty = parsed.bank.default_difficulty;
    let questions = parsed
        .questions
        .into_iter()
        .map(|q| {
            let discipline: Discipline = q
                .discipline
                .parse()
                .map_err(|e: String| anyhow::anyhow!("question {}: {}", q.id, e))?;
            let correct: Letter = q
                .correct
                .parse()
                .map_err(|e: String| anyhow::anyhow!("question {}: {}", q.id, e))?;
            let count = q.alternatives.len();
            let alternatives: [String; 5] = q.alternatives.try_into().map_err(|_| {
                anyhow::anyhow!("question {}: expected 5 alternatives, found {}", q.id, count)
            })?;

            Ok(BaseQuestion {
                id: q.id,
                statement: q.statement,
                discipline,
                topic: q.topic.trim().to_string(),
                subtopic: q.subtopic,
                alternatives,
                correct,
                explanation: q.explanation,
                difficulty: q.difficulty.unwrap_or(default_difficulty),
                active: q.active,
                times_used: 0,
                times_correct: 0,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(QuestionSet {
        id: parsed.bank.id,
        name: parsed.bank.name,
        description: parsed.bank.description,
        questions,
    })
}

/// Recursively load all `.toml` bank files from a directory.
pub fn load_bank_directory(dir: &Path) -> Result<Vec<QuestionSet>> {
    let mut sets = Vec::new();

    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            sets.extend(load_bank_directory(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            match parse_bank(&path) {
                Ok(set) => sets.push(set),
                Err(e) => {
                    tracing::warn!("skipping {}: {:#}", path.display(), e);
                }
            }
        }
    }

    sets.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(sets)
}

/// Load a bank from a single file or a directory of files.
pub fn load_bank(path: &Path) -> Result<Vec<QuestionSet>> {
    if path.is_dir() {
        load_bank_directory(path)
    } else {
        Ok(vec![parse_bank(path)?])
    }
}

/// A warning from bank validation.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    /// The question ID (if applicable).
    pub question_id: Option<String>,
    /// Warning message.
    pub message: String,
}

/// Validate a question set for common issues.
pub fn validate_bank(set: &QuestionSet) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let warn = |q: &BaseQuestion, message: String| ValidationWarning {
        question_id: Some(q.id.clone()),
        message,
    };

    if set.questions.is_empty() {
        warnings.push(ValidationWarning {
            question_id: None,
            message: format!("bank '{}' has no questions", set.id),
        });
    }

    let mut seen_ids = HashSet::new();
    for q in &set.questions {
        if !seen_ids.insert(&q.id) {
            warnings.push(warn(q, format!("duplicate question ID: {}", q.id)));
        }
        if q.statement.trim().is_empty() {
            warnings.push(warn(q, "statement is empty".into()));
        }
        for letter in Letter::ALL {
            if q.alternative(letter).trim().is_empty() {
                warnings.push(warn(q, format!("alternative {letter} is empty")));
            }
        }
        if !(0.0..=1.0).contains(&q.difficulty) {
            warnings.push(warn(
                q,
                format!("difficulty {} is outside [0, 1]", q.difficulty),
            ));
        }
        if q.topic.is_empty() {
            warnings.push(warn(q, "topic is blank".into()));
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const VALID_TOML: &str = r#"
[bank]
id = "enem-sample"
name = "ENEM sample"
description = "A few practice questions"
default_difficulty = 0.4

[[questions]]
id = "mat-001"
discipline = "matemática"
topic = "Porcentagem"
statement = "Um produto de R$ 200 sofre desconto de 15%. Qual o novo preço?"
alternatives = ["R$ 170", "R$ 185", "R$ 160", "R$ 175", "R$ 150"]
correct = "A"
explanation = "200 × 0,85 = 170."
difficulty = 0.2

[[questions]]
id = "fil-001"
discipline = "filosofia"
topic = "Ética"
subtopic = "Aristóteles"
statement = "Para Aristóteles, a virtude é"
alternatives = ["um dom divino", "o meio-termo entre extremos", "a obediência à lei", "o prazer", "a riqueza"]
correct = "b"
"#;

    #[test]
    fn parse_valid_toml() {
        let set = parse_bank_str(VALID_TOML, &PathBuf::from("sample.toml")).unwrap();
        assert_eq!(set.id, "enem-sample");
        assert_eq!(set.questions.len(), 2);

        let math = &set.questions[0];
        assert_eq!(math.discipline, Discipline::Mathematics);
        assert_eq!(math.correct, Letter::A);
        assert_eq!(math.alternative(Letter::A), "R$ 170");
        assert_eq!(math.difficulty, 0.2);

        let philosophy = &set.questions[1];
        assert_eq!(philosophy.discipline, Discipline::Philosophy);
        assert_eq!(philosophy.correct, Letter::B);
        assert_eq!(philosophy.subtopic.as_deref(), Some("Aristóteles"));
        assert_eq!(philosophy.difficulty, 0.4);
        assert!(philosophy.active);

        assert!(validate_bank(&set).is_empty());
    }

    #[test]
    fn wrong_alternative_count_is_rejected() {
        let toml = r#"
[bank]
id = "short"
name = "Short"

[[questions]]
id = "q1"
discipline = "history"
topic = "Brasil Império"
statement = "?"
alternatives = ["a", "b", "c"]
correct = "A"
"#;
        let err = parse_bank_str(toml, &PathBuf::from("short.toml")).unwrap_err();
        assert!(err.to_string().contains("expected 5 alternatives"));
    }

    #[test]
    fn unknown_discipline_is_rejected() {
        let toml = r#"
[bank]
id = "bad"
name = "Bad"

[[questions]]
id = "q1"
discipline = "astrology"
statement = "?"
alternatives = ["a", "b", "c", "d", "e"]
correct = "A"
"#;
        assert!(parse_bank_str(toml, &PathBuf::from("bad.toml")).is_err());
    }

    #[test]
    fn validate_reports_common_issues() {
        let toml = r#"
[bank]
id = "issues"
name = "Issues"

[[questions]]
id = "same"
discipline = "physics"
topic = "Cinemática"
statement = "  "
alternatives = ["a", "", "c", "d", "e"]
correct = "A"
difficulty = 1.5

[[questions]]
id = "same"
discipline = "physics"
statement = "Velocidade média?"
alternatives = ["a", "b", "c", "d", "e"]
correct = "A"
"#;
        let set = parse_bank_str(toml, &PathBuf::from("issues.toml")).unwrap();
        let warnings = validate_bank(&set);
        let messages: Vec<&str> = warnings.iter().map(|w| w.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("duplicate")));
        assert!(messages.iter().any(|m| m.contains("statement is empty")));
        assert!(messages.iter().any(|m| m.contains("alternative B is empty")));
        assert!(messages.iter().any(|m| m.contains("outside [0, 1]")));
        assert!(messages.iter().any(|m| m.contains("topic is blank")));
    }

    #[test]
    fn parse_malformed_toml() {
        let bad = "this is not [valid toml }{";
        assert!(parse_bank_str(bad, &PathBuf::from("bad.toml")).is_err());
    }

    #[test]
    fn load_directory_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sample.toml"), VALID_TOML).unwrap();
        std::fs::write(dir.path().join("broken.toml"), "not [toml").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(
            nested.join("more.toml"),
            VALID_TOML.replace("enem-sample", "enem-more"),
        )
        .unwrap();

        let sets = load_bank_directory(dir.path()).unwrap();
        let ids: Vec<&str> = sets.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["enem-more", "enem-sample"]);

        let single = load_bank(&dir.path().join("sample.toml")).unwrap();
        assert_eq!(single.len(), 1);
    }
}
