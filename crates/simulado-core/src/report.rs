//! Exam reports with per-area and per-discipline breakdowns and JSON
//! persistence.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Area, Discipline, Exam, ExamKind, ExamQuestion};
use crate::scorer::{score_exam, ScoreCard};

/// A completed exam, scored and broken down for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamReport {
    pub exam: ExamSummary,
    pub score: ScoreCard,
    pub by_area: Vec<Breakdown>,
    pub by_discipline: Vec<Breakdown>,
    /// The scored questions, kept so the report can be re-scored offline.
    pub questions: Vec<ExamQuestion>,
}

/// The exam fields a report needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamSummary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub areas: String,
    pub kind: ExamKind,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed: Option<String>,
}

/// Tallies for one area or discipline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub name: String,
    pub questions: u32,
    pub correct: u32,
    pub skipped: u32,
    /// Correct over answered, 0 when nothing was answered.
    pub accuracy: f64,
}

#[derive(Default)]
struct Tally {
    questions: u32,
    correct: u32,
    skipped: u32,
}

impl Tally {
    fn add(&mut self, q: &ExamQuestion) {
        self.questions += 1;
        self.correct += u32::from(q.is_correct());
        self.skipped += u32::from(q.is_skipped());
    }

    fn into_breakdown(self, name: &str) -> Breakdown {
        let answered = self.questions - self.skipped;
        Breakdown {
            name: name.to_string(),
            questions: self.questions,
            correct: self.correct,
            skipped: self.skipped,
            accuracy: if answered == 0 {
                0.0
            } else {
                self.correct as f64 / answered as f64
            },
        }
    }
}

impl ExamReport {
    /// Score and tally an exam's questions.
    pub fn build(exam: &Exam, questions: &[ExamQuestion]) -> Self {
        let score = score_exam(questions, exam.started_at, exam.finished_at);

        let mut areas: BTreeMap<Area, Tally> = BTreeMap::new();
        let mut disciplines: BTreeMap<Discipline, Tally> = BTreeMap::new();
        for q in questions {
            areas.entry(q.discipline.area()).or_default().add(q);
            disciplines.entry(q.discipline).or_default().add(q);
        }

        let mut questions = questions.to_vec();
        questions.sort_by_key(|q| q.number);

        Self {
            exam: ExamSummary {
                id: exam.id,
                user_id: exam.user_id,
                title: exam.title.clone(),
                areas: exam.areas.clone(),
                kind: exam.kind,
                started_at: exam.started_at,
                finished_at: exam.finished_at,
                elapsed: exam.elapsed.clone(),
            },
            score,
            by_area: areas
                .into_iter()
                .map(|(a, t)| t.into_breakdown(a.as_str()))
                .collect(),
            by_discipline: disciplines
                .into_iter()
                .map(|(d, t)| t.into_breakdown(d.as_str()))
                .collect(),
            questions,
        }
    }

    /// Recompute the score card from the stored questions.
    pub fn rescore(&self) -> ScoreCard {
        score_exam(&self.questions, self.exam.started_at, self.exam.finished_at)
    }

    /// Save the report as JSON to a file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize report")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        Ok(())
    }

    /// Load a report from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read report from {}", path.display()))?;
        let report: ExamReport =
            serde_json::from_str(&content).context("failed to parse report JSON")?;
        Ok(report)
    }
}
