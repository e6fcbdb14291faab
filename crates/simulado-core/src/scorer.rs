//! TRI-like exam scoring.
//!
//! Approximates the ENEM's Item Response Theory output with a
//! difficulty-weighted correctness ratio, a penalty for inconsistent answer
//! patterns (hard questions right while easier ones are wrong), and a final
//! clamp to the [400, 800] band.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ExamQuestion;

/// Lower bound of the final score band.
pub const MIN_SCORE: f64 = 400.0;
/// Upper bound of the final score band.
pub const MAX_SCORE: f64 = 800.0;
/// Difficulty gap above which a neighbour counts as "harder".
pub const INCONSISTENCY_GAP: f64 = 0.2;
/// Consistency factor lost per inconsistency.
pub const INCONSISTENCY_PENALTY: f64 = 0.05;

/// What the scorer needs to know about one answered (or skipped) question.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredItem {
    pub difficulty: f64,
    pub correct: bool,
    pub answered: bool,
}

impl From<&ExamQuestion> for ScoredItem {
    fn from(q: &ExamQuestion) -> Self {
        Self {
            difficulty: q.difficulty,
            correct: q.is_correct(),
            answered: !q.is_skipped(),
        }
    }
}

/// Full breakdown of a scored exam.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    /// Clamped, rounded score; 0 when nothing was answered correctly.
    pub final_score: f64,
    /// Raw score before clamping.
    pub raw_score: f64,
    /// Σ(w·correct) / Σw.
    pub weighted_ratio: f64,
    pub consistency_factor: f64,
    pub inconsistencies: u32,
    pub question_count: u32,
    pub total_correct: u32,
    pub skipped: u32,
    /// Wall-clock seconds per question, when start and finish are known.
    pub mean_seconds_per_question: Option<f64>,
}

/// Weight of a question: harder questions count more.
pub fn weight(difficulty: f64) -> f64 {
    1.0 + 2.0 * difficulty
}

/// Difficulty-weighted share of correct answers; 0 when there are no weights.
pub fn weighted_ratio(items: &[ScoredItem]) -> f64 {
    let total: f64 = items.iter().map(|i| weight(i.difficulty)).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let earned: f64 = items
        .iter()
        .filter(|i| i.correct)
        .map(|i| weight(i.difficulty))
        .sum();
    earned / total
}

/// Count adjacent pairs, in ascending difficulty, where the harder question
/// is correct, the easier one is not, and the gap exceeds
/// [`INCONSISTENCY_GAP`].
pub fn count_inconsistencies(items: &[ScoredItem]) -> u32 {
    let mut sorted: Vec<&ScoredItem> = items.iter().collect();
    sorted.sort_by(|a, b| a.difficulty.total_cmp(&b.difficulty));

    sorted
        .windows(2)
        .filter(|pair| {
            let (easier, harder) = (pair[0], pair[1]);
            harder.correct
                && !easier.correct
                && harder.difficulty - easier.difficulty > INCONSISTENCY_GAP
        })
        .count() as u32
}

pub fn consistency_factor(inconsistencies: u32) -> f64 {
    (1.0 - INCONSISTENCY_PENALTY * inconsistencies as f64).max(0.0)
}

/// Clamp to the score band and round to one decimal, or 0 if nothing was
/// correct.
pub fn final_score(raw_score: f64, any_correct: bool) -> f64 {
    if !any_correct {
        return 0.0;
    }
    round1(raw_score.clamp(MIN_SCORE, MAX_SCORE))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Score a list of items. Never fails; an empty list scores zero everywhere.
pub fn score_items(items: &[ScoredItem]) -> ScoreCard {
    if items.is_empty() {
        return ScoreCard::default();
    }

    let total_correct = items.iter().filter(|i| i.correct).count() as u32;
    let skipped = items.iter().filter(|i| !i.answered).count() as u32;
    let ratio = weighted_ratio(items);
    let inconsistencies = count_inconsistencies(items);
    let factor = consistency_factor(inconsistencies);
    let raw = ratio * 1000.0 * factor;

    ScoreCard {
        final_score: final_score(raw, total_correct > 0),
        raw_score: raw,
        weighted_ratio: ratio,
        consistency_factor: factor,
        inconsistencies,
        question_count: items.len() as u32,
        total_correct,
        skipped,
        mean_seconds_per_question: None,
    }
}

/// Score a completed exam's questions and fill the timing statistic.
pub fn score_exam(
    questions: &[ExamQuestion],
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
) -> ScoreCard {
    let items: Vec<ScoredItem> = questions.iter().map(ScoredItem::from).collect();
    let mut card = score_items(&items);

    if let (Some(start), Some(end)) = (started_at, finished_at) {
        if !questions.is_empty() {
            let seconds = (end - start).num_milliseconds().max(0) as f64 / 1000.0;
            card.mean_seconds_per_question = Some(seconds / questions.len() as f64);
        }
    }

    card
}

/// Format a span of seconds as `HHhMM`.
pub fn format_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    format!("{hours:02}h{minutes:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(difficulty: f64, correct: bool) -> ScoredItem {
        ScoredItem {
            difficulty,
            correct,
            answered: true,
        }
    }

    fn skipped(difficulty: f64) -> ScoredItem {
        ScoredItem {
            difficulty,
            correct: false,
            answered: false,
        }
    }

    #[test]
    fn single_correct_question_clamps_to_max() {
        let card = score_items(&[item(0.5, true)]);
        assert!((card.weighted_ratio - 1.0).abs() < f64::EPSILON);
        assert!((card.consistency_factor - 1.0).abs() < f64::EPSILON);
        assert!((card.raw_score - 1000.0).abs() < 1e-9);
        assert_eq!(card.final_score, 800.0);
    }

    #[test]
    fn inconsistent_pattern_is_penalised() {
        let items = [item(0.2, false), item(0.5, false), item(0.8, true)];
        let card = score_items(&items);
        assert_eq!(card.inconsistencies, 1);
        assert!((card.consistency_factor - 0.95).abs() < 1e-12);
        assert!((card.weighted_ratio - 2.6 / 6.0).abs() < 1e-12);
        assert_eq!(card.final_score, 411.7);
        assert_eq!(card.total_correct, 1);
        assert_eq!(card.skipped, 0);
    }

    #[test]
    fn order_of_questions_does_not_matter() {
        let items = [item(0.8, true), item(0.2, false), item(0.5, false)];
        assert_eq!(count_inconsistencies(&items), 1);
    }

    #[test]
    fn small_difficulty_gap_is_not_inconsistent() {
        let items = [item(0.5, false), item(0.7, true)];
        assert_eq!(count_inconsistencies(&items), 0);
    }

    #[test]
    fn all_correct_scores_full_ratio() {
        let items = [item(0.1, true), item(0.4, true), item(0.9, true)];
        let card = score_items(&items);
        assert!((card.weighted_ratio - 1.0).abs() < 1e-12);
        assert!(card.raw_score >= 950.0);
        assert_eq!(card.final_score, 800.0);
    }

    #[test]
    fn all_wrong_scores_zero() {
        let items = [item(0.1, false), skipped(0.4), item(0.9, false)];
        let card = score_items(&items);
        assert_eq!(card.final_score, 0.0);
        assert_eq!(card.skipped, 1);
        assert_eq!(card.total_correct, 0);
    }

    #[test]
    fn low_ratio_with_a_correct_answer_clamps_to_min() {
        let mut items = vec![item(0.0, true)];
        items.extend((0..20).map(|_| item(0.0, false)));
        let card = score_items(&items);
        assert!(card.raw_score < MIN_SCORE);
        assert_eq!(card.final_score, MIN_SCORE);
    }

    #[test]
    fn consistency_factor_never_negative() {
        assert_eq!(consistency_factor(0), 1.0);
        assert!((consistency_factor(4) - 0.8).abs() < 1e-12);
        assert_eq!(consistency_factor(25), 0.0);
        assert_eq!(consistency_factor(40), 0.0);
    }

    #[test]
    fn empty_exam_scores_zero() {
        let card = score_exam(&[], None, None);
        assert_eq!(card, ScoreCard::default());
    }

    #[test]
    fn elapsed_format() {
        assert_eq!(format_elapsed(0), "00h00");
        assert_eq!(format_elapsed(59), "00h00");
        assert_eq!(format_elapsed(6360), "01h46");
        assert_eq!(format_elapsed(5 * 3600 + 30 * 60), "05h30");
        assert_eq!(format_elapsed(-10), "00h00");
    }
}
