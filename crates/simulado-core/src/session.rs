//! Exam lifecycle: pending, in progress, completed.
//!
//! An exam is scheduled with its generation spec and gets questions lazily,
//! the first time it is started or viewed. Answers are persisted one at a
//! time as the student moves through the exam. `finish` claims, scores and
//! completes the exam in one store transaction, so concurrent finishes score
//! and reward once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bank::QuestionBank;
use crate::error::{retry_once, Result, SimuladoError, StoreError};
use crate::generator::ExamGenerator;
use crate::model::{
    Alternative, Discipline, Exam, ExamQuestion, ExamStatus, Letter, NewExam,
};
use crate::report::ExamReport;
use crate::rewards::{GrantOutcome, RewardEngine};
use crate::scorer::{format_elapsed, score_exam, ScoreCard};
use crate::traits::{Clock, ExamOutcome, ExamStore};

/// Longest per-question time, in seconds, that overwrites the stored value.
pub const MAX_ANSWER_SECONDS: i64 = 1800;

/// Outcome of an exam whose `finished_at` has just been stamped.
pub fn exam_outcome(exam: &Exam, questions: &[ExamQuestion]) -> ExamOutcome {
    let finished_at = exam.finished_at.unwrap_or(exam.created_at);
    let started_at = exam.started_at.unwrap_or(finished_at);
    let card = score_exam(questions, Some(started_at), Some(finished_at));
    ExamOutcome {
        final_score: card.final_score,
        elapsed: format_elapsed((finished_at - started_at).num_seconds()),
        skipped: card.skipped,
        total_correct: card.total_correct,
        mean_seconds_per_question: card.mean_seconds_per_question,
    }
}

/// One question as shown to the student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionView {
    pub exam_id: Uuid,
    pub question_id: Uuid,
    pub number: u32,
    /// Number of questions in the exam.
    pub total: u32,
    pub discipline: Discipline,
    pub topic: String,
    pub statement: String,
    pub alternatives: Vec<Alternative>,
    pub current_answer: Option<Letter>,
    pub time_to_answer: Option<u32>,
    pub viewed_at: DateTime<Utc>,
    /// Only revealed once the exam is completed.
    pub correct: Option<Letter>,
    pub explanation: Option<String>,
}

/// Per-question line of an exam overview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionSummary {
    pub question_id: Uuid,
    pub number: u32,
    pub discipline: Discipline,
    pub topic: String,
    pub difficulty: f64,
    pub user_answer: Option<Letter>,
    pub time_to_answer: Option<u32>,
    /// Only revealed once the exam is completed.
    pub correct: Option<Letter>,
}

/// An exam together with the state of each of its questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamOverview {
    pub exam: Exam,
    pub questions: Vec<QuestionSummary>,
}

/// What `finish` produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishOutcome {
    pub exam: Exam,
    pub score: ScoreCard,
    /// `None` when the score earned no XP.
    pub reward: Option<GrantOutcome>,
}

/// Runs exams on behalf of their owners.
#[derive(Clone)]
pub struct ExamSessions {
    exams: Arc<dyn ExamStore>,
    bank: QuestionBank,
    generator: ExamGenerator,
    rewards: RewardEngine,
    clock: Arc<dyn Clock>,
    default_duration_minutes: u32,
    retry_delay: Duration,
}

impl ExamSessions {
    pub fn new(
        exams: Arc<dyn ExamStore>,
        generator: ExamGenerator,
        bank: QuestionBank,
        rewards: RewardEngine,
        clock: Arc<dyn Clock>,
        default_duration_minutes: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            exams,
            bank,
            generator,
            rewards,
            clock,
            default_duration_minutes,
            retry_delay,
        }
    }

    /// Create a pending exam. The spec is checked now; questions are drawn
    /// when the exam starts.
    pub async fn schedule(&self, user_id: Uuid, new: NewExam) -> Result<Exam> {
        if new.title.trim().is_empty() {
            return Err(SimuladoError::InvalidInput {
                field: "title",
                reason: "title is empty".into(),
            });
        }
        if new.duration_minutes == Some(0) {
            return Err(SimuladoError::InvalidInput {
                field: "duration_minutes",
                reason: "duration must be at least one minute".into(),
            });
        }
        self.generator.validate(&new.spec)?;

        let exam = Exam::pending(user_id, new, self.default_duration_minutes, self.clock.now());
        let exam = self.exams.create_exam(exam).await?;
        tracing::info!(
            "scheduled exam {} '{}' ({}) for user {user_id}",
            exam.id,
            exam.title,
            exam.areas
        );
        Ok(exam)
    }

    /// Make sure the exam has questions and is started. Returns the first
    /// question number.
    pub async fn start(&self, user_id: Uuid, exam_id: Uuid) -> Result<u32> {
        let exam = self.load_owned(user_id, exam_id).await?;
        if exam.is_completed() {
            return Err(SimuladoError::AlreadyCompleted(exam_id));
        }
        self.ensure_questions(&exam).await?;
        self.mark_started(&exam).await?;
        Ok(1)
    }

    /// Fetch question `number` (1-based). Viewing an unstarted exam starts it.
    pub async fn view_question(&self, user_id: Uuid, exam_id: Uuid, number: u32) -> Result<QuestionView> {
        let exam = self.load_owned(user_id, exam_id).await?;

        let questions = if exam.is_completed() {
            self.load_questions(exam_id).await?
        } else {
            let questions = self.ensure_questions(&exam).await?;
            self.mark_started(&exam).await?;
            questions
        };

        let total = questions.len() as u32;
        let Some(question) = questions.into_iter().find(|q| q.number == number) else {
            return Err(SimuladoError::not_found(
                "question",
                format!("{exam_id}#{number}"),
            ));
        };

        let revealed = exam.is_completed();
        Ok(QuestionView {
            exam_id,
            question_id: question.id,
            number: question.number,
            total,
            discipline: question.discipline,
            topic: question.topic,
            statement: question.statement,
            alternatives: question.alternatives,
            current_answer: question.user_answer,
            time_to_answer: question.time_to_answer,
            viewed_at: self.clock.now(),
            correct: revealed.then_some(question.correct),
            explanation: revealed.then_some(question.explanation),
        })
    }

    /// Persist an answer. `elapsed_seconds` overwrites the question's time
    /// only when it lies in `1..=1800`; negative values are rejected.
    pub async fn save_answer(
        &self,
        user_id: Uuid,
        exam_id: Uuid,
        question_id: Uuid,
        letter: &str,
        elapsed_seconds: Option<i64>,
    ) -> Result<ExamQuestion> {
        let answer: Letter = letter
            .parse()
            .map_err(|_| SimuladoError::InvalidLetter(letter.to_string()))?;
        let time = match elapsed_seconds {
            Some(t) if t < 0 => return Err(SimuladoError::InvalidTime(t)),
            Some(t) if (1..=MAX_ANSWER_SECONDS).contains(&t) => Some(t as u32),
            _ => None,
        };

        let exam = self.load_owned(user_id, exam_id).await?;
        if exam.is_completed() {
            return Err(SimuladoError::AlreadyCompleted(exam_id));
        }

        let question = retry_once("get_exam_question", self.retry_delay, || {
            self.exams.get_exam_question(question_id)
        })
        .await?
        .ok_or_else(|| SimuladoError::not_found("exam question", question_id))?;
        if question.exam_id != exam_id {
            return Err(SimuladoError::WrongExam {
                exam_id,
                question_id,
            });
        }

        let write = retry_once("record_answer", self.retry_delay, || {
            self.exams.record_answer(question_id, answer, time)
        })
        .await?
        .ok_or(SimuladoError::AlreadyCompleted(exam_id))?;

        tracing::debug!(
            "exam {exam_id} q{}: {answer} (was {:?}, time {:?})",
            write.question.number,
            write.previous,
            time
        );

        if write.previous != Some(answer) {
            if let Some(base_id) = &write.question.base_id {
                let was_correct = answer == write.question.correct;
                if let Err(e) = self.bank.materialise_stat(base_id, was_correct).await {
                    tracing::warn!("usage stat for {base_id} not recorded: {e}");
                }
            }
        }

        Ok(write.question)
    }

    /// Score, complete and reward an exam. A second call returns
    /// [`SimuladoError::AlreadyCompleted`] and changes nothing.
    ///
    /// Completion is one store transaction. If the reward grant fails after
    /// it, the error is returned and [`ExamSessions::settle_reward`] credits
    /// the exam later.
    pub async fn finish(&self, user_id: Uuid, exam_id: Uuid) -> Result<FinishOutcome> {
        let exam = self.load_owned(user_id, exam_id).await?;
        if exam.finished_at.is_some() {
            return Err(SimuladoError::AlreadyCompleted(exam_id));
        }

        let now = self.clock.now();
        let finished = retry_once("finish_exam", self.retry_delay, || {
            self.exams.finish_exam(exam_id, now, exam_outcome)
        })
        .await?
        .ok_or(SimuladoError::AlreadyCompleted(exam_id))?;

        let completed = finished.exam;
        let card = score_exam(&finished.questions, completed.started_at, completed.finished_at);
        tracing::info!(
            "exam {exam_id} completed: score {:.1}, {}/{} correct, elapsed {}",
            card.final_score,
            card.total_correct,
            card.question_count,
            completed.elapsed.as_deref().unwrap_or("-")
        );

        let reward = self.rewards.reward_exam(user_id, &completed).await?;
        Ok(FinishOutcome {
            exam: completed,
            score: card,
            reward,
        })
    }

    /// Credit a completed exam that has not been rewarded yet. Returns `None`
    /// if it was already credited or earned no XP.
    pub async fn settle_reward(&self, user_id: Uuid, exam_id: Uuid) -> Result<Option<GrantOutcome>> {
        let exam = self.load_owned(user_id, exam_id).await?;
        if !exam.is_completed() {
            return Err(SimuladoError::InvalidInput {
                field: "exam",
                reason: format!("exam {exam_id} is not completed"),
            });
        }
        self.rewards.reward_exam(user_id, &exam).await
    }

    /// A user's exams, newest first.
    pub async fn list_exams(&self, user_id: Uuid, status: Option<ExamStatus>) -> Result<Vec<Exam>> {
        let exams = retry_once("list_exams", self.retry_delay, || {
            self.exams.list_exams(user_id, status)
        })
        .await?;
        Ok(exams)
    }

    /// Remove an exam and its questions.
    pub async fn delete_exam(&self, user_id: Uuid, exam_id: Uuid) -> Result<()> {
        self.load_owned(user_id, exam_id).await?;
        let deleted = retry_once("delete_exam", self.retry_delay, || {
            self.exams.delete_exam(exam_id)
        })
        .await?;
        if !deleted {
            return Err(SimuladoError::not_found("exam", exam_id));
        }
        tracing::info!("deleted exam {exam_id}");
        Ok(())
    }

    /// The exam and a summary of every question. Correct letters are
    /// withheld until completion.
    pub async fn exam_overview(&self, user_id: Uuid, exam_id: Uuid) -> Result<ExamOverview> {
        let exam = self.load_owned(user_id, exam_id).await?;
        let revealed = exam.is_completed();
        let questions = self
            .load_questions(exam_id)
            .await?
            .into_iter()
            .map(|q| QuestionSummary {
                question_id: q.id,
                number: q.number,
                discipline: q.discipline,
                topic: q.topic,
                difficulty: q.difficulty,
                user_answer: q.user_answer,
                time_to_answer: q.time_to_answer,
                correct: revealed.then_some(q.correct),
            })
            .collect();
        Ok(ExamOverview { exam, questions })
    }

    /// Per-area and per-discipline breakdown of a completed exam.
    pub async fn report(&self, user_id: Uuid, exam_id: Uuid) -> Result<ExamReport> {
        let exam = self.load_owned(user_id, exam_id).await?;
        if !exam.is_completed() {
            return Err(SimuladoError::InvalidInput {
                field: "exam",
                reason: format!("exam {exam_id} is not completed"),
            });
        }
        let questions = self.load_questions(exam_id).await?;
        Ok(ExamReport::build(&exam, &questions))
    }

    async fn load_owned(&self, user_id: Uuid, exam_id: Uuid) -> Result<Exam> {
        let exam = retry_once("get_exam", self.retry_delay, || self.exams.get_exam(exam_id))
            .await?
            .ok_or_else(|| SimuladoError::not_found("exam", exam_id))?;
        if exam.user_id != user_id {
            return Err(SimuladoError::not_owner("exam", exam_id));
        }
        Ok(exam)
    }

    async fn load_questions(&self, exam_id: Uuid) -> Result<Vec<ExamQuestion>> {
        let questions = retry_once("questions", self.retry_delay, || {
            self.exams.questions(exam_id)
        })
        .await?;
        Ok(questions)
    }

    /// Generate and attach questions if the exam has none yet.
    async fn ensure_questions(&self, exam: &Exam) -> Result<Vec<ExamQuestion>> {
        let existing = self.load_questions(exam.id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let generated = self.generator.generate(exam.id, &exam.spec).await?;
        match self.exams.attach_questions(exam.id, generated.clone()).await {
            Ok(()) => Ok(generated),
            // Someone else attached first; theirs win.
            Err(StoreError::Conflict(_)) => self.load_questions(exam.id).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_started(&self, exam: &Exam) -> Result<()> {
        if exam.started_at.is_some() {
            return Ok(());
        }
        let now = self.clock.now();
        let started = retry_once("mark_started", self.retry_delay, || {
            self.exams.mark_started(exam.id, now)
        })
        .await?;
        if started.started_at == Some(now) {
            tracing::info!("exam {} started", exam.id);
        }
        Ok(())
    }
}
