//! Store and clock abstractions.
//!
//! The services in this crate hold no state of their own; everything lives
//! behind these async traits, implemented by the `simulado-store` crate.
//! Each method is one transactional unit.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::model::{
    BaseQuestion, Discipline, Exam, ExamQuestion, ExamStatus, Letter, StudySession, UserBalance,
    XpEntry,
};

// ---------------------------------------------------------------------------
// Question bank store
// ---------------------------------------------------------------------------

/// Read-mostly pool of base questions.
#[async_trait]
pub trait QuestionStore: Send + Sync {
    /// Insert or replace bank questions (seed/import path). Returns how many
    /// were written.
    async fn upsert_questions(&self, questions: Vec<BaseQuestion>) -> StoreResult<usize>;

    async fn get_question(&self, id: &str) -> StoreResult<Option<BaseQuestion>>;

    /// Active question count per discipline; disciplines with none are omitted.
    async fn count_active(&self, disciplines: &[Discipline]) -> StoreResult<HashMap<Discipline, u64>>;

    /// Distinct non-empty topics of active questions with their counts,
    /// ordered lexicographically.
    async fn topics(&self, discipline: Discipline) -> StoreResult<Vec<(String, u64)>>;

    /// Up to `k` active questions drawn uniformly without replacement,
    /// optionally restricted to a topic.
    async fn sample_active(
        &self,
        discipline: Discipline,
        topic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<BaseQuestion>>;

    /// Atomically bump `times_used`, and `times_correct` when `was_correct`.
    async fn increment_usage(&self, id: &str, was_correct: bool) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Exam store
// ---------------------------------------------------------------------------

/// Result of persisting an answer.
#[derive(Debug, Clone)]
pub struct AnswerWrite {
    /// The question after the write.
    pub question: ExamQuestion,
    /// The letter stored before the write.
    pub previous: Option<Letter>,
}

/// An exam as it was completed by finish.
#[derive(Debug, Clone)]
pub struct FinishedExam {
    /// The completed exam with its outcome written.
    pub exam: Exam,
    /// All questions of the exam as scored, ordered by number.
    pub questions: Vec<ExamQuestion>,
}

/// Aggregates written back to an exam when it completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExamOutcome {
    pub final_score: f64,
    pub elapsed: String,
    pub skipped: u32,
    pub total_correct: u32,
    pub mean_seconds_per_question: Option<f64>,
}

/// Scores a claimed exam. Called by the store inside the finish transaction,
/// with `finished_at` and `started_at` already stamped.
pub type OutcomeFn = fn(&Exam, &[ExamQuestion]) -> ExamOutcome;

/// Exams and their materialised questions.
#[async_trait]
pub trait ExamStore: Send + Sync {
    async fn create_exam(&self, exam: Exam) -> StoreResult<Exam>;

    async fn get_exam(&self, id: Uuid) -> StoreResult<Option<Exam>>;

    /// A user's exams, newest first, optionally filtered by status.
    async fn list_exams(&self, user_id: Uuid, status: Option<ExamStatus>) -> StoreResult<Vec<Exam>>;

    /// Delete an exam and its questions. Returns `false` if it did not exist.
    async fn delete_exam(&self, id: Uuid) -> StoreResult<bool>;

    /// Attach the generated questions. Fails with `Conflict` if the exam
    /// already has questions.
    async fn attach_questions(&self, exam_id: Uuid, questions: Vec<ExamQuestion>) -> StoreResult<()>;

    /// All questions of an exam ordered by number.
    async fn questions(&self, exam_id: Uuid) -> StoreResult<Vec<ExamQuestion>>;

    async fn get_exam_question(&self, question_id: Uuid) -> StoreResult<Option<ExamQuestion>>;

    /// Stamp `started_at` if absent and move a pending exam to in-progress.
    async fn mark_started(&self, exam_id: Uuid, at: DateTime<Utc>) -> StoreResult<Exam>;

    /// Store the answer letter and, when given, overwrite the answer time.
    /// Writes to the same question are serialised. Returns `None` if the
    /// exam has already been claimed by finish.
    async fn record_answer(
        &self,
        question_id: Uuid,
        answer: Letter,
        time_to_answer: Option<u32>,
    ) -> StoreResult<Option<AnswerWrite>>;

    /// In one transaction: stamp `finished_at` (and a missing `started_at`)
    /// on an unfinished exam, score its questions with `score`, write the
    /// outcome and mark it completed. Nothing is written if any step fails.
    /// Returns `None` if the exam was already finished.
    async fn finish_exam(
        &self,
        exam_id: Uuid,
        at: DateTime<Utc>,
        score: OutcomeFn,
    ) -> StoreResult<Option<FinishedExam>>;

    /// `(user_id, final_score)` of exams completed at or after `since`.
    async fn completed_scores(&self, since: DateTime<Utc>) -> StoreResult<Vec<(Uuid, f64)>>;
}

// ---------------------------------------------------------------------------
// User balances and ledger
// ---------------------------------------------------------------------------

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn load_balance(&self, user_id: Uuid) -> StoreResult<Option<UserBalance>>;

    /// Compare-and-swap the balance row and append the ledger entry in one
    /// transaction. The row is written only if its stored version equals
    /// `expected_version` (0 = row must not exist yet); the stored version
    /// becomes `expected_version + 1`. Returns `false` on a version mismatch
    /// and `Conflict` if the entry's reference is already in the ledger.
    async fn commit_balance(
        &self,
        expected_version: u64,
        balance: &UserBalance,
        entry: Option<&XpEntry>,
    ) -> StoreResult<bool>;

    /// The ledger entry carrying `reference`, if any.
    async fn find_entry(&self, reference: &str) -> StoreResult<Option<XpEntry>>;

    /// Ledger entries of a user, newest first.
    async fn ledger(&self, user_id: Uuid) -> StoreResult<Vec<XpEntry>>;

    /// Balances ordered by `xp_total` descending.
    async fn top_balances(&self, limit: usize) -> StoreResult<Vec<UserBalance>>;
}

// ---------------------------------------------------------------------------
// Study sessions
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StudyStore: Send + Sync {
    /// The user's open session, if any.
    async fn open_session(&self, user_id: Uuid) -> StoreResult<Option<StudySession>>;

    /// Insert an open session. Returns `false` if the user already has one.
    async fn insert_open(&self, session: &StudySession) -> StoreResult<bool>;

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<StudySession>>;

    /// Close an open session. Returns `None` if it was already closed.
    async fn close_session(
        &self,
        id: Uuid,
        finished_at: DateTime<Utc>,
        minutes: u32,
    ) -> StoreResult<Option<StudySession>>;

    /// Update the heartbeat of an open session. Returns `false` if the
    /// session is closed.
    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;

    /// Open sessions whose last heartbeat is before `cutoff`.
    async fn idle_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StudySession>>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for every service.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
