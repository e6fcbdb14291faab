//! In-memory store.
//!
//! Each table group sits behind its own lock; every trait method takes the
//! lock once, so each call is one atomic unit. Bank usage counters are
//! atomics and only need the read lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use uuid::Uuid;

use simulado_core::error::{StoreError, StoreResult};
use simulado_core::model::{
    BaseQuestion, Discipline, Exam, ExamQuestion, ExamStatus, Letter, StudySession, UserBalance,
    XpEntry,
};
use simulado_core::traits::{
    AnswerWrite, ExamStore, FinishedExam, OutcomeFn, QuestionStore, StudyStore, UserStore,
};

/// A bank question with live usage counters.
struct QuestionRow {
    question: BaseQuestion,
    times_used: AtomicU64,
    times_correct: AtomicU64,
}

impl QuestionRow {
    fn snapshot(&self) -> BaseQuestion {
        let mut q = self.question.clone();
        q.times_used = self.times_used.load(Ordering::Relaxed);
        q.times_correct = self.times_correct.load(Ordering::Relaxed);
        q
    }
}

#[derive(Default)]
struct ExamTables {
    exams: HashMap<Uuid, Exam>,
    /// Question ids per exam, in number order.
    by_exam: HashMap<Uuid, Vec<Uuid>>,
    questions: HashMap<Uuid, ExamQuestion>,
}

impl ExamTables {
    fn exam_mut(&mut self, id: Uuid) -> StoreResult<&mut Exam> {
        self.exams
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("exam {id}")))
    }

    fn questions_of(&self, exam_id: Uuid) -> Vec<ExamQuestion> {
        self.by_exam
            .get(&exam_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.questions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct UserTables {
    balances: HashMap<Uuid, UserBalance>,
    /// Append-only, in commit order.
    ledger: Vec<XpEntry>,
}

/// Process-local store implementing every store trait.
#[derive(Default)]
pub struct MemoryStore {
    questions: RwLock<HashMap<String, QuestionRow>>,
    exams: Mutex<ExamTables>,
    users: Mutex<UserTables>,
    studies: Mutex<HashMap<Uuid, StudySession>>,
    /// Number of upcoming calls that fail with `Unavailable`.
    failures: AtomicU32,
    /// Upcoming failures of one named operation.
    targeted: Mutex<HashMap<&'static str, u32>>,
    calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls of `operation` (a trait method name) fail
    /// with a transient error. Other operations are unaffected.
    pub fn fail_calls(&self, operation: &'static str, n: u32) {
        let mut targeted = self.targeted.lock().unwrap_or_else(|e| e.into_inner());
        targeted.insert(operation, n);
    }

    /// Number of store calls made so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn enter(&self, operation: &str) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let targeted = {
            let mut targeted = self.targeted.lock().unwrap_or_else(|e| e.into_inner());
            match targeted.get_mut(operation) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if injected || targeted {
            return Err(StoreError::Unavailable(format!("{operation}: injected failure")));
        }
        Ok(())
    }

    fn read_questions(&self) -> RwLockReadGuard<'_, HashMap<String, QuestionRow>> {
        self.questions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_questions(&self) -> RwLockWriteGuard<'_, HashMap<String, QuestionRow>> {
        self.questions.write().unwrap_or_else(|e| e.into_inner())
    }

    fn exam_tables(&self) -> MutexGuard<'_, ExamTables> {
        self.exams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn user_tables(&self) -> MutexGuard<'_, UserTables> {
        self.users.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn study_table(&self) -> MutexGuard<'_, HashMap<Uuid, StudySession>> {
        self.studies.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QuestionStore for MemoryStore {
    async fn upsert_questions(&self, questions: Vec<BaseQuestion>) -> StoreResult<usize> {
        self.enter("upsert_questions")?;
        let mut table = self.write_questions();
        let count = questions.len();
        for question in questions {
            // Re-imports keep the usage history.
            let (used, correct) = table
                .get(&question.id)
                .map(|row| {
                    (
                        row.times_used.load(Ordering::Relaxed),
                        row.times_correct.load(Ordering::Relaxed),
                    )
                })
                .unwrap_or((question.times_used, question.times_correct));
            table.insert(
                question.id.clone(),
                QuestionRow {
                    question,
                    times_used: AtomicU64::new(used),
                    times_correct: AtomicU64::new(correct),
                },
            );
        }
        Ok(count)
    }

    async fn get_question(&self, id: &str) -> StoreResult<Option<BaseQuestion>> {
        self.enter("get_question")?;
        Ok(self.read_questions().get(id).map(QuestionRow::snapshot))
    }

    async fn count_active(&self, disciplines: &[Discipline]) -> StoreResult<HashMap<Discipline, u64>> {
        self.enter("count_active")?;
        let mut counts = HashMap::new();
        for row in self.read_questions().values() {
            let q = &row.question;
            if q.active && disciplines.contains(&q.discipline) {
                *counts.entry(q.discipline).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn topics(&self, discipline: Discipline) -> StoreResult<Vec<(String, u64)>> {
        self.enter("topics")?;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for row in self.read_questions().values() {
            let q = &row.question;
            if q.active && q.discipline == discipline && !q.topic.trim().is_empty() {
                *counts.entry(q.topic.clone()).or_insert(0) += 1;
            }
        }
        let mut topics: Vec<(String, u64)> = counts.into_iter().collect();
        topics.sort();
        Ok(topics)
    }

    async fn sample_active(
        &self,
        discipline: Discipline,
        topic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<BaseQuestion>> {
        self.enter("sample_active")?;
        let table = self.read_questions();
        let candidates: Vec<&QuestionRow> = table
            .values()
            .filter(|row| {
                let q = &row.question;
                q.active
                    && q.discipline == discipline
                    && topic.map_or(true, |t| q.topic.trim() == t.trim())
            })
            .collect();

        let mut rng = rand::thread_rng();
        Ok(candidates
            .choose_multiple(&mut rng, k)
            .map(|row| row.snapshot())
            .collect())
    }

    async fn increment_usage(&self, id: &str, was_correct: bool) -> StoreResult<()> {
        self.enter("increment_usage")?;
        let table = self.read_questions();
        let row = table
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("question {id}")))?;
        row.times_used.fetch_add(1, Ordering::Relaxed);
        if was_correct {
            row.times_correct.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[async_trait]
impl ExamStore for MemoryStore {
    async fn create_exam(&self, exam: Exam) -> StoreResult<Exam> {
        self.enter("create_exam")?;
        let mut tables = self.exam_tables();
        if tables.exams.contains_key(&exam.id) {
            return Err(StoreError::Conflict(format!("exam {} exists", exam.id)));
        }
        tables.exams.insert(exam.id, exam.clone());
        Ok(exam)
    }

    async fn get_exam(&self, id: Uuid) -> StoreResult<Option<Exam>> {
        self.enter("get_exam")?;
        Ok(self.exam_tables().exams.get(&id).cloned())
    }

    async fn list_exams(&self, user_id: Uuid, status: Option<ExamStatus>) -> StoreResult<Vec<Exam>> {
        self.enter("list_exams")?;
        let tables = self.exam_tables();
        let mut exams: Vec<Exam> = tables
            .exams
            .values()
            .filter(|e| e.user_id == user_id && status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        exams.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(exams)
    }

    async fn delete_exam(&self, id: Uuid) -> StoreResult<bool> {
        self.enter("delete_exam")?;
        let mut tables = self.exam_tables();
        if tables.exams.remove(&id).is_none() {
            return Ok(false);
        }
        for qid in tables.by_exam.remove(&id).unwrap_or_default() {
            tables.questions.remove(&qid);
        }
        Ok(true)
    }

    async fn attach_questions(&self, exam_id: Uuid, questions: Vec<ExamQuestion>) -> StoreResult<()> {
        self.enter("attach_questions")?;
        let mut tables = self.exam_tables();
        tables.exam_mut(exam_id)?;
        if tables.by_exam.get(&exam_id).is_some_and(|ids| !ids.is_empty()) {
            return Err(StoreError::Conflict(format!(
                "exam {exam_id} already has questions"
            )));
        }

        let mut questions = questions;
        questions.sort_by_key(|q| q.number);
        if questions.windows(2).any(|w| w[0].number == w[1].number) {
            return Err(StoreError::Conflict(format!(
                "duplicate question number in exam {exam_id}"
            )));
        }

        if let Some(stray) = questions.iter().find(|q| q.exam_id != exam_id) {
            return Err(StoreError::Conflict(format!(
                "question {} belongs to exam {}",
                stray.id, stray.exam_id
            )));
        }

        let ids = questions.iter().map(|q| q.id).collect();
        for q in questions {
            tables.questions.insert(q.id, q);
        }
        tables.by_exam.insert(exam_id, ids);
        Ok(())
    }

    async fn questions(&self, exam_id: Uuid) -> StoreResult<Vec<ExamQuestion>> {
        self.enter("questions")?;
        Ok(self.exam_tables().questions_of(exam_id))
    }

    async fn get_exam_question(&self, question_id: Uuid) -> StoreResult<Option<ExamQuestion>> {
        self.enter("get_exam_question")?;
        Ok(self.exam_tables().questions.get(&question_id).cloned())
    }

    async fn mark_started(&self, exam_id: Uuid, at: DateTime<Utc>) -> StoreResult<Exam> {
        self.enter("mark_started")?;
        let mut tables = self.exam_tables();
        let exam = tables.exam_mut(exam_id)?;
        if exam.started_at.is_none() && exam.finished_at.is_none() {
            exam.started_at = Some(at);
        }
        if exam.status == ExamStatus::Pending && exam.finished_at.is_none() {
            exam.status = ExamStatus::InProgress;
        }
        Ok(exam.clone())
    }

    async fn record_answer(
        &self,
        question_id: Uuid,
        answer: Letter,
        time_to_answer: Option<u32>,
    ) -> StoreResult<Option<AnswerWrite>> {
        self.enter("record_answer")?;
        let mut tables = self.exam_tables();
        let exam_id = tables
            .questions
            .get(&question_id)
            .map(|q| q.exam_id)
            .ok_or_else(|| StoreError::NotFound(format!("exam question {question_id}")))?;
        if tables.exam_mut(exam_id)?.finished_at.is_some() {
            return Ok(None);
        }

        let Some(question) = tables.questions.get_mut(&question_id) else {
            return Err(StoreError::NotFound(format!("exam question {question_id}")));
        };
        let previous = question.user_answer.replace(answer);
        if time_to_answer.is_some() {
            question.time_to_answer = time_to_answer;
        }
        Ok(Some(AnswerWrite {
            question: question.clone(),
            previous,
        }))
    }

    async fn finish_exam(
        &self,
        exam_id: Uuid,
        at: DateTime<Utc>,
        score: OutcomeFn,
    ) -> StoreResult<Option<FinishedExam>> {
        self.enter("finish_exam")?;
        let mut tables = self.exam_tables();
        let mut exam = tables.exam_mut(exam_id)?.clone();
        if exam.finished_at.is_some() {
            return Ok(None);
        }
        exam.finished_at = Some(at);
        exam.started_at.get_or_insert(at);

        let questions = tables.questions_of(exam_id);
        let outcome = score(&exam, &questions);
        exam.status = ExamStatus::Completed;
        exam.final_score = Some(outcome.final_score);
        exam.elapsed = Some(outcome.elapsed);
        exam.skipped = Some(outcome.skipped);
        exam.total_correct = Some(outcome.total_correct);
        exam.mean_seconds_per_question = outcome.mean_seconds_per_question;

        tables.exams.insert(exam_id, exam.clone());
        Ok(Some(FinishedExam { exam, questions }))
    }

    async fn completed_scores(&self, since: DateTime<Utc>) -> StoreResult<Vec<(Uuid, f64)>> {
        self.enter("completed_scores")?;
        let tables = self.exam_tables();
        Ok(tables
            .exams
            .values()
            .filter(|e| e.is_completed() && e.finished_at.is_some_and(|at| at >= since))
            .filter_map(|e| e.final_score.map(|s| (e.user_id, s)))
            .collect())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn load_balance(&self, user_id: Uuid) -> StoreResult<Option<UserBalance>> {
        self.enter("load_balance")?;
        Ok(self.user_tables().balances.get(&user_id).cloned())
    }

    async fn commit_balance(
        &self,
        expected_version: u64,
        balance: &UserBalance,
        entry: Option<&XpEntry>,
    ) -> StoreResult<bool> {
        self.enter("commit_balance")?;
        let mut tables = self.user_tables();
        let stored = tables
            .balances
            .get(&balance.user_id)
            .map_or(0, |b| b.version);
        if stored != expected_version {
            return Ok(false);
        }
        if let Some(reference) = entry.and_then(|e| e.reference.as_deref()) {
            if tables.ledger.iter().any(|e| e.reference.as_deref() == Some(reference)) {
                return Err(StoreError::Conflict(format!("ledger reference {reference}")));
            }
        }

        let mut next = balance.clone();
        next.version = expected_version + 1;
        tables.balances.insert(next.user_id, next);
        if let Some(entry) = entry {
            tables.ledger.push(entry.clone());
        }
        Ok(true)
    }

    async fn find_entry(&self, reference: &str) -> StoreResult<Option<XpEntry>> {
        self.enter("find_entry")?;
        Ok(self
            .user_tables()
            .ledger
            .iter()
            .find(|e| e.reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn ledger(&self, user_id: Uuid) -> StoreResult<Vec<XpEntry>> {
        self.enter("ledger")?;
        Ok(self
            .user_tables()
            .ledger
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn top_balances(&self, limit: usize) -> StoreResult<Vec<UserBalance>> {
        self.enter("top_balances")?;
        let mut balances: Vec<UserBalance> = self.user_tables().balances.values().cloned().collect();
        balances.sort_by(|a, b| b.xp_total.cmp(&a.xp_total).then(a.user_id.cmp(&b.user_id)));
        balances.truncate(limit);
        Ok(balances)
    }
}

#[async_trait]
impl StudyStore for MemoryStore {
    async fn open_session(&self, user_id: Uuid) -> StoreResult<Option<StudySession>> {
        self.enter("open_session")?;
        Ok(self
            .study_table()
            .values()
            .find(|s| s.user_id == user_id && s.is_open())
            .cloned())
    }

    async fn insert_open(&self, session: &StudySession) -> StoreResult<bool> {
        self.enter("insert_open")?;
        let mut table = self.study_table();
        if table
            .values()
            .any(|s| s.user_id == session.user_id && s.is_open())
        {
            return Ok(false);
        }
        table.insert(session.id, session.clone());
        Ok(true)
    }

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<StudySession>> {
        self.enter("get_session")?;
        Ok(self.study_table().get(&id).cloned())
    }

    async fn close_session(
        &self,
        id: Uuid,
        finished_at: DateTime<Utc>,
        minutes: u32,
    ) -> StoreResult<Option<StudySession>> {
        self.enter("close_session")?;
        let mut table = self.study_table();
        match table.get_mut(&id) {
            Some(session) if session.is_open() => {
                session.finished_at = Some(finished_at);
                session.minutes = minutes;
                Ok(Some(session.clone()))
            }
            Some(_) => Ok(None),
            None => Err(StoreError::NotFound(format!("study session {id}"))),
        }
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        self.enter("touch")?;
        let mut table = self.study_table();
        match table.get_mut(&id) {
            Some(session) if session.is_open() => {
                session.last_ping_at = session.last_ping_at.max(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn idle_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StudySession>> {
        self.enter("idle_sessions")?;
        let mut idle: Vec<StudySession> = self
            .study_table()
            .values()
            .filter(|s| s.is_open() && s.last_ping_at < cutoff)
            .cloned()
            .collect();
        idle.sort_by_key(|s| s.last_ping_at);
        Ok(idle)
    }
}
