//! PostgreSQL store.
//!
//! Every trait method is one statement or one transaction. Finish claims
//! the exam row with a conditional `UPDATE` and writes the outcome in the
//! same transaction; answer writes hold a share lock on the exam row, so a
//! claim waits for in-flight answers and then sees them all.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::FromRow;
use uuid::Uuid;

use simulado_core::error::{StoreError, StoreResult};
use simulado_core::model::{
    Alternative, BaseQuestion, Discipline, Exam, ExamKind, ExamQuestion, ExamSpec, ExamStatus,
    Letter, StudySession, UserBalance, XpEntry,
};
use simulado_core::traits::{
    AnswerWrite, ExamStore, FinishedExam, OutcomeFn, QuestionStore, StudyStore, UserStore,
};

fn db_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Unavailable(e.to_string()),
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            StoreError::Conflict(db.message().to_string())
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

fn decode<T: FromStr<Err = String>>(column: &str, value: &str) -> StoreResult<T> {
    value
        .parse()
        .map_err(|e| StoreError::Backend(format!("bad {column} '{value}': {e}")))
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

const QUESTION_COLUMNS: &str = "id, statement, discipline, topic, subtopic, a, b, c, d, e, \
     correct, explanation, difficulty, active, times_used, times_correct";

#[derive(FromRow)]
struct QuestionRow {
    id: String,
    statement: String,
    discipline: String,
    topic: String,
    subtopic: Option<String>,
    a: String,
    b: String,
    c: String,
    d: String,
    e: String,
    correct: String,
    explanation: String,
    difficulty: f64,
    active: bool,
    times_used: i64,
    times_correct: i64,
}

impl TryFrom<QuestionRow> for BaseQuestion {
    type Error = StoreError;

    fn try_from(row: QuestionRow) -> StoreResult<Self> {
        Ok(BaseQuestion {
            discipline: decode("discipline", &row.discipline)?,
            correct: decode("correct", &row.correct)?,
            id: row.id,
            statement: row.statement,
            topic: row.topic,
            subtopic: row.subtopic,
            alternatives: [row.a, row.b, row.c, row.d, row.e],
            explanation: row.explanation,
            difficulty: row.difficulty,
            active: row.active,
            times_used: row.times_used.max(0) as u64,
            times_correct: row.times_correct.max(0) as u64,
        })
    }
}

const EXAM_COLUMNS: &str = "id, user_id, title, areas, spec, duration_minutes, type, status, \
     created_at, scheduled_at, started_at, finished_at, final_score, elapsed_string, skipped, \
     total_correct, mean_seconds";

#[derive(FromRow)]
struct ExamRow {
    id: Uuid,
    user_id: Uuid,
    title: String,
    areas: String,
    spec: String,
    duration_minutes: i32,
    #[sqlx(rename = "type")]
    kind: String,
    status: String,
    created_at: DateTime<Utc>,
    scheduled_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    final_score: Option<f64>,
    elapsed_string: Option<String>,
    skipped: Option<i32>,
    total_correct: Option<i32>,
    mean_seconds: Option<f64>,
}

impl TryFrom<ExamRow> for Exam {
    type Error = StoreError;

    fn try_from(row: ExamRow) -> StoreResult<Self> {
        let spec: ExamSpec = serde_json::from_str(&row.spec)
            .map_err(|e| StoreError::Backend(format!("bad spec of exam {}: {e}", row.id)))?;
        Ok(Exam {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            areas: row.areas,
            spec,
            duration_minutes: row.duration_minutes.max(0) as u32,
            kind: decode::<ExamKind>("type", &row.kind)?,
            status: decode::<ExamStatus>("status", &row.status)?,
            created_at: row.created_at,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            final_score: row.final_score,
            elapsed: row.elapsed_string,
            skipped: row.skipped.map(|n| n.max(0) as u32),
            total_correct: row.total_correct.map(|n| n.max(0) as u32),
            mean_seconds_per_question: row.mean_seconds,
        })
    }
}

const EXAM_QUESTION_COLUMNS: &str = "id, exam_id, base_id, number, discipline, topic, statement, \
     difficulty, correct, explanation, user_answer, time_to_answer";

#[derive(FromRow)]
struct ExamQuestionRow {
    id: Uuid,
    exam_id: Uuid,
    base_id: Option<String>,
    number: i32,
    discipline: String,
    topic: String,
    statement: String,
    difficulty: f64,
    correct: String,
    explanation: String,
    user_answer: Option<String>,
    time_to_answer: Option<i32>,
}

impl ExamQuestionRow {
    fn into_question(self, alternatives: Vec<Alternative>) -> StoreResult<ExamQuestion> {
        Ok(ExamQuestion {
            discipline: decode("discipline", &self.discipline)?,
            correct: decode("correct", &self.correct)?,
            user_answer: self
                .user_answer
                .as_deref()
                .map(|l| decode::<Letter>("user_answer", l))
                .transpose()?,
            id: self.id,
            exam_id: self.exam_id,
            base_id: self.base_id,
            number: self.number.max(0) as u32,
            topic: self.topic,
            statement: self.statement,
            alternatives,
            explanation: self.explanation,
            difficulty: self.difficulty,
            time_to_answer: self.time_to_answer.map(|t| t.max(0) as u32),
        })
    }
}

#[derive(FromRow)]
struct AlternativeRow {
    exam_question_id: Uuid,
    letter: String,
    text: String,
}

#[derive(FromRow)]
struct BalanceRow {
    id: Uuid,
    xp_total: i64,
    diamonds: i64,
    last_diamond_reset: DateTime<Utc>,
    version: i64,
}

impl From<BalanceRow> for UserBalance {
    fn from(row: BalanceRow) -> Self {
        UserBalance {
            user_id: row.id,
            xp_total: row.xp_total,
            diamonds: row.diamonds,
            last_diamond_reset: row.last_diamond_reset,
            version: row.version.max(0) as u64,
        }
    }
}

#[derive(FromRow)]
struct LedgerRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    source: String,
    description: String,
    reference: Option<String>,
    at: DateTime<Utc>,
}

const LEDGER_COLUMNS: &str = "id, user_id, amount, source, description, reference, at";

impl From<LedgerRow> for XpEntry {
    fn from(row: LedgerRow) -> Self {
        XpEntry {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            source: row.source,
            description: row.description,
            reference: row.reference,
            at: row.at,
        }
    }
}

const SESSION_COLUMNS: &str = "id, user_id, activity, started_at, finished_at, last_ping_at, minutes";

#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    activity: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    last_ping_at: DateTime<Utc>,
    minutes: i32,
}

impl From<SessionRow> for StudySession {
    fn from(row: SessionRow) -> Self {
        StudySession {
            id: row.id,
            user_id: row.user_id,
            activity: row.activity,
            started_at: row.started_at,
            finished_at: row.finished_at,
            last_ping_at: row.last_ping_at,
            minutes: row.minutes.max(0) as u32,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Store backed by a PostgreSQL connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with a small pool.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await
            .map_err(db_err)?;
        tracing::info!("connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn exam_exists(&self, id: Uuid) -> StoreResult<bool> {
        let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM exams WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(found.is_some())
    }
}

/// Attach alternatives to question rows, preserving row order.
async fn with_alternatives(
    conn: &mut PgConnection,
    rows: Vec<ExamQuestionRow>,
) -> StoreResult<Vec<ExamQuestion>> {
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let alternatives: Vec<AlternativeRow> = sqlx::query_as(
        "SELECT exam_question_id, letter, text FROM alternatives \
         WHERE exam_question_id = ANY($1) ORDER BY exam_question_id, letter",
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;

    let mut grouped: HashMap<Uuid, Vec<Alternative>> = HashMap::new();
    for alt in alternatives {
        grouped.entry(alt.exam_question_id).or_default().push(Alternative {
            letter: decode("letter", &alt.letter)?,
            text: alt.text,
        });
    }

    rows.into_iter()
        .map(|row| {
            let alts = grouped.remove(&row.id).unwrap_or_default();
            row.into_question(alts)
        })
        .collect()
}

async fn questions_of(conn: &mut PgConnection, exam_id: Uuid) -> StoreResult<Vec<ExamQuestion>> {
    let rows: Vec<ExamQuestionRow> = sqlx::query_as(&format!(
        "SELECT {EXAM_QUESTION_COLUMNS} FROM exam_questions WHERE exam_id = $1 ORDER BY number"
    ))
    .bind(exam_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err)?;
    with_alternatives(conn, rows).await
}

async fn exam_question(conn: &mut PgConnection, id: Uuid) -> StoreResult<Option<ExamQuestion>> {
    let row: Option<ExamQuestionRow> = sqlx::query_as(&format!(
        "SELECT {EXAM_QUESTION_COLUMNS} FROM exam_questions WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    match row {
        Some(row) => Ok(with_alternatives(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

#[async_trait]
impl QuestionStore for PgStore {
    async fn upsert_questions(&self, questions: Vec<BaseQuestion>) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for q in &questions {
            sqlx::query(
                r#"
                INSERT INTO base_questions (
                    id, statement, discipline, topic, subtopic, a, b, c, d, e,
                    correct, explanation, difficulty, active
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (id)
                DO UPDATE SET
                    statement = EXCLUDED.statement,
                    discipline = EXCLUDED.discipline,
                    topic = EXCLUDED.topic,
                    subtopic = EXCLUDED.subtopic,
                    a = EXCLUDED.a,
                    b = EXCLUDED.b,
                    c = EXCLUDED.c,
                    d = EXCLUDED.d,
                    e = EXCLUDED.e,
                    correct = EXCLUDED.correct,
                    explanation = EXCLUDED.explanation,
                    difficulty = EXCLUDED.difficulty,
                    active = EXCLUDED.active
                "#,
            )
            .bind(&q.id)
            .bind(&q.statement)
            .bind(q.discipline.as_str())
            .bind(&q.topic)
            .bind(&q.subtopic)
            .bind(&q.alternatives[0])
            .bind(&q.alternatives[1])
            .bind(&q.alternatives[2])
            .bind(&q.alternatives[3])
            .bind(&q.alternatives[4])
            .bind(q.correct.to_string())
            .bind(&q.explanation)
            .bind(q.difficulty)
            .bind(q.active)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(questions.len())
    }

    async fn get_question(&self, id: &str) -> StoreResult<Option<BaseQuestion>> {
        let row: Option<QuestionRow> = sqlx::query_as(&format!(
            "SELECT {QUESTION_COLUMNS} FROM base_questions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(BaseQuestion::try_from).transpose()
    }

    async fn count_active(&self, disciplines: &[Discipline]) -> StoreResult<HashMap<Discipline, u64>> {
        let names: Vec<&str> = disciplines.iter().map(|d| d.as_str()).collect();
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT discipline, COUNT(*)
            FROM base_questions
            WHERE active AND discipline = ANY($1)
            GROUP BY discipline
            "#,
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|(name, n)| Ok::<_, StoreError>((decode::<Discipline>("discipline", &name)?, n.max(0) as u64)))
            .collect()
    }

    async fn topics(&self, discipline: Discipline) -> StoreResult<Vec<(String, u64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT topic, COUNT(*)
            FROM base_questions
            WHERE active AND discipline = $1 AND btrim(topic) <> ''
            GROUP BY topic
            ORDER BY topic
            "#,
        )
        .bind(discipline.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(t, n)| (t, n.max(0) as u64)).collect())
    }

    async fn sample_active(
        &self,
        discipline: Discipline,
        topic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<BaseQuestion>> {
        let rows: Vec<QuestionRow> = sqlx::query_as(&format!(
            "SELECT {QUESTION_COLUMNS} FROM base_questions \
             WHERE active AND discipline = $1 AND ($2::TEXT IS NULL OR btrim(topic) = btrim($2)) \
             ORDER BY RANDOM() LIMIT $3"
        ))
        .bind(discipline.as_str())
        .bind(topic)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(BaseQuestion::try_from).collect()
    }

    async fn increment_usage(&self, id: &str, was_correct: bool) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE base_questions
            SET times_used = times_used + 1,
                times_correct = times_correct + CASE WHEN $2 THEN 1 ELSE 0 END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(was_correct)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("question {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ExamStore for PgStore {
    async fn create_exam(&self, exam: Exam) -> StoreResult<Exam> {
        let spec = serde_json::to_string(&exam.spec)
            .map_err(|e| StoreError::Backend(format!("failed to encode spec: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO exams (
                id, user_id, title, areas, spec, duration_minutes, type, status,
                created_at, scheduled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(exam.id)
        .bind(exam.user_id)
        .bind(&exam.title)
        .bind(&exam.areas)
        .bind(spec)
        .bind(exam.duration_minutes as i32)
        .bind(exam.kind.to_string())
        .bind(exam.status.as_str())
        .bind(exam.created_at)
        .bind(exam.scheduled_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(exam)
    }

    async fn get_exam(&self, id: Uuid) -> StoreResult<Option<Exam>> {
        let row: Option<ExamRow> =
            sqlx::query_as(&format!("SELECT {EXAM_COLUMNS} FROM exams WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(Exam::try_from).transpose()
    }

    async fn list_exams(&self, user_id: Uuid, status: Option<ExamStatus>) -> StoreResult<Vec<Exam>> {
        let rows: Vec<ExamRow> = sqlx::query_as(&format!(
            "SELECT {EXAM_COLUMNS} FROM exams \
             WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC, id"
        ))
        .bind(user_id)
        .bind(status.map(ExamStatus::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(Exam::try_from).collect()
    }

    async fn delete_exam(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM exams WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn attach_questions(&self, exam_id: Uuid, questions: Vec<ExamQuestion>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM exams WHERE id = $1 FOR UPDATE")
            .bind(exam_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if locked.is_none() {
            return Err(StoreError::NotFound(format!("exam {exam_id}")));
        }

        let (existing,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM exam_questions WHERE exam_id = $1")
                .bind(exam_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
        if existing > 0 {
            return Err(StoreError::Conflict(format!(
                "exam {exam_id} already has questions"
            )));
        }

        for q in &questions {
            if q.exam_id != exam_id {
                return Err(StoreError::Conflict(format!(
                    "question {} belongs to exam {}",
                    q.id, q.exam_id
                )));
            }
            sqlx::query(
                r#"
                INSERT INTO exam_questions (
                    id, exam_id, base_id, number, discipline, topic, statement,
                    difficulty, correct, explanation
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(q.id)
            .bind(exam_id)
            .bind(&q.base_id)
            .bind(q.number as i32)
            .bind(q.discipline.as_str())
            .bind(&q.topic)
            .bind(&q.statement)
            .bind(q.difficulty)
            .bind(q.correct.to_string())
            .bind(&q.explanation)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            for alt in &q.alternatives {
                sqlx::query(
                    "INSERT INTO alternatives (exam_question_id, letter, text) VALUES ($1, $2, $3)",
                )
                .bind(q.id)
                .bind(alt.letter.to_string())
                .bind(&alt.text)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn questions(&self, exam_id: Uuid) -> StoreResult<Vec<ExamQuestion>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        questions_of(&mut conn, exam_id).await
    }

    async fn get_exam_question(&self, question_id: Uuid) -> StoreResult<Option<ExamQuestion>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        exam_question(&mut conn, question_id).await
    }

    async fn mark_started(&self, exam_id: Uuid, at: DateTime<Utc>) -> StoreResult<Exam> {
        let row: Option<ExamRow> = sqlx::query_as(&format!(
            "UPDATE exams \
             SET started_at = COALESCE(started_at, $2), \
                 status = CASE WHEN status = 'pending' THEN 'in_progress' ELSE status END \
             WHERE id = $1 AND finished_at IS NULL \
             RETURNING {EXAM_COLUMNS}"
        ))
        .bind(exam_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Exam::try_from(row),
            None => self
                .get_exam(exam_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("exam {exam_id}"))),
        }
    }

    async fn record_answer(
        &self,
        question_id: Uuid,
        answer: Letter,
        time_to_answer: Option<u32>,
    ) -> StoreResult<Option<AnswerWrite>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let locked: Option<(Option<DateTime<Utc>>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT e.finished_at, q.user_answer
            FROM exam_questions q
            JOIN exams e ON e.id = q.exam_id
            WHERE q.id = $1
            FOR UPDATE OF q
            FOR SHARE OF e
            "#,
        )
        .bind(question_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some((finished_at, previous)) = locked else {
            return Err(StoreError::NotFound(format!("exam question {question_id}")));
        };
        if finished_at.is_some() {
            return Ok(None);
        }
        let previous = previous
            .as_deref()
            .map(|l| decode::<Letter>("user_answer", l))
            .transpose()?;

        sqlx::query(
            r#"
            UPDATE exam_questions
            SET user_answer = $2, time_to_answer = COALESCE($3, time_to_answer)
            WHERE id = $1
            "#,
        )
        .bind(question_id)
        .bind(answer.to_string())
        .bind(time_to_answer.map(|t| t as i32))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let question = exam_question(&mut tx, question_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("exam question {question_id}")))?;
        tx.commit().await.map_err(db_err)?;
        Ok(Some(AnswerWrite { question, previous }))
    }

    async fn finish_exam(
        &self,
        exam_id: Uuid,
        at: DateTime<Utc>,
        score: OutcomeFn,
    ) -> StoreResult<Option<FinishedExam>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row: Option<ExamRow> = sqlx::query_as(&format!(
            "UPDATE exams \
             SET finished_at = $2, started_at = COALESCE(started_at, $2) \
             WHERE id = $1 AND finished_at IS NULL \
             RETURNING {EXAM_COLUMNS}"
        ))
        .bind(exam_id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            drop(tx);
            if self.exam_exists(exam_id).await? {
                return Ok(None);
            }
            return Err(StoreError::NotFound(format!("exam {exam_id}")));
        };

        let claimed = Exam::try_from(row)?;
        let questions = questions_of(&mut tx, exam_id).await?;
        let outcome = score(&claimed, &questions);

        let row: ExamRow = sqlx::query_as(&format!(
            "UPDATE exams \
             SET status = 'completed', final_score = $2, elapsed_string = $3, skipped = $4, \
                 total_correct = $5, mean_seconds = $6 \
             WHERE id = $1 \
             RETURNING {EXAM_COLUMNS}"
        ))
        .bind(exam_id)
        .bind(outcome.final_score)
        .bind(&outcome.elapsed)
        .bind(outcome.skipped as i32)
        .bind(outcome.total_correct as i32)
        .bind(outcome.mean_seconds_per_question)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let exam = Exam::try_from(row)?;
        tx.commit().await.map_err(db_err)?;
        Ok(Some(FinishedExam { exam, questions }))
    }

    async fn completed_scores(&self, since: DateTime<Utc>) -> StoreResult<Vec<(Uuid, f64)>> {
        let rows: Vec<(Uuid, f64)> = sqlx::query_as(
            r#"
            SELECT user_id, final_score
            FROM exams
            WHERE status = 'completed' AND finished_at >= $1 AND final_score IS NOT NULL
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows)
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn load_balance(&self, user_id: Uuid) -> StoreResult<Option<UserBalance>> {
        let row: Option<BalanceRow> = sqlx::query_as(
            "SELECT id, xp_total, diamonds, last_diamond_reset, version FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(UserBalance::from))
    }

    async fn commit_balance(
        &self,
        expected_version: u64,
        balance: &UserBalance,
        entry: Option<&XpEntry>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let next_version = expected_version as i64 + 1;

        let result = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO users (id, xp_total, diamonds, last_diamond_reset, version)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(balance.user_id)
            .bind(balance.xp_total)
            .bind(balance.diamonds)
            .bind(balance.last_diamond_reset)
            .bind(next_version)
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE users
                SET xp_total = $2, diamonds = $3, last_diamond_reset = $4, version = $5
                WHERE id = $1 AND version = $6
                "#,
            )
            .bind(balance.user_id)
            .bind(balance.xp_total)
            .bind(balance.diamonds)
            .bind(balance.last_diamond_reset)
            .bind(next_version)
            .bind(expected_version as i64)
            .execute(&mut *tx)
            .await
        };

        if result.map_err(db_err)?.rows_affected() == 0 {
            return Ok(false);
        }

        if let Some(entry) = entry {
            sqlx::query(
                r#"
                INSERT INTO xp_ledger (id, user_id, amount, source, description, reference, at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(entry.id)
            .bind(entry.user_id)
            .bind(entry.amount)
            .bind(&entry.source)
            .bind(&entry.description)
            .bind(&entry.reference)
            .bind(entry.at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn find_entry(&self, reference: &str) -> StoreResult<Option<XpEntry>> {
        let row: Option<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM xp_ledger WHERE reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(XpEntry::from))
    }

    async fn ledger(&self, user_id: Uuid) -> StoreResult<Vec<XpEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM xp_ledger WHERE user_id = $1 ORDER BY seq DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(XpEntry::from).collect())
    }

    async fn top_balances(&self, limit: usize) -> StoreResult<Vec<UserBalance>> {
        let rows: Vec<BalanceRow> = sqlx::query_as(
            r#"
            SELECT id, xp_total, diamonds, last_diamond_reset, version
            FROM users
            ORDER BY xp_total DESC, id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(UserBalance::from).collect())
    }
}

#[async_trait]
impl StudyStore for PgStore {
    async fn open_session(&self, user_id: Uuid) -> StoreResult<Option<StudySession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM study_sessions WHERE user_id = $1 AND finished_at IS NULL"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(StudySession::from))
    }

    async fn insert_open(&self, session: &StudySession) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO study_sessions (id, user_id, activity, started_at, last_ping_at, minutes)
            VALUES ($1, $2, $3, $4, $5, 0)
            ON CONFLICT (user_id) WHERE finished_at IS NULL DO NOTHING
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.activity)
        .bind(session.started_at)
        .bind(session.last_ping_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<StudySession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM study_sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(StudySession::from))
    }

    async fn close_session(
        &self,
        id: Uuid,
        finished_at: DateTime<Utc>,
        minutes: u32,
    ) -> StoreResult<Option<StudySession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "UPDATE study_sessions SET finished_at = $2, minutes = $3 \
             WHERE id = $1 AND finished_at IS NULL \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id)
        .bind(finished_at)
        .bind(minutes as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(row.into())),
            None if self.get_session(id).await?.is_some() => Ok(None),
            None => Err(StoreError::NotFound(format!("study session {id}"))),
        }
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE study_sessions
            SET last_ping_at = GREATEST(last_ping_at, $2)
            WHERE id = $1 AND finished_at IS NULL
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn idle_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StudySession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM study_sessions \
             WHERE finished_at IS NULL AND last_ping_at < $1 \
             ORDER BY last_ping_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(StudySession::from).collect())
    }
}
