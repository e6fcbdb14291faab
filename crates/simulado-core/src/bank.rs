//! Question bank service.
//!
//! A thin, retrying facade over a [`QuestionStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{retry_once, Result, SimuladoError};
use crate::model::{BaseQuestion, Discipline};
use crate::traits::QuestionStore;

/// Queryable, read-mostly pool of base questions.
#[derive(Clone)]
pub struct QuestionBank {
    store: Arc<dyn QuestionStore>,
    retry_delay: Duration,
}

impl QuestionBank {
    pub fn new(store: Arc<dyn QuestionStore>, retry_delay: Duration) -> Self {
        Self { store, retry_delay }
    }

    /// Import questions into the bank. Invalid questions are rejected as a
    /// whole batch.
    pub async fn import(&self, questions: Vec<BaseQuestion>) -> Result<usize> {
        for q in &questions {
            if !(0.0..=1.0).contains(&q.difficulty) {
                return Err(SimuladoError::InvalidInput {
                    field: "difficulty",
                    reason: format!("question {} has difficulty {}", q.id, q.difficulty),
                });
            }
        }
        let count = questions.len();
        let written = retry_once("upsert_questions", self.retry_delay, || {
            self.store.upsert_questions(questions.clone())
        })
        .await?;
        tracing::info!("imported {written}/{count} questions into the bank");
        Ok(written)
    }

    /// Fetch an active question.
    pub async fn get(&self, id: &str) -> Result<BaseQuestion> {
        let question = retry_once("get_question", self.retry_delay, || {
            self.store.get_question(id)
        })
        .await?;
        match question {
            Some(q) if q.active => Ok(q),
            _ => Err(SimuladoError::not_found("question", id)),
        }
    }

    /// Number of active questions per discipline; missing disciplines omitted.
    pub async fn count_by_discipline(
        &self,
        disciplines: &[Discipline],
    ) -> Result<HashMap<Discipline, u64>> {
        let counts = retry_once("count_active", self.retry_delay, || {
            self.store.count_active(disciplines)
        })
        .await?;
        Ok(counts.into_iter().filter(|(_, n)| *n > 0).collect())
    }

    /// Distinct non-empty topics in a discipline, ordered lexicographically.
    pub async fn list_topics(&self, discipline: Discipline) -> Result<Vec<(String, u64)>> {
        let mut topics = retry_once("topics", self.retry_delay, || {
            self.store.topics(discipline)
        })
        .await?;
        topics.retain(|(topic, _)| !topic.trim().is_empty());
        topics.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(topics)
    }

    /// `k` active questions of a discipline, uniformly at random. Returns all
    /// available when fewer exist.
    pub async fn sample(&self, discipline: Discipline, k: usize) -> Result<Vec<BaseQuestion>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let sampled = retry_once("sample_active", self.retry_delay, || {
            self.store.sample_active(discipline, None, k)
        })
        .await?;
        Ok(sampled)
    }

    /// As [`sample`](Self::sample), restricted to one topic. Subtopics are
    /// ignored.
    pub async fn sample_by_topic(
        &self,
        discipline: Discipline,
        topic: &str,
        k: usize,
    ) -> Result<Vec<BaseQuestion>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let sampled = retry_once("sample_active", self.retry_delay, || {
            self.store.sample_active(discipline, Some(topic), k)
        })
        .await?;
        Ok(sampled)
    }

    /// Record one use of a question.
    pub async fn materialise_stat(&self, base_id: &str, was_correct: bool) -> Result<()> {
        retry_once("increment_usage", self.retry_delay, || {
            self.store.increment_usage(base_id, was_correct)
        })
        .await?;
        tracing::debug!("usage recorded for {base_id} (correct: {was_correct})");
        Ok(())
    }
}
