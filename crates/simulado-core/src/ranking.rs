//! Leaderboards over XP and exam scores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{retry_once, Result};
use crate::traits::{ExamStore, UserStore};

/// A leaderboard row. Equal values share a position; positions are dense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub position: u32,
    pub user_id: Uuid,
    pub value: f64,
}

/// Assign dense 1-based positions to rows already sorted by value, descending.
pub fn dense_rank(sorted: impl IntoIterator<Item = (Uuid, f64)>) -> Vec<RankEntry> {
    let mut entries = Vec::new();
    let mut position = 0;
    let mut previous: Option<f64> = None;
    for (user_id, value) in sorted {
        if previous != Some(value) {
            position += 1;
            previous = Some(value);
        }
        entries.push(RankEntry {
            position,
            user_id,
            value,
        });
    }
    entries
}

#[derive(Clone)]
pub struct Leaderboard {
    users: Arc<dyn UserStore>,
    exams: Arc<dyn ExamStore>,
    retry_delay: Duration,
}

impl Leaderboard {
    pub fn new(users: Arc<dyn UserStore>, exams: Arc<dyn ExamStore>, retry_delay: Duration) -> Self {
        Self {
            users,
            exams,
            retry_delay,
        }
    }

    /// Users by lifetime XP.
    pub async fn top_xp(&self, limit: usize) -> Result<Vec<RankEntry>> {
        let balances = retry_once("top_balances", self.retry_delay, || {
            self.users.top_balances(limit)
        })
        .await?;
        let mut rows: Vec<(Uuid, f64)> = balances
            .into_iter()
            .map(|b| (b.user_id, b.xp_total as f64))
            .collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        rows.truncate(limit);
        Ok(dense_rank(rows))
    }

    /// Users by their best exam score completed at or after `since`.
    pub async fn top_scores(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<RankEntry>> {
        let scores = retry_once("completed_scores", self.retry_delay, || {
            self.exams.completed_scores(since)
        })
        .await?;

        let mut best: HashMap<Uuid, f64> = HashMap::new();
        for (user_id, score) in scores {
            let entry = best.entry(user_id).or_insert(score);
            if score > *entry {
                *entry = score;
            }
        }

        let mut rows: Vec<(Uuid, f64)> = best.into_iter().filter(|(_, s)| *s > 0.0).collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        rows.truncate(limit);
        Ok(dense_rank(rows))
    }
}
