//! XP and diamond rewards.
//!
//! XP accumulates forever. Diamonds are derived one-for-two from XP grants
//! and reset to zero at the first grant of each calendar month (UTC). The
//! reset is detected lazily; [`RewardEngine::balance`] applies it on read so
//! no caller sees a stale balance.
//!
//! Balance updates are optimistic: load the row, compute the new row, then
//! compare-and-swap it together with the ledger append. A lost race reloads
//! and recomputes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{retry_once, Result, SimuladoError, StoreError};
use crate::model::{Exam, StudySession, UserBalance, XpEntry};
use crate::traits::{Clock, UserStore};

/// Maximum XP credited for one study session.
pub const STUDY_XP_CAP: i64 = 240;
/// XP per studied minute.
pub const STUDY_XP_PER_MINUTE: i64 = 2;
/// Ledger source tag for completed exams.
pub const EXAM_SOURCE: &str = "simulado";

const MAX_CAS_ATTEMPTS: u32 = 32;

/// What a single grant did to a user's balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantOutcome {
    pub xp_gained: i64,
    pub xp_total: i64,
    pub diamonds_gained: i64,
    pub diamonds_total: i64,
    /// Diamonds were zeroed by the monthly reset before this grant.
    pub was_reset: bool,
}

/// What a diamond spend did to a user's balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendOutcome {
    pub diamonds_spent: i64,
    pub diamonds_total: i64,
}

/// `true` if `now` falls in a later calendar month than the last reset.
pub fn needs_reset(last_reset: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (now.year(), now.month()) != (last_reset.year(), last_reset.month())
}

/// Apply the monthly reset to a balance as of `now`, without persisting.
pub fn effective_balance(balance: &UserBalance, now: DateTime<Utc>) -> UserBalance {
    let mut view = balance.clone();
    if needs_reset(balance.last_diamond_reset, now) {
        view.diamonds = 0;
        view.last_diamond_reset = now;
    }
    view
}

/// Compute the balance after granting `amount` XP at `now`.
pub fn apply_grant(balance: &UserBalance, amount: i64, now: DateTime<Utc>) -> (UserBalance, GrantOutcome) {
    let mut next = balance.clone();
    next.xp_total += amount;

    let was_reset = needs_reset(balance.last_diamond_reset, now);
    if was_reset {
        next.diamonds = 0;
        next.last_diamond_reset = now;
    }

    let diamonds_gained = amount.div_euclid(2);
    let before = next.diamonds;
    next.diamonds = (next.diamonds + diamonds_gained).max(0);

    let outcome = GrantOutcome {
        xp_gained: amount,
        xp_total: next.xp_total,
        diamonds_gained: next.diamonds - before,
        diamonds_total: next.diamonds,
        was_reset,
    };
    (next, outcome)
}

/// XP for a completed exam: a tenth of the score, rounded to a multiple of 5.
/// Halves round to even, so 625 earns 60 and 675 earns 70.
pub fn exam_xp(score: f64) -> i64 {
    if score <= 0.0 {
        return 0;
    }
    ((score * 0.1 / 5.0).round_ties_even() * 5.0) as i64
}

/// XP for a closed study session, capped at [`STUDY_XP_CAP`].
pub fn study_xp(minutes: u32) -> i64 {
    (minutes as i64 * STUDY_XP_PER_MINUTE).min(STUDY_XP_CAP)
}

/// Converts activity into XP and diamond deltas.
#[derive(Clone)]
pub struct RewardEngine {
    users: Arc<dyn UserStore>,
    clock: Arc<dyn Clock>,
    retry_delay: Duration,
}

impl RewardEngine {
    pub fn new(users: Arc<dyn UserStore>, clock: Arc<dyn Clock>, retry_delay: Duration) -> Self {
        Self {
            users,
            clock,
            retry_delay,
        }
    }

    async fn load(&self, user_id: Uuid) -> Result<UserBalance> {
        let stored = retry_once("load_balance", self.retry_delay, || {
            self.users.load_balance(user_id)
        })
        .await?;
        Ok(stored.unwrap_or_else(|| UserBalance::empty(user_id, self.clock.now())))
    }

    /// Credit XP (and half as many diamonds) and append a ledger entry.
    pub async fn grant_xp(
        &self,
        user_id: Uuid,
        amount: i64,
        source: &str,
        description: &str,
    ) -> Result<GrantOutcome> {
        self.grant(user_id, amount, source, description, None)
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("grant to {user_id} was skipped")).into())
    }

    /// Like [`RewardEngine::grant_xp`], but credits `reference` at most once.
    /// Returns `None` if the ledger already holds an entry for it.
    pub async fn grant_once(
        &self,
        user_id: Uuid,
        amount: i64,
        source: &str,
        description: &str,
        reference: &str,
    ) -> Result<Option<GrantOutcome>> {
        self.grant(user_id, amount, source, description, Some(reference))
            .await
    }

    async fn grant(
        &self,
        user_id: Uuid,
        amount: i64,
        source: &str,
        description: &str,
        reference: Option<&str>,
    ) -> Result<Option<GrantOutcome>> {
        if source.trim().is_empty() {
            return Err(SimuladoError::InvalidInput {
                field: "source",
                reason: "source tag is empty".into(),
            });
        }

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            if let Some(reference) = reference {
                let existing = retry_once("find_entry", self.retry_delay, || {
                    self.users.find_entry(reference)
                })
                .await?;
                if existing.is_some() {
                    tracing::debug!("{reference} already credited to {user_id}");
                    return Ok(None);
                }
            }

            let now = self.clock.now();
            let current = self.load(user_id).await?;
            let (next, outcome) = apply_grant(&current, amount, now);
            let entry = XpEntry {
                id: Uuid::new_v4(),
                user_id,
                amount,
                source: source.to_string(),
                description: description.to_string(),
                reference: reference.map(str::to_string),
                at: now,
            };

            let committed = match retry_once("commit_balance", self.retry_delay, || {
                self.users.commit_balance(current.version, &next, Some(&entry))
            })
            .await
            {
                Ok(committed) => committed,
                // A concurrent grant wrote the same reference; the next pass sees it.
                Err(StoreError::Conflict(_)) if reference.is_some() => false,
                Err(e) => return Err(e.into()),
            };

            if committed {
                if outcome.was_reset {
                    tracing::info!("monthly diamond reset for user {user_id}");
                }
                tracing::info!(
                    "granted {amount} XP to {user_id} ({source}), total {}",
                    outcome.xp_total
                );
                return Ok(Some(outcome));
            }
            tracing::debug!("balance race for {user_id}, attempt {attempt}");
        }

        Err(StoreError::Conflict(format!("balance of user {user_id} kept changing")).into())
    }

    /// Spend diamonds, failing if the (reset-aware) balance is too low.
    pub async fn spend_diamonds(&self, user_id: Uuid, amount: i64, reason: &str) -> Result<SpendOutcome> {
        if amount <= 0 {
            return Err(SimuladoError::InvalidInput {
                field: "amount",
                reason: format!("spend amount must be positive, got {amount}"),
            });
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = self.load(user_id).await?;
            let mut next = effective_balance(&current, now);
            if next.diamonds < amount {
                return Err(SimuladoError::InsufficientDiamonds {
                    needed: amount,
                    available: next.diamonds,
                });
            }
            next.diamonds -= amount;

            let entry = XpEntry {
                id: Uuid::new_v4(),
                user_id,
                amount: -amount,
                source: "spend".to_string(),
                description: reason.to_string(),
                reference: None,
                at: now,
            };

            let committed = retry_once("commit_balance", self.retry_delay, || {
                self.users.commit_balance(current.version, &next, Some(&entry))
            })
            .await?;

            if committed {
                tracing::info!("user {user_id} spent {amount} diamonds: {reason}");
                return Ok(SpendOutcome {
                    diamonds_spent: amount,
                    diamonds_total: next.diamonds,
                });
            }
        }

        Err(StoreError::Conflict(format!("balance of user {user_id} kept changing")).into())
    }

    /// Credit a completed exam once. Returns `None` when there is nothing to
    /// grant or the exam was already credited.
    pub async fn reward_exam(&self, user_id: Uuid, exam: &Exam) -> Result<Option<GrantOutcome>> {
        let Some(score) = exam.final_score.filter(|_| exam.is_completed()) else {
            return Ok(None);
        };
        let xp = exam_xp(score);
        if xp <= 0 {
            return Ok(None);
        }
        let description = format!("{} ({score:.1})", exam.title);
        let reference = format!("exam:{}", exam.id);
        self.grant_once(user_id, xp, EXAM_SOURCE, &description, &reference)
            .await
    }

    /// Credit a closed study session once. Returns `None` for empty sessions
    /// and sessions already credited.
    pub async fn reward_study_session(&self, session: &StudySession) -> Result<Option<GrantOutcome>> {
        if session.is_open() || session.minutes == 0 {
            return Ok(None);
        }
        let xp = study_xp(session.minutes);
        let source = format!("study:{}", session.activity);
        let description = format!("{} min", session.minutes);
        let reference = format!("study:{}", session.id);
        self.grant_once(session.user_id, xp, &source, &description, &reference)
            .await
    }

    /// Current balance with the monthly reset applied on read.
    pub async fn balance(&self, user_id: Uuid) -> Result<UserBalance> {
        let current = self.load(user_id).await?;
        Ok(effective_balance(&current, self.clock.now()))
    }

    /// Ledger entries, newest first.
    pub async fn ledger(&self, user_id: Uuid) -> Result<Vec<XpEntry>> {
        let entries = retry_once("ledger", self.retry_delay, || self.users.ledger(user_id)).await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn balance(xp: i64, diamonds: i64, last_reset: DateTime<Utc>) -> UserBalance {
        UserBalance {
            user_id: Uuid::nil(),
            xp_total: xp,
            diamonds,
            last_diamond_reset: last_reset,
            version: 3,
        }
    }

    #[test]
    fn grant_within_month_accumulates() {
        let b = balance(100, 50, at(2024, 1, 2));
        let (next, outcome) = apply_grant(&b, 40, at(2024, 1, 20));
        assert_eq!(next.xp_total, 140);
        assert_eq!(next.diamonds, 70);
        assert!(!outcome.was_reset);
        assert_eq!(outcome.diamonds_gained, 20);
        assert_eq!(next.last_diamond_reset, at(2024, 1, 2));
    }

    #[test]
    fn grant_after_month_boundary_resets_diamonds() {
        let b = balance(100, 50, at(2024, 1, 15));
        let now = at(2024, 2, 1);
        let (next, outcome) = apply_grant(&b, 40, now);
        assert_eq!(next.xp_total, 140);
        assert_eq!(next.diamonds, 20);
        assert_eq!(next.last_diamond_reset, now);
        assert!(outcome.was_reset);
        assert_eq!(outcome.diamonds_total, 20);
    }

    #[test]
    fn same_month_different_year_resets() {
        assert!(needs_reset(at(2023, 3, 10), at(2024, 3, 10)));
        assert!(!needs_reset(at(2024, 3, 1), at(2024, 3, 31)));
    }

    #[test]
    fn odd_amounts_floor_diamonds() {
        let b = balance(0, 0, at(2024, 1, 1));
        let (next, outcome) = apply_grant(&b, 15, at(2024, 1, 1));
        assert_eq!(next.diamonds, 7);
        assert_eq!(outcome.diamonds_gained, 7);
    }

    #[test]
    fn negative_grant_never_drives_diamonds_below_zero() {
        let b = balance(100, 3, at(2024, 1, 1));
        let (next, outcome) = apply_grant(&b, -20, at(2024, 1, 2));
        assert_eq!(next.xp_total, 80);
        assert_eq!(next.diamonds, 0);
        assert_eq!(outcome.diamonds_gained, -3);
    }

    #[test]
    fn effective_balance_hides_stale_diamonds() {
        let b = balance(10, 50, at(2024, 1, 15));
        assert_eq!(effective_balance(&b, at(2024, 1, 31)).diamonds, 50);
        assert_eq!(effective_balance(&b, at(2024, 2, 1)).diamonds, 0);
    }

    #[test]
    fn exam_xp_rounds_half_to_even_multiple_of_five() {
        assert_eq!(exam_xp(411.7), 40);
        assert_eq!(exam_xp(800.0), 80);
        assert_eq!(exam_xp(625.0), 60);
        assert_eq!(exam_xp(675.0), 70);
        assert_eq!(exam_xp(0.0), 0);
    }

    #[test]
    fn study_xp_is_capped() {
        assert_eq!(study_xp(7), 14);
        assert_eq!(study_xp(120), 240);
        assert_eq!(study_xp(600), 240);
    }
}
