//! Study-time tracking.
//!
//! A user has at most one open session. Starting a different activity
//! closes the open one first; closing credits XP through the reward engine,
//! once per session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{retry_once, Result, SimuladoError, StoreError};
use crate::model::StudySession;
use crate::rewards::{GrantOutcome, RewardEngine};
use crate::traits::{Clock, StudyStore};

const MAX_START_ATTEMPTS: u32 = 8;

/// A session that was just closed, with the XP it earned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedSession {
    pub session: StudySession,
    pub reward: Option<GrantOutcome>,
}

/// Result of [`StudyTracker::start`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyStart {
    /// The open session for the requested activity.
    pub session: StudySession,
    /// Whole minutes since the session started; 0 for a new session.
    pub elapsed_minutes: u32,
    /// The session of another activity closed to make room, if any.
    pub closed: Option<ClosedSession>,
}

/// Whole minutes between two instants, never less than one.
pub fn session_minutes(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> u32 {
    let minutes = (finished_at - started_at).num_seconds().max(0) / 60;
    minutes.clamp(1, u32::MAX as i64) as u32
}

#[derive(Clone)]
pub struct StudyTracker {
    store: Arc<dyn StudyStore>,
    rewards: RewardEngine,
    clock: Arc<dyn Clock>,
    retry_delay: Duration,
}

impl StudyTracker {
    pub fn new(
        store: Arc<dyn StudyStore>,
        rewards: RewardEngine,
        clock: Arc<dyn Clock>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            rewards,
            clock,
            retry_delay,
        }
    }

    /// Open (or resume) a session for `activity`.
    pub async fn start(&self, user_id: Uuid, activity: &str) -> Result<StudyStart> {
        let activity = activity.trim();
        if activity.is_empty() {
            return Err(SimuladoError::InvalidInput {
                field: "activity",
                reason: "activity tag is empty".into(),
            });
        }

        let mut closed = None;
        for _ in 0..MAX_START_ATTEMPTS {
            let now = self.clock.now();
            let open = retry_once("open_session", self.retry_delay, || {
                self.store.open_session(user_id)
            })
            .await?;

            if let Some(session) = open {
                if session.activity == activity {
                    let elapsed = (now - session.started_at).num_minutes().max(0) as u32;
                    return Ok(StudyStart {
                        session,
                        elapsed_minutes: elapsed,
                        closed,
                    });
                }
                match self.close(session, now, true).await {
                    Ok(done) => closed = Some(done),
                    Err(SimuladoError::AlreadyClosed(_)) => {}
                    Err(e) => return Err(e),
                }
                continue;
            }

            let session = StudySession::open(user_id, activity, now);
            let inserted = retry_once("insert_open", self.retry_delay, || {
                self.store.insert_open(&session)
            })
            .await?;
            if inserted {
                tracing::info!("study session {} opened: {activity} for {user_id}", session.id);
                return Ok(StudyStart {
                    session,
                    elapsed_minutes: 0,
                    closed,
                });
            }
            tracing::debug!("concurrent study start for {user_id}, retrying");
        }

        Err(StoreError::Conflict(format!("open session of user {user_id} kept changing")).into())
    }

    /// Close a session now, optionally crediting XP.
    pub async fn finish(&self, session_id: Uuid, credit_xp: bool) -> Result<ClosedSession> {
        let session = retry_once("get_session", self.retry_delay, || {
            self.store.get_session(session_id)
        })
        .await?
        .ok_or_else(|| SimuladoError::not_found("study session", session_id))?;
        if !session.is_open() {
            return Err(SimuladoError::AlreadyClosed(session_id));
        }
        self.close(session, self.clock.now(), credit_xp).await
    }

    /// Heartbeat from a client.
    pub async fn ping(&self, session_id: Uuid) -> Result<()> {
        let now = self.clock.now();
        let touched = retry_once("touch", self.retry_delay, || self.store.touch(session_id, now)).await?;
        if touched {
            return Ok(());
        }
        let session = retry_once("get_session", self.retry_delay, || {
            self.store.get_session(session_id)
        })
        .await?;
        match session {
            Some(_) => Err(SimuladoError::AlreadyClosed(session_id)),
            None => Err(SimuladoError::not_found("study session", session_id)),
        }
    }

    /// Close every session with no heartbeat for `timeout`. Each is closed at
    /// its last heartbeat and credited.
    pub async fn sweep_idle(&self, timeout: chrono::Duration) -> Result<Vec<ClosedSession>> {
        let cutoff = self.clock.now() - timeout;
        let idle = retry_once("idle_sessions", self.retry_delay, || {
            self.store.idle_sessions(cutoff)
        })
        .await?;

        let mut closed = Vec::with_capacity(idle.len());
        for session in idle {
            let at = session.last_ping_at;
            match self.close(session, at, true).await {
                Ok(done) => closed.push(done),
                Err(SimuladoError::AlreadyClosed(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if !closed.is_empty() {
            tracing::info!("closed {} idle study sessions", closed.len());
        }
        Ok(closed)
    }

    /// Credit a closed session that has no ledger entry yet, e.g. after the
    /// grant failed on close. Returns `None` if it was already credited.
    pub async fn settle_reward(&self, session_id: Uuid) -> Result<Option<GrantOutcome>> {
        let session = retry_once("get_session", self.retry_delay, || {
            self.store.get_session(session_id)
        })
        .await?
        .ok_or_else(|| SimuladoError::not_found("study session", session_id))?;
        if session.is_open() {
            return Err(SimuladoError::InvalidInput {
                field: "session",
                reason: format!("study session {session_id} is still open"),
            });
        }
        self.rewards.reward_study_session(&session).await
    }

    /// The user's open session, if any.
    pub async fn current(&self, user_id: Uuid) -> Result<Option<StudySession>> {
        let open = retry_once("open_session", self.retry_delay, || {
            self.store.open_session(user_id)
        })
        .await?;
        Ok(open)
    }

    async fn close(
        &self,
        session: StudySession,
        finished_at: DateTime<Utc>,
        credit_xp: bool,
    ) -> Result<ClosedSession> {
        let minutes = session_minutes(session.started_at, finished_at);
        let closed = retry_once("close_session", self.retry_delay, || {
            self.store.close_session(session.id, finished_at, minutes)
        })
        .await?
        .ok_or(SimuladoError::AlreadyClosed(session.id))?;
        tracing::info!(
            "study session {} closed: {} for {} min",
            closed.id,
            closed.activity,
            closed.minutes
        );

        let reward = if credit_xp {
            self.rewards.reward_study_session(&closed).await?
        } else {
            None
        };
        Ok(ClosedSession {
            session: closed,
            reward,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn minutes_floor_with_minimum_of_one() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        assert_eq!(session_minutes(start, start), 1);
        assert_eq!(session_minutes(start, start + chrono::Duration::seconds(59)), 1);
        assert_eq!(session_minutes(start, start + chrono::Duration::seconds(7 * 60 + 59)), 7);
        assert_eq!(session_minutes(start, start + chrono::Duration::hours(3)), 180);
        assert_eq!(session_minutes(start, start - chrono::Duration::minutes(5)), 1);
    }
}
