//! Engine assembly.
//!
//! Wires the six services over one store and one clock.

use std::sync::Arc;
use std::time::Duration;

use crate::bank::QuestionBank;
use crate::config::SimuladoConfig;
use crate::generator::ExamGenerator;
use crate::ranking::Leaderboard;
use crate::rewards::RewardEngine;
use crate::session::ExamSessions;
use crate::study::StudyTracker;
use crate::traits::{Clock, ExamStore, QuestionStore, StudyStore, UserStore};

/// Runtime settings of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Used when a scheduled exam names no duration.
    pub default_duration_minutes: u32,
    /// Largest question count a spec may request.
    pub max_total_questions: u32,
    /// Delay before the single retry of a transient store failure.
    pub retry_delay: Duration,
    /// Idle time after which the study sweep closes a session.
    pub study_idle_timeout: chrono::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::from(&SimuladoConfig::default())
    }
}

impl From<&SimuladoConfig> for EngineConfig {
    fn from(config: &SimuladoConfig) -> Self {
        Self {
            default_duration_minutes: config.default_duration_minutes,
            max_total_questions: config.max_total_questions,
            retry_delay: config.retry_delay(),
            study_idle_timeout: config.study_idle_timeout(),
        }
    }
}

/// All services of the simulado engine.
#[derive(Clone)]
pub struct SimuladoEngine {
    bank: QuestionBank,
    generator: ExamGenerator,
    sessions: ExamSessions,
    rewards: RewardEngine,
    study: StudyTracker,
    leaderboard: Leaderboard,
    config: EngineConfig,
}

impl SimuladoEngine {
    pub fn new(
        questions: Arc<dyn QuestionStore>,
        exams: Arc<dyn ExamStore>,
        users: Arc<dyn UserStore>,
        studies: Arc<dyn StudyStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let delay = config.retry_delay;
        let bank = QuestionBank::new(questions, delay);
        let generator = ExamGenerator::new(bank.clone(), config.max_total_questions);
        let rewards = RewardEngine::new(Arc::clone(&users), Arc::clone(&clock), delay);
        let sessions = ExamSessions::new(
            Arc::clone(&exams),
            generator.clone(),
            bank.clone(),
            rewards.clone(),
            Arc::clone(&clock),
            config.default_duration_minutes,
            delay,
        );
        let study = StudyTracker::new(studies, rewards.clone(), clock, delay);
        let leaderboard = Leaderboard::new(users, exams, delay);

        Self {
            bank,
            generator,
            sessions,
            rewards,
            study,
            leaderboard,
            config,
        }
    }

    /// Build the engine over a single store implementing every store trait.
    pub fn with_store<S>(store: Arc<S>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self
    where
        S: QuestionStore + ExamStore + UserStore + StudyStore + 'static,
    {
        Self::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store,
            clock,
            config,
        )
    }

    pub fn bank(&self) -> &QuestionBank {
        &self.bank
    }

    pub fn generator(&self) -> &ExamGenerator {
        &self.generator
    }

    pub fn sessions(&self) -> &ExamSessions {
        &self.sessions
    }

    pub fn rewards(&self) -> &RewardEngine {
        &self.rewards
    }

    pub fn study(&self) -> &StudyTracker {
        &self.study
    }

    pub fn leaderboard(&self) -> &Leaderboard {
        &self.leaderboard
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
