//! CLI subcommands and the helpers they share.

use std::path::{Path, PathBuf};

use anyhow::Result;

use simulado_core::config::SimuladoConfig;
use simulado_core::model::BaseQuestion;
use simulado_core::parser;
use simulado_core::traits::{ExamStore, QuestionStore, StudyStore, UserStore};

pub mod init;
pub mod run;
pub mod score;
pub mod stats;
pub mod validate;

/// Everything the engine needs from a store.
pub trait EngineStore: QuestionStore + ExamStore + UserStore + StudyStore + 'static {}

impl<T> EngineStore for T where T: QuestionStore + ExamStore + UserStore + StudyStore + 'static {}

/// The bank given on the command line, else the configured one.
pub fn bank_path(arg: Option<PathBuf>, config: &SimuladoConfig) -> Result<PathBuf> {
    match arg.or_else(|| config.bank_path.clone()) {
        Some(path) => Ok(path),
        None => anyhow::bail!("no question bank given; pass --bank or set bank_path in simulado.toml"),
    }
}

/// Parse every bank file under `path` into one list of questions.
pub fn load_questions(path: &Path) -> Result<Vec<BaseQuestion>> {
    let sets = parser::load_bank(path)?;
    anyhow::ensure!(!sets.is_empty(), "no question banks found in {}", path.display());

    let mut questions = Vec::new();
    for set in sets {
        tracing::debug!("bank '{}': {} questions", set.id, set.questions.len());
        questions.extend(set.questions);
    }
    Ok(questions)
}
