//! The `simulado run` command.
//!
//! Loads a bank, schedules an exam, lets a simulated student answer it on a
//! manual clock and prints the score, the breakdown and the reward.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use comfy_table::{Cell, Table};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use simulado_core::config::{load_config_from, SimuladoConfig};
use simulado_core::engine::{EngineConfig, SimuladoEngine};
use simulado_core::generator::{parse_areas, parse_disciplines};
use simulado_core::model::{
    Area, BaseQuestion, DistributionStrategy, ExamKind, ExamSpec, Letter, NewExam,
};
use simulado_core::report::ExamReport;
use simulado_core::session::FinishOutcome;
use simulado_core::traits::{ExamStore, ManualClock};
use simulado_store::MemoryStore;

use super::{bank_path, load_questions, EngineStore};

pub struct RunArgs {
    pub bank: Option<PathBuf>,
    pub areas: Option<String>,
    pub disciplines: Option<String>,
    pub topic: Option<String>,
    pub total: Option<u32>,
    pub accuracy: f64,
    pub skip_rate: f64,
    pub seed: Option<u64>,
    pub output: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.accuracy),
        "accuracy must be between 0.0 and 1.0"
    );
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.skip_rate),
        "skip rate must be between 0.0 and 1.0"
    );

    let config = load_config_from(args.config.as_deref())?;
    let spec = build_spec(&args, &config)?;
    let path = bank_path(args.bank.clone(), &config)?;
    let questions = load_questions(&path)?;

    #[cfg(feature = "postgres")]
    if let Some(url) = &config.database_url {
        let store = Arc::new(simulado_store::PgStore::connect(url).await?);
        store.run_migrations().await?;
        return simulate(store, &config, questions, spec, &args).await;
    }

    #[cfg(not(feature = "postgres"))]
    if config.database_url.is_some() {
        tracing::warn!("database_url is set but postgres support is not compiled in; using the in-memory store");
    }

    simulate(Arc::new(MemoryStore::new()), &config, questions, spec, &args).await
}

fn build_spec(args: &RunArgs, config: &SimuladoConfig) -> Result<ExamSpec> {
    let total = args.total.unwrap_or(config.default_total_questions);

    if let Some(topic) = &args.topic {
        let disciplines = parse_disciplines(args.disciplines.as_deref().unwrap_or_default())?;
        let [discipline] = disciplines.as_slice() else {
            anyhow::bail!("--topic needs exactly one discipline, got {}", disciplines.len());
        };
        return Ok(ExamSpec::Topic {
            discipline: *discipline,
            topic: topic.clone(),
            total,
        });
    }

    if let Some(list) = &args.disciplines {
        return Ok(ExamSpec::Disciplines {
            disciplines: parse_disciplines(list)?,
            total,
        });
    }

    let areas = match &args.areas {
        Some(list) => parse_areas(list)?,
        None => Area::ALL.to_vec(),
    };
    Ok(ExamSpec::Areas {
        areas,
        total,
        strategy: DistributionStrategy::Balanced,
    })
}

async fn simulate<S: EngineStore>(
    store: Arc<S>,
    config: &SimuladoConfig,
    questions: Vec<BaseQuestion>,
    spec: ExamSpec,
    args: &RunArgs,
) -> Result<()> {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = SimuladoEngine::with_store(store.clone(), clock.clone(), EngineConfig::from(config));
    engine.bank().import(questions).await?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let user = Uuid::new_v4();
    let sessions = engine.sessions();
    let exam = sessions
        .schedule(
            user,
            NewExam {
                title: format!("Simulado {}", spec.summary()),
                kind: match spec {
                    ExamSpec::Areas { .. } => ExamKind::Enem,
                    _ => ExamKind::Individual,
                },
                spec,
                duration_minutes: None,
                scheduled_at: None,
            },
        )
        .await?;
    sessions.start(user, exam.id).await?;

    // The simulated student reads the answer key straight from the store.
    let key = store.questions(exam.id).await?;
    eprintln!("Simulating {} questions of '{}'", key.len(), exam.title);

    for question in &key {
        let seconds = rng.gen_range(30..=240);
        clock.advance(chrono::Duration::seconds(seconds));
        if rng.gen_bool(args.skip_rate) {
            continue;
        }
        let letter = if rng.gen_bool(args.accuracy) {
            question.correct
        } else {
            let wrong: Vec<Letter> = Letter::ALL
                .into_iter()
                .filter(|l| *l != question.correct)
                .collect();
            wrong.choose(&mut rng).copied().unwrap_or(question.correct)
        };
        sessions
            .save_answer(user, exam.id, question.id, &letter.to_string(), Some(seconds))
            .await?;
    }

    let outcome = sessions.finish(user, exam.id).await?;
    let report = sessions.report(user, exam.id).await?;
    print_outcome(&outcome, &report);

    if let Some(path) = &args.output {
        report
            .save_json(path)
            .with_context(|| format!("failed to save report to {}", path.display()))?;
        eprintln!("Report saved to: {}", path.display());
    }

    Ok(())
}

fn print_outcome(outcome: &FinishOutcome, report: &ExamReport) {
    let score = &outcome.score;
    println!(
        "Score: {:.1} ({}/{} correct, {} skipped, {} inconsistencies)",
        score.final_score,
        score.total_correct,
        score.question_count,
        score.skipped,
        score.inconsistencies
    );
    if let Some(elapsed) = &outcome.exam.elapsed {
        println!("Elapsed: {elapsed}");
    }

    let mut table = Table::new();
    table.set_header(vec!["Discipline", "Questions", "Correct", "Skipped", "Accuracy"]);
    for b in &report.by_discipline {
        table.add_row(vec![
            Cell::new(&b.name),
            Cell::new(b.questions),
            Cell::new(b.correct),
            Cell::new(b.skipped),
            Cell::new(format!("{:.1}%", b.accuracy * 100.0)),
        ]);
    }
    println!("{table}");

    match &outcome.reward {
        Some(reward) => println!(
            "Reward: +{} XP, +{} diamonds (total {} XP, {} diamonds)",
            reward.xp_gained, reward.diamonds_gained, reward.xp_total, reward.diamonds_total
        ),
        None => println!("Reward: none"),
    }
}
