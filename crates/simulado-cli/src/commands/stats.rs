//! The `simulado stats` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use comfy_table::{Cell, Table};

use simulado_core::config::load_config_from;
use simulado_core::engine::{EngineConfig, SimuladoEngine};
use simulado_core::model::Discipline;
use simulado_core::traits::SystemClock;
use simulado_store::MemoryStore;

use super::{bank_path, load_questions, EngineStore};

pub async fn execute(bank: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let path = bank_path(bank, &config)?;
    let questions = load_questions(&path)?;

    #[cfg(feature = "postgres")]
    if let Some(url) = &config.database_url {
        let store = Arc::new(simulado_store::PgStore::connect(url).await?);
        store.run_migrations().await?;
        return print_stats(store, EngineConfig::from(&config), questions).await;
    }

    #[cfg(not(feature = "postgres"))]
    if config.database_url.is_some() {
        tracing::warn!("database_url is set but postgres support is not compiled in; using the in-memory store");
    }

    print_stats(Arc::new(MemoryStore::new()), EngineConfig::from(&config), questions).await
}

async fn print_stats<S: EngineStore>(
    store: Arc<S>,
    config: EngineConfig,
    questions: Vec<simulado_core::model::BaseQuestion>,
) -> Result<()> {
    let engine = SimuladoEngine::with_store(store, Arc::new(SystemClock), config);
    let bank = engine.bank();
    let imported = bank.import(questions).await?;

    let counts = bank.count_by_discipline(&Discipline::ALL).await?;

    let mut table = Table::new();
    table.set_header(vec!["Discipline", "Area", "Active", "Topics"]);

    let mut total = 0;
    for discipline in Discipline::ALL {
        let Some(&active) = counts.get(&discipline) else {
            continue;
        };
        total += active;
        let topics = bank
            .list_topics(discipline)
            .await?
            .into_iter()
            .map(|(topic, n)| format!("{topic} ({n})"))
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(discipline),
            Cell::new(discipline.area()),
            Cell::new(active),
            Cell::new(topics),
        ]);
    }

    println!("{table}");
    println!("{total} active of {imported} imported questions");
    Ok(())
}
