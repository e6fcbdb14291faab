//! The `simulado validate` command.

use std::path::PathBuf;

use anyhow::Result;

pub fn execute(bank_path: PathBuf) -> Result<()> {
    let sets = simulado_core::parser::load_bank(&bank_path)?;

    let mut total_warnings = 0;

    for set in &sets {
        println!("Bank: {} ({} questions)", set.name, set.questions.len());

        let warnings = simulado_core::parser::validate_bank(set);
        for w in &warnings {
            let prefix = w
                .question_id
                .as_ref()
                .map(|id| format!("  [{id}]"))
                .unwrap_or_else(|| "  ".to_string());
            println!("{prefix} WARNING: {}", w.message);
        }
        total_warnings += warnings.len();
    }

    if sets.is_empty() {
        println!("No question banks found.");
    } else if total_warnings == 0 {
        println!("All banks valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}
