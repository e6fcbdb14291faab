//! The `simulado score` command.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{Cell, Table};

use simulado_core::report::ExamReport;

pub fn execute(report_path: PathBuf, format: String) -> Result<()> {
    let report = ExamReport::load_json(&report_path)?;
    let card = report.rescore();

    if (card.final_score - report.score.final_score).abs() > 0.05 {
        tracing::warn!(
            "stored score {:.1} differs from recomputed {:.1}",
            report.score.final_score,
            card.final_score
        );
    }

    match format.as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&card)?);
        }
        _ => {
            println!("Exam: {} ({})", report.exam.title, report.exam.areas);
            println!(
                "Score: {:.1} (raw {:.1}, ratio {:.3}, consistency {:.2})",
                card.final_score, card.raw_score, card.weighted_ratio, card.consistency_factor
            );
            println!(
                "Correct: {}/{}, skipped {}, inconsistencies {}",
                card.total_correct, card.question_count, card.skipped, card.inconsistencies
            );
            if let Some(mean) = card.mean_seconds_per_question {
                println!("Mean time per question: {mean:.0}s");
            }

            let mut table = Table::new();
            table.set_header(vec!["Area", "Questions", "Correct", "Skipped", "Accuracy"]);
            for b in &report.by_area {
                table.add_row(vec![
                    Cell::new(&b.name),
                    Cell::new(b.questions),
                    Cell::new(b.correct),
                    Cell::new(b.skipped),
                    Cell::new(format!("{:.1}%", b.accuracy * 100.0)),
                ]);
            }
            println!("{table}");
        }
    }

    Ok(())
}
