//! CLI integration tests using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn simulado(dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("simulado").unwrap();
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env_remove("SIMULADO_DATABASE_URL")
        .env_remove("RUST_LOG");
    cmd
}

/// A temp dir with the starter config and example bank in place.
fn initialised() -> TempDir {
    let dir = TempDir::new().unwrap();
    simulado(&dir).arg("init").assert().success();
    dir
}

#[test]
fn init_creates_files() {
    let dir = TempDir::new().unwrap();

    simulado(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created simulado.toml"))
        .stdout(predicate::str::contains("Created banks/example.toml"));

    assert!(dir.path().join("simulado.toml").exists());
    assert!(dir.path().join("banks/example.toml").exists());
}

#[test]
fn init_skips_existing() {
    let dir = initialised();

    simulado(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulado.toml already exists"))
        .stdout(predicate::str::contains("banks/example.toml already exists"));
}

#[test]
fn validate_example_bank() {
    let dir = initialised();

    simulado(&dir)
        .arg("validate")
        .arg("--bank")
        .arg("banks/example.toml")
        .assert()
        .success()
        .stdout(predicate::str::contains("Example Bank (10 questions)"))
        .stdout(predicate::str::contains("All banks valid"));
}

#[test]
fn validate_reports_warnings() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("broken.toml"),
        r#"
[bank]
id = "broken"
name = "Broken"

[[questions]]
id = "q1"
discipline = "fisica"
topic = "Cinemática"
statement = "   "
alternatives = ["a", "b", "c", "d", ""]
correct = "A"

[[questions]]
id = "q1"
discipline = "fisica"
topic = "Cinemática"
statement = "Velocidade média?"
alternatives = ["a", "b", "c", "d", "e"]
correct = "B"
difficulty = 1.5
"#,
    )
    .unwrap();

    simulado(&dir)
        .arg("validate")
        .arg("--bank")
        .arg("broken.toml")
        .assert()
        .success()
        .stdout(predicate::str::contains("[q1] WARNING: statement is empty"))
        .stdout(predicate::str::contains("alternative E is empty"))
        .stdout(predicate::str::contains("duplicate question ID"))
        .stdout(predicate::str::contains("warning(s) found"));
}

#[test]
fn validate_nonexistent_file() {
    let dir = TempDir::new().unwrap();

    simulado(&dir)
        .arg("validate")
        .arg("--bank")
        .arg("nonexistent.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn stats_lists_disciplines() {
    let dir = initialised();

    simulado(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("mathematics"))
        .stdout(predicate::str::contains("Probabilidade (1)"))
        .stdout(predicate::str::contains("10 active of 10 imported questions"));
}

#[test]
fn run_perfect_student() {
    let dir = initialised();

    simulado(&dir)
        .args(["run", "--areas", "matematica", "--total", "3"])
        .args(["--accuracy", "1.0", "--seed", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Score: 800.0 (3/3 correct"))
        .stdout(predicate::str::contains("Reward: +80 XP, +40 diamonds"));
}

#[test]
fn run_blank_exam_scores_zero() {
    let dir = initialised();

    simulado(&dir)
        .args(["run", "--disciplines", "biologia,historia", "--total", "4"])
        .args(["--skip-rate", "1.0", "--seed", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Score: 0.0 (0/4 correct, 4 skipped"))
        .stdout(predicate::str::contains("Reward: none"));
}

#[test]
fn run_topic_exam() {
    let dir = initialised();

    simulado(&dir)
        .args(["run", "--disciplines", "matematica", "--topic", "Funções"])
        .args(["--total", "5", "--accuracy", "1.0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(2/2 correct"));
}

#[test]
fn run_topic_needs_one_discipline() {
    let dir = initialised();

    simulado(&dir)
        .args(["run", "--disciplines", "matematica,fisica", "--topic", "Funções"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("exactly one discipline"));
}

#[test]
fn run_unknown_area_fails() {
    let dir = initialised();

    simulado(&dir)
        .args(["run", "--areas", "astrologia", "--total", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown area"));
}

#[test]
fn run_without_bank_fails() {
    let dir = TempDir::new().unwrap();

    simulado(&dir)
        .args(["run", "--total", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no question bank given"));
}

#[test]
fn run_rejects_bad_accuracy() {
    let dir = initialised();

    simulado(&dir)
        .args(["run", "--accuracy", "1.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("accuracy must be between"));
}

#[test]
fn saved_report_rescores() {
    let dir = initialised();

    simulado(&dir)
        .args(["run", "--areas", "matematica", "--total", "3"])
        .args(["--accuracy", "1.0", "--output", "out/report.json"])
        .assert()
        .success();
    assert!(dir.path().join("out/report.json").exists());

    simulado(&dir)
        .args(["score", "--report", "out/report.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Score: 800.0"))
        .stdout(predicate::str::contains("Correct: 3/3"))
        .stdout(predicate::str::contains("mathematics"));

    simulado(&dir)
        .args(["score", "--report", "out/report.json", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"final_score\": 800.0"));
}
