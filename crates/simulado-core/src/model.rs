//! Core data model types for the simulado engine.
//!
//! Questions, exams, study sessions and user balances. Everything here is
//! plain data; behaviour lives in the service modules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Answer letters
// ---------------------------------------------------------------------------

/// One of the five alternative letters of an ENEM question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Letter {
    A,
    B,
    C,
    D,
    E,
}

impl Letter {
    /// All letters in alternative order.
    pub const ALL: [Letter; 5] = [Letter::A, Letter::B, Letter::C, Letter::D, Letter::E];

    /// Zero-based position of the letter (A = 0).
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_char(self) -> char {
        match self {
            Letter::A => 'A',
            Letter::B => 'B',
            Letter::C => 'C',
            Letter::D => 'D',
            Letter::E => 'E',
        }
    }
}

impl fmt::Display for Letter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl FromStr for Letter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Letter::A),
            "B" => Ok(Letter::B),
            "C" => Ok(Letter::C),
            "D" => Ok(Letter::D),
            "E" => Ok(Letter::E),
            other => Err(format!("'{other}' is not one of A, B, C, D, E")),
        }
    }
}

// ---------------------------------------------------------------------------
// Disciplines and areas
// ---------------------------------------------------------------------------

/// A concrete ENEM subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    Portuguese,
    Literature,
    English,
    Spanish,
    Arts,
    Mathematics,
    History,
    Geography,
    Philosophy,
    Sociology,
    Physics,
    Chemistry,
    Biology,
}

impl Discipline {
    pub const ALL: [Discipline; 13] = [
        Discipline::Portuguese,
        Discipline::Literature,
        Discipline::English,
        Discipline::Spanish,
        Discipline::Arts,
        Discipline::Mathematics,
        Discipline::History,
        Discipline::Geography,
        Discipline::Philosophy,
        Discipline::Sociology,
        Discipline::Physics,
        Discipline::Chemistry,
        Discipline::Biology,
    ];

    /// The single area this discipline belongs to.
    pub fn area(self) -> Area {
        match self {
            Discipline::Portuguese
            | Discipline::Literature
            | Discipline::English
            | Discipline::Spanish
            | Discipline::Arts => Area::Languages,
            Discipline::Mathematics => Area::Mathematics,
            Discipline::History
            | Discipline::Geography
            | Discipline::Philosophy
            | Discipline::Sociology => Area::Humanities,
            Discipline::Physics | Discipline::Chemistry | Discipline::Biology => Area::Nature,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Discipline::Portuguese => "portuguese",
            Discipline::Literature => "literature",
            Discipline::English => "english",
            Discipline::Spanish => "spanish",
            Discipline::Arts => "arts",
            Discipline::Mathematics => "mathematics",
            Discipline::History => "history",
            Discipline::Geography => "geography",
            Discipline::Philosophy => "philosophy",
            Discipline::Sociology => "sociology",
            Discipline::Physics => "physics",
            Discipline::Chemistry => "chemistry",
            Discipline::Biology => "biology",
        }
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Discipline {
    type Err = String;

    /// Accepts the English snake_case name or the usual Portuguese name,
    /// with or without accents.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_name(s).as_str() {
            "portuguese" | "portugues" | "lingua_portuguesa" => Ok(Discipline::Portuguese),
            "literature" | "literatura" => Ok(Discipline::Literature),
            "english" | "ingles" => Ok(Discipline::English),
            "spanish" | "espanhol" => Ok(Discipline::Spanish),
            "arts" | "artes" => Ok(Discipline::Arts),
            "mathematics" | "math" | "matematica" => Ok(Discipline::Mathematics),
            "history" | "historia" => Ok(Discipline::History),
            "geography" | "geografia" => Ok(Discipline::Geography),
            "philosophy" | "filosofia" => Ok(Discipline::Philosophy),
            "sociology" | "sociologia" => Ok(Discipline::Sociology),
            "physics" | "fisica" => Ok(Discipline::Physics),
            "chemistry" | "quimica" => Ok(Discipline::Chemistry),
            "biology" | "biologia" => Ok(Discipline::Biology),
            other => Err(format!("unknown discipline: {other}")),
        }
    }
}

/// One of the four ENEM macro-areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Area {
    Languages,
    Mathematics,
    Humanities,
    Nature,
}

impl Area {
    pub const ALL: [Area; 4] = [
        Area::Languages,
        Area::Mathematics,
        Area::Humanities,
        Area::Nature,
    ];

    /// Fan-out of an area to its disciplines, in display order.
    pub fn disciplines(self) -> &'static [Discipline] {
        match self {
            Area::Languages => &[
                Discipline::Portuguese,
                Discipline::Literature,
                Discipline::English,
                Discipline::Spanish,
                Discipline::Arts,
            ],
            Area::Mathematics => &[Discipline::Mathematics],
            Area::Humanities => &[
                Discipline::History,
                Discipline::Geography,
                Discipline::Philosophy,
                Discipline::Sociology,
            ],
            Area::Nature => &[Discipline::Physics, Discipline::Chemistry, Discipline::Biology],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Area::Languages => "languages",
            Area::Mathematics => "mathematics",
            Area::Humanities => "humanities",
            Area::Nature => "nature",
        }
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Area {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_name(s).as_str() {
            "languages" | "linguagens" => Ok(Area::Languages),
            "mathematics" | "math" | "matematica" => Ok(Area::Mathematics),
            "humanities" | "humanas" | "ciencias_humanas" => Ok(Area::Humanities),
            "nature" | "natureza" | "ciencias_da_natureza" => Ok(Area::Nature),
            other => Err(format!("unknown area: {other}")),
        }
    }
}

/// Lowercase, strip Portuguese accents and fold separators to `_`.
fn normalize_name(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' => 'a',
            'é' | 'ê' => 'e',
            'í' => 'i',
            'ó' | 'ô' | 'õ' => 'o',
            'ú' | 'ü' => 'u',
            'ç' => 'c',
            ' ' | '-' => '_',
            other => other,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Question bank
// ---------------------------------------------------------------------------

/// A canonical, reusable question in the bank.
///
/// Immutable once imported except for the usage counters, which the store
/// increments atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseQuestion {
    /// Stable identifier.
    pub id: String,
    /// Question statement.
    pub statement: String,
    pub discipline: Discipline,
    /// Free-text topic within the discipline.
    pub topic: String,
    /// Informational only; never used as a selection filter.
    #[serde(default)]
    pub subtopic: Option<String>,
    /// Alternative texts, A through E.
    pub alternatives: [String; 5],
    pub correct: Letter,
    #[serde(default)]
    pub explanation: String,
    /// Difficulty in [0.0, 1.0].
    pub difficulty: f64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub times_used: u64,
    #[serde(default)]
    pub times_correct: u64,
}

impl BaseQuestion {
    pub fn alternative(&self, letter: Letter) -> &str {
        &self.alternatives[letter.index()]
    }

    /// Observed share of correct answers, if the question was ever used.
    pub fn accuracy(&self) -> Option<f64> {
        if self.times_used == 0 {
            None
        } else {
            Some(self.times_correct as f64 / self.times_used as f64)
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Exams
// ---------------------------------------------------------------------------

/// How questions are spread across the resolved disciplines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Even split, remainder to the first disciplines.
    #[default]
    Balanced,
}

/// What an exam should be generated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExamSpec {
    /// ENEM areas, fanned out to their disciplines.
    Areas {
        areas: Vec<Area>,
        total: u32,
        #[serde(default)]
        strategy: DistributionStrategy,
    },
    /// An explicit set of disciplines.
    Disciplines { disciplines: Vec<Discipline>, total: u32 },
    /// A single-topic focused session.
    Topic {
        discipline: Discipline,
        topic: String,
        total: u32,
    },
}

impl ExamSpec {
    /// Requested number of questions.
    pub fn total(&self) -> u32 {
        match self {
            ExamSpec::Areas { total, .. }
            | ExamSpec::Disciplines { total, .. }
            | ExamSpec::Topic { total, .. } => *total,
        }
    }

    /// Free-text summary stored on the exam (e.g. "languages, nature").
    pub fn summary(&self) -> String {
        match self {
            ExamSpec::Areas { areas, .. } => areas
                .iter()
                .map(|a| a.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            ExamSpec::Disciplines { disciplines, .. } => disciplines
                .iter()
                .map(|d| d.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            ExamSpec::Topic {
                discipline, topic, ..
            } => format!("{discipline}: {topic}"),
        }
    }
}

/// Whether an exam mirrors the full ENEM or is a custom practice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamKind {
    Enem,
    Individual,
}

impl fmt::Display for ExamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExamKind::Enem => write!(f, "enem"),
            ExamKind::Individual => write!(f, "individual"),
        }
    }
}

impl FromStr for ExamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "enem" => Ok(ExamKind::Enem),
            "individual" => Ok(ExamKind::Individual),
            other => Err(format!("unknown exam type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamStatus {
    Pending,
    InProgress,
    Completed,
}

impl ExamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExamStatus::Pending => "pending",
            ExamStatus::InProgress => "in_progress",
            ExamStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ExamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExamStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExamStatus::Pending),
            "in_progress" => Ok(ExamStatus::InProgress),
            "completed" => Ok(ExamStatus::Completed),
            other => Err(format!("unknown exam status: {other}")),
        }
    }
}

/// One exam attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exam {
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    pub title: String,
    /// Free-text summary of the generation spec.
    pub areas: String,
    pub spec: ExamSpec,
    pub duration_minutes: u32,
    pub kind: ExamKind,
    pub status: ExamStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Stamped when the first question is first viewed.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Stamped when finish claims the exam.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Present iff status is `Completed`.
    #[serde(default)]
    pub final_score: Option<f64>,
    /// `HHhMM` between start and finish.
    #[serde(default)]
    pub elapsed: Option<String>,
    #[serde(default)]
    pub skipped: Option<u32>,
    #[serde(default)]
    pub total_correct: Option<u32>,
    #[serde(default)]
    pub mean_seconds_per_question: Option<f64>,
}

impl Exam {
    /// A freshly scheduled, pending exam.
    pub fn pending(user_id: Uuid, new: NewExam, duration_minutes: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: new.title,
            areas: new.spec.summary(),
            spec: new.spec,
            duration_minutes: new.duration_minutes.unwrap_or(duration_minutes),
            kind: new.kind,
            status: ExamStatus::Pending,
            created_at: now,
            scheduled_at: new.scheduled_at,
            started_at: None,
            finished_at: None,
            final_score: None,
            elapsed: None,
            skipped: None,
            total_correct: None,
            mean_seconds_per_question: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExamStatus::Completed
    }
}

/// Request to schedule a new exam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExam {
    pub title: String,
    pub spec: ExamSpec,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    pub kind: ExamKind,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// A lettered alternative of a materialised question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub letter: Letter,
    pub text: String,
}

/// A copy of a bank question inside a specific exam, carrying the user's
/// answer and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamQuestion {
    pub id: Uuid,
    pub exam_id: Uuid,
    /// Back-reference into the bank, when the question came from it.
    #[serde(default)]
    pub base_id: Option<String>,
    /// 1-based ordinal, unique within the exam.
    pub number: u32,
    pub discipline: Discipline,
    #[serde(default)]
    pub topic: String,
    pub statement: String,
    pub alternatives: Vec<Alternative>,
    pub correct: Letter,
    #[serde(default)]
    pub explanation: String,
    pub difficulty: f64,
    #[serde(default)]
    pub user_answer: Option<Letter>,
    /// Seconds spent on the last answer, when known.
    #[serde(default)]
    pub time_to_answer: Option<u32>,
}

impl ExamQuestion {
    /// Materialise a bank question as question `number` of an exam.
    pub fn from_base(exam_id: Uuid, number: u32, base: &BaseQuestion) -> Self {
        Self {
            id: Uuid::new_v4(),
            exam_id,
            base_id: Some(base.id.clone()),
            number,
            discipline: base.discipline,
            topic: base.topic.clone(),
            statement: base.statement.clone(),
            alternatives: Letter::ALL
                .iter()
                .map(|&letter| Alternative {
                    letter,
                    text: base.alternative(letter).to_string(),
                })
                .collect(),
            correct: base.correct,
            explanation: base.explanation.clone(),
            difficulty: base.difficulty,
            user_answer: None,
            time_to_answer: None,
        }
    }

    pub fn is_correct(&self) -> bool {
        self.user_answer == Some(self.correct)
    }

    pub fn is_skipped(&self) -> bool {
        self.user_answer.is_none()
    }
}

// ---------------------------------------------------------------------------
// Study time, XP and balances
// ---------------------------------------------------------------------------

/// A tracked study session; open while `finished_at` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudySession {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Activity tag, e.g. "reading" or "exercises".
    pub activity: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last heartbeat; equals `started_at` until the first ping.
    pub last_ping_at: DateTime<Utc>,
    #[serde(default)]
    pub minutes: u32,
}

impl StudySession {
    pub fn open(user_id: Uuid, activity: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            activity: activity.to_string(),
            started_at: now,
            finished_at: None,
            last_ping_at: now,
            minutes: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// Append-only XP ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Signed amount; negative for diamond spends.
    pub amount: i64,
    /// Source tag, e.g. "simulado" or "study:reading".
    pub source: String,
    #[serde(default)]
    pub description: String,
    /// Unique key of the thing credited, e.g. "exam:<id>". At most one
    /// ledger entry carries a given reference.
    #[serde(default)]
    pub reference: Option<String>,
    pub at: DateTime<Utc>,
}

/// The reward-relevant columns of a user row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: Uuid,
    pub xp_total: i64,
    pub diamonds: i64,
    pub last_diamond_reset: DateTime<Utc>,
    /// Optimistic concurrency token; 0 means the row does not exist yet.
    pub version: u64,
}

impl UserBalance {
    /// Balance of a user with no reward history.
    pub fn empty(user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            xp_total: 0,
            diamonds: 0,
            last_diamond_reset: now,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_question() -> BaseQuestion {
        BaseQuestion {
            id: "mat-001".into(),
            statement: "Quanto é 2 + 2?".into(),
            discipline: Discipline::Mathematics,
            topic: "Aritmética".into(),
            subtopic: None,
            alternatives: ["1".into(), "2".into(), "3".into(), "4".into(), "5".into()],
            correct: Letter::D,
            explanation: "Soma simples.".into(),
            difficulty: 0.1,
            active: true,
            times_used: 0,
            times_correct: 0,
        }
    }

    #[test]
    fn letter_display_and_parse() {
        assert_eq!(Letter::C.to_string(), "C");
        assert_eq!("c".parse::<Letter>().unwrap(), Letter::C);
        assert_eq!(" E ".parse::<Letter>().unwrap(), Letter::E);
        assert!("F".parse::<Letter>().is_err());
        assert!("".parse::<Letter>().is_err());
        assert_eq!(Letter::E.index(), 4);
    }

    #[test]
    fn every_discipline_belongs_to_exactly_one_area() {
        for discipline in Discipline::ALL {
            let owners: Vec<Area> = Area::ALL
                .iter()
                .copied()
                .filter(|a| a.disciplines().contains(&discipline))
                .collect();
            assert_eq!(owners, vec![discipline.area()], "{discipline}");
        }
    }

    #[test]
    fn discipline_parse_accepts_portuguese_names() {
        assert_eq!("Matemática".parse::<Discipline>().unwrap(), Discipline::Mathematics);
        assert_eq!("português".parse::<Discipline>().unwrap(), Discipline::Portuguese);
        assert_eq!("Língua Portuguesa".parse::<Discipline>().unwrap(), Discipline::Portuguese);
        assert_eq!("physics".parse::<Discipline>().unwrap(), Discipline::Physics);
        assert_eq!("química".parse::<Discipline>().unwrap(), Discipline::Chemistry);
        assert!("astrology".parse::<Discipline>().is_err());
    }

    #[test]
    fn area_parse_accepts_portuguese_names() {
        assert_eq!("linguagens".parse::<Area>().unwrap(), Area::Languages);
        assert_eq!("Ciências da Natureza".parse::<Area>().unwrap(), Area::Nature);
        assert_eq!("humanas".parse::<Area>().unwrap(), Area::Humanities);
        assert!("arts".parse::<Area>().is_err());
    }

    #[test]
    fn spec_summary_and_total() {
        let spec = ExamSpec::Areas {
            areas: vec![Area::Languages, Area::Nature],
            total: 10,
            strategy: DistributionStrategy::Balanced,
        };
        assert_eq!(spec.summary(), "languages, nature");
        assert_eq!(spec.total(), 10);

        let topic = ExamSpec::Topic {
            discipline: Discipline::Philosophy,
            topic: "Ética".into(),
            total: 5,
        };
        assert_eq!(topic.summary(), "philosophy: Ética");
    }

    #[test]
    fn spec_serde_tagged() {
        let json = r#"{"kind":"areas","areas":["languages"],"total":3}"#;
        let spec: ExamSpec = serde_json::from_str(json).unwrap();
        assert_eq!(
            spec,
            ExamSpec::Areas {
                areas: vec![Area::Languages],
                total: 3,
                strategy: DistributionStrategy::Balanced
            }
        );
    }

    #[test]
    fn exam_question_copies_base() {
        let base = sample_question();
        let exam_id = Uuid::new_v4();
        let q = ExamQuestion::from_base(exam_id, 3, &base);
        assert_eq!(q.number, 3);
        assert_eq!(q.exam_id, exam_id);
        assert_eq!(q.base_id.as_deref(), Some("mat-001"));
        assert_eq!(q.alternatives.len(), 5);
        assert_eq!(q.alternatives[3].letter, Letter::D);
        assert_eq!(q.alternatives[3].text, "4");
        assert!(q.is_skipped());
        assert!(!q.is_correct());
    }

    #[test]
    fn base_question_accuracy() {
        let mut q = sample_question();
        assert_eq!(q.accuracy(), None);
        q.times_used = 4;
        q.times_correct = 1;
        assert_eq!(q.accuracy(), Some(0.25));
    }
}
