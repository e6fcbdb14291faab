//! Exam generation from the question bank.
//!
//! Resolves a spec to disciplines, plans a balanced distribution against
//! the bank's availability, samples, shuffles and materialises the result as
//! exam questions.

use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::bank::QuestionBank;
use crate::error::{Result, SimuladoError};
use crate::model::{Area, BaseQuestion, Discipline, ExamQuestion, ExamSpec};

/// Selects and materialises exam questions.
#[derive(Clone)]
pub struct ExamGenerator {
    bank: QuestionBank,
    max_total: u32,
}

impl ExamGenerator {
    pub fn new(bank: QuestionBank, max_total: u32) -> Self {
        Self { bank, max_total }
    }

    /// Check a spec without touching the bank.
    pub fn validate(&self, spec: &ExamSpec) -> Result<()> {
        let total = spec.total();
        if total == 0 {
            return Err(SimuladoError::InvalidSpec(
                "total must be at least 1".into(),
            ));
        }
        if total > self.max_total {
            return Err(SimuladoError::InvalidSpec(format!(
                "total {total} exceeds the maximum of {}",
                self.max_total
            )));
        }
        match spec {
            ExamSpec::Topic { topic, .. } if topic.trim().is_empty() => {
                Err(SimuladoError::InvalidSpec("topic is empty".into()))
            }
            ExamSpec::Topic { .. } => Ok(()),
            _ => resolve_disciplines(spec).map(|_| ()),
        }
    }

    /// Pick base questions for a spec, in random order.
    pub async fn select(&self, spec: &ExamSpec) -> Result<Vec<BaseQuestion>> {
        self.validate(spec)?;
        let total = spec.total();

        if let ExamSpec::Topic {
            discipline, topic, ..
        } = spec
        {
            let mut picked = self
                .bank
                .sample_by_topic(*discipline, topic.trim(), total as usize)
                .await?;
            if picked.is_empty() {
                return Err(SimuladoError::NoQuestionsAvailable(spec.summary()));
            }
            picked.shuffle(&mut rand::thread_rng());
            return Ok(picked);
        }

        let candidates = resolve_disciplines(spec)?;
        let counts = self.bank.count_by_discipline(&candidates).await?;
        let availability: Vec<(Discipline, u64)> = candidates
            .iter()
            .filter_map(|d| counts.get(d).map(|&n| (*d, n)))
            .filter(|(_, n)| *n > 0)
            .collect();

        if availability.is_empty() {
            return Err(SimuladoError::NoQuestionsAvailable(spec.summary()));
        }

        let plan = plan_distribution(&availability, total);
        tracing::debug!("distribution plan for '{}': {plan:?}", spec.summary());

        let mut picked = Vec::with_capacity(total as usize);
        for (discipline, count) in plan {
            picked.extend(self.bank.sample(discipline, count as usize).await?);
        }

        picked.shuffle(&mut rand::thread_rng());
        picked.truncate(total as usize);
        Ok(picked)
    }

    /// Select and materialise questions for an exam, numbered from 1.
    pub async fn generate(&self, exam_id: Uuid, spec: &ExamSpec) -> Result<Vec<ExamQuestion>> {
        let picked = self.select(spec).await?;
        tracing::info!(
            "generated {} of {} requested questions for exam {exam_id}",
            picked.len(),
            spec.total()
        );
        Ok(materialise(exam_id, &picked))
    }
}

/// Resolve a spec to its candidate disciplines, de-duplicated in order.
pub fn resolve_disciplines(spec: &ExamSpec) -> Result<Vec<Discipline>> {
    let resolved: Vec<Discipline> = match spec {
        ExamSpec::Areas { areas, .. } => {
            if areas.is_empty() {
                return Err(SimuladoError::InvalidSpec("no areas selected".into()));
            }
            areas
                .iter()
                .flat_map(|a| a.disciplines().iter().copied())
                .collect()
        }
        ExamSpec::Disciplines { disciplines, .. } => {
            if disciplines.is_empty() {
                return Err(SimuladoError::InvalidSpec(
                    "no disciplines selected".into(),
                ));
            }
            disciplines.clone()
        }
        ExamSpec::Topic { discipline, .. } => vec![*discipline],
    };

    let mut unique = Vec::with_capacity(resolved.len());
    for d in resolved {
        if !unique.contains(&d) {
            unique.push(d);
        }
    }
    Ok(unique)
}

/// Balanced split of `total` over disciplines with known availability.
///
/// Each discipline gets `total / n`, the first `total % n` one more, clipped
/// to availability. Whatever clipping leaves unassigned is handed out
/// round-robin to disciplines that still have spare questions, so the plan
/// always sums to `min(total, Σ availability)`.
pub fn plan_distribution(availability: &[(Discipline, u64)], total: u32) -> Vec<(Discipline, u32)> {
    let n = availability.len() as u32;
    if n == 0 || total == 0 {
        return Vec::new();
    }

    let base = total / n;
    let remainder = total % n;
    let mut plan: Vec<(Discipline, u32)> = availability
        .iter()
        .enumerate()
        .map(|(i, &(discipline, available))| {
            let wanted = base + u32::from((i as u32) < remainder);
            (discipline, wanted.min(available.min(u32::MAX as u64) as u32))
        })
        .collect();

    let available_total: u64 = availability.iter().map(|(_, n)| *n).sum();
    let target = (total as u64).min(available_total) as u32;
    let mut assigned: u32 = plan.iter().map(|(_, c)| *c).sum();

    while assigned < target {
        let mut progressed = false;
        for (slot, &(_, available)) in plan.iter_mut().zip(availability) {
            if assigned == target {
                break;
            }
            if (slot.1 as u64) < available {
                slot.1 += 1;
                assigned += 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    plan.retain(|(_, c)| *c > 0);
    plan
}

/// Copy base questions into an exam, numbering them from 1.
pub fn materialise(exam_id: Uuid, questions: &[BaseQuestion]) -> Vec<ExamQuestion> {
    questions
        .iter()
        .enumerate()
        .map(|(i, q)| ExamQuestion::from_base(exam_id, i as u32 + 1, q))
        .collect()
}

/// Parse a comma-separated list of area names.
pub fn parse_areas(list: &str) -> Result<Vec<Area>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Area>().map_err(SimuladoError::InvalidSpec))
        .collect()
}

/// Parse a comma-separated list of discipline names.
pub fn parse_disciplines(list: &str) -> Result<Vec<Discipline>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Discipline>().map_err(SimuladoError::InvalidSpec))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DistributionStrategy;

    fn total_of(plan: &[(Discipline, u32)]) -> u32 {
        plan.iter().map(|(_, c)| *c).sum()
    }

    #[test]
    fn even_split_with_remainder_to_first() {
        let avail = [
            (Discipline::History, 100),
            (Discipline::Geography, 100),
            (Discipline::Philosophy, 100),
        ];
        let plan = plan_distribution(&avail, 10);
        assert_eq!(
            plan,
            vec![
                (Discipline::History, 4),
                (Discipline::Geography, 3),
                (Discipline::Philosophy, 3)
            ]
        );
    }

    #[test]
    fn single_discipline_takes_everything() {
        let plan = plan_distribution(&[(Discipline::Portuguese, 100)], 10);
        assert_eq!(plan, vec![(Discipline::Portuguese, 10)]);
    }

    #[test]
    fn two_disciplines_split_evenly() {
        let avail = [(Discipline::Portuguese, 100), (Discipline::Literature, 20)];
        let plan = plan_distribution(&avail, 10);
        assert_eq!(
            plan,
            vec![(Discipline::Portuguese, 5), (Discipline::Literature, 5)]
        );
    }

    #[test]
    fn clipped_shortfall_is_redistributed() {
        let avail = [(Discipline::Portuguese, 100), (Discipline::Literature, 2)];
        let plan = plan_distribution(&avail, 10);
        assert_eq!(
            plan,
            vec![(Discipline::Portuguese, 8), (Discipline::Literature, 2)]
        );
    }

    #[test]
    fn plan_never_exceeds_availability() {
        let avail = [
            (Discipline::Physics, 1),
            (Discipline::Chemistry, 2),
            (Discipline::Biology, 3),
        ];
        let plan = plan_distribution(&avail, 50);
        assert_eq!(total_of(&plan), 6);
        for ((_, planned), (_, available)) in plan.iter().zip(avail.iter()) {
            assert!(*planned as u64 <= *available);
        }
    }

    #[test]
    fn plan_sums_to_min_of_total_and_availability() {
        let avail = [
            (Discipline::History, 7),
            (Discipline::Geography, 0),
            (Discipline::Sociology, 13),
        ];
        for total in 1..=30 {
            let plan = plan_distribution(&avail, total);
            assert_eq!(total_of(&plan), total.min(20), "total {total}");
        }
    }

    #[test]
    fn resolve_areas_fans_out_and_dedups() {
        let spec = ExamSpec::Areas {
            areas: vec![Area::Nature, Area::Mathematics, Area::Nature],
            total: 5,
            strategy: DistributionStrategy::Balanced,
        };
        assert_eq!(
            resolve_disciplines(&spec).unwrap(),
            vec![
                Discipline::Physics,
                Discipline::Chemistry,
                Discipline::Biology,
                Discipline::Mathematics
            ]
        );
    }

    #[test]
    fn resolve_rejects_empty_selection() {
        let spec = ExamSpec::Areas {
            areas: vec![],
            total: 5,
            strategy: DistributionStrategy::Balanced,
        };
        assert!(matches!(
            resolve_disciplines(&spec),
            Err(SimuladoError::InvalidSpec(_))
        ));
        let spec = ExamSpec::Disciplines {
            disciplines: vec![],
            total: 5,
        };
        assert!(matches!(
            resolve_disciplines(&spec),
            Err(SimuladoError::InvalidSpec(_))
        ));
    }

    #[test]
    fn parse_lists() {
        assert_eq!(
            parse_areas("linguagens, nature").unwrap(),
            vec![Area::Languages, Area::Nature]
        );
        assert!(matches!(
            parse_areas("languages,astrology"),
            Err(SimuladoError::InvalidSpec(_))
        ));
        assert_eq!(
            parse_disciplines("física,biology").unwrap(),
            vec![Discipline::Physics, Discipline::Biology]
        );
    }

    #[test]
    fn materialise_numbers_from_one() {
        let base = BaseQuestion {
            id: "his-1".into(),
            statement: "?".into(),
            discipline: Discipline::History,
            topic: "Brasil Colônia".into(),
            subtopic: None,
            alternatives: Default::default(),
            correct: crate::model::Letter::A,
            explanation: String::new(),
            difficulty: 0.3,
            active: true,
            times_used: 0,
            times_correct: 0,
        };
        let exam_id = Uuid::new_v4();
        let questions = materialise(exam_id, &[base.clone(), base]);
        let numbers: Vec<u32> = questions.iter().map(|q| q.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert!(questions.iter().all(|q| q.user_answer.is_none()));
    }
}
