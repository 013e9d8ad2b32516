//! Worker selection: eligibility filter, score, deterministic tie-break.

use std::cmp::Ordering;

use crate::config::ScoreWeights;

/// Everything the selector needs to know about one worker.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub id: &'a str,
    pub priority: u8,
    pub current_load: u32,
    pub max_concurrent: u32,
    pub is_active: bool,
    pub session_verified: bool,
    pub remaining_credits: Option<u32>,
    pub models: &'a [String],
    /// Registry insertion order; lower was added first.
    pub order: u64,
}

impl Candidate<'_> {
    /// Inactive, unverified and full workers are excluded before scoring.
    pub fn is_eligible(&self) -> bool {
        self.is_active && self.session_verified && self.current_load < self.max_concurrent
    }

    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.max_concurrent)
    }

    fn lists_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m.eq_ignore_ascii_case(model))
    }
}

/// `priority * w.priority - load_ratio * w.load + affinity`.
pub fn score(candidate: &Candidate<'_>, model: &str, weights: &ScoreWeights) -> f64 {
    let mut score = f64::from(candidate.priority) * weights.priority
        - candidate.load_ratio() * weights.load;

    if candidate.remaining_credits.is_some_and(|c| c > 0) {
        score += weights.credit_affinity;
    }
    if candidate.lists_model(model) {
        score += weights.model_affinity;
    }
    score
}

/// Pick the best eligible worker for a job requesting `model`.
///
/// Ties go to higher priority, then lower current load, then earlier
/// insertion order.
pub fn select<'a, I>(candidates: I, model: &str, weights: &ScoreWeights) -> Option<&'a str>
where
    I: IntoIterator<Item = Candidate<'a>>,
{
    candidates
        .into_iter()
        .filter(Candidate::is_eligible)
        .map(|c| (score(&c, model, weights), c))
        .max_by(|(score_a, a), (score_b, b)| rank(*score_a, a, *score_b, b))
        .map(|(_, c)| c.id)
}

/// `Greater` means `a` is the better pick.
fn rank(score_a: f64, a: &Candidate<'_>, score_b: f64, b: &Candidate<'_>) -> Ordering {
    score_a
        .total_cmp(&score_b)
        .then_with(|| a.priority.cmp(&b.priority))
        .then_with(|| b.current_load.cmp(&a.current_load))
        .then_with(|| b.order.cmp(&a.order))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        id: &'static str,
        priority: u8,
        load: u32,
        cap: u32,
        order: u64,
    ) -> Candidate<'static> {
        Candidate {
            id,
            priority,
            current_load: load,
            max_concurrent: cap,
            is_active: true,
            session_verified: true,
            remaining_credits: None,
            models: &[],
            order,
        }
    }

    #[test]
    fn higher_priority_wins_at_equal_load() {
        let weights = ScoreWeights::default();
        let picked = select(
            [candidate("w1", 5, 0, 2, 0), candidate("w2", 9, 0, 1, 1)],
            "any",
            &weights,
        );
        assert_eq!(picked, Some("w2"));
    }

    #[test]
    fn ineligible_workers_are_excluded_not_penalized() {
        let weights = ScoreWeights::default();
        let mut unverified = candidate("top", 10, 0, 5, 0);
        unverified.session_verified = false;
        let mut inactive = candidate("off", 10, 0, 5, 1);
        inactive.is_active = false;
        let full = candidate("full", 10, 2, 2, 2);
        let low = candidate("low", 1, 0, 1, 3);

        let picked = select([unverified, inactive, full, low], "any", &weights);
        assert_eq!(picked, Some("low"));
    }

    #[test]
    fn none_when_nobody_is_eligible() {
        let weights = ScoreWeights::default();
        assert_eq!(select([candidate("w", 5, 1, 1, 0)], "m", &weights), None);
        assert_eq!(select(Vec::<Candidate<'static>>::new(), "m", &weights), None);
    }

    #[test]
    fn zero_capacity_never_selected() {
        let weights = ScoreWeights::default();
        assert_eq!(select([candidate("w", 5, 0, 0, 0)], "m", &weights), None);
    }

    #[test]
    fn load_lowers_score() {
        let weights = ScoreWeights::default();
        let idle = candidate("idle", 5, 0, 4, 1);
        let busy = candidate("busy", 5, 3, 4, 0);
        assert!(score(&idle, "m", &weights) > score(&busy, "m", &weights));
        assert_eq!(select([busy, idle], "m", &weights), Some("idle"));
    }

    #[test]
    fn ties_fall_back_to_insertion_order() {
        let weights = ScoreWeights::default();
        let picked = select(
            [candidate("second", 5, 0, 2, 7), candidate("first", 5, 0, 2, 3)],
            "m",
            &weights,
        );
        assert_eq!(picked, Some("first"));
    }

    #[test]
    fn equal_score_prefers_higher_priority() {
        // 6*10 - 0.5*100 = 10 and 5*10 - 0.4*100 = 10
        let weights = ScoreWeights::default();
        let a = candidate("a", 6, 1, 2, 0);
        let b = candidate("b", 5, 2, 5, 1);
        assert_eq!(score(&a, "m", &weights), score(&b, "m", &weights));
        assert_eq!(select([b, a], "m", &weights), Some("a"));
    }

    #[test]
    fn affinity_bonuses_apply() {
        let weights = ScoreWeights::default();
        let models = vec!["hailuo_2_3".to_string()];
        let mut affine = candidate("affine", 5, 0, 2, 1);
        affine.models = &models;
        affine.remaining_credits = Some(12);
        let plain = candidate("plain", 6, 0, 2, 0);

        let expected = 50.0 + weights.credit_affinity + weights.model_affinity;
        assert_eq!(score(&affine, "hailuo_2_3", &weights), expected);
        assert_eq!(select([plain, affine], "hailuo_2_3", &weights), Some("affine"));
        // Without the model match only the credit bonus remains: 65 > 60.
        assert_eq!(select([plain, affine], "other", &weights), Some("affine"));
    }

    #[test]
    fn exhausted_credits_earn_no_bonus() {
        let weights = ScoreWeights::default();
        let mut empty = candidate("empty", 5, 0, 2, 0);
        empty.remaining_credits = Some(0);
        assert_eq!(score(&empty, "m", &weights), 50.0);
    }
}
