//! Target selection: expected-improvement scoring over the queue.

use crate::models::TargetId;

/// Weights of the expected-improvement score.
#[derive(Debug, Clone, Copy)]
pub struct SelectionWeights {
    pub mutation: f64,
    pub line: f64,
    pub branch: f64,
    pub noop: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            mutation: 0.5,
            line: 0.2,
            branch: 0.2,
            noop: 0.3,
        }
    }
}

/// One candidate target with its current metrics.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub target: TargetId,
    pub mutation_score: f64,
    pub line_coverage: f64,
    pub branch_coverage: f64,
    /// Normalized recent-noop penalty in [0, 1].
    pub noop_penalty: f64,
    pub rounds_spent: u32,
}

impl Candidate {
    /// `w1·(1−mutation) + w2·(1−line) + w3·(1−branch) − w4·noop`.
    pub fn expected_improvement(&self, weights: &SelectionWeights) -> f64 {
        weights.mutation * (1.0 - self.mutation_score)
            + weights.line * (1.0 - self.line_coverage)
            + weights.branch * (1.0 - self.branch_coverage)
            - weights.noop * self.noop_penalty
    }
}

/// Pick the candidate with the highest expected improvement. Ties break to
/// fewer rounds spent, then canonical target id order.
pub fn select_target<'a>(
    candidates: &'a [Candidate],
    weights: &SelectionWeights,
) -> Option<&'a Candidate> {
    rank_targets(candidates, weights).into_iter().next()
}

/// All candidates in selection order (best first), with the same tie-break
/// rules as [`select_target`]. The planner walks this order when the best
/// candidate has no actionable work.
pub fn rank_targets<'a>(
    candidates: &'a [Candidate],
    weights: &SelectionWeights,
) -> Vec<&'a Candidate> {
    let mut ranked: Vec<&Candidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| {
        let score_a = a.expected_improvement(weights);
        let score_b = b.expected_improvement(weights);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.rounds_spent.cmp(&b.rounds_spent))
            .then_with(|| a.target.cmp(&b.target))
    });
    ranked
}
