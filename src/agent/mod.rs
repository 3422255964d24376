//! Planner agent: the co-evolution scheduler.
//!
//! Each round the planner picks the target with the highest expected
//! improvement, chooses one action for it, executes that action against
//! the workspace, observes the result, and checks the stop conditions.
//! All store writes happen on this task; workers and bridges hand results
//! back by value.

pub mod selector;
pub mod state;
pub mod writeback;

use crate::analyzer::format::Formatter;
use crate::analyzer::AnalyzerBridge;
use crate::build::{parse_coverage_csv, MavenDriver};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::evaluate::{EvalSummary, MutationEvaluator, QueuedMutant};
use crate::knowledge::store::{ChunkFilter, ChunkKind};
use crate::knowledge::{format_context, KnowledgeBase};
use crate::llm::prompts::{
    self, MutantPromptInput, PromptRole, SurvivingMutantBrief, TestPromptInput,
};
use crate::llm::LlmClient;
use crate::models::{
    CoverageSnapshot, MutantStatus, Target, TargetId, TestOrigin, TestStatus,
};
use crate::sandbox::{SandboxManager, Workspace};
use crate::store::Database;
use selector::{rank_targets, Candidate, SelectionWeights};
use state::{Checkpoint, TargetProgress};
use std::collections::BTreeMap;

/// Oldest surviving mutants injected into one refine prompt.
const REFINE_MUTANT_BATCH: usize = 3;

/// "Recently generated" horizon for the generate-mutants gate, in rounds.
const RECENT_MUTANT_ROUNDS: u32 = 2;

/// One atomic step the planner may take on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    GenerateTests,
    RefineTests,
    GenerateMutants,
    RunEvaluation,
    Advance,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::GenerateTests => "generate_tests",
            Action::RefineTests => "refine_tests",
            Action::GenerateMutants => "generate_mutants",
            Action::RunEvaluation => "run_evaluation",
            Action::Advance => "advance",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxIterations,
    BudgetExhausted,
    NoImprovement,
    Excellence,
    QueueExhausted,
}

/// Terminal state of a run, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Stopped(StopReason),
    Cancelled,
    /// The baseline failed during an evaluation cycle; results cannot be
    /// trusted.
    Unreliable,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Stopped(_) => 0,
            RunOutcome::Cancelled => 2,
            RunOutcome::Unreliable => 3,
        }
    }
}

/// What the decision tree sees for one target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetView {
    pub has_tests: bool,
    pub surviving: usize,
    pub unevaluated: usize,
    /// Tests changed since this target's last evaluation.
    pub tests_dirty: bool,
    pub mutation_score: f64,
    pub mutants_recently_generated: bool,
}

/// Decision tree for the selected target.
///
/// Pending evaluation work (new mutants or changed tests) is consumed
/// before refining again, so a refine round is always followed by the
/// evaluation that can flip its surviving mutants.
pub fn choose_action(view: &TargetView, high_threshold: f64) -> Action {
    if !view.has_tests {
        Action::GenerateTests
    } else if view.unevaluated > 0 || view.tests_dirty {
        Action::RunEvaluation
    } else if view.surviving > 0 {
        Action::RefineTests
    } else if view.mutation_score >= high_threshold && !view.mutants_recently_generated {
        Action::GenerateMutants
    } else {
        Action::Advance
    }
}

/// Metric deltas below this are treated as non-improvement.
pub const MIN_IMPROVEMENT: f64 = 0.01;

/// Per-target metrics used for the improvement check.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TargetMetrics {
    pub mutation_score: f64,
    pub line_coverage: f64,
    pub branch_coverage: f64,
}

impl TargetMetrics {
    fn from_snapshot(snapshot: &CoverageSnapshot) -> Self {
        Self {
            mutation_score: snapshot.mutation_score,
            line_coverage: snapshot.line_coverage,
            branch_coverage: snapshot.branch_coverage,
        }
    }
}

/// Whether any metric increased by at least [`MIN_IMPROVEMENT`].
pub fn is_improvement(previous: &TargetMetrics, current: &TargetMetrics) -> bool {
    current.mutation_score - previous.mutation_score >= MIN_IMPROVEMENT
        || current.line_coverage - previous.line_coverage >= MIN_IMPROVEMENT
        || current.branch_coverage - previous.branch_coverage >= MIN_IMPROVEMENT
}

/// Global excellence: every target has a snapshot and each meets all three
/// thresholds.
pub fn is_excellent(
    snapshots: &[CoverageSnapshot],
    target_count: usize,
    thresholds: &crate::config::ExcellenceThresholds,
) -> bool {
    target_count > 0
        && snapshots.len() >= target_count
        && snapshots.iter().all(|s| {
            s.mutation_score >= thresholds.mutation_score
                && s.line_coverage >= thresholds.line_coverage
                && s.branch_coverage >= thresholds.branch_coverage
        })
}

struct ActionOutcome {
    success: bool,
    error_kind: Option<ErrorKind>,
    llm_calls_delta: u32,
    evaluated: bool,
}

impl ActionOutcome {
    fn ok(llm_calls_delta: u32) -> Self {
        Self {
            success: true,
            error_kind: None,
            llm_calls_delta,
            evaluated: false,
        }
    }

    fn failed(kind: ErrorKind, llm_calls_delta: u32) -> Self {
        Self {
            success: false,
            error_kind: Some(kind),
            llm_calls_delta,
            evaluated: false,
        }
    }
}

/// The scheduler. Owns the run state; all component handles are shared
/// references constructed once at startup.
pub struct PlannerAgent<'a> {
    config: &'a Config,
    db: &'a Database,
    knowledge: &'a KnowledgeBase,
    llm: &'a LlmClient,
    analyzer: &'a AnalyzerBridge,
    formatter: &'a Formatter,
    driver: &'a MavenDriver,
    sandboxes: &'a SandboxManager,
    workspace: Workspace,
    cancel: CancelToken,
    weights: SelectionWeights,

    targets: Vec<Target>,
    progress: BTreeMap<String, TargetProgress>,
    prev_metrics: BTreeMap<String, TargetMetrics>,
    round: u32,
    no_improvement_evals: u32,
}

#[allow(clippy::too_many_arguments)]
impl<'a> PlannerAgent<'a> {
    pub fn new(
        config: &'a Config,
        db: &'a Database,
        knowledge: &'a KnowledgeBase,
        llm: &'a LlmClient,
        analyzer: &'a AnalyzerBridge,
        formatter: &'a Formatter,
        driver: &'a MavenDriver,
        sandboxes: &'a SandboxManager,
        workspace: Workspace,
        cancel: CancelToken,
        targets: Vec<Target>,
    ) -> Self {
        Self {
            config,
            db,
            knowledge,
            llm,
            analyzer,
            formatter,
            driver,
            sandboxes,
            workspace,
            cancel,
            weights: SelectionWeights::default(),
            targets,
            progress: BTreeMap::new(),
            prev_metrics: BTreeMap::new(),
            round: 0,
            no_improvement_evals: 0,
        }
    }

    /// Restore scheduling state from a checkpoint (resume path). The queue
    /// is reconstructed deterministically: targets, progress, and budget
    /// come from the checkpoint; artifacts come from the durable store.
    pub async fn resume_from(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.round = checkpoint.round;
        self.no_improvement_evals = checkpoint.no_improvement_evals;
        self.progress = checkpoint.progress.clone();
        // In-flight budget increments at crash time stay consumed.
        self.db.restore_budget(&checkpoint.budget).await?;
        for snapshot in &checkpoint.coverage_snapshots {
            self.prev_metrics.insert(
                snapshot.target.canonical(),
                TargetMetrics::from_snapshot(snapshot),
            );
        }
        if !checkpoint.targets.is_empty() {
            self.targets = checkpoint.targets;
        }
        tracing::info!(round = self.round, "resumed from checkpoint");
        Ok(())
    }

    /// Drive rounds until a stop condition, cancellation, or an unreliable
    /// evaluation. Fatal errors propagate after a checkpoint is written.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                self.write_checkpoint().await?;
                return Ok(RunOutcome::Cancelled);
            }

            if let Some(reason) = self.check_stop().await? {
                self.write_checkpoint().await?;
                self.log_summary(reason).await;
                return Ok(RunOutcome::Stopped(reason));
            }

            let Some((target, action)) = self.next_work().await? else {
                self.write_checkpoint().await?;
                self.log_summary(StopReason::QueueExhausted).await;
                return Ok(RunOutcome::Stopped(StopReason::QueueExhausted));
            };

            self.round += 1;
            self.db.record_round(self.round).await?;

            let outcome = match self.execute(&target, action).await {
                Ok(outcome) => outcome,
                Err(e) if e.kind == ErrorKind::TestFailed => {
                    // Baseline failure during evaluation: results cannot be
                    // trusted this cycle.
                    tracing::error!(round = self.round, target_id = %target.id, "{e}");
                    self.write_checkpoint().await?;
                    return Ok(RunOutcome::Unreliable);
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(round = self.round, "fatal: {e}");
                    self.write_checkpoint().await?;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(round = self.round, target_id = %target.id, "{e}");
                    ActionOutcome::failed(e.kind, 0)
                }
            };

            tracing::info!(
                round = self.round,
                target_id = %target.id,
                action = %action,
                outcome = if outcome.success { "ok" } else { "failed" },
                error_kind = outcome.error_kind.map(|k| k.as_str()),
                llm_calls_delta = outcome.llm_calls_delta,
                "action complete"
            );

            self.update_progress(&target, &outcome).await?;
            self.write_checkpoint().await?;
        }
    }

    async fn check_stop(&self) -> Result<Option<StopReason>> {
        let budget = self.db.budget().await?;
        if budget.rounds_used >= self.config.agent.max_iterations {
            return Ok(Some(StopReason::MaxIterations));
        }
        if budget.llm_calls_used >= self.config.agent.budget_llm_calls {
            return Ok(Some(StopReason::BudgetExhausted));
        }
        if self.no_improvement_evals >= self.config.agent.stop_on_no_improvement_rounds {
            return Ok(Some(StopReason::NoImprovement));
        }

        let snapshots = self.db.latest_coverage_all().await?;
        if is_excellent(
            &snapshots,
            self.targets.len(),
            &self.config.agent.excellence_thresholds,
        ) {
            return Ok(Some(StopReason::Excellence));
        }

        Ok(None)
    }

    /// Walk targets in selection order until one has actionable work.
    async fn next_work(&self) -> Result<Option<(Target, Action)>> {
        let candidates = self.candidates().await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        for candidate in rank_targets(&candidates, &self.weights) {
            let target = self
                .targets
                .iter()
                .find(|t| t.id == candidate.target)
                .ok_or_else(|| Error::internal("candidate without target"))?;
            let view = self.target_view(target).await?;
            let action = choose_action(&view, self.config.agent.excellence_thresholds.mutation_score);
            if action != Action::Advance {
                return Ok(Some((target.clone(), action)));
            }
        }

        Ok(None)
    }

    async fn candidates(&self) -> Result<Vec<Candidate>> {
        let stop_rounds = self.config.agent.stop_on_no_improvement_rounds.max(1) as f64;
        let mut candidates = Vec::new();
        for target in &self.targets {
            let progress = self.progress_for(&target.id);
            if progress.blacklisted {
                continue;
            }

            let metrics = match self.db.latest_coverage(&target.id).await? {
                Some(snapshot) => TargetMetrics::from_snapshot(&snapshot),
                None => TargetMetrics::default(),
            };

            candidates.push(Candidate {
                target: target.id.clone(),
                mutation_score: metrics.mutation_score,
                line_coverage: metrics.line_coverage,
                branch_coverage: metrics.branch_coverage,
                noop_penalty: (progress.noop_rounds as f64 / stop_rounds).min(1.0),
                rounds_spent: progress.rounds_spent,
            });
        }
        Ok(candidates)
    }

    async fn target_view(&self, target: &Target) -> Result<TargetView> {
        let progress = self.progress_for(&target.id);
        let active_tests = self.db.count_active_tests(&target.id).await?;
        let surviving = self
            .db
            .mutants_with_status(&target.id, MutantStatus::Survived)
            .await?
            .len();
        let unevaluated = self.db.unevaluated_mutants(&target.id).await?.len();
        let (killed, survived) = self.db.mutant_score_counts(&target.id).await?;
        let last_mutant_round = self.db.last_mutant_round(&target.id).await?;

        Ok(TargetView {
            has_tests: active_tests > 0,
            surviving,
            unevaluated,
            tests_dirty: progress.tests_dirty,
            mutation_score: CoverageSnapshot::mutation_score(killed, survived),
            mutants_recently_generated: last_mutant_round
                .is_some_and(|r| self.round.saturating_sub(r) < RECENT_MUTANT_ROUNDS),
        })
    }

    fn progress_for(&self, target: &TargetId) -> TargetProgress {
        self.progress
            .get(&target.canonical())
            .cloned()
            .unwrap_or_default()
    }

    fn progress_mut(&mut self, target: &TargetId) -> &mut TargetProgress {
        self.progress.entry(target.canonical()).or_default()
    }

    async fn execute(&mut self, target: &Target, action: Action) -> Result<ActionOutcome> {
        match action {
            Action::GenerateTests => {
                self.generate_tests(target, PromptRole::GenTestsInitial).await
            }
            Action::RefineTests => self.generate_tests(target, PromptRole::GenTestsRefine).await,
            Action::GenerateMutants => {
                let role = if self.db.last_mutant_round(&target.id).await?.is_some() {
                    PromptRole::GenMutantsRefine
                } else {
                    PromptRole::GenMutantsInitial
                };
                self.generate_mutants(target, role).await
            }
            Action::RunEvaluation => self.run_evaluation(target).await,
            Action::Advance => Ok(ActionOutcome::ok(0)),
        }
    }

    /// Retrieval context for a generation prompt: contracts for the target
    /// class plus bug reports matched by the refine focus.
    async fn retrieval_context(
        &self,
        target: &Target,
        bug_query: &str,
    ) -> Result<Option<String>> {
        let contract_query = format!(
            "{} {}",
            target.signature,
            target.javadoc.as_deref().unwrap_or_default()
        );
        let contract_filter = ChunkFilter {
            kind: Some(ChunkKind::Contract),
            target_class: Some(target.id.class_fqn.clone()),
            ..ChunkFilter::default()
        };
        let mut chunks = self
            .knowledge
            .retrieve(
                &contract_query,
                &contract_filter,
                self.config.knowledge.top_k_contracts,
            )
            .await?;

        let bug_filter = ChunkFilter {
            kind: Some(ChunkKind::BugReport),
            ..ChunkFilter::default()
        };
        chunks.extend(
            self.knowledge
                .retrieve(bug_query, &bug_filter, self.config.knowledge.top_k_bugs)
                .await?,
        );

        Ok(format_context(&chunks))
    }

    async fn generate_tests(&mut self, target: &Target, role: PromptRole) -> Result<ActionOutcome> {
        let surviving_mutants: Vec<SurvivingMutantBrief> = if role == PromptRole::GenTestsRefine {
            self.db
                .mutants_with_status(&target.id, MutantStatus::Survived)
                .await?
                .into_iter()
                .take(REFINE_MUTANT_BATCH)
                .map(|m| SurvivingMutantBrief {
                    mutant_id: m.id,
                    line_start: m.patch.line_start,
                    line_end: m.patch.line_end,
                    original: m.patch.original_code,
                    mutated: m.patch.mutated_code,
                    tag: m.tag,
                })
                .collect()
        } else {
            Vec::new()
        };

        let bug_query = if surviving_mutants.is_empty() {
            format!("bugs in {}", target.signature)
        } else {
            surviving_mutants
                .iter()
                .map(|m| format!("{} changed to {}", m.original, m.mutated))
                .collect::<Vec<_>>()
                .join("; ")
        };
        let context = self.retrieval_context(target, &bug_query).await?;
        let existing = self.db.test_method_names(&target.id).await?;

        let input = TestPromptInput {
            target,
            context: context.as_deref(),
            existing_test_methods: &existing,
            surviving_mutants: &surviving_mutants,
        };
        let (system, user) = prompts::render_test_prompt(role, &input);

        // The increment lands before the call so a crash counts the
        // in-flight spend as consumed.
        self.db.record_llm_call().await?;
        let response = match self.llm.chat_json(&system, &user).await {
            Ok(response) => response,
            Err(e) if e.kind.is_retryable() => {
                // Retries are already exhausted inside the client; the
                // action becomes a no-op for this round.
                tracing::warn!(target_id = %target.id, "generation unavailable: {e}");
                return Ok(ActionOutcome::failed(e.kind, 1));
            }
            Err(e) => return Err(e),
        };
        let validated = prompts::validate_tests(response)?;

        let origin = surviving_mutants
            .first()
            .map(|m| TestOrigin::RefineForMutant(m.mutant_id))
            .unwrap_or(TestOrigin::Initial);

        let mut inserted = Vec::new();
        for method in &validated.methods {
            if existing.contains(&method.name) {
                continue;
            }
            let id = self
                .db
                .insert_test(
                    &target.id,
                    &method.name,
                    &method.code,
                    TestStatus::PendingFormat,
                    &origin,
                    self.round,
                )
                .await?;
            inserted.push(id);
        }
        if inserted.is_empty() {
            return Ok(ActionOutcome::failed(ErrorKind::LlmMalformedResponse, 1));
        }

        let method_sources: Vec<&str> = validated
            .methods
            .iter()
            .filter(|m| !existing.contains(&m.name))
            .map(|m| m.code.as_str())
            .collect();

        let committed = writeback::commit_tests(
            self.analyzer,
            self.formatter,
            self.driver,
            &self.workspace,
            target,
            &validated.imports,
            &method_sources,
        )
        .await;

        match committed {
            Ok(_) => {
                for id in inserted {
                    self.db.update_test_status(id, TestStatus::Active).await?;
                }
                self.progress_mut(&target.id).tests_dirty = true;
                Ok(ActionOutcome::ok(1))
            }
            Err(e) => {
                // Rejected tests never persist.
                for id in inserted {
                    self.db.delete_test(id).await?;
                }
                tracing::warn!(target_id = %target.id, "tests rejected: {e}");
                Ok(ActionOutcome::failed(e.kind, 1))
            }
        }
    }

    async fn generate_mutants(
        &mut self,
        target: &Target,
        role: PromptRole,
    ) -> Result<ActionOutcome> {
        let bug_query = format!("defect patterns for {}", target.signature);
        let context = self.retrieval_context(target, &bug_query).await?;
        let known = self.db.patches_for_target(&target.id).await?;

        let input = MutantPromptInput {
            target,
            context: context.as_deref(),
            known_patches: &known,
        };
        let (system, user) = prompts::render_mutant_prompt(role, &input);

        self.db.record_llm_call().await?;
        let raw: serde_json::Value = match self.llm.chat_json(&system, &user).await {
            Ok(raw) => raw,
            Err(e) if e.kind.is_retryable() => {
                tracing::warn!(target_id = %target.id, "generation unavailable: {e}");
                return Ok(ActionOutcome::failed(e.kind, 1));
            }
            Err(e) => return Err(e),
        };
        let proposals = prompts::validate_mutants(raw, target)?;

        let mut added = 0usize;
        for proposal in proposals {
            if known.contains(&proposal.patch) {
                tracing::debug!(target_id = %target.id, "skipping duplicate mutant proposal");
                continue;
            }
            self.db
                .insert_mutant(&target.id, &proposal.patch, proposal.tag, self.round)
                .await?;
            added += 1;
        }

        if added == 0 {
            return Ok(ActionOutcome::failed(ErrorKind::LlmMalformedResponse, 1));
        }
        tracing::info!(target_id = %target.id, added, "mutants queued");
        Ok(ActionOutcome::ok(1))
    }

    async fn run_evaluation(&mut self, target: &Target) -> Result<ActionOutcome> {
        // Unevaluated mutants plus this target's surviving mutants (its own
        // tests may have changed); FIFO by id.
        let mut mutants = self.db.unevaluated_mutants(&target.id).await?;
        mutants.extend(
            self.db
                .mutants_with_status(&target.id, MutantStatus::Survived)
                .await?,
        );
        mutants.sort_by_key(|m| m.id);

        let queued: Vec<QueuedMutant> = mutants
            .iter()
            .map(|m| QueuedMutant {
                id: m.id,
                patch: m.patch.clone(),
            })
            .collect();

        let evaluator = MutationEvaluator::new(self.driver, self.sandboxes);
        let outcomes = evaluator
            .evaluate_target(&self.workspace, target, &queued, self.round, &self.cancel)
            .await?;

        for outcome in &outcomes {
            self.db
                .update_mutant_status(outcome.mutant_id, outcome.status)
                .await?;
            if let Some(run) = &outcome.run {
                self.db.insert_evaluation_run(run).await?;
            }
        }
        let summary = EvalSummary::from_outcomes(&outcomes);

        let snapshot = self.snapshot_coverage(target).await?;
        self.db.insert_coverage(&snapshot).await?;
        self.progress_mut(&target.id).tests_dirty = false;

        tracing::info!(
            target_id = %target.id,
            evaluated = summary.evaluated,
            killed = summary.killed,
            survived = summary.survived,
            invalid = summary.invalid,
            mutation_score = snapshot.mutation_score,
            "evaluation complete"
        );

        Ok(ActionOutcome {
            success: true,
            error_kind: None,
            llm_calls_delta: 0,
            evaluated: true,
        })
    }

    /// Coverage phase against the workspace plus the fresh mutant counts.
    async fn snapshot_coverage(&self, target: &Target) -> Result<CoverageSnapshot> {
        let (killed, survived) = self.db.mutant_score_counts(&target.id).await?;
        let tests_count = self.db.count_active_tests(&target.id).await?;

        let coverage_run = self.driver.run_tests_with_coverage(self.workspace.path()).await;
        let counters = match &coverage_run.report_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(content) => parse_coverage_csv(&content, &target.id.class_fqn),
                Err(e) => {
                    tracing::warn!("coverage report unreadable: {e}");
                    None
                }
            },
            None => {
                tracing::warn!(
                    "coverage run produced no report ({})",
                    coverage_run
                        .output
                        .error
                        .unwrap_or_else(|| format!("exit {}", coverage_run.output.exit_code))
                );
                None
            }
        };

        Ok(CoverageSnapshot {
            target: target.id.clone(),
            round: self.round,
            line_coverage: counters.map(|c| c.line_coverage).unwrap_or(0.0),
            branch_coverage: counters.map(|c| c.branch_coverage).unwrap_or(0.0),
            mutation_score: CoverageSnapshot::mutation_score(killed, survived),
            tests_count,
        })
    }

    async fn update_progress(&mut self, target: &Target, outcome: &ActionOutcome) -> Result<()> {
        let stop_rounds = self.config.agent.stop_on_no_improvement_rounds;

        if outcome.evaluated {
            let key = target.id.canonical();
            let current = self
                .db
                .latest_coverage(&target.id)
                .await?
                .map(|s| TargetMetrics::from_snapshot(&s))
                .unwrap_or_default();
            let previous = self.prev_metrics.get(&key).copied().unwrap_or_default();

            if is_improvement(&previous, &current) {
                self.db.record_improvement(self.round).await?;
                self.no_improvement_evals = 0;
                self.progress_mut(&target.id).noop_rounds = 0;
            } else {
                self.no_improvement_evals += 1;
                self.progress_mut(&target.id).noop_rounds += 1;
            }
            self.prev_metrics.insert(key, current);
        } else if !outcome.success {
            self.progress_mut(&target.id).noop_rounds += 1;
        }

        let progress = self.progress_mut(&target.id);
        progress.rounds_spent += 1;

        // Targets that keep failing stop being scheduled.
        if !outcome.success && progress.noop_rounds >= stop_rounds.max(1) * 2 {
            progress.blacklisted = true;
            tracing::warn!(target_id = %target.id, "target blacklisted after repeated failures");
        }

        Ok(())
    }

    async fn write_checkpoint(&self) -> Result<()> {
        let budget = self.db.budget().await?;
        let mut active_tests = Vec::new();
        let mut mutant_statuses = Vec::new();
        for target in &self.targets {
            active_tests.extend(self.db.active_tests(&target.id).await?);
            for status in [
                MutantStatus::Pending,
                MutantStatus::Valid,
                MutantStatus::Invalid,
                MutantStatus::Survived,
                MutantStatus::Killed,
                MutantStatus::EvaluationError,
                MutantStatus::Unknown,
            ] {
                for mutant in self.db.mutants_with_status(&target.id, status).await? {
                    mutant_statuses.push((mutant.id, mutant.status));
                }
            }
        }
        mutant_statuses.sort_by_key(|(id, _)| *id);

        let checkpoint = Checkpoint {
            round: self.round,
            budget,
            no_improvement_evals: self.no_improvement_evals,
            targets: self.targets.clone(),
            progress: self.progress.clone(),
            active_tests,
            mutant_statuses,
            coverage_snapshots: self.db.latest_coverage_all().await?,
            knowledge_namespace: self.knowledge.namespace().to_string(),
        };
        checkpoint.save(&self.config.checkpoint_path())
    }

    async fn log_summary(&self, reason: StopReason) {
        let budget = self.db.budget().await.unwrap_or_default();
        let snapshots = self.db.latest_coverage_all().await.unwrap_or_default();

        tracing::info!("run finished: {:?}", reason);
        tracing::info!(
            "rounds: {}, llm calls: {}/{}",
            budget.rounds_used,
            budget.llm_calls_used,
            self.config.agent.budget_llm_calls
        );
        for snapshot in &snapshots {
            tracing::info!(
                "{}: mutation {:.0}%, line {:.0}%, branch {:.0}%, {} tests",
                snapshot.target,
                snapshot.mutation_score * 100.0,
                snapshot.line_coverage * 100.0,
                snapshot.branch_coverage * 100.0,
                snapshot.tests_count
            );
        }
    }
}
