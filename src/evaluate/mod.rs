//! Mutation evaluator: classifies mutants against their target's tests.
//!
//! Each mutant is applied in a fresh ephemeral sandbox, compiled, and run
//! against the target's current test class. The workspace is never touched.
//! Within one target, evaluations run strictly in FIFO order.

use crate::build::{CommandOutput, MavenDriver, TestRunResult};
use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind, Result};
use crate::models::{
    EvaluationRun, MutantStatus, MutationPatch, Target, TestOutcome,
};
use crate::sandbox::{SandboxManager, Workspace};
use chrono::Utc;
use std::time::Instant;

/// Replace lines `[line_start, line_end]` (1-based, inclusive) of `content`
/// with the lines of the patch's mutated code.
///
/// Surrounding content is preserved bit-exactly: the text is split on `\n`
/// with no trailing-newline normalization, so a file that ends in a newline
/// keeps it and one that does not stays that way.
pub fn apply_patch(content: &str, patch: &MutationPatch) -> Result<String> {
    let mut parts: Vec<&str> = content.split('\n').collect();
    // A trailing newline yields one phantom empty element after the split;
    // it is not an addressable line.
    let line_count = if content.ends_with('\n') {
        parts.len() - 1
    } else {
        parts.len()
    };

    if patch.line_start < 1
        || patch.line_start > patch.line_end
        || patch.line_end as usize > line_count
    {
        return Err(Error::new(
            ErrorKind::PatchOutOfBounds,
            format!(
                "patch lines {}-{} out of bounds for {} ({} lines)",
                patch.line_start, patch.line_end, patch.file_path, line_count
            ),
        ));
    }

    let replacement: Vec<&str> = patch.mutated_code.split('\n').collect();
    let start = (patch.line_start - 1) as usize;
    let end = patch.line_end as usize;
    parts.splice(start..end, replacement);

    Ok(parts.join("\n"))
}

/// Outcome of one evaluation attempt on a mutant. Most mutants produce
/// exactly one; a runner error on the first test run produces an
/// `evaluation_error` outcome followed by the retry's outcome.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub mutant_id: i64,
    pub status: MutantStatus,
    pub run: Option<EvaluationRun>,
}

/// Aggregate counts for one evaluation cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvalSummary {
    pub evaluated: usize,
    pub killed: usize,
    pub survived: usize,
    pub invalid: usize,
    pub errors: usize,
    pub unknown: usize,
}

impl EvalSummary {
    /// `evaluated` counts distinct mutants; the per-status counts are per
    /// outcome, so a runner error followed by a decisive retry shows up in
    /// both `errors` and the final status.
    pub fn from_outcomes(outcomes: &[EvalOutcome]) -> Self {
        let mut summary = Self::default();
        let mut seen = std::collections::HashSet::new();
        for outcome in outcomes {
            if seen.insert(outcome.mutant_id) {
                summary.evaluated += 1;
            }
            match outcome.status {
                MutantStatus::Killed => summary.killed += 1,
                MutantStatus::Survived => summary.survived += 1,
                MutantStatus::Invalid => summary.invalid += 1,
                MutantStatus::EvaluationError => summary.errors += 1,
                MutantStatus::Unknown => summary.unknown += 1,
                MutantStatus::Pending | MutantStatus::Valid => {}
            }
        }
        summary
    }
}

/// A mutant queued for evaluation (id + patch; the rest lives in the
/// store).
#[derive(Debug, Clone)]
pub struct QueuedMutant {
    pub id: i64,
    pub patch: MutationPatch,
}

/// Drives mutant evaluation for one target at a time.
pub struct MutationEvaluator<'a> {
    driver: &'a MavenDriver,
    sandboxes: &'a SandboxManager,
}

impl<'a> MutationEvaluator<'a> {
    pub fn new(driver: &'a MavenDriver, sandboxes: &'a SandboxManager) -> Self {
        Self { driver, sandboxes }
    }

    /// Evaluate `mutants` (FIFO) against the target's current tests.
    ///
    /// The baseline check runs first: the target's tests must pass against
    /// the unmutated workspace, otherwise the whole cycle is aborted as
    /// unreliable (`test_failed`). Cancellation is honored between mutants.
    pub async fn evaluate_target(
        &self,
        workspace: &Workspace,
        target: &Target,
        mutants: &[QueuedMutant],
        round: u32,
        cancel: &CancelToken,
    ) -> Result<Vec<EvalOutcome>> {
        let test_class = target.id.test_class_name();

        let baseline = self
            .driver
            .run_tests_matching(workspace.path(), &test_class)
            .await;
        if !baseline.output.success {
            return Err(Error::new(
                ErrorKind::TestFailed,
                format!(
                    "evaluation unreliable: baseline failed for {} ({})",
                    target.id,
                    baseline
                        .output
                        .error
                        .unwrap_or_else(|| format!("exit {}", baseline.output.exit_code))
                ),
            ));
        }

        let mut outcomes = Vec::with_capacity(mutants.len());
        for mutant in mutants {
            if cancel.is_cancelled() {
                tracing::info!("evaluation cancelled after {} mutants", outcomes.len());
                break;
            }
            let mutant_outcomes = self
                .evaluate_one(workspace, target, mutant, round, &test_class)
                .await?;
            if let Some(last) = mutant_outcomes.last() {
                tracing::info!(
                    mutant = mutant.id,
                    target_id = %target.id,
                    status = %last.status,
                    "mutant evaluated"
                );
            }
            outcomes.extend(mutant_outcomes);
        }

        Ok(outcomes)
    }

    /// Evaluate one mutant. Usually one outcome; a runner error on the
    /// first test run additionally yields an `evaluation_error` outcome
    /// (recorded and counted separately) before the single retry, whose
    /// result — or `unknown` on a second error — comes last.
    async fn evaluate_one(
        &self,
        workspace: &Workspace,
        target: &Target,
        mutant: &QueuedMutant,
        round: u32,
        test_class: &str,
    ) -> Result<Vec<EvalOutcome>> {
        let started = Instant::now();
        let sandbox = self
            .sandboxes
            .acquire_target_sandbox(workspace, mutant.id)
            .await?;

        let file = sandbox.path().join(&mutant.patch.file_path);
        let content = match tokio::fs::read_to_string(&file).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(mutant = mutant.id, "patched file unreadable: {e}");
                return Ok(vec![EvalOutcome {
                    mutant_id: mutant.id,
                    status: MutantStatus::Invalid,
                    run: None,
                }]);
            }
        };
        let mutated = match apply_patch(&content, &mutant.patch) {
            Ok(mutated) => mutated,
            Err(e) => {
                tracing::warn!(mutant = mutant.id, "patch rejected: {e}");
                return Ok(vec![EvalOutcome {
                    mutant_id: mutant.id,
                    status: MutantStatus::Invalid,
                    run: None,
                }]);
            }
        };
        tokio::fs::write(&file, mutated).await?;

        let compile = self.driver.compile(sandbox.path()).await;
        if !compile.success {
            return Ok(vec![EvalOutcome {
                mutant_id: mutant.id,
                status: MutantStatus::Invalid,
                run: Some(make_run(mutant.id, round, &[], started, &compile)),
            }]);
        }

        let compile_tests = self.driver.compile_tests(sandbox.path()).await;
        if !compile_tests.success {
            return Ok(vec![EvalOutcome {
                mutant_id: mutant.id,
                status: MutantStatus::Invalid,
                run: Some(make_run(mutant.id, round, &[], started, &compile_tests)),
            }]);
        }

        let mut outcomes = Vec::with_capacity(1);
        let first = self
            .driver
            .run_tests_matching(sandbox.path(), test_class)
            .await;
        let (status, test_run) = match classify(&first) {
            Classification::Decided(status) => (status, first),
            Classification::RunnerError => {
                // The failed attempt is an evaluation_error in its own
                // right, recorded before the retry; only a second error
                // becomes unknown.
                tracing::warn!(mutant = mutant.id, "runner error, retrying once");
                outcomes.push(EvalOutcome {
                    mutant_id: mutant.id,
                    status: MutantStatus::EvaluationError,
                    run: Some(make_run(mutant.id, round, &[], started, &first.output)),
                });
                let second = self
                    .driver
                    .run_tests_matching(sandbox.path(), test_class)
                    .await;
                match classify(&second) {
                    Classification::Decided(status) => (status, second),
                    Classification::RunnerError => (MutantStatus::Unknown, second),
                }
            }
        };

        let test_outcomes: Vec<(String, TestOutcome)> = test_run
            .tests
            .iter()
            .map(|t| (t.name.clone(), t.outcome))
            .collect();

        outcomes.push(EvalOutcome {
            mutant_id: mutant.id,
            status,
            run: Some(make_run(
                mutant.id,
                round,
                &test_outcomes,
                started,
                &test_run.output,
            )),
        });
        Ok(outcomes)
    }
}

enum Classification {
    Decided(MutantStatus),
    RunnerError,
}

/// Classify a test run over mutated code: all pass → survived, a test
/// failure → killed, anything unattributable → runner error.
fn classify(run: &TestRunResult) -> Classification {
    if run.output.error.is_some() {
        return Classification::RunnerError;
    }
    if run.output.success {
        return Classification::Decided(MutantStatus::Survived);
    }
    if !run.tests.is_empty() {
        return Classification::Decided(MutantStatus::Killed);
    }
    if let Some(summary) = run.summary {
        if summary.failures + summary.errors > 0 {
            return Classification::Decided(MutantStatus::Killed);
        }
    }
    Classification::RunnerError
}

fn make_run(
    mutant_id: i64,
    round: u32,
    outcomes: &[(String, TestOutcome)],
    started: Instant,
    output: &CommandOutput,
) -> EvaluationRun {
    EvaluationRun {
        mutant_id,
        round,
        outcomes: outcomes.to_vec(),
        wall_time_ms: started.elapsed().as_millis() as u64,
        exit_code: output.exit_code,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{TestResult, TestSummary};

    fn patch(line_start: u32, line_end: u32, mutated: &str) -> MutationPatch {
        MutationPatch {
            file_path: "src/main/java/A.java".into(),
            line_start,
            line_end,
            original_code: "placeholder".into(),
            mutated_code: mutated.into(),
        }
    }

    #[test]
    fn test_apply_patch_single_line() {
        let content = "line1\nline2\nline3";
        let result = apply_patch(content, &patch(2, 2, "changed")).unwrap();
        assert_eq!(result, "line1\nchanged\nline3");
    }

    #[test]
    fn test_apply_patch_preserves_trailing_newline() {
        let content = "line1\nline2\n";
        let result = apply_patch(content, &patch(1, 1, "changed")).unwrap();
        assert_eq!(result, "changed\nline2\n");
    }

    #[test]
    fn test_apply_patch_no_trailing_newline_stays() {
        let content = "line1\nline2";
        let result = apply_patch(content, &patch(2, 2, "changed")).unwrap();
        assert_eq!(result, "line1\nchanged");
    }

    #[test]
    fn test_apply_patch_multi_line_replacement() {
        let content = "a\nb\nc\nd";
        let result = apply_patch(content, &patch(2, 3, "x\ny\nz")).unwrap();
        assert_eq!(result, "a\nx\ny\nz\nd");
    }

    #[test]
    fn test_apply_patch_shrinking_replacement() {
        let content = "a\nb\nc\nd";
        let result = apply_patch(content, &patch(1, 3, "only")).unwrap();
        assert_eq!(result, "only\nd");
    }

    #[test]
    fn test_apply_patch_insertion_via_expansion() {
        // The no-op guard insertion from a mutant that wraps one line.
        let content = "int divide(int a, int b) {\n    return a / b;\n}";
        let result = apply_patch(
            content,
            &patch(2, 2, "    if (b == 0) return 0;\n    return a / b;"),
        )
        .unwrap();
        assert_eq!(
            result,
            "int divide(int a, int b) {\n    if (b == 0) return 0;\n    return a / b;\n}"
        );
    }

    #[test]
    fn test_apply_patch_out_of_bounds() {
        let content = "a\nb";
        let err = apply_patch(content, &patch(1, 3, "x")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PatchOutOfBounds);
    }

    #[test]
    fn test_apply_patch_phantom_trailing_line_not_addressable() {
        // Two real lines plus trailing newline: line 3 does not exist.
        let content = "a\nb\n";
        assert!(apply_patch(content, &patch(3, 3, "x")).is_err());
        assert!(apply_patch(content, &patch(2, 2, "x")).is_ok());
    }

    #[test]
    fn test_apply_patch_zero_line_start() {
        let err = apply_patch("a\nb", &patch(0, 1, "x")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PatchOutOfBounds);
    }

    #[test]
    fn test_apply_patch_inverted_range() {
        assert!(apply_patch("a\nb\nc", &patch(3, 2, "x")).is_err());
    }

    fn run_result(
        success: bool,
        error: Option<&str>,
        tests: Vec<TestResult>,
        summary: Option<TestSummary>,
    ) -> TestRunResult {
        TestRunResult {
            output: CommandOutput {
                success,
                exit_code: if success { 0 } else { 1 },
                stdout: String::new(),
                error: error.map(|e| e.to_string()),
            },
            tests,
            summary,
        }
    }

    #[test]
    fn test_classify_survived() {
        let run = run_result(true, None, vec![], None);
        assert!(matches!(
            classify(&run),
            Classification::Decided(MutantStatus::Survived)
        ));
    }

    #[test]
    fn test_classify_killed_by_named_failure() {
        let run = run_result(
            false,
            None,
            vec![TestResult {
                name: "T.testX".into(),
                outcome: TestOutcome::Fail,
            }],
            None,
        );
        assert!(matches!(
            classify(&run),
            Classification::Decided(MutantStatus::Killed)
        ));
    }

    #[test]
    fn test_classify_killed_by_summary_only() {
        let run = run_result(
            false,
            None,
            vec![],
            Some(TestSummary {
                run: 3,
                failures: 1,
                errors: 0,
                skipped: 0,
            }),
        );
        assert!(matches!(
            classify(&run),
            Classification::Decided(MutantStatus::Killed)
        ));
    }

    #[test]
    fn test_classify_runner_error_on_timeout() {
        let run = run_result(false, Some("timeout after 120 seconds"), vec![], None);
        assert!(matches!(classify(&run), Classification::RunnerError));
    }

    #[test]
    fn test_classify_runner_error_on_unattributable_failure() {
        let run = run_result(false, None, vec![], None);
        assert!(matches!(classify(&run), Classification::RunnerError));
    }

    #[test]
    fn test_summary_from_outcomes() {
        let outcomes = vec![
            EvalOutcome {
                mutant_id: 1,
                status: MutantStatus::Killed,
                run: None,
            },
            EvalOutcome {
                mutant_id: 2,
                status: MutantStatus::Survived,
                run: None,
            },
            EvalOutcome {
                mutant_id: 3,
                status: MutantStatus::Invalid,
                run: None,
            },
            EvalOutcome {
                mutant_id: 4,
                status: MutantStatus::Unknown,
                run: None,
            },
        ];
        let summary = EvalSummary::from_outcomes(&outcomes);
        assert_eq!(summary.evaluated, 4);
        assert_eq!(summary.killed, 1);
        assert_eq!(summary.survived, 1);
        assert_eq!(summary.invalid, 1);
        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.errors, 0);
    }

    #[test]
    fn test_summary_counts_error_attempt_separately() {
        // A runner error followed by a decisive retry: the mutant is
        // evaluated once but the error is counted on its own.
        let outcomes = vec![
            EvalOutcome {
                mutant_id: 7,
                status: MutantStatus::EvaluationError,
                run: None,
            },
            EvalOutcome {
                mutant_id: 7,
                status: MutantStatus::Killed,
                run: None,
            },
        ];
        let summary = EvalSummary::from_outcomes(&outcomes);
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.killed, 1);
    }

    #[test]
    fn test_summary_error_then_unknown() {
        let outcomes = vec![
            EvalOutcome {
                mutant_id: 9,
                status: MutantStatus::EvaluationError,
                run: None,
            },
            EvalOutcome {
                mutant_id: 9,
                status: MutantStatus::Unknown,
                run: None,
            },
        ];
        let summary = EvalSummary::from_outcomes(&outcomes);
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.killed, 0);
    }
}
