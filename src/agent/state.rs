//! Planner run state and the per-round checkpoint.
//!
//! The checkpoint is a single JSON document written after each round. On
//! resume, the planner reconstructs its queue deterministically from this
//! state plus the durable store; `load(save(state)) == state` holds for
//! every field.

use crate::error::{Error, ErrorKind, Result};
use crate::models::{
    BudgetCounter, CoverageSnapshot, MutantStatus, Target, TargetId, TestCase,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Per-target scheduling progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetProgress {
    /// Rounds the planner has spent on this target.
    pub rounds_spent: u32,
    /// Consecutive rounds on this target without improvement; feeds the
    /// selection penalty.
    pub noop_rounds: u32,
    /// Whether the target's tests changed since its last evaluation.
    pub tests_dirty: bool,
    /// Targets that repeatedly fail actions are blacklisted and no longer
    /// scheduled.
    pub blacklisted: bool,
}

/// Everything needed to resume a run after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub round: u32,
    pub budget: BudgetCounter,
    /// Evaluation rounds since the last improvement; feeds the
    /// no-improvement stop window.
    pub no_improvement_evals: u32,
    pub targets: Vec<Target>,
    /// Keyed by canonical target id; BTreeMap keeps serialization stable.
    pub progress: BTreeMap<String, TargetProgress>,
    pub active_tests: Vec<TestCase>,
    pub mutant_statuses: Vec<(i64, MutantStatus)>,
    pub coverage_snapshots: Vec<CoverageSnapshot>,
    pub knowledge_namespace: String,
}

impl Checkpoint {
    /// Write atomically: serialize to a sibling temp file, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::internal(format!("checkpoint serialize: {e}")))?;

        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, json)?;
        std::fs::rename(&temp, path)?;
        tracing::debug!("checkpoint written to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::new(
                ErrorKind::ConfigInvalid,
                format!("cannot read checkpoint {}: {e}", path.display()),
            )
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::new(
                ErrorKind::ConfigInvalid,
                format!("cannot parse checkpoint {}: {e}", path.display()),
            )
        })
    }

    pub fn progress_for(&self, target: &TargetId) -> TargetProgress {
        self.progress
            .get(&target.canonical())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MethodFacts, MutationPatch, TestOrigin, TestStatus};
    use tempfile::TempDir;

    fn sample_checkpoint() -> Checkpoint {
        let target = Target {
            id: TargetId::new(
                "com.example.Calculator",
                "divide",
                vec!["int".into(), "int".into()],
            ),
            file_path: "src/main/java/com/example/Calculator.java".into(),
            line_start: 10,
            line_end: 14,
            signature: "public int divide(int a, int b)".into(),
            javadoc: None,
            collaborators: vec![],
            facts: MethodFacts::default(),
        };

        let mut progress = BTreeMap::new();
        progress.insert(
            target.id.canonical(),
            TargetProgress {
                rounds_spent: 3,
                noop_rounds: 1,
                tests_dirty: true,
                blacklisted: false,
            },
        );

        Checkpoint {
            round: 3,
            budget: BudgetCounter {
                llm_calls_used: 42,
                rounds_used: 3,
                last_improvement_round: 2,
            },
            no_improvement_evals: 1,
            active_tests: vec![TestCase {
                id: 1,
                target: target.id.clone(),
                test_class_name: "Calculator_divideTest".into(),
                test_method_name: "testDividesEvenly".into(),
                source: "@Test void testDividesEvenly() {}".into(),
                status: TestStatus::Active,
                origin: TestOrigin::Initial,
                created_round: 0,
            }],
            mutant_statuses: vec![(1, MutantStatus::Survived), (2, MutantStatus::Killed)],
            coverage_snapshots: vec![CoverageSnapshot {
                target: target.id.clone(),
                round: 3,
                line_coverage: 0.8,
                branch_coverage: 0.7,
                mutation_score: 0.5,
                tests_count: 1,
            }],
            targets: vec![target],
            progress,
            knowledge_namespace: "run-1".into(),
        }
    }

    // Keep the patch type exercised through serde so checkpoint compat
    // breaks loudly if the wire names change.
    #[test]
    fn test_patch_wire_names_stable() {
        let patch = MutationPatch {
            file_path: "A.java".into(),
            line_start: 1,
            line_end: 1,
            original_code: "a".into(),
            mutated_code: "b".into(),
        };
        let json = serde_json::to_string(&patch).unwrap();
        assert!(json.contains("\"original\""));
        assert!(json.contains("\"mutated\""));
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");

        let checkpoint = sample_checkpoint();
        checkpoint.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn test_checkpoint_save_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mut checkpoint = sample_checkpoint();
        checkpoint.save(&path).unwrap();
        checkpoint.round = 4;
        checkpoint.save(&path).unwrap();

        assert_eq!(Checkpoint::load(&path).unwrap().round, 4);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_checkpoint_load_missing_is_config_error() {
        let err = Checkpoint::load(Path::new("/nonexistent/checkpoint.json")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigInvalid);
    }

    #[test]
    fn test_progress_for_unknown_target_is_default() {
        let checkpoint = sample_checkpoint();
        let other = TargetId::new("com.example.Other", "m", vec![]);
        assert_eq!(checkpoint.progress_for(&other), TargetProgress::default());
    }
}
