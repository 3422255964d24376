//! Core data model: targets, tests, mutants, evaluation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier for a single public method under test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    pub class_fqn: String,
    pub method_name: String,
    pub param_types: Vec<String>,
}

impl TargetId {
    pub fn new(
        class_fqn: impl Into<String>,
        method_name: impl Into<String>,
        param_types: Vec<String>,
    ) -> Self {
        Self {
            class_fqn: class_fqn.into(),
            method_name: method_name.into(),
            param_types,
        }
    }

    /// Canonical rendering, used for ordering and as the durable key:
    /// `com.example.Calculator#divide(int,int)`.
    pub fn canonical(&self) -> String {
        format!(
            "{}#{}({})",
            self.class_fqn,
            self.method_name,
            self.param_types.join(",")
        )
    }

    /// Simple (unqualified) class name.
    pub fn simple_class_name(&self) -> &str {
        self.class_fqn.rsplit('.').next().unwrap_or(&self.class_fqn)
    }

    /// Derived test class name: `{ClassName}_{methodName}Test`.
    pub fn test_class_name(&self) -> String {
        format!("{}_{}Test", self.simple_class_name(), self.method_name)
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Structural facts reported by the external analyzer for one method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodFacts {
    /// Method source text (verbatim, as found in the file).
    #[serde(default)]
    pub source: String,
    /// 1-based lines containing explicit null checks.
    #[serde(default)]
    pub null_checks: Vec<u32>,
    /// 1-based lines containing boundary comparisons.
    #[serde(default)]
    pub boundary_checks: Vec<u32>,
    /// Exception types thrown or caught inside the method.
    #[serde(default)]
    pub exception_handling: Vec<String>,
    /// Methods invoked from the body.
    #[serde(default)]
    pub method_calls: Vec<String>,
    #[serde(default)]
    pub cyclomatic_complexity: u32,
}

/// A method for which tests and mutants are managed.
///
/// Immutable once analyzed; never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub file_path: String,
    /// 1-based inclusive line range of the method in `file_path`.
    pub line_start: u32,
    pub line_end: u32,
    pub signature: String,
    pub javadoc: Option<String>,
    /// Collaborator types that must be mocked, in declaration order.
    pub collaborators: Vec<String>,
    pub facts: MethodFacts,
}

impl Target {
    /// Whether a 1-based line range falls inside this target's method body.
    pub fn contains_lines(&self, line_start: u32, line_end: u32) -> bool {
        line_start >= self.line_start && line_end <= self.line_end
    }
}

/// How a mutant rewrites the production source.
///
/// Line numbers are 1-based and inclusive. `original` and `mutated` are
/// bit-exact strings; the applier replaces lines `[line_start, line_end]`
/// with the lines of `mutated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationPatch {
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    #[serde(rename = "original")]
    pub original_code: String,
    #[serde(rename = "mutated")]
    pub mutated_code: String,
}

impl MutationPatch {
    /// Structural validity: ordered line range, an actual change.
    pub fn is_well_formed(&self) -> bool {
        self.line_start >= 1
            && self.line_start <= self.line_end
            && self.mutated_code != self.original_code
    }
}

/// Semantic category of the fault a mutant encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticTag {
    NullCheckRemoved,
    BoundaryFlipped,
    ReturnValueChanged,
    OperatorSwapped,
    ExceptionSwallowed,
    OffByOne,
    Other,
}

impl SemanticTag {
    pub fn as_str(self) -> &'static str {
        match self {
            SemanticTag::NullCheckRemoved => "null_check_removed",
            SemanticTag::BoundaryFlipped => "boundary_flipped",
            SemanticTag::ReturnValueChanged => "return_value_changed",
            SemanticTag::OperatorSwapped => "operator_swapped",
            SemanticTag::ExceptionSwallowed => "exception_swallowed",
            SemanticTag::OffByOne => "off_by_one",
            SemanticTag::Other => "other",
        }
    }

    /// Permissive parse for LLM output; anything unrecognized is `Other`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim() {
            "null_check_removed" => SemanticTag::NullCheckRemoved,
            "boundary_flipped" => SemanticTag::BoundaryFlipped,
            "return_value_changed" => SemanticTag::ReturnValueChanged,
            "operator_swapped" => SemanticTag::OperatorSwapped,
            "exception_swallowed" => SemanticTag::ExceptionSwallowed,
            "off_by_one" => SemanticTag::OffByOne,
            _ => SemanticTag::Other,
        }
    }
}

impl std::fmt::Display for SemanticTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutant lifecycle: `pending → valid | invalid → survived | killed`, with
/// `evaluation_error` / `unknown` for runner failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutantStatus {
    Pending,
    Valid,
    Invalid,
    Survived,
    Killed,
    EvaluationError,
    Unknown,
}

impl MutantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MutantStatus::Pending => "pending",
            MutantStatus::Valid => "valid",
            MutantStatus::Invalid => "invalid",
            MutantStatus::Survived => "survived",
            MutantStatus::Killed => "killed",
            MutantStatus::EvaluationError => "evaluation_error",
            MutantStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MutantStatus::Pending),
            "valid" => Some(MutantStatus::Valid),
            "invalid" => Some(MutantStatus::Invalid),
            "survived" => Some(MutantStatus::Survived),
            "killed" => Some(MutantStatus::Killed),
            "evaluation_error" => Some(MutantStatus::EvaluationError),
            "unknown" => Some(MutantStatus::Unknown),
            _ => None,
        }
    }

    /// Whether this status participates in the mutation-score denominator.
    pub fn counts_for_score(self) -> bool {
        matches!(self, MutantStatus::Survived | MutantStatus::Killed)
    }
}

impl std::fmt::Display for MutantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed semantic fault in the production code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutant {
    /// Monotonic integer per run, assigned by the store.
    pub id: i64,
    pub target: TargetId,
    pub patch: MutationPatch,
    pub tag: SemanticTag,
    pub status: MutantStatus,
    pub created_round: u32,
}

/// Where a test came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TestOrigin {
    Initial,
    RefineForMutant(i64),
}

impl From<TestOrigin> for String {
    fn from(o: TestOrigin) -> String {
        match o {
            TestOrigin::Initial => "initial".to_string(),
            TestOrigin::RefineForMutant(id) => format!("refine_for_mutant={id}"),
        }
    }
}

impl TryFrom<String> for TestOrigin {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, String> {
        if s == "initial" {
            return Ok(TestOrigin::Initial);
        }
        if let Some(id) = s.strip_prefix("refine_for_mutant=") {
            return id
                .parse::<i64>()
                .map(TestOrigin::RefineForMutant)
                .map_err(|e| format!("bad mutant id in origin '{s}': {e}"));
        }
        Err(format!("unrecognized test origin '{s}'"))
    }
}

impl std::fmt::Display for TestOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from(self.clone()))
    }
}

/// Test lifecycle. A test reaches `active` only after it compiles in the
/// workspace and passes against the unmutated baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    PendingFormat,
    Compiled,
    FailingOnBaseline,
    Active,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::PendingFormat => "pending_format",
            TestStatus::Compiled => "compiled",
            TestStatus::FailingOnBaseline => "failing_on_baseline",
            TestStatus::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_format" => Some(TestStatus::PendingFormat),
            "compiled" => Some(TestStatus::Compiled),
            "failing_on_baseline" => Some(TestStatus::FailingOnBaseline),
            "active" => Some(TestStatus::Active),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single generated test method, owned by one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub target: TargetId,
    pub test_class_name: String,
    pub test_method_name: String,
    /// Rendered (and, once past `pending_format`, formatted) source of the
    /// test method body.
    pub source: String,
    pub status: TestStatus,
    pub origin: TestOrigin,
    pub created_round: u32,
}

/// Outcome of one test within an evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Pass,
    Fail,
    Error,
}

/// One evaluation of one mutant. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
    pub mutant_id: i64,
    pub round: u32,
    pub outcomes: Vec<(String, TestOutcome)>,
    pub wall_time_ms: u64,
    pub exit_code: i32,
    pub timestamp: DateTime<Utc>,
}

/// Quality metrics for one target at one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    pub target: TargetId,
    pub round: u32,
    pub line_coverage: f64,
    pub branch_coverage: f64,
    /// `killed / (killed + survived)`; invalid, evaluation_error, and
    /// unknown mutants are excluded from the denominator.
    pub mutation_score: f64,
    pub tests_count: u32,
}

impl CoverageSnapshot {
    pub fn mutation_score(killed: usize, survived: usize) -> f64 {
        let denom = killed + survived;
        if denom == 0 {
            0.0
        } else {
            killed as f64 / denom as f64
        }
    }
}

/// Process-wide budget usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCounter {
    pub llm_calls_used: u32,
    pub rounds_used: u32,
    pub last_improvement_round: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_id() -> TargetId {
        TargetId::new(
            "com.example.Calculator",
            "divide",
            vec!["int".into(), "int".into()],
        )
    }

    #[test]
    fn test_canonical_rendering() {
        assert_eq!(
            target_id().canonical(),
            "com.example.Calculator#divide(int,int)"
        );
    }

    #[test]
    fn test_canonical_no_params() {
        let id = TargetId::new("com.example.Clock", "now", vec![]);
        assert_eq!(id.canonical(), "com.example.Clock#now()");
    }

    #[test]
    fn test_test_class_name_derivation() {
        assert_eq!(target_id().test_class_name(), "Calculator_divideTest");
    }

    #[test]
    fn test_target_id_ordering_is_stable() {
        let a = TargetId::new("com.example.A", "m", vec![]);
        let b = TargetId::new("com.example.B", "m", vec![]);
        assert!(a < b);
    }

    #[test]
    fn test_patch_well_formed() {
        let patch = MutationPatch {
            file_path: "src/main/java/A.java".into(),
            line_start: 3,
            line_end: 5,
            original_code: "return a / b;".into(),
            mutated_code: "return a / (b + 1);".into(),
        };
        assert!(patch.is_well_formed());
    }

    #[test]
    fn test_patch_rejects_inverted_range() {
        let patch = MutationPatch {
            file_path: "A.java".into(),
            line_start: 5,
            line_end: 3,
            original_code: "x".into(),
            mutated_code: "y".into(),
        };
        assert!(!patch.is_well_formed());
    }

    #[test]
    fn test_patch_rejects_identity_mutation() {
        let patch = MutationPatch {
            file_path: "A.java".into(),
            line_start: 1,
            line_end: 1,
            original_code: "x".into(),
            mutated_code: "x".into(),
        };
        assert!(!patch.is_well_formed());
    }

    #[test]
    fn test_mutant_status_roundtrip() {
        for status in [
            MutantStatus::Pending,
            MutantStatus::Valid,
            MutantStatus::Invalid,
            MutantStatus::Survived,
            MutantStatus::Killed,
            MutantStatus::EvaluationError,
            MutantStatus::Unknown,
        ] {
            assert_eq!(MutantStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MutantStatus::parse("bogus"), None);
    }

    #[test]
    fn test_score_denominator_excludes_non_terminal() {
        assert!(MutantStatus::Killed.counts_for_score());
        assert!(MutantStatus::Survived.counts_for_score());
        assert!(!MutantStatus::Invalid.counts_for_score());
        assert!(!MutantStatus::EvaluationError.counts_for_score());
        assert!(!MutantStatus::Unknown.counts_for_score());
    }

    #[test]
    fn test_origin_string_roundtrip() {
        let refine = TestOrigin::RefineForMutant(17);
        let s: String = refine.clone().into();
        assert_eq!(s, "refine_for_mutant=17");
        assert_eq!(TestOrigin::try_from(s).unwrap(), refine);
        assert_eq!(
            TestOrigin::try_from("initial".to_string()).unwrap(),
            TestOrigin::Initial
        );
        assert!(TestOrigin::try_from("garbage".to_string()).is_err());
    }

    #[test]
    fn test_semantic_tag_lenient_parse() {
        assert_eq!(
            SemanticTag::parse_lenient("boundary_flipped"),
            SemanticTag::BoundaryFlipped
        );
        assert_eq!(SemanticTag::parse_lenient("whatever"), SemanticTag::Other);
    }

    #[test]
    fn test_mutation_score_empty_denominator() {
        assert_eq!(CoverageSnapshot::mutation_score(0, 0), 0.0);
        assert_eq!(CoverageSnapshot::mutation_score(3, 1), 0.75);
    }

    #[test]
    fn test_patch_serde_uses_wire_field_names() {
        let patch = MutationPatch {
            file_path: "A.java".into(),
            line_start: 1,
            line_end: 2,
            original_code: "a".into(),
            mutated_code: "b".into(),
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert!(json.get("original").is_some());
        assert!(json.get("mutated").is_some());
        assert!(json.get("original_code").is_none());
    }
}
