//! Row types for the relational store.

use crate::error::{Error, Result};
use crate::models::{
    CoverageSnapshot, MethodFacts, Mutant, MutantStatus, MutationPatch, SemanticTag, Target,
    TargetId, TestCase, TestOrigin, TestStatus,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A target row; JSON columns hold the structured parts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TargetRow {
    pub id: String,
    pub class_fqn: String,
    pub method_name: String,
    pub param_types: String,
    pub file_path: String,
    pub line_start: i64,
    pub line_end: i64,
    pub signature: String,
    pub javadoc: Option<String>,
    pub collaborators: String,
    pub facts: String,
    pub created_at: String,
}

impl TargetRow {
    pub fn into_target(self) -> Result<Target> {
        let param_types: Vec<String> = serde_json::from_str(&self.param_types)
            .map_err(|e| Error::internal(format!("target param_types: {e}")))?;
        let collaborators: Vec<String> = serde_json::from_str(&self.collaborators)
            .map_err(|e| Error::internal(format!("target collaborators: {e}")))?;
        let facts: MethodFacts = serde_json::from_str(&self.facts)
            .map_err(|e| Error::internal(format!("target facts: {e}")))?;

        Ok(Target {
            id: TargetId::new(self.class_fqn, self.method_name, param_types),
            file_path: self.file_path,
            line_start: self.line_start as u32,
            line_end: self.line_end as u32,
            signature: self.signature,
            javadoc: self.javadoc,
            collaborators,
            facts,
        })
    }
}

/// A test case row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TestRow {
    pub id: i64,
    pub target_id: String,
    pub class_fqn: String,
    pub method_name: String,
    pub param_types: String,
    pub test_class_name: String,
    pub test_method_name: String,
    pub source: String,
    pub status: String,
    pub origin: String,
    pub created_round: i64,
    pub created_at: String,
}

impl TestRow {
    pub fn into_test_case(self) -> Result<TestCase> {
        let param_types: Vec<String> = serde_json::from_str(&self.param_types)
            .map_err(|e| Error::internal(format!("test param_types: {e}")))?;
        let status = TestStatus::parse(&self.status)
            .ok_or_else(|| Error::internal(format!("bad test status '{}'", self.status)))?;
        let origin = TestOrigin::try_from(self.origin).map_err(Error::internal)?;

        Ok(TestCase {
            id: self.id,
            target: TargetId::new(self.class_fqn, self.method_name, param_types),
            test_class_name: self.test_class_name,
            test_method_name: self.test_method_name,
            source: self.source,
            status,
            origin,
            created_round: self.created_round as u32,
        })
    }
}

/// A mutant row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MutantRow {
    pub id: i64,
    pub target_id: String,
    pub class_fqn: String,
    pub method_name: String,
    pub param_types: String,
    pub file_path: String,
    pub line_start: i64,
    pub line_end: i64,
    pub original_code: String,
    pub mutated_code: String,
    pub tag: String,
    pub status: String,
    pub created_round: i64,
    pub created_at: String,
}

impl MutantRow {
    pub fn into_mutant(self) -> Result<Mutant> {
        let param_types: Vec<String> = serde_json::from_str(&self.param_types)
            .map_err(|e| Error::internal(format!("mutant param_types: {e}")))?;
        let status = MutantStatus::parse(&self.status)
            .ok_or_else(|| Error::internal(format!("bad mutant status '{}'", self.status)))?;

        Ok(Mutant {
            id: self.id,
            target: TargetId::new(self.class_fqn, self.method_name, param_types),
            patch: MutationPatch {
                file_path: self.file_path,
                line_start: self.line_start as u32,
                line_end: self.line_end as u32,
                original_code: self.original_code,
                mutated_code: self.mutated_code,
            },
            tag: SemanticTag::parse_lenient(&self.tag),
            status,
            created_round: self.created_round as u32,
        })
    }
}

/// A coverage snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CoverageRow {
    pub id: i64,
    pub target_id: String,
    pub class_fqn: String,
    pub method_name: String,
    pub param_types: String,
    pub round: i64,
    pub line_coverage: f64,
    pub branch_coverage: f64,
    pub mutation_score: f64,
    pub tests_count: i64,
    pub created_at: String,
}

impl CoverageRow {
    pub fn into_snapshot(self) -> Result<CoverageSnapshot> {
        let param_types: Vec<String> = serde_json::from_str(&self.param_types)
            .map_err(|e| Error::internal(format!("coverage param_types: {e}")))?;

        Ok(CoverageSnapshot {
            target: TargetId::new(self.class_fqn, self.method_name, param_types),
            round: self.round as u32,
            line_coverage: self.line_coverage,
            branch_coverage: self.branch_coverage,
            mutation_score: self.mutation_score,
            tests_count: self.tests_count as u32,
        })
    }
}

/// The single budget row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BudgetRow {
    pub id: i64,
    pub llm_calls_used: i64,
    pub rounds_used: i64,
    pub last_improvement_round: i64,
}
