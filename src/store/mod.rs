//! Durable record of targets, tests, mutants, runs, coverage, and budget.
//!
//! Single-writer model: only the planner task writes; workers hand results
//! back by value. The workspace sandbox stays the source of truth for test
//! sources; this store mirrors it.

mod models;

pub use models::*;

use crate::error::Result;
use crate::models::{
    CoverageSnapshot, EvaluationRun, Mutant, MutantStatus, MutationPatch, SemanticTag, Target,
    TargetId, TestCase, TestOrigin, TestStatus,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::path::Path;

/// Database wrapper for SQLite operations
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id TEXT PRIMARY KEY,
                class_fqn TEXT NOT NULL,
                method_name TEXT NOT NULL,
                param_types TEXT NOT NULL,
                file_path TEXT NOT NULL,
                line_start INTEGER NOT NULL,
                line_end INTEGER NOT NULL,
                signature TEXT NOT NULL,
                javadoc TEXT,
                collaborators TEXT NOT NULL DEFAULT '[]',
                facts TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_id TEXT NOT NULL,
                class_fqn TEXT NOT NULL,
                method_name TEXT NOT NULL,
                param_types TEXT NOT NULL,
                test_class_name TEXT NOT NULL,
                test_method_name TEXT NOT NULL,
                source TEXT NOT NULL,
                status TEXT NOT NULL,
                origin TEXT NOT NULL,
                created_round INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(target_id, test_class_name, test_method_name),
                FOREIGN KEY (target_id) REFERENCES targets(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mutants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_id TEXT NOT NULL,
                class_fqn TEXT NOT NULL,
                method_name TEXT NOT NULL,
                param_types TEXT NOT NULL,
                file_path TEXT NOT NULL,
                line_start INTEGER NOT NULL,
                line_end INTEGER NOT NULL,
                original_code TEXT NOT NULL,
                mutated_code TEXT NOT NULL,
                tag TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_round INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (target_id) REFERENCES targets(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS evaluation_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mutant_id INTEGER NOT NULL,
                round INTEGER NOT NULL,
                outcomes TEXT NOT NULL DEFAULT '[]',
                wall_time_ms INTEGER NOT NULL,
                exit_code INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (mutant_id) REFERENCES mutants(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coverage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_id TEXT NOT NULL,
                class_fqn TEXT NOT NULL,
                method_name TEXT NOT NULL,
                param_types TEXT NOT NULL,
                round INTEGER NOT NULL,
                line_coverage REAL NOT NULL,
                branch_coverage REAL NOT NULL,
                mutation_score REAL NOT NULL,
                tests_count INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (target_id) REFERENCES targets(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS budget (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                llm_calls_used INTEGER NOT NULL DEFAULT 0,
                rounds_used INTEGER NOT NULL DEFAULT 0,
                last_improvement_round INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO budget (id) VALUES (1)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mutants_target_status ON mutants(target_id, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tests_target ON tests(target_id, status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Clear all run data. Fresh (non-resume) runs start from an empty
    /// store; only `--resume` keeps prior rows.
    pub async fn reset(&self) -> Result<()> {
        for table in [
            "evaluation_runs",
            "coverage",
            "mutants",
            "tests",
            "targets",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        sqlx::query(
            "UPDATE budget SET llm_calls_used = 0, rounds_used = 0, last_improvement_round = 0 \
             WHERE id = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    /// Insert a target, replacing analyzer facts if it already exists.
    pub async fn upsert_target(&self, target: &Target) -> Result<()> {
        let param_types = serde_json::to_string(&target.id.param_types)
            .unwrap_or_else(|_| "[]".into());
        let collaborators =
            serde_json::to_string(&target.collaborators).unwrap_or_else(|_| "[]".into());
        let facts = serde_json::to_string(&target.facts).unwrap_or_else(|_| "{}".into());

        sqlx::query(
            r#"
            INSERT INTO targets
                (id, class_fqn, method_name, param_types, file_path, line_start, line_end,
                 signature, javadoc, collaborators, facts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_path = excluded.file_path,
                line_start = excluded.line_start,
                line_end = excluded.line_end,
                signature = excluded.signature,
                javadoc = excluded.javadoc,
                collaborators = excluded.collaborators,
                facts = excluded.facts
            "#,
        )
        .bind(target.id.canonical())
        .bind(&target.id.class_fqn)
        .bind(&target.id.method_name)
        .bind(param_types)
        .bind(&target.file_path)
        .bind(target.line_start as i64)
        .bind(target.line_end as i64)
        .bind(&target.signature)
        .bind(&target.javadoc)
        .bind(collaborators)
        .bind(facts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All targets in canonical order.
    pub async fn get_targets(&self) -> Result<Vec<Target>> {
        let rows = sqlx::query_as::<_, TargetRow>("SELECT * FROM targets ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TargetRow::into_target).collect()
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    /// Persist a new test case; returns its id.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_test(
        &self,
        target: &TargetId,
        test_method_name: &str,
        source: &str,
        status: TestStatus,
        origin: &TestOrigin,
        created_round: u32,
    ) -> Result<i64> {
        let param_types =
            serde_json::to_string(&target.param_types).unwrap_or_else(|_| "[]".into());
        let row = sqlx::query(
            r#"
            INSERT INTO tests
                (target_id, class_fqn, method_name, param_types, test_class_name,
                 test_method_name, source, status, origin, created_round)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(target.canonical())
        .bind(&target.class_fqn)
        .bind(&target.method_name)
        .bind(param_types)
        .bind(target.test_class_name())
        .bind(test_method_name)
        .bind(source)
        .bind(status.as_str())
        .bind(origin.to_string())
        .bind(created_round as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    pub async fn update_test_status(&self, test_id: i64, status: TestStatus) -> Result<()> {
        sqlx::query("UPDATE tests SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(test_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a rejected test (baseline regressions never persist).
    pub async fn delete_test(&self, test_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM tests WHERE id = ?")
            .bind(test_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The target's active tests, oldest first.
    pub async fn active_tests(&self, target: &TargetId) -> Result<Vec<TestCase>> {
        let rows = sqlx::query_as::<_, TestRow>(
            "SELECT * FROM tests WHERE target_id = ? AND status = 'active' ORDER BY id",
        )
        .bind(target.canonical())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TestRow::into_test_case).collect()
    }

    /// Names of every test method recorded for a target (any status), used
    /// to prevent redefinitions in refreshed prompts.
    pub async fn test_method_names(&self, target: &TargetId) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT test_method_name FROM tests WHERE target_id = ? ORDER BY id",
        )
        .bind(target.canonical())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("test_method_name"))
            .collect())
    }

    pub async fn count_active_tests(&self, target: &TargetId) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM tests WHERE target_id = ? AND status = 'active'",
        )
        .bind(target.canonical())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    // ------------------------------------------------------------------
    // Mutants
    // ------------------------------------------------------------------

    /// Persist a new mutant; ids are monotonic per run.
    pub async fn insert_mutant(
        &self,
        target: &TargetId,
        patch: &MutationPatch,
        tag: SemanticTag,
        created_round: u32,
    ) -> Result<i64> {
        let param_types =
            serde_json::to_string(&target.param_types).unwrap_or_else(|_| "[]".into());
        let row = sqlx::query(
            r#"
            INSERT INTO mutants
                (target_id, class_fqn, method_name, param_types, file_path,
                 line_start, line_end, original_code, mutated_code, tag, status, created_round)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            RETURNING id
            "#,
        )
        .bind(target.canonical())
        .bind(&target.class_fqn)
        .bind(&target.method_name)
        .bind(param_types)
        .bind(&patch.file_path)
        .bind(patch.line_start as i64)
        .bind(patch.line_end as i64)
        .bind(&patch.original_code)
        .bind(&patch.mutated_code)
        .bind(tag.as_str())
        .bind(created_round as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    pub async fn update_mutant_status(&self, mutant_id: i64, status: MutantStatus) -> Result<()> {
        sqlx::query("UPDATE mutants SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(mutant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mutants of a target with the given status, FIFO by id.
    pub async fn mutants_with_status(
        &self,
        target: &TargetId,
        status: MutantStatus,
    ) -> Result<Vec<Mutant>> {
        let rows = sqlx::query_as::<_, MutantRow>(
            "SELECT * FROM mutants WHERE target_id = ? AND status = ? ORDER BY id",
        )
        .bind(target.canonical())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MutantRow::into_mutant).collect()
    }

    /// Mutants awaiting their first evaluation (pending or valid), FIFO.
    pub async fn unevaluated_mutants(&self, target: &TargetId) -> Result<Vec<Mutant>> {
        let rows = sqlx::query_as::<_, MutantRow>(
            "SELECT * FROM mutants WHERE target_id = ? AND status IN ('pending', 'valid') \
             ORDER BY id",
        )
        .bind(target.canonical())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MutantRow::into_mutant).collect()
    }

    /// Every patch recorded for a target (for avoid-repeats prompting).
    pub async fn patches_for_target(&self, target: &TargetId) -> Result<Vec<MutationPatch>> {
        let mutants = sqlx::query_as::<_, MutantRow>(
            "SELECT * FROM mutants WHERE target_id = ? ORDER BY id",
        )
        .bind(target.canonical())
        .fetch_all(&self.pool)
        .await?;
        Ok(mutants
            .into_iter()
            .filter_map(|row| row.into_mutant().ok())
            .map(|m| m.patch)
            .collect())
    }

    /// (killed, survived) counts for the mutation-score denominator.
    pub async fn mutant_score_counts(&self, target: &TargetId) -> Result<(usize, usize)> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN status = 'killed' THEN 1 ELSE 0 END) AS killed,
                SUM(CASE WHEN status = 'survived' THEN 1 ELSE 0 END) AS survived
            FROM mutants WHERE target_id = ?
            "#,
        )
        .bind(target.canonical())
        .fetch_one(&self.pool)
        .await?;
        let killed: i64 = row.get::<Option<i64>, _>("killed").unwrap_or(0);
        let survived: i64 = row.get::<Option<i64>, _>("survived").unwrap_or(0);
        Ok((killed as usize, survived as usize))
    }

    /// The most recent round in which mutants were created for a target.
    pub async fn last_mutant_round(&self, target: &TargetId) -> Result<Option<u32>> {
        let row = sqlx::query("SELECT MAX(created_round) AS r FROM mutants WHERE target_id = ?")
            .bind(target.canonical())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<Option<i64>, _>("r").map(|r| r as u32))
    }

    // ------------------------------------------------------------------
    // Evaluation runs
    // ------------------------------------------------------------------

    /// Append one evaluation record.
    pub async fn insert_evaluation_run(&self, run: &EvaluationRun) -> Result<()> {
        let outcomes = serde_json::to_string(&run.outcomes).unwrap_or_else(|_| "[]".into());
        sqlx::query(
            "INSERT INTO evaluation_runs (mutant_id, round, outcomes, wall_time_ms, exit_code) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run.mutant_id)
        .bind(run.round as i64)
        .bind(outcomes)
        .bind(run.wall_time_ms as i64)
        .bind(run.exit_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Coverage
    // ------------------------------------------------------------------

    pub async fn insert_coverage(&self, snapshot: &CoverageSnapshot) -> Result<()> {
        let param_types =
            serde_json::to_string(&snapshot.target.param_types).unwrap_or_else(|_| "[]".into());
        sqlx::query(
            r#"
            INSERT INTO coverage
                (target_id, class_fqn, method_name, param_types, round,
                 line_coverage, branch_coverage, mutation_score, tests_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.target.canonical())
        .bind(&snapshot.target.class_fqn)
        .bind(&snapshot.target.method_name)
        .bind(param_types)
        .bind(snapshot.round as i64)
        .bind(snapshot.line_coverage)
        .bind(snapshot.branch_coverage)
        .bind(snapshot.mutation_score)
        .bind(snapshot.tests_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest snapshot per target.
    pub async fn latest_coverage_all(&self) -> Result<Vec<CoverageSnapshot>> {
        let rows = sqlx::query_as::<_, CoverageRow>(
            r#"
            SELECT c.* FROM coverage c
            INNER JOIN (
                SELECT target_id, MAX(id) AS max_id FROM coverage GROUP BY target_id
            ) latest ON c.id = latest.max_id
            ORDER BY c.target_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CoverageRow::into_snapshot).collect()
    }

    pub async fn latest_coverage(&self, target: &TargetId) -> Result<Option<CoverageSnapshot>> {
        let row = sqlx::query_as::<_, CoverageRow>(
            "SELECT * FROM coverage WHERE target_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(target.canonical())
        .fetch_optional(&self.pool)
        .await?;
        row.map(CoverageRow::into_snapshot).transpose()
    }

    // ------------------------------------------------------------------
    // Budget
    // ------------------------------------------------------------------

    pub async fn budget(&self) -> Result<crate::models::BudgetCounter> {
        let row = sqlx::query_as::<_, BudgetRow>("SELECT * FROM budget WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(crate::models::BudgetCounter {
            llm_calls_used: row.llm_calls_used as u32,
            rounds_used: row.rounds_used as u32,
            last_improvement_round: row.last_improvement_round as u32,
        })
    }

    /// Atomic increment, written before the spending operation's result is
    /// observed so a crash counts the in-flight call as consumed.
    pub async fn record_llm_call(&self) -> Result<()> {
        sqlx::query("UPDATE budget SET llm_calls_used = llm_calls_used + 1 WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_round(&self, round: u32) -> Result<()> {
        sqlx::query("UPDATE budget SET rounds_used = ? WHERE id = 1")
            .bind(round as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_improvement(&self, round: u32) -> Result<()> {
        sqlx::query("UPDATE budget SET last_improvement_round = ? WHERE id = 1")
            .bind(round as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Restore counters from a checkpoint (resume path).
    pub async fn restore_budget(&self, counter: &crate::models::BudgetCounter) -> Result<()> {
        sqlx::query(
            "UPDATE budget SET llm_calls_used = ?, rounds_used = ?, last_improvement_round = ? \
             WHERE id = 1",
        )
        .bind(counter.llm_calls_used as i64)
        .bind(counter.rounds_used as i64)
        .bind(counter.last_improvement_round as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
