//! Build driver bridge: Maven behind four operations.
//!
//! The driver is located once at construction (`MAVEN_HOME`, then PATH,
//! then a version query); failure to locate is a fatal startup error.
//! Individual invocations that time out are reported as `success = false`
//! with a timeout error, never as a panic or a hang.

use crate::error::{Error, ErrorKind, Result};
use crate::models::TestOutcome;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Structured result of one build-tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub error: Option<String>,
}

impl CommandOutput {
    fn timeout(seconds: u64) -> Self {
        Self {
            success: false,
            exit_code: -1,
            stdout: String::new(),
            error: Some(format!("timeout after {seconds} seconds")),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| e.starts_with("timeout"))
    }
}

/// Per-test outcome parsed from the test phase output.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub name: String,
    pub outcome: TestOutcome,
}

/// Result of a test phase run.
#[derive(Debug, Clone)]
pub struct TestRunResult {
    pub output: CommandOutput,
    /// Failing and erroring tests; passing tests are not listed
    /// individually by the tool.
    pub tests: Vec<TestResult>,
    pub summary: Option<TestSummary>,
}

impl TestRunResult {
    /// Whether any test whose name contains `needle` failed or errored.
    pub fn has_failure_matching(&self, needle: &str) -> bool {
        self.tests.iter().any(|t| t.name.contains(needle))
    }
}

/// The `Tests run: N, Failures: F, Errors: E, Skipped: S` summary line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestSummary {
    pub run: u32,
    pub failures: u32,
    pub errors: u32,
    pub skipped: u32,
}

/// Result of a coverage run.
#[derive(Debug, Clone)]
pub struct CoverageRunResult {
    pub output: CommandOutput,
    /// Path to the coverage report (CSV), when produced.
    pub report_path: Option<PathBuf>,
}

/// Line and branch coverage for one class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageCounters {
    pub line_coverage: f64,
    pub branch_coverage: f64,
}

/// Maven build driver.
pub struct MavenDriver {
    mvn: PathBuf,
    compile_timeout: Duration,
    test_timeout: Duration,
    coverage_timeout: Duration,
}

impl MavenDriver {
    /// Locate the build tool and verify it responds to a version query.
    pub async fn locate(
        compile_timeout: Duration,
        test_timeout: Duration,
        coverage_timeout: Duration,
    ) -> Result<Self> {
        let maven_home = std::env::var_os("MAVEN_HOME").map(PathBuf::from);
        let path_var = std::env::var("PATH").unwrap_or_default();
        let mvn = find_mvn(maven_home.as_deref(), &path_var).ok_or_else(|| {
            Error::new(
                ErrorKind::ExternalToolMissing,
                "mvn not found via MAVEN_HOME or PATH",
            )
        })?;

        let driver = Self {
            mvn,
            compile_timeout,
            test_timeout,
            coverage_timeout,
        };

        let version = driver
            .run(Path::new("."), &["--version"], Duration::from_secs(30))
            .await;
        if !version.success {
            return Err(Error::new(
                ErrorKind::ExternalToolMissing,
                format!(
                    "mvn --version failed: {}",
                    version.error.unwrap_or_else(|| version.stdout)
                ),
            ));
        }
        if let Some(line) = version.stdout.lines().next() {
            tracing::info!("build driver: {}", line.trim());
        }

        Ok(driver)
    }

    #[cfg(test)]
    fn with_path(mvn: PathBuf) -> Self {
        Self {
            mvn,
            compile_timeout: Duration::from_secs(5),
            test_timeout: Duration::from_secs(5),
            coverage_timeout: Duration::from_secs(5),
        }
    }

    async fn run(&self, dir: &Path, args: &[&str], timeout: Duration) -> CommandOutput {
        let child = Command::new(&self.mvn)
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return CommandOutput {
                    success: false,
                    exit_code: -1,
                    stdout: String::new(),
                    error: Some(format!("failed to spawn {}: {e}", self.mvn.display())),
                };
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let combined = format!("{stdout}{stderr}");
                CommandOutput {
                    success: output.status.success(),
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: combined,
                    error: None,
                }
            }
            Ok(Err(e)) => CommandOutput {
                success: false,
                exit_code: -1,
                stdout: String::new(),
                error: Some(format!("command execution error: {e}")),
            },
            // kill_on_drop reaps the child when the future is dropped here.
            Err(_) => CommandOutput::timeout(timeout.as_secs()),
        }
    }

    /// Compile production sources.
    pub async fn compile(&self, project: &Path) -> CommandOutput {
        self.run(project, &["compile", "-B", "-q"], self.compile_timeout)
            .await
    }

    /// Compile test sources.
    pub async fn compile_tests(&self, project: &Path) -> CommandOutput {
        self.run(project, &["test-compile", "-B", "-q"], self.compile_timeout)
            .await
    }

    /// Run the whole test phase.
    pub async fn run_tests(&self, project: &Path) -> TestRunResult {
        let output = self.run(project, &["test", "-B"], self.test_timeout).await;
        let tests = parse_test_failures(&output.stdout);
        let summary = parse_test_summary(&output.stdout);
        TestRunResult {
            output,
            tests,
            summary,
        }
    }

    /// Run only tests matching a class or `Class#method` pattern.
    pub async fn run_tests_matching(&self, project: &Path, pattern: &str) -> TestRunResult {
        let test_arg = format!("-Dtest={pattern}");
        let output = self
            .run(
                project,
                &["test", "-B", test_arg.as_str(), "-DfailIfNoTests=false"],
                self.test_timeout,
            )
            .await;
        let tests = parse_test_failures(&output.stdout);
        let summary = parse_test_summary(&output.stdout);
        TestRunResult {
            output,
            tests,
            summary,
        }
    }

    /// Run the test phase with coverage instrumentation and report
    /// generation.
    pub async fn run_tests_with_coverage(&self, project: &Path) -> CoverageRunResult {
        let output = self
            .run(
                project,
                &["test", "-B", "jacoco:report"],
                self.coverage_timeout,
            )
            .await;

        let report = project.join("target/site/jacoco/jacoco.csv");
        let report_path = (output.success && report.is_file()).then_some(report);
        CoverageRunResult {
            output,
            report_path,
        }
    }
}

/// Resolve the `mvn` executable: `MAVEN_HOME/bin/mvn` first, then each PATH
/// entry.
fn find_mvn(maven_home: Option<&Path>, path_var: &str) -> Option<PathBuf> {
    if let Some(home) = maven_home {
        let candidate = home.join("bin").join("mvn");
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    for dir in path_var.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join("mvn");
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    None
}

/// Parse failing/erroring tests from surefire-style output lines such as
/// `[ERROR] Calculator_divideTest.testDivideByZero -- Time elapsed: 0.004 s <<< FAILURE!`.
fn parse_test_failures(output: &str) -> Vec<TestResult> {
    let mut results = Vec::new();
    for line in output.lines() {
        let outcome = if line.contains("<<< FAILURE!") {
            TestOutcome::Fail
        } else if line.contains("<<< ERROR!") {
            TestOutcome::Error
        } else {
            continue;
        };

        let stripped = line
            .trim_start()
            .trim_start_matches("[ERROR]")
            .trim_start();
        let name = stripped
            .split_whitespace()
            .next()
            .unwrap_or("unknown")
            .to_string();
        if !results.iter().any(|r: &TestResult| r.name == name) {
            results.push(TestResult { name, outcome });
        }
    }
    results
}

/// Parse the last `Tests run: …` summary line in the output.
fn parse_test_summary(output: &str) -> Option<TestSummary> {
    let mut summary = None;
    for line in output.lines() {
        let trimmed = line.trim_start().trim_start_matches("[INFO]").trim();
        if !trimmed.starts_with("Tests run:") {
            continue;
        }
        let mut parsed = TestSummary {
            run: 0,
            failures: 0,
            errors: 0,
            skipped: 0,
        };
        let mut ok = false;
        for part in trimmed.split(',') {
            let part = part.trim();
            if let Some((key, value)) = part.rsplit_once(':') {
                let value: u32 = match value.trim().parse() {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                match key.trim() {
                    "Tests run" => {
                        parsed.run = value;
                        ok = true;
                    }
                    "Failures" => parsed.failures = value,
                    "Errors" => parsed.errors = value,
                    "Skipped" => parsed.skipped = value,
                    _ => {}
                }
            }
        }
        if ok {
            summary = Some(parsed);
        }
    }
    summary
}

/// Look up one class's counters in a jacoco CSV report.
///
/// Columns: GROUP, PACKAGE, CLASS, INSTRUCTION_MISSED, INSTRUCTION_COVERED,
/// BRANCH_MISSED, BRANCH_COVERED, LINE_MISSED, LINE_COVERED, …
pub fn parse_coverage_csv(content: &str, class_fqn: &str) -> Option<CoverageCounters> {
    let (package, class) = class_fqn.rsplit_once('.').unwrap_or(("", class_fqn));

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 9 {
            continue;
        }
        if fields[1] != package || fields[2] != class {
            continue;
        }

        let branch_missed: f64 = fields[5].parse().ok()?;
        let branch_covered: f64 = fields[6].parse().ok()?;
        let line_missed: f64 = fields[7].parse().ok()?;
        let line_covered: f64 = fields[8].parse().ok()?;

        let line_total = line_missed + line_covered;
        let branch_total = branch_missed + branch_covered;
        return Some(CoverageCounters {
            line_coverage: if line_total == 0.0 {
                0.0
            } else {
                line_covered / line_total
            },
            // A class without branches counts as fully branch-covered.
            branch_coverage: if branch_total == 0.0 {
                1.0
            } else {
                branch_covered / branch_total
            },
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_mvn_prefers_maven_home() {
        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("mvn"), "#!/bin/sh").unwrap();

        let found = find_mvn(Some(dir.path()), "/nonexistent");
        assert_eq!(found, Some(bin.join("mvn")));
    }

    #[test]
    fn test_find_mvn_falls_back_to_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("mvn"), "#!/bin/sh").unwrap();

        let path_var = format!("/nonexistent:{}", dir.path().display());
        let found = find_mvn(None, &path_var);
        assert_eq!(found, Some(dir.path().join("mvn")));
    }

    #[test]
    fn test_find_mvn_missing() {
        assert_eq!(find_mvn(None, "/nonexistent:/also/missing"), None);
    }

    #[test]
    fn test_parse_test_failures() {
        let output = "\
[INFO] Running com.example.Calculator_divideTest
[ERROR] Calculator_divideTest.testDivideByZero -- Time elapsed: 0.004 s <<< FAILURE!
[ERROR] Calculator_divideTest.testOverflow -- Time elapsed: 0.001 s <<< ERROR!
[INFO] Tests run: 3, Failures: 1, Errors: 1, Skipped: 0";

        let results = parse_test_failures(output);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "Calculator_divideTest.testDivideByZero");
        assert_eq!(results[0].outcome, TestOutcome::Fail);
        assert_eq!(results[1].outcome, TestOutcome::Error);
    }

    #[test]
    fn test_parse_test_failures_dedupes_repeated_lines() {
        let output = "\
[ERROR] T.testX -- Time elapsed: 0.1 s <<< FAILURE!
[ERROR] T.testX -- Time elapsed: 0.1 s <<< FAILURE!";
        assert_eq!(parse_test_failures(output).len(), 1);
    }

    #[test]
    fn test_parse_test_summary_takes_last() {
        let output = "\
[INFO] Tests run: 2, Failures: 0, Errors: 0, Skipped: 0
[INFO] Results:
[INFO] Tests run: 5, Failures: 1, Errors: 0, Skipped: 1";
        let summary = parse_test_summary(output).unwrap();
        assert_eq!(
            summary,
            TestSummary {
                run: 5,
                failures: 1,
                errors: 0,
                skipped: 1
            }
        );
    }

    #[test]
    fn test_parse_test_summary_absent() {
        assert_eq!(parse_test_summary("BUILD FAILURE"), None);
    }

    #[test]
    fn test_has_failure_matching() {
        let result = TestRunResult {
            output: CommandOutput {
                success: false,
                exit_code: 1,
                stdout: String::new(),
                error: None,
            },
            tests: vec![TestResult {
                name: "Calculator_divideTest.testDivideByZero".into(),
                outcome: TestOutcome::Fail,
            }],
            summary: None,
        };
        assert!(result.has_failure_matching("Calculator_divideTest"));
        assert!(!result.has_failure_matching("Inventory_addStockTest"));
    }

    #[test]
    fn test_command_output_timeout_flag() {
        let output = CommandOutput::timeout(30);
        assert!(!output.success);
        assert!(output.is_timeout());

        let ok = CommandOutput {
            success: true,
            exit_code: 0,
            stdout: String::new(),
            error: None,
        };
        assert!(!ok.is_timeout());
    }

    #[test]
    fn test_parse_coverage_csv() {
        let csv = "\
GROUP,PACKAGE,CLASS,INSTRUCTION_MISSED,INSTRUCTION_COVERED,BRANCH_MISSED,BRANCH_COVERED,LINE_MISSED,LINE_COVERED,COMPLEXITY_MISSED,COMPLEXITY_COVERED,METHOD_MISSED,METHOD_COVERED
demo,com.example,Calculator,5,45,1,3,2,8,1,4,0,3
demo,com.example,Inventory,10,0,4,0,6,0,3,0,2,0";

        let calc = parse_coverage_csv(csv, "com.example.Calculator").unwrap();
        assert!((calc.line_coverage - 0.8).abs() < 1e-9);
        assert!((calc.branch_coverage - 0.75).abs() < 1e-9);

        let inv = parse_coverage_csv(csv, "com.example.Inventory").unwrap();
        assert_eq!(inv.line_coverage, 0.0);
        assert_eq!(inv.branch_coverage, 0.0);

        assert!(parse_coverage_csv(csv, "com.example.Missing").is_none());
    }

    #[test]
    fn test_parse_coverage_csv_no_branches_counts_full() {
        let csv = "\
GROUP,PACKAGE,CLASS,INSTRUCTION_MISSED,INSTRUCTION_COVERED,BRANCH_MISSED,BRANCH_COVERED,LINE_MISSED,LINE_COVERED
demo,com.example,Pojo,0,10,0,0,0,4";
        let pojo = parse_coverage_csv(csv, "com.example.Pojo").unwrap();
        assert_eq!(pojo.line_coverage, 1.0);
        assert_eq!(pojo.branch_coverage, 1.0);
    }

    #[tokio::test]
    async fn test_run_reports_spawn_failure() {
        let driver = MavenDriver::with_path(PathBuf::from("/nonexistent/mvn"));
        let output = driver.compile(Path::new(".")).await;
        assert!(!output.success);
        assert!(output.error.unwrap().contains("failed to spawn"));
    }
}
