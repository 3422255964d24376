//! Test write-back discipline: a single all-or-nothing operation per
//! target test file.
//!
//! Generated tests are structurally validated, formatted, merged
//! additively into the target's single test file (new `@Test` methods are
//! appended, nothing is ever deleted), then baseline-checked against the
//! whole workspace. Failure at any stage restores the file exactly as it
//! was.

use crate::analyzer::format::Formatter;
use crate::analyzer::AnalyzerBridge;
use crate::build::MavenDriver;
use crate::error::{Error, ErrorKind, Result};
use crate::models::Target;
use crate::sandbox::Workspace;
use std::path::PathBuf;

const TEST_SOURCE_ROOT: &str = "src/test/java";

/// Imports every generated test file gets regardless of what the model
/// asked for.
const DEFAULT_IMPORTS: [&str; 2] = [
    "org.junit.jupiter.api.Test",
    "static org.junit.jupiter.api.Assertions.*",
];

/// Location of a target's single test file inside the workspace.
pub fn test_file_path(workspace: &Workspace, target: &Target) -> PathBuf {
    test_file_path_in(workspace.path(), target)
}

/// Same, under an arbitrary project root (preprocessing sandboxes).
pub fn test_file_path_in(root: &std::path::Path, target: &Target) -> PathBuf {
    let mut path = root.join(TEST_SOURCE_ROOT);
    if let Some((package, _)) = target.id.class_fqn.rsplit_once('.') {
        for part in package.split('.') {
            path.push(part);
        }
    }
    path.push(format!("{}.java", target.id.test_class_name()));
    path
}

/// Render a fresh test class around the given methods.
pub fn render_test_class(
    package: Option<&str>,
    class_name: &str,
    imports: &[String],
    methods: &[&str],
) -> String {
    let mut lines = Vec::new();
    if let Some(package) = package {
        lines.push(format!("package {package};"));
        lines.push(String::new());
    }

    for import in merged_import_list(imports) {
        lines.push(format!("import {import};"));
    }
    lines.push(String::new());

    lines.push(format!("class {class_name} {{"));
    for (i, method) in methods.iter().enumerate() {
        if i > 0 {
            lines.push(String::new());
        }
        for line in method.lines() {
            lines.push(format!("    {line}"));
        }
    }
    lines.push("}".to_string());
    lines.push(String::new());
    lines.join("\n")
}

fn merged_import_list(extra: &[String]) -> Vec<String> {
    let mut imports: Vec<String> = DEFAULT_IMPORTS.iter().map(|i| i.to_string()).collect();
    for import in extra {
        let import = import
            .trim()
            .trim_start_matches("import ")
            .trim_end_matches(';')
            .trim()
            .to_string();
        if !import.is_empty() && !imports.contains(&import) {
            imports.push(import);
        }
    }
    imports
}

/// Add any missing import lines to existing source, after the last import
/// (or after the package line when there are none).
pub fn merge_imports(content: &str, imports: &[String]) -> String {
    let wanted: Vec<String> = merged_import_list(imports)
        .into_iter()
        .map(|i| format!("import {i};"))
        .filter(|line| !content.contains(line.as_str()))
        .collect();
    if wanted.is_empty() {
        return content.to_string();
    }

    let lines: Vec<&str> = content.lines().collect();
    let mut insert_at = 0;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("import ") || trimmed.starts_with("package ") {
            insert_at = i + 1;
        }
    }

    let mut merged: Vec<String> = lines[..insert_at].iter().map(|l| l.to_string()).collect();
    merged.extend(wanted);
    merged.extend(lines[insert_at..].iter().map(|l| l.to_string()));
    let mut result = merged.join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Append methods inside the class body, before the final closing brace.
pub fn append_methods(content: &str, methods: &[&str]) -> Result<String> {
    let close = content.rfind('}').ok_or_else(|| {
        Error::new(
            ErrorKind::InternalInvariant,
            "test file has no closing brace",
        )
    })?;

    let mut body = String::with_capacity(content.len() + 256);
    body.push_str(content[..close].trim_end());
    body.push('\n');
    for method in methods {
        body.push('\n');
        for line in method.lines() {
            body.push_str("    ");
            body.push_str(line);
            body.push('\n');
        }
    }
    body.push_str(&content[close..]);
    Ok(body)
}

/// Outcome of a successful commit.
#[derive(Debug, Clone)]
pub struct CommittedTests {
    pub file_path: PathBuf,
    /// The formatted file content as written.
    pub file_content: String,
}

/// Merge new test methods into the target's test file: validate → format →
/// write → compile → baseline. All-or-nothing; on failure the workspace is
/// byte-identical to before the call.
pub async fn commit_tests(
    analyzer: &AnalyzerBridge,
    formatter: &Formatter,
    driver: &MavenDriver,
    workspace: &Workspace,
    target: &Target,
    imports: &[String],
    methods: &[&str],
) -> Result<CommittedTests> {
    let path = test_file_path(workspace, target);
    let existing = match tokio::fs::read_to_string(&path).await {
        Ok(content) => Some(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let candidate = match &existing {
        Some(content) => append_methods(&merge_imports(content, imports), methods)?,
        None => {
            let package = target.id.class_fqn.rsplit_once('.').map(|(p, _)| p);
            render_test_class(package, &target.id.test_class_name(), imports, methods)
        }
    };

    analyzer.validate_test(&candidate).await?;
    let formatted = formatter.format_source(&candidate).await?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &formatted).await?;

    let compile = driver.compile_tests(workspace.path()).await;
    if !compile.success {
        rollback(&path, existing.as_deref()).await;
        return Err(Error::new(
            ErrorKind::BuildFailed,
            format!(
                "generated tests for {} do not compile: {}",
                target.id,
                compile.error.unwrap_or_else(|| truncated(&compile.stdout))
            ),
        ));
    }

    // Baseline rule: the whole suite must still pass, for every target.
    let baseline = driver.run_tests(workspace.path()).await;
    if !baseline.output.success {
        rollback(&path, existing.as_deref()).await;
        let failing: Vec<&str> = baseline.tests.iter().map(|t| t.name.as_str()).collect();
        return Err(Error::new(
            ErrorKind::BaselineRegressed,
            format!(
                "new tests for {} regress the baseline ({})",
                target.id,
                if failing.is_empty() {
                    truncated(&baseline.output.stdout)
                } else {
                    failing.join(", ")
                }
            ),
        ));
    }

    Ok(CommittedTests {
        file_path: path,
        file_content: formatted,
    })
}

async fn rollback(path: &std::path::Path, previous: Option<&str>) {
    let result = match previous {
        Some(content) => tokio::fs::write(path, content).await,
        None => tokio::fs::remove_file(path).await,
    };
    if let Err(e) = result {
        tracing::warn!("failed to roll back {}: {}", path.display(), e);
    }
}

fn truncated(s: &str) -> String {
    const MAX: usize = 400;
    match s.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MethodFacts, TargetId};
    use crate::sandbox::SandboxManager;
    use tempfile::TempDir;

    fn sample_target() -> Target {
        Target {
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
        }
    }

    #[tokio::test]
    async fn test_test_file_path_follows_package() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir_all(project.join("src/main/java")).unwrap();
        let manager = SandboxManager::new(dir.path().join("sandbox")).unwrap();
        let workspace = manager.create_workspace(&project).await.unwrap();

        let path = test_file_path(&workspace, &sample_target());
        assert!(path.ends_with(
            "src/test/java/com/example/Calculator_divideTest.java"
        ));
    }

    #[test]
    fn test_render_fresh_class() {
        let rendered = render_test_class(
            Some("com.example"),
            "Calculator_divideTest",
            &["org.mockito.Mockito".to_string()],
            &["@Test\nvoid testDividesEvenly() {\n    assertEquals(5, new Calculator().divide(10, 2));\n}"],
        );

        assert!(rendered.starts_with("package com.example;"));
        assert!(rendered.contains("import org.junit.jupiter.api.Test;"));
        assert!(rendered.contains("import static org.junit.jupiter.api.Assertions.*;"));
        assert!(rendered.contains("import org.mockito.Mockito;"));
        assert!(rendered.contains("class Calculator_divideTest {"));
        assert!(rendered.contains("    @Test"));
        assert!(rendered.trim_end().ends_with('}'));
    }

    #[test]
    fn test_render_without_package() {
        let rendered = render_test_class(None, "TopLevel_runTest", &[], &["@Test\nvoid t() {}"]);
        assert!(!rendered.contains("package"));
        assert!(rendered.starts_with("import "));
    }

    #[test]
    fn test_merge_imports_skips_existing() {
        let content = "package com.example;\n\nimport org.junit.jupiter.api.Test;\n\nclass T {\n}\n";
        let merged = merge_imports(content, &["org.mockito.Mockito".to_string()]);

        assert_eq!(
            merged.matches("import org.junit.jupiter.api.Test;").count(),
            1
        );
        assert!(merged.contains("import org.mockito.Mockito;"));
        // New imports land after the existing import block.
        let test_pos = merged.find("import org.junit").unwrap();
        let mockito_pos = merged.find("import org.mockito").unwrap();
        assert!(mockito_pos > test_pos);
        let class_pos = merged.find("class T").unwrap();
        assert!(mockito_pos < class_pos);
    }

    #[test]
    fn test_merge_imports_no_change_when_all_present() {
        let content = "package p;\nimport org.junit.jupiter.api.Test;\nimport static org.junit.jupiter.api.Assertions.*;\nclass T {\n}\n";
        assert_eq!(merge_imports(content, &[]), content);
    }

    #[test]
    fn test_append_methods_before_closing_brace() {
        let content = "class T {\n    @Test\n    void existing() {}\n}\n";
        let appended = append_methods(content, &["@Test\nvoid fresh() {}"]).unwrap();

        assert!(appended.contains("void existing()"));
        assert!(appended.contains("    @Test\n    void fresh() {}"));
        let existing_pos = appended.find("void existing").unwrap();
        let fresh_pos = appended.find("void fresh").unwrap();
        assert!(fresh_pos > existing_pos);
        assert!(appended.trim_end().ends_with('}'));
    }

    #[test]
    fn test_append_methods_never_deletes() {
        let content = "class T {\n    void a() {}\n    void b() {}\n}\n";
        let appended = append_methods(content, &["void c() {}"]).unwrap();
        assert!(appended.contains("void a()"));
        assert!(appended.contains("void b()"));
        assert!(appended.contains("void c()"));
    }

    #[test]
    fn test_append_methods_rejects_braceless_file() {
        let err = append_methods("not java at all", &["void c() {}"]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalInvariant);
    }
}
