//! Project scanner: enumerates production classes and their public methods.
//!
//! Walks the Maven source layout, derives class FQNs from file paths, and
//! asks the analyzer bridge for method declarations and structural facts,
//! producing the stable target identifiers the planner schedules.

use crate::analyzer::AnalyzerBridge;
use crate::error::Result;
use crate::models::{Target, TargetId};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const MAIN_SOURCE_ROOT: &str = "src/main/java";

/// A production class discovered in the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedClass {
    pub class_fqn: String,
    /// Path relative to the project root.
    pub file_path: PathBuf,
}

/// Find all production Java sources under `src/main/java`, sorted by FQN
/// for deterministic target ordering.
pub fn find_production_classes(project_path: &Path) -> Vec<ScannedClass> {
    let source_root = project_path.join(MAIN_SOURCE_ROOT);
    if !source_root.is_dir() {
        tracing::warn!("no production source root at {}", source_root.display());
        return Vec::new();
    }

    let mut classes: Vec<ScannedClass> = WalkDir::new(&source_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "java"))
        .filter_map(|e| {
            let fqn = fqn_from_path(&source_root, e.path())?;
            let relative = e.path().strip_prefix(project_path).ok()?;
            Some(ScannedClass {
                class_fqn: fqn,
                file_path: relative.to_path_buf(),
            })
        })
        .collect();

    classes.sort_by(|a, b| a.class_fqn.cmp(&b.class_fqn));
    classes
}

/// Derive a class FQN from its path under the source root:
/// `src/main/java/com/example/Calculator.java` → `com.example.Calculator`.
fn fqn_from_path(source_root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(source_root).ok()?;
    let stem = relative.file_stem()?.to_str()?;
    if stem == "package-info" || stem == "module-info" {
        return None;
    }

    let mut parts: Vec<String> = relative
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| c.as_os_str().to_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    parts.push(stem.to_string());
    Some(parts.join("."))
}

/// Scans the project and produces fully-analyzed targets.
pub struct Scanner<'a> {
    analyzer: &'a AnalyzerBridge,
}

impl<'a> Scanner<'a> {
    pub fn new(analyzer: &'a AnalyzerBridge) -> Self {
        Self { analyzer }
    }

    /// Enumerate every public method of every production class as a
    /// [`Target`]. Classes the analyzer cannot parse are skipped with a
    /// warning; a project with zero analyzable classes yields an empty
    /// list, which the caller treats as "nothing to do".
    pub async fn scan(&self, project_path: &Path) -> Result<Vec<Target>> {
        let classes = find_production_classes(project_path);
        tracing::info!("found {} production classes", classes.len());

        let mut targets = Vec::new();
        for class in &classes {
            let absolute = project_path.join(&class.file_path);
            let methods = match self.analyzer.public_methods(&absolute).await {
                Ok(methods) => methods,
                Err(e) => {
                    tracing::warn!("skipping {}: {}", class.class_fqn, e);
                    continue;
                }
            };

            for decl in methods {
                let analysis = match self.analyzer.analyze_method(&absolute, &decl.name).await {
                    Ok(analysis) => analysis,
                    Err(e) => {
                        tracing::warn!("skipping {}.{}: {}", class.class_fqn, decl.name, e);
                        continue;
                    }
                };

                targets.push(Target {
                    id: TargetId::new(
                        class.class_fqn.clone(),
                        decl.name.clone(),
                        decl.param_types.clone(),
                    ),
                    file_path: class.file_path.display().to_string(),
                    line_start: analysis.line_start,
                    line_end: analysis.line_end,
                    signature: analysis.signature.clone(),
                    javadoc: analysis.javadoc.clone().or(decl.javadoc.clone()),
                    collaborators: analysis.collaborators.clone(),
                    facts: analysis.facts(),
                });
            }
        }

        // Scan order is part of the planner's deterministic tie-break.
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::info!("scan produced {} targets", targets.len());
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fqn_from_path() {
        let root = Path::new("/p/src/main/java");
        assert_eq!(
            fqn_from_path(root, Path::new("/p/src/main/java/com/example/Calculator.java")),
            Some("com.example.Calculator".to_string())
        );
        assert_eq!(
            fqn_from_path(root, Path::new("/p/src/main/java/TopLevel.java")),
            Some("TopLevel".to_string())
        );
    }

    #[test]
    fn test_fqn_skips_package_info() {
        let root = Path::new("/p/src/main/java");
        assert_eq!(
            fqn_from_path(root, Path::new("/p/src/main/java/com/example/package-info.java")),
            None
        );
        assert_eq!(
            fqn_from_path(root, Path::new("/p/src/main/java/module-info.java")),
            None
        );
    }

    #[test]
    fn test_find_production_classes_sorted() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src/main/java/com/example");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("Zebra.java"), "class Zebra {}").unwrap();
        std::fs::write(source.join("Alpha.java"), "class Alpha {}").unwrap();
        std::fs::write(source.join("notes.txt"), "not java").unwrap();

        let classes = find_production_classes(dir.path());
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].class_fqn, "com.example.Alpha");
        assert_eq!(classes[1].class_fqn, "com.example.Zebra");
        assert_eq!(
            classes[0].file_path,
            PathBuf::from("src/main/java/com/example/Alpha.java")
        );
    }

    #[test]
    fn test_find_production_classes_ignores_tests() {
        let dir = TempDir::new().unwrap();
        let test_source = dir.path().join("src/test/java/com/example");
        std::fs::create_dir_all(&test_source).unwrap();
        std::fs::write(test_source.join("AlphaTest.java"), "class AlphaTest {}").unwrap();

        assert!(find_production_classes(dir.path()).is_empty());
    }

    #[test]
    fn test_find_production_classes_missing_root() {
        let dir = TempDir::new().unwrap();
        assert!(find_production_classes(dir.path()).is_empty());
    }
}
