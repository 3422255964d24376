//! Bug-report ingestion.
//!
//! Accepts `.md` (with optional YAML front-matter), `.txt`, `.diff`, and
//! `.patch` files. Parsing is permissive: unknown structure degrades to
//! generic prose, never to an error for the whole directory.

use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

const SUPPORTED_EXTENSIONS: [&str; 4] = ["md", "txt", "diff", "patch"];

/// A parsed bug report, ready for chunking and indexing.
#[derive(Debug, Clone)]
pub struct BugReport {
    pub id: String,
    pub title: String,
    pub file_path: String,
    pub content: String,
    pub file_type: String,
    /// Tags from front-matter and/or a `## Tags` / `## 标签` section.
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

/// Parses bug-report files into [`BugReport`]s.
#[derive(Default)]
pub struct BugReportParser {
    id_counter: u32,
}

impl BugReportParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self, path: &Path) -> String {
        self.id_counter += 1;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "report".to_string());
        format!("bug_{}_{}", stem, self.id_counter)
    }

    /// Parse a single file. Returns `None` for unsupported extensions or
    /// unreadable files (logged, not fatal).
    pub fn parse_file(&mut self, path: &Path) -> Option<BugReport> {
        let extension = path.extension()?.to_string_lossy().to_lowercase();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            tracing::debug!("skipping unsupported bug report type: {}", path.display());
            return None;
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("failed to read bug report {}: {}", path.display(), e);
                return None;
            }
        };

        let (metadata, content) = if extension == "md" {
            parse_front_matter(&raw)
        } else {
            (HashMap::new(), raw)
        };

        let mut tags = metadata
            .get("tags")
            .map(|t| split_tags(t))
            .unwrap_or_default();
        for tag in extract_tags_section(&content) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let title = extract_title(&content, path, &metadata);

        Some(BugReport {
            id: self.next_id(path),
            title,
            file_path: path.display().to_string(),
            content: content.trim().to_string(),
            file_type: extension,
            tags,
            metadata,
        })
    }

    /// Parse every supported file under a directory (recursive).
    pub fn parse_directory(&mut self, directory: &Path) -> Vec<BugReport> {
        if !directory.is_dir() {
            tracing::warn!("bug report directory does not exist: {}", directory.display());
            return Vec::new();
        }

        let mut reports = Vec::new();
        for entry in WalkDir::new(directory)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if let Some(report) = self.parse_file(entry.path()) {
                reports.push(report);
            }
        }

        tracing::info!(
            "parsed {} bug reports from {}",
            reports.len(),
            directory.display()
        );
        reports
    }
}

/// Title precedence: front-matter `title` > first `# ` heading > file name.
fn extract_title(content: &str, path: &Path, metadata: &HashMap<String, String>) -> String {
    if let Some(title) = metadata.get("title") {
        return title.clone();
    }

    for line in content.lines() {
        let line = line.trim();
        if let Some(heading) = line.strip_prefix("# ") {
            return heading.trim().to_string();
        }
    }

    path.file_stem()
        .map(|s| s.to_string_lossy().replace(['-', '_'], " "))
        .unwrap_or_else(|| "untitled".to_string())
}

/// Permissive YAML front-matter parse: flat `key: value` pairs and simple
/// `- item` lists only. Returns (metadata, remaining content).
fn parse_front_matter(raw: &str) -> (HashMap<String, String>, String) {
    let mut lines = raw.lines();
    if lines.next().map(|l| l.trim()) != Some("---") {
        return (HashMap::new(), raw.to_string());
    }

    let mut metadata = HashMap::new();
    let mut current_key: Option<String> = None;
    let mut list_items: Vec<String> = Vec::new();
    let mut consumed = 1usize;
    let mut closed = false;

    for line in lines {
        consumed += 1;
        let trimmed = line.trim();

        if trimmed == "---" {
            closed = true;
            break;
        }

        if let Some(item) = trimmed.strip_prefix("- ") {
            if current_key.is_some() {
                list_items.push(item.trim().to_string());
            }
            continue;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            if let Some(prev_key) = current_key.take() {
                if !list_items.is_empty() {
                    metadata.insert(prev_key, list_items.join(","));
                    list_items = Vec::new();
                }
            }

            let key = key.trim().to_string();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if value.is_empty() {
                current_key = Some(key);
            } else {
                metadata.insert(key, value.to_string());
            }
        }
    }

    if let Some(prev_key) = current_key {
        if !list_items.is_empty() {
            metadata.insert(prev_key, list_items.join(","));
        }
    }

    if !closed {
        // Unterminated front-matter: treat the whole file as content.
        return (HashMap::new(), raw.to_string());
    }

    let content = raw
        .lines()
        .skip(consumed)
        .collect::<Vec<_>>()
        .join("\n");
    (metadata, content)
}

/// Extract tags from a `## Tags` or `## 标签` section: list items or
/// comma/space separated words, up to the next heading.
fn extract_tags_section(content: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut in_section = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("##") {
            let heading = trimmed.trim_start_matches('#').trim().to_lowercase();
            in_section = heading == "tags" || heading == "标签";
            continue;
        }
        if trimmed.starts_with('#') {
            in_section = false;
            continue;
        }
        if !in_section || trimmed.is_empty() {
            continue;
        }

        let stripped = trimmed.strip_prefix("- ").unwrap_or(trimmed);
        for tag in split_tags(stripped) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
    }

    tags
}

fn split_tags(s: &str) -> Vec<String> {
    s.split([',', ' '])
        .map(|t| t.trim().trim_start_matches('`').trim_end_matches('`'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_markdown_with_front_matter() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "BUG-002.md",
            "---\ntitle: Negative stock accepted\nseverity: high\ntags:\n  - boundary\n  - validation\n---\n# Ignored heading\n\naddStock accepts quantity 0 incorrectly.",
        );

        let mut parser = BugReportParser::new();
        let report = parser.parse_file(&path).unwrap();
        assert_eq!(report.title, "Negative stock accepted");
        assert_eq!(report.metadata.get("severity").unwrap(), "high");
        assert!(report.tags.contains(&"boundary".to_string()));
        assert!(report.tags.contains(&"validation".to_string()));
        assert!(report.content.contains("addStock"));
        assert!(!report.content.contains("---"));
    }

    #[test]
    fn test_parse_markdown_tags_section() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "report.md",
            "# NPE in parser\n\nCrash on empty input.\n\n## Tags\n\n- null-check\n- validation\n\n## Fix\n\nGuard the argument.",
        );

        let mut parser = BugReportParser::new();
        let report = parser.parse_file(&path).unwrap();
        assert_eq!(report.title, "NPE in parser");
        assert_eq!(report.tags, vec!["null-check", "validation"]);
    }

    #[test]
    fn test_parse_chinese_tags_heading() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "report.md",
            "# 越界问题\n\n数量检查有误。\n\n## 标签\n\nboundary overflow",
        );

        let mut parser = BugReportParser::new();
        let report = parser.parse_file(&path).unwrap();
        assert_eq!(report.tags, vec!["boundary", "overflow"]);
    }

    #[test]
    fn test_parse_plain_text_uses_file_name_title() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "race-condition-notes.txt", "thread A and B both write");

        let mut parser = BugReportParser::new();
        let report = parser.parse_file(&path).unwrap();
        assert_eq!(report.title, "race condition notes");
        assert_eq!(report.file_type, "txt");
        assert!(report.tags.is_empty());
    }

    #[test]
    fn test_parse_diff_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "fix.diff",
            "--- a/Inventory.java\n+++ b/Inventory.java\n@@ -8,1 +8,1 @@\n-if (quantity < 0) {\n+if (quantity <= 0) {",
        );

        let mut parser = BugReportParser::new();
        let report = parser.parse_file(&path).unwrap();
        assert_eq!(report.file_type, "diff");
        assert!(report.content.contains("quantity <= 0"));
    }

    #[test]
    fn test_unsupported_extension_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "notes.rs", "fn main() {}");

        let mut parser = BugReportParser::new();
        assert!(parser.parse_file(&path).is_none());
    }

    #[test]
    fn test_unterminated_front_matter_treated_as_content() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "odd.md", "---\ntitle: unclosed\n\nbody text");

        let mut parser = BugReportParser::new();
        let report = parser.parse_file(&path).unwrap();
        assert!(report.content.contains("title: unclosed"));
        assert!(report.metadata.is_empty());
    }

    #[test]
    fn test_parse_directory_recurses_and_filters() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write_file(&dir, "a.md", "# A\n\ncontent");
        write_file(&dir, "b.txt", "content b");
        write_file(&dir, "ignored.java", "class X {}");
        std::fs::write(dir.path().join("nested/c.patch"), "+ patched").unwrap();

        let mut parser = BugReportParser::new();
        let reports = parser.parse_directory(dir.path());
        assert_eq!(reports.len(), 3);
    }

    #[test]
    fn test_parse_directory_missing_returns_empty() {
        let mut parser = BugReportParser::new();
        let reports = parser.parse_directory(Path::new("/nonexistent/dir"));
        assert!(reports.is_empty());
    }
}
