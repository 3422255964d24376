//! Chunking strategies for code and prose.
//!
//! Code is chunked at method granularity: one chunk per method, boundaries
//! never crossed. A method longer than the token budget becomes a single
//! oversized chunk rather than being split. Prose is chunked into
//! heading-bounded windows with one paragraph of overlap.

/// Rough token estimate: ~4 characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        (chars / 4).max(1)
    }
}

/// A method's position within its class source (1-based, inclusive).
#[derive(Debug, Clone)]
pub struct MethodSpan {
    pub name: String,
    pub line_start: u32,
    pub line_end: u32,
}

/// A chunk of class source: either one method or the class-level remainder
/// (fields, class javadoc).
#[derive(Debug, Clone, PartialEq)]
pub struct CodeChunk {
    pub content: String,
    /// `None` for the class-level chunk.
    pub method_name: Option<String>,
    pub line_start: u32,
    pub line_end: u32,
}

/// A window of prose under one heading.
#[derive(Debug, Clone, PartialEq)]
pub struct ProseChunk {
    pub heading: Option<String>,
    pub content: String,
}

/// Chunk class source at method granularity.
///
/// Every span becomes exactly one chunk regardless of size. Lines covered by
/// no span form the class-level chunk (emitted first when non-empty).
pub fn chunk_code(source: &str, methods: &[MethodSpan]) -> Vec<CodeChunk> {
    let lines: Vec<&str> = source.lines().collect();
    let total_lines = lines.len() as u32;
    let mut chunks = Vec::new();

    let mut covered = vec![false; lines.len()];
    for span in methods {
        let start = span.line_start.max(1);
        let end = span.line_end.min(total_lines);
        for line in start..=end {
            if let Some(slot) = covered.get_mut(line as usize - 1) {
                *slot = true;
            }
        }
    }

    // Class-level chunk: everything outside method bodies.
    let class_level: Vec<&str> = lines
        .iter()
        .enumerate()
        .filter(|(i, _)| !covered[*i])
        .map(|(_, l)| *l)
        .collect();
    let class_content = class_level.join("\n");
    if !class_content.trim().is_empty() {
        chunks.push(CodeChunk {
            content: class_content,
            method_name: None,
            line_start: 1,
            line_end: total_lines,
        });
    }

    for span in methods {
        let start = span.line_start.max(1) as usize;
        let end = (span.line_end.min(total_lines) as usize).max(start);
        if start > lines.len() {
            continue;
        }
        let content = lines[start - 1..end.min(lines.len())].join("\n");
        chunks.push(CodeChunk {
            content,
            method_name: Some(span.name.clone()),
            line_start: span.line_start,
            line_end: span.line_end,
        });
    }

    chunks
}

/// Chunk prose into heading-bounded windows of at most `max_tokens`, with
/// one paragraph of overlap between consecutive windows of the same section.
pub fn chunk_prose(text: &str, max_tokens: usize) -> Vec<ProseChunk> {
    let mut chunks = Vec::new();

    for section in split_sections(text) {
        let paragraphs = split_paragraphs(&section.body);
        if paragraphs.is_empty() {
            continue;
        }

        let mut window: Vec<String> = Vec::new();
        let mut window_tokens = 0usize;

        for paragraph in paragraphs {
            let tokens = estimate_tokens(&paragraph);

            if window_tokens + tokens > max_tokens && !window.is_empty() {
                chunks.push(make_prose_chunk(&section.heading, &window));
                // One-paragraph overlap into the next window.
                let carry = window.pop().expect("window is non-empty");
                let carry_tokens = estimate_tokens(&carry);
                window = vec![carry];
                window_tokens = carry_tokens;
            }

            window_tokens += tokens;
            window.push(paragraph);
        }

        if !window.is_empty() {
            chunks.push(make_prose_chunk(&section.heading, &window));
        }
    }

    chunks
}

struct Section {
    heading: Option<String>,
    body: String,
}

/// Split text at Markdown headings. Content before the first heading forms
/// a heading-less section.
fn split_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut heading: Option<String> = None;
    let mut body: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim_start().starts_with('#') {
            if !body.iter().all(|l| l.trim().is_empty()) || heading.is_some() {
                sections.push(Section {
                    heading: heading.take(),
                    body: body.join("\n"),
                });
            }
            heading = Some(line.trim_start_matches('#').trim().to_string());
            body = Vec::new();
        } else {
            body.push(line);
        }
    }

    if heading.is_some() || !body.iter().all(|l| l.trim().is_empty()) {
        sections.push(Section {
            heading,
            body: body.join("\n"),
        });
    }

    sections
}

fn split_paragraphs(body: &str) -> Vec<String> {
    body.split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

fn make_prose_chunk(heading: &Option<String>, paragraphs: &[String]) -> ProseChunk {
    ProseChunk {
        heading: heading.clone(),
        content: paragraphs.join("\n\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASS_SOURCE: &str = "\
package com.example;

/** Inventory bookkeeping. */
public class Inventory {
    private final Map<String, Integer> stock = new HashMap<>();

    public void addStock(String product, int quantity) {
        if (quantity < 0) {
            throw new IllegalArgumentException(\"negative quantity\");
        }
        stock.merge(product, quantity, Integer::sum);
    }

    public int available(String product) {
        return stock.getOrDefault(product, 0);
    }
}";

    fn spans() -> Vec<MethodSpan> {
        vec![
            MethodSpan {
                name: "addStock".into(),
                line_start: 7,
                line_end: 12,
            },
            MethodSpan {
                name: "available".into(),
                line_start: 14,
                line_end: 16,
            },
        ]
    }

    #[test]
    fn test_chunk_code_one_chunk_per_method() {
        let chunks = chunk_code(CLASS_SOURCE, &spans());
        let method_chunks: Vec<_> = chunks
            .iter()
            .filter(|c| c.method_name.is_some())
            .collect();
        assert_eq!(method_chunks.len(), 2);
        assert!(method_chunks[0].content.contains("addStock"));
        assert!(method_chunks[0].content.contains("IllegalArgumentException"));
        assert!(method_chunks[1].content.contains("getOrDefault"));
    }

    #[test]
    fn test_chunk_code_never_splits_method_body() {
        // An absurdly small budget has no effect on code chunks; the whole
        // method stays together.
        let chunks = chunk_code(CLASS_SOURCE, &spans());
        let add_stock = chunks
            .iter()
            .find(|c| c.method_name.as_deref() == Some("addStock"))
            .unwrap();
        assert!(add_stock.content.starts_with("    public void addStock"));
        assert!(add_stock.content.ends_with("}"));
    }

    #[test]
    fn test_chunk_code_class_level_chunk_has_fields_and_javadoc() {
        let chunks = chunk_code(CLASS_SOURCE, &spans());
        let class_chunk = chunks.iter().find(|c| c.method_name.is_none()).unwrap();
        assert!(class_chunk.content.contains("Inventory bookkeeping"));
        assert!(class_chunk.content.contains("private final Map"));
        assert!(!class_chunk.content.contains("addStock(String"));
    }

    #[test]
    fn test_chunk_code_no_methods() {
        let chunks = chunk_code("public class Empty {}", &[]);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].method_name.is_none());
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens(&"a".repeat(400)), 100);
    }

    #[test]
    fn test_chunk_prose_heading_bounded() {
        let text = "# Problem\n\nIt crashes.\n\n# Fix\n\nCheck for null.";
        let chunks = chunk_prose(text, 500);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].heading.as_deref(), Some("Problem"));
        assert_eq!(chunks[1].heading.as_deref(), Some("Fix"));
        assert!(chunks[1].content.contains("Check for null"));
    }

    #[test]
    fn test_chunk_prose_windows_overlap_one_paragraph() {
        let p1 = "alpha ".repeat(100);
        let p2 = "beta ".repeat(100);
        let p3 = "gamma ".repeat(100);
        let text = format!("# Long\n\n{}\n\n{}\n\n{}", p1.trim(), p2.trim(), p3.trim());
        // Each paragraph is ~150 tokens; budget of 300 fits two.
        let chunks = chunk_prose(&text, 300);
        assert!(chunks.len() >= 2);
        // The last paragraph of a window re-appears as the first of the next.
        let first_end = chunks[0].content.split("\n\n").last().unwrap().to_string();
        let second_start = chunks[1].content.split("\n\n").next().unwrap().to_string();
        assert_eq!(first_end, second_start);
    }

    #[test]
    fn test_chunk_prose_content_before_heading() {
        let text = "preamble text\n\n# Section\n\nbody";
        let chunks = chunk_prose(text, 500);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].heading, None);
        assert!(chunks[0].content.contains("preamble"));
    }

    #[test]
    fn test_chunk_prose_empty() {
        assert!(chunk_prose("", 500).is_empty());
        assert!(chunk_prose("\n\n\n", 500).is_empty());
    }
}
