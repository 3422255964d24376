//! Typed prompt roles and schema validation of model responses.
//!
//! The planner only speaks to the model through these four roles; each has
//! a typed input and a typed, validated output. Responses that fail
//! validation are rejected before anything touches the workspace.

use crate::error::{Error, ErrorKind, Result};
use crate::models::{MutationPatch, SemanticTag, Target};
use serde::Deserialize;

/// The finite set of prompt roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    GenTestsInitial,
    GenTestsRefine,
    GenMutantsInitial,
    GenMutantsRefine,
}

impl PromptRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptRole::GenTestsInitial => "gen_tests_initial",
            PromptRole::GenTestsRefine => "gen_tests_refine",
            PromptRole::GenMutantsInitial => "gen_mutants_initial",
            PromptRole::GenMutantsRefine => "gen_mutants_refine",
        }
    }
}

impl std::fmt::Display for PromptRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A description of a surviving mutant, used to aim `refine` prompts.
#[derive(Debug, Clone)]
pub struct SurvivingMutantBrief {
    pub mutant_id: i64,
    pub line_start: u32,
    pub line_end: u32,
    pub original: String,
    pub mutated: String,
    pub tag: SemanticTag,
}

/// Everything a test-generation prompt needs.
pub struct TestPromptInput<'a> {
    pub target: &'a Target,
    /// Retrieval context; `None` when the knowledge base is disabled or
    /// returned no hits. The context section is omitted entirely then.
    pub context: Option<&'a str>,
    /// Names of test methods that already exist for this target.
    pub existing_test_methods: &'a [String],
    /// Surviving mutants to kill (refine role only).
    pub surviving_mutants: &'a [SurvivingMutantBrief],
}

/// Everything a mutant-generation prompt needs.
pub struct MutantPromptInput<'a> {
    pub target: &'a Target,
    pub context: Option<&'a str>,
    /// Patches already tried for this target, so the model avoids repeats.
    pub known_patches: &'a [MutationPatch],
}

/// One generated test method, schema-validated.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedTestMethod {
    pub name: String,
    /// Full method source including the `@Test` annotation.
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Validated response of a test-generation role.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedTests {
    #[serde(default)]
    pub imports: Vec<String>,
    pub methods: Vec<GeneratedTestMethod>,
}

#[derive(Debug, Deserialize)]
struct RawMutantPatch {
    line_start: u32,
    line_end: u32,
    original: String,
    mutated: String,
    #[serde(default)]
    tag: String,
    #[serde(default)]
    intent: String,
}

#[derive(Debug, Deserialize)]
struct RawMutantsResponse {
    mutants: Vec<RawMutantPatch>,
}

/// One validated mutant proposal: a patch plus its semantic tag.
#[derive(Debug, Clone)]
pub struct MutantProposal {
    pub patch: MutationPatch,
    pub tag: SemanticTag,
    pub intent: String,
}

/// Add absolute file line numbers so the model can cite exact ranges.
fn numbered_source(source: &str, first_line: u32) -> String {
    source
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:4} | {}", first_line + i as u32, line))
        .collect::<Vec<_>>()
        .join("\n")
}

const TEST_SYSTEM_PROMPT: &str = "You are an expert Java test engineer. You write focused JUnit 5 \
     unit tests that exercise boundaries, error paths, and contracts. \
     Respond with a single JSON object and nothing else.";

const MUTANT_SYSTEM_PROMPT: &str = "You are a mutation testing expert for Java. You propose small, \
     compilable semantic faults that plausible bugs would introduce. \
     Respond with a single JSON object and nothing else.";

/// Render the user prompt for a test-generation role.
pub fn render_test_prompt(role: PromptRole, input: &TestPromptInput<'_>) -> (String, String) {
    debug_assert!(matches!(
        role,
        PromptRole::GenTestsInitial | PromptRole::GenTestsRefine
    ));

    let target = input.target;
    let mut sections = Vec::new();

    sections.push(format!(
        "Write JUnit 5 test methods for this Java method.\n\n\
         Class: {}\n\
         Method: {}\n\
         Signature: {}",
        target.id.class_fqn, target.id.method_name, target.signature
    ));

    if let Some(javadoc) = &target.javadoc {
        sections.push(format!("Javadoc:\n{javadoc}"));
    }

    sections.push(format!(
        "Source (lines {}-{}):\n```\n{}\n```",
        target.line_start,
        target.line_end,
        numbered_source(&target.facts.source, target.line_start)
    ));

    if !target.collaborators.is_empty() {
        sections.push(format!(
            "Collaborators to mock (Mockito): {}",
            target.collaborators.join(", ")
        ));
    }

    if let Some(context) = input.context {
        sections.push(format!("Relevant knowledge:\n{context}"));
    }

    if !input.existing_test_methods.is_empty() {
        sections.push(format!(
            "Existing test methods (do NOT redefine these): {}",
            input.existing_test_methods.join(", ")
        ));
    }

    if role == PromptRole::GenTestsRefine && !input.surviving_mutants.is_empty() {
        let mut lines = vec![
            "These mutants currently SURVIVE the test suite. Write tests that fail on the \
             mutated code but pass on the original:"
                .to_string(),
        ];
        for m in input.surviving_mutants {
            lines.push(format!(
                "- mutant {} ({}) at lines {}-{}:\n  original: {}\n  mutated:  {}",
                m.mutant_id, m.tag, m.line_start, m.line_end, m.original, m.mutated
            ));
        }
        sections.push(lines.join("\n"));
    }

    sections.push(
        "Respond with JSON:\n\
         {\n\
           \"imports\": [\"fully.qualified.Import\"],\n\
           \"methods\": [\n\
             {\"name\": \"testMethodName\", \"code\": \"@Test\\nvoid testMethodName() { ... }\", \
              \"description\": \"what it checks\"}\n\
           ]\n\
         }\n\
         Each `code` value must be a complete method including its @Test annotation. \
         Tests must pass against the ORIGINAL (unmutated) implementation."
            .to_string(),
    );

    (TEST_SYSTEM_PROMPT.to_string(), sections.join("\n\n"))
}

/// Render the user prompt for a mutant-generation role.
pub fn render_mutant_prompt(role: PromptRole, input: &MutantPromptInput<'_>) -> (String, String) {
    debug_assert!(matches!(
        role,
        PromptRole::GenMutantsInitial | PromptRole::GenMutantsRefine
    ));

    let target = input.target;
    let mut sections = Vec::new();

    sections.push(format!(
        "Propose up to 3 small semantic mutations of this Java method.\n\n\
         Class: {}\n\
         Method: {}\n\
         Signature: {}",
        target.id.class_fqn, target.id.method_name, target.signature
    ));

    sections.push(format!(
        "Source (lines {}-{}):\n```\n{}\n```",
        target.line_start,
        target.line_end,
        numbered_source(&target.facts.source, target.line_start)
    ));

    if let Some(context) = input.context {
        sections.push(format!("Relevant knowledge:\n{context}"));
    }

    if !input.known_patches.is_empty() {
        let mut lines =
            vec!["Mutations already tried (propose DIFFERENT ones):".to_string()];
        for p in input.known_patches {
            lines.push(format!(
                "- lines {}-{}: {} -> {}",
                p.line_start, p.line_end, p.original_code, p.mutated_code
            ));
        }
        sections.push(lines.join("\n"));
    }

    if role == PromptRole::GenMutantsRefine {
        sections.push(
            "Previous mutants of this method were all killed. Aim for subtler faults: \
             boundary conditions, swallowed exceptions, off-by-one errors."
                .to_string(),
        );
    }

    sections.push(format!(
        "RULES:\n\
         - `original` must be copied EXACTLY from the lines cited (same whitespace).\n\
         - `mutated` must differ from `original` and still compile.\n\
         - line_start and line_end are 1-based, inclusive, and must lie within \
           lines {}-{}.\n\
         - tag is one of: null_check_removed, boundary_flipped, return_value_changed, \
           operator_swapped, exception_swallowed, off_by_one, other.\n\n\
         Respond with JSON:\n\
         {{\n\
           \"mutants\": [\n\
             {{\"line_start\": N, \"line_end\": N, \"original\": \"...\", \
              \"mutated\": \"...\", \"tag\": \"...\", \"intent\": \"what fault this encodes\"}}\n\
           ]\n\
         }}",
        target.line_start, target.line_end
    ));

    (MUTANT_SYSTEM_PROMPT.to_string(), sections.join("\n\n"))
}

/// Validate a test-generation response.
///
/// Rejects empty responses, duplicate or invalid method names, and methods
/// without an `@Test` annotation.
pub fn validate_tests(response: GeneratedTests) -> Result<GeneratedTests> {
    if response.methods.is_empty() {
        return Err(Error::new(
            ErrorKind::LlmMalformedResponse,
            "response contains no test methods",
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for method in &response.methods {
        if method.name.is_empty() || !is_java_identifier(&method.name) {
            return Err(Error::new(
                ErrorKind::LlmMalformedResponse,
                format!("invalid test method name '{}'", method.name),
            ));
        }
        if !seen.insert(method.name.as_str()) {
            return Err(Error::new(
                ErrorKind::LlmMalformedResponse,
                format!("duplicate test method name '{}'", method.name),
            ));
        }
        if !method.code.contains("@Test") {
            return Err(Error::new(
                ErrorKind::LlmMalformedResponse,
                format!("method '{}' is missing an @Test annotation", method.name),
            ));
        }
    }

    Ok(response)
}

/// Parse and validate a mutant-generation response against its target.
///
/// Structurally broken proposals (inverted ranges, identity mutations,
/// out-of-range lines) are dropped with a warning rather than failing the
/// whole response; an entirely unusable response is an error.
pub fn validate_mutants(
    raw: serde_json::Value,
    target: &Target,
) -> Result<Vec<MutantProposal>> {
    let parsed: RawMutantsResponse = serde_json::from_value(raw).map_err(|e| {
        Error::new(
            ErrorKind::LlmMalformedResponse,
            format!("mutant response schema mismatch: {e}"),
        )
    })?;

    if parsed.mutants.is_empty() {
        return Err(Error::new(
            ErrorKind::LlmMalformedResponse,
            "response contains no mutants",
        ));
    }

    let total = parsed.mutants.len();
    let mut proposals = Vec::new();

    for raw in parsed.mutants {
        let patch = MutationPatch {
            file_path: target.file_path.clone(),
            line_start: raw.line_start,
            line_end: raw.line_end,
            original_code: raw.original,
            mutated_code: raw.mutated,
        };

        if !patch.is_well_formed() {
            tracing::warn!(
                target_id = %target.id,
                "dropping malformed mutant proposal at lines {}-{}",
                patch.line_start,
                patch.line_end
            );
            continue;
        }
        if !target.contains_lines(patch.line_start, patch.line_end) {
            tracing::warn!(
                target_id = %target.id,
                "dropping mutant proposal outside method range: {}-{} not in {}-{}",
                patch.line_start,
                patch.line_end,
                target.line_start,
                target.line_end
            );
            continue;
        }

        proposals.push(MutantProposal {
            patch,
            tag: SemanticTag::parse_lenient(&raw.tag),
            intent: raw.intent,
        });
    }

    if proposals.is_empty() {
        return Err(Error::new(
            ErrorKind::LlmMalformedResponse,
            format!("all {total} mutant proposals failed validation"),
        ));
    }

    Ok(proposals)
}

fn is_java_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}
