//! Bridge to the external structural analyzer.
//!
//! The analyzer is a separate JVM tool that enumerates public methods,
//! reports per-method structural facts, and structurally validates
//! generated test sources. It prints JSON on stdout; build-tool noise may
//! pollute the stream, so parsing falls back to the last JSON object in
//! the output.

pub mod format;

use crate::error::{Error, ErrorKind, Result};
use crate::models::MethodFacts;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// A public method declaration as enumerated by the analyzer.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodDecl {
    pub name: String,
    pub signature: String,
    #[serde(default)]
    pub param_types: Vec<String>,
    pub line_start: u32,
    pub line_end: u32,
    #[serde(default)]
    pub javadoc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PublicMethodsResponse {
    methods: Vec<MethodDecl>,
}

/// Full structural analysis of one method.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodAnalysis {
    pub signature: String,
    #[serde(default)]
    pub javadoc: Option<String>,
    pub source: String,
    pub line_start: u32,
    pub line_end: u32,
    #[serde(default)]
    pub null_checks: Vec<u32>,
    #[serde(default)]
    pub boundary_checks: Vec<u32>,
    #[serde(default)]
    pub exception_handling: Vec<String>,
    #[serde(default)]
    pub method_calls: Vec<String>,
    #[serde(default)]
    pub cyclomatic_complexity: u32,
    /// Collaborator types that tests must mock, in declaration order.
    #[serde(default)]
    pub collaborators: Vec<String>,
}

impl MethodAnalysis {
    pub fn facts(&self) -> MethodFacts {
        MethodFacts {
            source: self.source.clone(),
            null_checks: self.null_checks.clone(),
            boundary_checks: self.boundary_checks.clone(),
            exception_handling: self.exception_handling.clone(),
            method_calls: self.method_calls.clone(),
            cyclomatic_complexity: self.cyclomatic_complexity,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Bridge to the analyzer tool.
#[derive(Debug)]
pub struct AnalyzerBridge {
    java_cmd: String,
    runtime_jar: PathBuf,
    timeout: Duration,
}

impl AnalyzerBridge {
    /// Create the bridge. A missing analyzer jar is a fatal startup error.
    pub fn new(java_cmd: &str, runtime_jar: &Path, timeout: Duration) -> Result<Self> {
        if !runtime_jar.is_file() {
            return Err(Error::new(
                ErrorKind::ExternalToolMissing,
                format!("analyzer jar not found: {}", runtime_jar.display()),
            ));
        }
        Ok(Self {
            java_cmd: java_cmd.to_string(),
            runtime_jar: runtime_jar.to_path_buf(),
            timeout,
        })
    }

    async fn run_tool(&self, args: &[&str]) -> Result<String> {
        let child = Command::new(&self.java_cmd)
            .arg("-cp")
            .arg(&self.runtime_jar)
            .arg("dev.coevo.analyzer.CodeAnalyzer")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::new(
                    ErrorKind::ExternalToolMissing,
                    format!("failed to spawn {}: {e}", self.java_cmd),
                )
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::new(
                    ErrorKind::Timeout,
                    format!("analyzer timed out after {:?}", self.timeout),
                )
            })?
            .map_err(|e| Error::new(ErrorKind::AnalyzerParseFailed, format!("analyzer: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let detail = if stderr.is_empty() { &stdout } else { &stderr };
            return Err(Error::new(
                ErrorKind::AnalyzerParseFailed,
                format!(
                    "analyzer exited {}: {}",
                    output.status.code().unwrap_or(-1),
                    detail
                ),
            ));
        }

        Ok(stdout)
    }

    fn parse_response<T: serde::de::DeserializeOwned>(stdout: &str) -> Result<T> {
        let json = recover_json(stdout).ok_or_else(|| {
            let preview: String = stdout.chars().take(200).collect();
            Error::new(
                ErrorKind::AnalyzerParseFailed,
                format!("no JSON in analyzer output: {preview}"),
            )
        })?;
        serde_json::from_str(json).map_err(|e| {
            Error::new(
                ErrorKind::AnalyzerParseFailed,
                format!("analyzer response schema mismatch: {e}"),
            )
        })
    }

    /// Enumerate the public methods of a class file.
    pub async fn public_methods(&self, file: &Path) -> Result<Vec<MethodDecl>> {
        let file_arg = file.display().to_string();
        let stdout = self.run_tool(&["publicMethods", &file_arg]).await?;
        let response: PublicMethodsResponse = Self::parse_response(&stdout)?;
        Ok(response.methods)
    }

    /// Analyze one method's structure.
    pub async fn analyze_method(&self, file: &Path, method_name: &str) -> Result<MethodAnalysis> {
        let file_arg = file.display().to_string();
        let stdout = self
            .run_tool(&["analyze", &file_arg, method_name])
            .await?;
        Self::parse_response(&stdout)
    }

    /// Structurally validate generated test source before it is written
    /// into the workspace.
    pub async fn validate_test(&self, source: &str) -> Result<()> {
        let temp_path = std::env::temp_dir().join(format!(
            "coevo-validate-{}-{}.java",
            std::process::id(),
            source.len()
        ));
        tokio::fs::write(&temp_path, source).await?;

        let file_arg = temp_path.display().to_string();
        let result = self.run_tool(&["validateTest", &file_arg]).await;
        let _ = tokio::fs::remove_file(&temp_path).await;

        let response: ValidateResponse = Self::parse_response(&result?)?;
        if response.valid {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::AnalyzerParseFailed,
                response
                    .error
                    .unwrap_or_else(|| "generated test failed structural validation".into()),
            ))
        }
    }
}

/// Recover a JSON object from possibly polluted stdout: the whole trimmed
/// output if it is an object, otherwise the suffix starting at the last
/// `{`.
fn recover_json(stdout: &str) -> Option<&str> {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }
    let last_brace = trimmed.rfind('{')?;
    let candidate = trimmed[last_brace..].trim();
    if candidate.ends_with('}') {
        Some(candidate)
    } else {
        None
    }
}
