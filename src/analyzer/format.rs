//! Formatter bridge: google-java-format over stdin/stdout.

use crate::config::FormatStyle;
use crate::error::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Formats generated test sources before they enter the workspace.
#[derive(Debug)]
pub struct Formatter {
    java_cmd: String,
    jar: PathBuf,
    style: FormatStyle,
    timeout: Duration,
}

impl Formatter {
    /// Create the formatter. A missing jar is a fatal startup error.
    pub fn new(
        java_cmd: &str,
        jar: &Path,
        style: FormatStyle,
        timeout: Duration,
    ) -> Result<Self> {
        if !jar.is_file() {
            return Err(Error::new(
                ErrorKind::ExternalToolMissing,
                format!("formatter jar not found: {}", jar.display()),
            ));
        }
        Ok(Self {
            java_cmd: java_cmd.to_string(),
            jar: jar.to_path_buf(),
            style,
            timeout,
        })
    }

    /// Format Java source. Returns `format_failed` on any formatter
    /// rejection (typically unparseable source).
    pub async fn format_source(&self, source: &str) -> Result<String> {
        let mut command = Command::new(&self.java_cmd);
        command.arg("-jar").arg(&self.jar);
        if self.style == FormatStyle::Aosp {
            command.arg("--aosp");
        }
        command.arg("-");

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::new(
                    ErrorKind::ExternalToolMissing,
                    format!("failed to spawn formatter: {e}"),
                )
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            Error::new(ErrorKind::FormatFailed, "formatter stdin unavailable")
        })?;
        stdin.write_all(source.as_bytes()).await.map_err(|e| {
            Error::new(ErrorKind::FormatFailed, format!("formatter stdin: {e}"))
        })?;
        drop(stdin);

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::new(
                    ErrorKind::Timeout,
                    format!("formatter timed out after {:?}", self.timeout),
                )
            })?
            .map_err(|e| Error::new(ErrorKind::FormatFailed, format!("formatter: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::new(
                ErrorKind::FormatFailed,
                format!("formatter rejected source: {}", stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_requires_jar() {
        let err = Formatter::new(
            "java",
            Path::new("/nonexistent/gjf.jar"),
            FormatStyle::Google,
            Duration::from_secs(10),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExternalToolMissing);
    }

    #[test]
    fn test_new_accepts_existing_jar() {
        let dir = TempDir::new().unwrap();
        let jar = dir.path().join("gjf.jar");
        std::fs::write(&jar, b"PK").unwrap();
        assert!(Formatter::new("java", &jar, FormatStyle::Aosp, Duration::from_secs(10)).is_ok());
    }
}
