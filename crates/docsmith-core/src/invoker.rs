//! Runs external conversion tools against a request's artifact namespace.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::ConversionError;
use crate::artifact::{ArtifactScope, list_owned};
use crate::tools::ToolSpec;

/// What a finished tool left behind.
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    /// Every path in the request's namespace after the tool exited.
    pub written: Vec<PathBuf>,
}

/// One invocation: binary, arguments, and where to run it.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub binary: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            current_dir: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Classify a failed run by its diagnostic text.
///
/// Only the tool's documented malformed-input patterns count as client
/// errors; every other failure is the environment's fault.
pub fn classify_failure(tool: &ToolSpec, diagnostic: &str) -> ConversionError {
    let diagnostic = diagnostic.trim();
    if let Some(pattern) = tool
        .malformed_input_patterns
        .iter()
        .find(|p| diagnostic.contains(**p))
    {
        tracing::debug!(tool = tool.name, pattern = %pattern, "tool rejected payload");
        return ConversionError::ClientInput(format!(
            "{} could not read the document",
            tool.name
        ));
    }
    ConversionError::environment(tool.name, diagnostic)
}

fn spawn_error(tool: &ToolSpec, binary: &Path, err: std::io::Error) -> ConversionError {
    let message = match err.kind() {
        ErrorKind::NotFound => format!("binary not found at {}", binary.display()),
        ErrorKind::PermissionDenied => {
            format!("permission denied executing {}", binary.display())
        }
        _ => format!("failed to start {}: {}", binary.display(), err),
    };
    ConversionError::environment(tool.name, message)
}

/// Run `invocation` to completion and record what it wrote in `scope`.
///
/// The wait suspends only this request. If the returned future is dropped
/// the child is killed. The namespace listing is taken on success and on
/// failure, so partial output is always registered for cleanup.
pub async fn invoke(
    tool: &ToolSpec,
    invocation: &Invocation,
    scope: &mut ArtifactScope,
) -> Result<ToolOutput, ConversionError> {
    let result = run(tool, invocation).await;

    let written = list_owned(scope.handle());
    scope.register_all(written.iter().cloned());

    match result {
        Ok((stdout, stderr)) => {
            scope.mark_produced();
            Ok(ToolOutput {
                stdout,
                stderr,
                written,
            })
        }
        Err(e) => {
            scope.mark_failed();
            Err(e)
        }
    }
}

async fn run(
    tool: &ToolSpec,
    invocation: &Invocation,
) -> Result<(Vec<u8>, String), ConversionError> {
    let mut command = Command::new(&invocation.binary);
    command
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &invocation.current_dir {
        command.current_dir(dir);
    }

    tracing::debug!(
        tool = tool.name,
        binary = %invocation.binary.display(),
        args = ?invocation.args,
        "invoking tool"
    );

    let child = command
        .spawn()
        .map_err(|e| spawn_error(tool, &invocation.binary, e))?;

    let output = match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ConversionError::environment(tool.name, e.to_string()))?,
        Err(_) => {
            return Err(ConversionError::environment(
                tool.name,
                format!("timed out after {}s", invocation.timeout.as_secs()),
            ));
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if output.status.success() {
        return Ok((output.stdout, stderr));
    }

    let diagnostic = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        stderr
    };
    let err = classify_failure(tool, &diagnostic);
    if !err.is_client_error() {
        tracing::warn!(tool = tool.name, status = %output.status, diagnostic = %diagnostic.trim(), "tool failed");
    }
    Err(err)
}

/// Check that a tool can be executed; returns the first line it printed.
pub async fn probe(
    tool: &ToolSpec,
    binary: &Path,
    timeout: Duration,
) -> Result<String, ConversionError> {
    let mut command = Command::new(binary);
    command
        .args(tool.probe_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = command
        .spawn()
        .map_err(|e| spawn_error(tool, binary, e))?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ConversionError::environment(tool.name, "probe timed out"))?
        .map_err(|e| ConversionError::environment(tool.name, e.to_string()))?;

    // Poppler prints its version banner on stderr; antiword exits non-zero
    // without arguments but still prints usage, which is enough.
    let text = [output.stdout.as_slice(), output.stderr.as_slice()]
        .iter()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .find(|s| !s.trim().is_empty())
        .unwrap_or_default();
    Ok(text.lines().next().unwrap_or("").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ANTIWORD, PDFTOHTML, UNRTF};

    #[test]
    fn syntax_error_is_client_input() {
        let err = classify_failure(&PDFTOHTML, "Syntax Error: Couldn't find trailer dictionary");
        assert!(matches!(err, ConversionError::ClientInput(_)));
    }

    #[test]
    fn other_diagnostics_are_environment_errors() {
        let err = classify_failure(&PDFTOHTML, "Command Line Error: Incorrect password");
        assert!(matches!(err, ConversionError::Environment { .. }));
        // unrtf documents no malformed-input pattern at all
        let err = classify_failure(&UNRTF, "Syntax Error:");
        assert!(!err.is_client_error());
    }

    #[test]
    fn antiword_rejects_non_word_documents() {
        let err = classify_failure(&ANTIWORD, "/tmp/x.doc is not a Word Document.");
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn missing_binary_is_environment_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut scope = ArtifactScope::allocate(tmp.path()).await.unwrap();
        let invocation = Invocation::new(
            tmp.path().join("no-such-pdftohtml"),
            Duration::from_secs(5),
        );
        let err = invoke(&PDFTOHTML, &invocation, &mut scope).await.unwrap_err();
        assert!(!err.is_client_error());
        assert!(err.to_string().contains("binary not found"));
        assert_eq!(scope.state(), crate::ArtifactState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn partial_output_is_registered_on_failure() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let script = bin.join("pdftohtml");
        std::fs::write(
            &script,
            "#!/bin/sh\nfor last; do :; done\ntouch \"${last%.html}-html.html\"\necho 'Syntax Error: bad xref' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let work = tmp.path().join("work");
        let mut scope = ArtifactScope::allocate(&work).await.unwrap();
        let out = scope.handle().with_suffix(".html");
        let invocation = Invocation::new(&script, Duration::from_secs(10)).arg(out);
        let err = invoke(&PDFTOHTML, &invocation, &mut scope).await.unwrap_err();

        assert!(err.is_client_error());
        assert_eq!(scope.registered().len(), 1);
        assert!(scope.registered()[0].ends_with(format!("{}-html.html", scope.handle().id())));
        scope.cleanup();
        assert!(list_owned(scope.handle()).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("sleepy");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut scope = ArtifactScope::allocate(&tmp.path().join("work")).await.unwrap();
        let invocation = Invocation::new(&script, Duration::from_millis(200));
        let err = invoke(&UNRTF, &invocation, &mut scope).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
