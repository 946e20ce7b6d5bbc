use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use rave_core::{Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Options for a single subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Kill the child and fail with a transient error once elapsed.
    pub timeout: Option<Duration>,
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    pub env: HashMap<String, String>,
    /// Start from an empty environment instead of inheriting. The agent
    /// controller uses this with a minimal PATH.
    pub clear_env: bool,
    /// Bytes piped to the child's stdin, then stdin is closed.
    pub stdin: Option<Vec<u8>>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub command: Vec<String>,
    pub returncode: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// First non-empty stream, trimmed. Used to build error messages.
    pub fn first_output(&self) -> String {
        let err = self.stderr_text();
        let trimmed = err.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
        self.stdout_text().trim().to_string()
    }
}

/// Run an external command with captured output.
///
/// The argv is passed verbatim; no shell is ever involved. On timeout the
/// child is killed and a transient error carrying the timeout is returned.
/// Spawn failures (missing binary) surface as resource errors.
pub async fn run(argv: &[&str], opts: RunOptions) -> Result<ProcessOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::internal("empty command"))?;

    debug!(program = %program, args = ?args, "running command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if opts.clear_env {
        cmd.env_clear();
    }
    for (k, v) in &opts.env {
        cmd.env(k, v);
    }
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(if opts.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        Error::resource(format!("failed to spawn {program}: {e}"))
    })?;

    if let Some(data) = opts.stdin {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("child stdin not captured"))?;
        // Writing may fail with EPIPE if the child exits early; the exit
        // status below is the authoritative outcome.
        let _ = stdin.write_all(&data).await;
        drop(stdin);
    }

    let wait = child.wait_with_output();
    let output = match opts.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, wait).await {
            Ok(res) => res,
            Err(_) => {
                return Err(Error::transient(format!(
                    "command timed out after {}s: {}",
                    timeout.as_secs(),
                    argv.join(" ")
                )));
            }
        },
        None => wait.await,
    }
    .map_err(|e| Error::internal(format!("failed to wait for {program}: {e}")))?;

    Ok(ProcessOutput {
        command: argv.iter().map(|s| s.to_string()).collect(),
        returncode: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
        duration: start.elapsed(),
    })
}

/// Run a command and fail with a resource error on non-zero exit.
pub async fn run_checked(argv: &[&str], opts: RunOptions) -> Result<ProcessOutput> {
    let output = run(argv, opts).await?;
    if !output.success() {
        return Err(Error::resource(format!(
            "command failed (exit {}): {}: {}",
            output.returncode,
            argv.join(" "),
            output.first_output()
        )));
    }
    Ok(output)
}

/// Run a command and return trimmed stdout, failing on non-zero exit.
pub async fn output_text(argv: &[&str], opts: RunOptions) -> Result<String> {
    let output = run_checked(argv, opts).await?;
    Ok(output.stdout_text().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run(&["echo", "hello"], RunOptions::default()).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_text().trim(), "hello");
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_is_not_an_error() {
        let out = run(&["false"], RunOptions::default()).await.unwrap();
        assert!(!out.success());
        assert_eq!(out.returncode, 1);
    }

    #[tokio::test]
    async fn test_run_checked_surfaces_failure() {
        let err = run_checked(&["false"], RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let err = run(
            &["sleep", "30"],
            RunOptions::with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
        assert!(err.is_transient(), "timeout should classify as transient");
    }

    #[tokio::test]
    async fn test_missing_binary_is_resource_error() {
        let err = run(&["rave-no-such-binary-xyz"], RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[tokio::test]
    async fn test_stdin_is_streamed() {
        let opts = RunOptions {
            stdin: Some(b"piped input".to_vec()),
            ..RunOptions::default()
        };
        let out = run(&["cat"], opts).await.unwrap();
        assert_eq!(out.stdout_text(), "piped input");
    }

    #[tokio::test]
    async fn test_clear_env_drops_variables() {
        std::env::set_var("RAVE_PROCESS_TEST_VAR", "1");
        let opts = RunOptions {
            clear_env: true,
            env: HashMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            ..RunOptions::default()
        };
        let out = run(&["env"], opts).await.unwrap();
        assert!(!out.stdout_text().contains("RAVE_PROCESS_TEST_VAR"));
        std::env::remove_var("RAVE_PROCESS_TEST_VAR");
    }

    #[tokio::test]
    async fn test_output_text_trims() {
        let text = output_text(&["echo", "  spaced  "], RunOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "spaced");
    }
}
