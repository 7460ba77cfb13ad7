//! Deploy-hook execution.
//!
//! Configured hook strings are tokenized with shell word-splitting rules and
//! executed directly as an argument vector. No shell is ever involved, so
//! metacharacters in configuration values cannot become commands.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("empty command")]
    Empty,

    #[error("failed to tokenize command: {0}")]
    Parse(#[from] shell_words::ParseError),

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with status {0}")]
    NonZeroExit(i32),

    #[error("command terminated by signal")]
    Terminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One hook invocation: the configured command string, extra environment,
/// and a hard timeout.
#[derive(Debug, Clone)]
pub struct HookSpec {
    pub command: String,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct HookOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run a hook to completion.
///
/// The command is spawned in its own process group; on timeout the whole
/// group receives SIGKILL so grandchildren cannot linger.
pub async fn run(spec: &HookSpec) -> Result<HookOutput, ExecError> {
    let argv = shell_words::split(&spec.command)?;
    let Some((program, args)) = argv.split_first() else {
        return Err(ExecError::Empty);
    };

    debug!(command = %shell_words::join(redacted_argv(&argv)), "Running deploy hook");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| ExecError::Spawn {
        command: program.clone(),
        source,
    })?;
    let pid = child.id();

    let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            // The child was killed on drop; take its whole process group with it.
            if let Some(pid) = pid {
                unsafe {
                    libc::killpg(pid as libc::pid_t, libc::SIGKILL);
                }
            }
            warn!(command = %program, timeout = ?spec.timeout, "Deploy hook timed out");
            return Err(ExecError::Timeout(spec.timeout));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    match output.status.code() {
        Some(0) => Ok(HookOutput { stdout, stderr }),
        Some(code) => {
            warn!(command = %program, code, stderr = %stderr.trim(), "Deploy hook failed");
            Err(ExecError::NonZeroExit(code))
        }
        None => Err(ExecError::Terminated),
    }
}

const SECRET_MARKERS: &[&str] = &["token", "secret", "password", "passwd", "apikey", "api-key", "api_key"];

fn looks_secret(word: &str) -> bool {
    let lower = word.trim_start_matches('-').to_lowercase();
    SECRET_MARKERS.iter().any(|m| lower.contains(m))
}

/// Replace secret-bearing argument values with `***` for logging.
///
/// Covers both `--token VALUE` and `key=VALUE` shapes.
fn redacted_argv(argv: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(argv.len());
    let mut mask_next = false;
    for arg in argv {
        if mask_next {
            redacted.push("***".to_string());
            mask_next = false;
            continue;
        }
        if let Some((key, _)) = arg.split_once('=') {
            if looks_secret(key) {
                redacted.push(format!("{key}=***"));
                continue;
            }
        } else if looks_secret(arg) {
            mask_next = true;
        }
        redacted.push(arg.clone());
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str) -> HookSpec {
        HookSpec {
            command: command.to_string(),
            env: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_metacharacters_not_interpreted() {
        let output = run(&spec("/bin/echo '; rm -rf /' '&& whoami'")).await.unwrap();
        // Passed through as two literal arguments, never a shell command
        assert_eq!(output.stdout.trim(), "; rm -rf / && whoami");
    }

    #[tokio::test]
    async fn test_env_passed_to_hook() {
        let mut s = spec("env");
        s.env.push(("CERTROUTE_LINEAGE".into(), "web".into()));
        let output = run(&s).await.unwrap();
        assert!(output.stdout.contains("CERTROUTE_LINEAGE=web"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let err = run(&spec("false")).await.unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit(1)));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let mut s = spec("sleep 30");
        s.timeout = Duration::from_millis(100);
        let started = std::time::Instant::now();
        let err = run(&s).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        assert!(matches!(run(&spec("")).await.unwrap_err(), ExecError::Empty));
    }

    #[tokio::test]
    async fn test_unbalanced_quote_rejected() {
        assert!(matches!(
            run(&spec("echo 'unterminated")).await.unwrap_err(),
            ExecError::Parse(_)
        ));
    }

    #[test]
    fn test_redaction() {
        let argv: Vec<String> = ["deploy", "--token", "s3cr3t", "--host", "example.com", "api_key=abc"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let redacted = redacted_argv(&argv);
        assert_eq!(redacted[2], "***");
        assert_eq!(redacted[4], "example.com");
        assert_eq!(redacted[5], "api_key=***");
    }
}
