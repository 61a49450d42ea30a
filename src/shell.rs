//! External command execution
//!
//! Every kernel mutation (`ip`, `iptables`, `wg`, `modprobe`) goes through
//! a `CommandRunner`. The system runner spawns processes directly (no shell,
//! so arguments need no quoting) and throttles spawns with a token bucket.

use crate::error::{Error, Result};
use crate::manifest::ThrottleConfig;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use throttle_machines::token_bucket;
use tokio::process::Command;

/// Path to the `ip` command
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `iptables` command
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Path to the `ip6tables` command
pub const IP6TABLES_CMD: &str = "/sbin/ip6tables";

/// Path to the `wg` command
pub const WG_CMD: &str = "/usr/bin/wg";

/// Path to the `modprobe` command
pub const MODPROBE_CMD: &str = "/sbin/modprobe";

/// Result of a command execution
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output (stdout + stderr) for error messages
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Render a program and its arguments for logs and errors
pub fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Build an owned argument vector from string slices
pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Seam for spawning external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command and return its result; non-zero exit is not an error here
    async fn run(&self, program: &str, args: &[String]) -> Result<ExecResult>;

    /// Run a command and fail with `KernelOperation` on non-zero exit
    async fn run_checked(&self, program: &str, args: &[String]) -> Result<String> {
        let result = self.run(program, args).await?;
        if result.success() {
            Ok(result.stdout)
        } else {
            Err(Error::KernelOperation {
                command: render(program, args),
                exit_code: result.exit_code,
                output: result.combined_output(),
            })
        }
    }
}

/// Runner that spawns real processes
pub struct SystemRunner {
    /// Token bucket state (tokens, last refill)
    bucket: Mutex<(f64, Instant)>,
    /// Fixed origin for bucket timestamps
    epoch: Instant,
    capacity: f64,
    refill_rate: f64,
}

impl SystemRunner {
    pub fn new(throttle: &ThrottleConfig) -> Self {
        let now = Instant::now();
        Self {
            bucket: Mutex::new((throttle.capacity, now)),
            epoch: now,
            capacity: throttle.capacity,
            refill_rate: throttle.refill_rate,
        }
    }

    /// Wait until the bucket grants a spawn token
    async fn throttle(&self) {
        loop {
            let retry_after = {
                let mut state = match self.bucket.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let (tokens, last_refill) = *state;
                let now = Instant::now();
                let now_secs = now.duration_since(self.epoch).as_secs_f64();
                let last_refill_secs = last_refill.duration_since(self.epoch).as_secs_f64();

                let result = token_bucket::check(
                    tokens,
                    last_refill_secs,
                    now_secs,
                    self.capacity,
                    self.refill_rate,
                );

                if result.allowed {
                    *state = (result.new_tokens, now);
                    return;
                }
                result.retry_after
            };
            tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<ExecResult> {
        self.throttle().await;

        let command = render(program, args);
        tracing::debug!(command = %command, "Executing command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::CommandSpawn {
                command: command.clone(),
                source: e,
            })?;

        let result = ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if result.success() {
            tracing::trace!(command = %command, "Command succeeded");
        } else {
            tracing::warn!(
                command = %command,
                exit_code = result.exit_code,
                stderr = %result.stderr,
                "Command failed"
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
pub use recording::RecordingRunner;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        assert_eq!(
            render(IP_CMD, &args(&["link", "del", "dev", "wg0"])),
            "/sbin/ip link del dev wg0"
        );
    }

    #[test]
    fn test_exec_result_combined() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "stdout".to_string(),
            stderr: "stderr".to_string(),
        };
        assert_eq!(result.combined_output(), "stdout\nstderr");

        let result = ExecResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "error message".to_string(),
        };
        assert!(!result.success());
        assert_eq!(result.combined_output(), "error message");
    }

    #[tokio::test]
    async fn test_system_runner_echo() {
        let runner = SystemRunner::new(&ThrottleConfig::default());
        let result = runner.run("echo", &args(&["hello"])).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_system_runner_checked_failure() {
        let runner = SystemRunner::new(&ThrottleConfig::default());
        let result = runner.run_checked("false", &[]).await;
        match result {
            Err(Error::KernelOperation { exit_code, .. }) => assert_eq!(exit_code, 1),
            other => panic!("Expected KernelOperation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_system_runner_spawn_error() {
        let runner = SystemRunner::new(&ThrottleConfig::default());
        let result = runner.run("/nonexistent/portolan-test-binary", &[]).await;
        assert!(matches!(result, Err(Error::CommandSpawn { .. })));
    }

    #[tokio::test]
    async fn test_recording_runner_scripted() {
        let runner = RecordingRunner::new();
        runner.fail_on("link del");
        runner.respond("link show", "[]");

        assert!(runner.run_checked(IP_CMD, &args(&["link", "del", "dev", "x"])).await.is_err());
        assert_eq!(
            runner.run_checked(IP_CMD, &args(&["-j", "link", "show"])).await.unwrap(),
            "[]"
        );
        assert_eq!(runner.commands().len(), 2);
        assert_eq!(runner.matching("link del").len(), 1);
    }
}
