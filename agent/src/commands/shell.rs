//! Shell and agent-native command execution.

use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};
use waypost_protocol::{CommandRequest, TaskResult};

/// Hard ceiling on a single command. Long-running work belongs in its own
/// process, not inside a job slot.
const EXEC_TIMEOUT_SECS: u64 = 300;

/// Run an external command. With args the program is exec'd directly; without
/// args the command string goes through `sh -c` so pipelines and expansions
/// work.
pub async fn execute(req: &CommandRequest) -> TaskResult {
    debug!(command = %req.command, args = ?req.args, "executing command");

    let mut cmd = if req.args.is_empty() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&req.command);
        cmd
    } else {
        let mut cmd = Command::new(&req.command);
        cmd.args(&req.args);
        cmd
    };
    // Kill on drop to prevent orphan processes
    cmd.kill_on_drop(true);

    let result = tokio::time::timeout(Duration::from_secs(EXEC_TIMEOUT_SECS), cmd.output()).await;

    match result {
        Ok(Ok(out)) => {
            let mut stderr = String::from_utf8_lossy(&out.stderr).into_owned();
            if !out.status.success() && stderr.is_empty() {
                stderr = format!("exit status: {}", out.status.code().unwrap_or(-1));
            }
            TaskResult {
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr,
            }
        }
        Ok(Err(err)) => TaskResult {
            stderr: format!("exec failed: {}", err),
            ..Default::default()
        },
        Err(_) => {
            warn!(command = %req.command, "command timed out");
            TaskResult {
                stderr: format!("command timed out after {}s", EXEC_TIMEOUT_SECS),
                ..Default::default()
            }
        }
    }
}

/// Agent-native built-ins that avoid spawning a process.
pub async fn native(req: &CommandRequest) -> TaskResult {
    match req.command.as_str() {
        "pwd" => match std::env::current_dir() {
            Ok(dir) => TaskResult {
                stdout: dir.display().to_string(),
                ..Default::default()
            },
            Err(err) => TaskResult {
                stderr: format!("pwd: {}", err),
                ..Default::default()
            },
        },
        "cd" => {
            let target = req.args.first().map(String::as_str).unwrap_or("/");
            match std::env::set_current_dir(target) {
                Ok(()) => TaskResult {
                    stdout: format!("changed directory to {}", target),
                    ..Default::default()
                },
                Err(err) => TaskResult {
                    stderr: format!("cd {}: {}", target, err),
                    ..Default::default()
                },
            }
        }
        "ls" => {
            let target = req.args.first().map(String::as_str).unwrap_or(".");
            list_dir(target).await
        }
        "env" => {
            let mut vars: Vec<String> = std::env::vars()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            vars.sort();
            TaskResult {
                stdout: vars.join("\n"),
                ..Default::default()
            }
        }
        other => TaskResult {
            stderr: format!("unknown native command: {}", other),
            ..Default::default()
        },
    }
}

async fn list_dir(target: &str) -> TaskResult {
    let mut entries = match tokio::fs::read_dir(target).await {
        Ok(entries) => entries,
        Err(err) => {
            return TaskResult {
                stderr: format!("ls {}: {}", target, err),
                ..Default::default()
            }
        }
    };

    let mut names = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
            Ok(None) => break,
            Err(err) => {
                return TaskResult {
                    stderr: format!("ls {}: {}", target, err),
                    ..Default::default()
                }
            }
        }
    }
    names.sort();
    TaskResult {
        stdout: names.join("\n"),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(command: &str, args: &[&str]) -> CommandRequest {
        CommandRequest {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn execute_captures_stdout() {
        let res = execute(&req("echo", &["hello"])).await;
        assert_eq!(res.stdout.trim(), "hello");
        assert!(res.stderr.is_empty());
    }

    #[tokio::test]
    async fn execute_shell_string_without_args() {
        let res = execute(&req("echo one && echo two", &[])).await;
        assert_eq!(res.stdout.trim(), "one\ntwo");
    }

    #[tokio::test]
    async fn execute_reports_nonzero_exit() {
        let res = execute(&req("false", &[])).await;
        assert!(!res.stderr.is_empty());
    }

    #[tokio::test]
    async fn execute_reports_missing_program() {
        let res = execute(&req("definitely-not-a-real-binary", &["x"])).await;
        assert!(res.stderr.contains("exec failed"));
    }

    #[tokio::test]
    async fn native_pwd_returns_a_path() {
        let res = native(&req("pwd", &[])).await;
        assert!(res.stdout.starts_with('/'));
        assert!(res.stderr.is_empty());
    }

    #[tokio::test]
    async fn native_ls_lists_created_file() {
        let dir = std::env::temp_dir().join(format!("waypost-ls-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir(&dir).await.unwrap();
        tokio::fs::write(dir.join("marker.txt"), b"x").await.unwrap();

        let res = native(&req("ls", &[dir.to_str().unwrap()])).await;
        assert!(res.stdout.contains("marker.txt"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn native_unknown_command_is_an_error() {
        let res = native(&req("frobnicate", &[])).await;
        assert!(res.stderr.contains("unknown native command: frobnicate"));
    }
}
