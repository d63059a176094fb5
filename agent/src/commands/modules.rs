//! Named built-in modules.
//!
//! The dispatch is case-insensitive on the module name. Most of the catalog
//! exists for parity with other agent builds and reports itself unsupported
//! here; only the cross-platform members do real work.

use anyhow::{Context, Result};
use tracing::debug;
use waypost_protocol::{CommandRequest, FileTransfer, TaskResult};

/// What a module produced: plain output, or a file artifact headed back to
/// the server (minidump-style modules).
pub enum ModuleOutcome {
    Output(TaskResult),
    Artifact(FileTransfer),
}

pub async fn run(req: &CommandRequest) -> ModuleOutcome {
    debug!(module = %req.command, "running module");

    match req.command.to_lowercase().as_str() {
        "ps" => ModuleOutcome::Output(ps()),
        "minidump" => match minidump(req).await {
            Ok(artifact) => ModuleOutcome::Artifact(artifact),
            Err(err) => ModuleOutcome::Output(TaskResult {
                stderr: format!("{:#}", err),
                ..Default::default()
            }),
        },
        "uptime" => ModuleOutcome::Output(unsupported("Uptime")),
        "netstat" => ModuleOutcome::Output(unsupported("Netstat")),
        "pipes" => ModuleOutcome::Output(unsupported("Pipes")),
        "ssh" => ModuleOutcome::Output(unsupported("SSH")),
        "token" => ModuleOutcome::Output(unsupported("Token")),
        "runas" => ModuleOutcome::Output(unsupported("RunAs")),
        "clr" => ModuleOutcome::Output(unsupported("CLR")),
        "createprocess" => ModuleOutcome::Output(unsupported("CreateProcess")),
        "memfd" => ModuleOutcome::Output(unsupported("Memfd")),
        "memory" => ModuleOutcome::Output(unsupported("Memory")),
        other => ModuleOutcome::Output(TaskResult {
            stderr: format!("unknown module command: {}", other),
            ..Default::default()
        }),
    }
}

fn unsupported(name: &str) -> TaskResult {
    TaskResult {
        stderr: format!("the {} command is not supported by this agent type", name),
        ..Default::default()
    }
}

/// Process listing from /proc: pid and comm, one per line.
#[cfg(target_os = "linux")]
fn ps() -> TaskResult {
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(err) => {
            return TaskResult {
                stderr: format!("reading /proc: {}", err),
                ..Default::default()
            }
        }
    };

    let mut rows: Vec<(u32, String)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Processes can exit between readdir and read; skip them.
        let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        rows.push((pid, comm.trim().to_string()));
    }
    rows.sort_by_key(|(pid, _)| *pid);

    let mut stdout = String::from("PID\tNAME\n");
    for (pid, comm) in rows {
        stdout.push_str(&format!("{}\t{}\n", pid, comm));
    }
    TaskResult {
        stdout,
        ..Default::default()
    }
}

#[cfg(not(target_os = "linux"))]
fn ps() -> TaskResult {
    unsupported("PS")
}

/// Process memory capture. The dump itself is a Windows capability; this
/// build only validates the request shape before refusing it, so the error
/// names the real problem when one exists.
async fn minidump(req: &CommandRequest) -> Result<FileTransfer> {
    let target = req
        .args
        .first()
        .context("minidump requires a target process argument")?;
    anyhow::bail!(
        "the Minidump command is not supported by this agent type (target {})",
        target
    )
}
