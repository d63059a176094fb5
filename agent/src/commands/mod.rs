//! Job execution leaves: everything that actually touches the host.
//!
//! Each leaf returns an owned value; nothing here holds engine state or
//! shared locks across an await.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;
use waypost_protocol::{ShellcodeRequest, TaskResult};

pub mod modules;
pub mod shell;
pub mod transfer;

/// Platform bracket run once at agent startup. Other agent builds take real
/// privileges here; this build has nothing to acquire.
pub fn setup() {
    debug!("platform setup: nothing to do");
}

/// Counterpart of [`setup`], run before the agent exits.
pub fn teardown() {
    debug!("platform teardown: nothing to do");
}

/// Shellcode injection is a Windows-only capability. The payload is decoded
/// so malformed requests are still reported precisely, then rejected.
pub fn shellcode(req: &ShellcodeRequest) -> TaskResult {
    if let Err(err) = BASE64.decode(&req.bytes) {
        return TaskResult {
            stderr: format!("decoding shellcode: {}", err),
            ..Default::default()
        };
    }
    debug!(method = %req.method, pid = ?req.pid, "rejecting shellcode job");
    TaskResult {
        stderr: "the Shellcode command is not supported by this agent type".into(),
        ..Default::default()
    }
}
