//! Transport client: sealed, length-prefixed frames over TCP.
//!
//! Every outgoing envelope is serialized, sealed under the current secret
//! and wrapped in a frame that carries the bearer token in the clear so the
//! server can route it before decryption. The handshake swaps the secret
//! under us via `set_secret`; the frame layout never changes.

use std::future::Future;

use anyhow::{ensure, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use waypost_protocol::seal::{self, SealedBox};
use waypost_protocol::{encode_frame, Envelope, MAX_FRAME_SIZE};

/// Request/response client the agent speaks through. Mocked in handshake and
/// controller tests.
pub trait Transport: Send {
    fn set_bearer(&mut self, token: String);
    fn set_secret(&mut self, secret: Vec<u8>);
    fn send(&mut self, envelope: Envelope) -> impl Future<Output = Result<Envelope>> + Send;
}

/// One frame on the wire: 4-byte big-endian length prefix, then JSON of this
/// struct. The token rides outside the sealed body.
#[derive(Serialize, Deserialize)]
struct Frame {
    token: String,
    #[serde(flatten)]
    sealed: SealedBox,
}

pub struct TcpTransport {
    addr: String,
    bearer: String,
    secret: Vec<u8>,
    stream: Option<TcpStream>,
    rng: StdRng,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            bearer: String::new(),
            secret: Vec::new(),
            stream: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Write one frame and read the reply frame. Connects lazily; the caller
    /// drops the stream on error so the next call reconnects.
    async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => {
                let stream = TcpStream::connect(&self.addr)
                    .await
                    .with_context(|| format!("connecting to {}", self.addr))?;
                debug!(addr = %self.addr, "connected");
                self.stream.insert(stream)
            }
        };

        stream.write_all(frame).await.context("writing frame")?;
        stream.flush().await.context("flushing frame")?;

        let len = stream.read_u32().await.context("reading frame length")?;
        ensure!(
            len <= MAX_FRAME_SIZE,
            "frame too large: {} bytes (max {})",
            len,
            MAX_FRAME_SIZE
        );
        let mut buf = vec![0u8; len as usize];
        stream
            .read_exact(&mut buf)
            .await
            .context("reading frame payload")?;
        Ok(buf)
    }
}

impl Transport for TcpTransport {
    fn set_bearer(&mut self, token: String) {
        self.bearer = token;
    }

    fn set_secret(&mut self, secret: Vec<u8>) {
        self.secret = secret;
    }

    async fn send(&mut self, envelope: Envelope) -> Result<Envelope> {
        let plain = serde_json::to_vec(&envelope).context("serializing envelope")?;
        let sealed = seal::seal(&plain, &self.secret, &mut self.rng).context("sealing envelope")?;
        let frame = encode_frame(&Frame {
            token: self.bearer.clone(),
            sealed,
        })
        .context("encoding frame")?;

        let reply = match self.exchange(&frame).await {
            Ok(reply) => reply,
            Err(err) => {
                // Stale connections are not worth diagnosing; reconnect on
                // the next attempt.
                self.stream = None;
                return Err(err);
            }
        };

        let frame: Frame = serde_json::from_slice(&reply).context("parsing reply frame")?;
        let plain = seal::open(&frame.sealed, &self.secret).context("opening reply frame")?;
        serde_json::from_slice(&plain).context("parsing reply envelope")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use uuid::Uuid;
    use waypost_protocol::MessageBody;

    const SECRET: &[u8] = b"test transport secret";

    async fn read_frame(stream: &mut TcpStream) -> Frame {
        let len = stream.read_u32().await.unwrap();
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await.unwrap();
        serde_json::from_slice(&buf).unwrap()
    }

    async fn write_envelope(stream: &mut TcpStream, envelope: &Envelope) {
        let mut rng = StdRng::from_entropy();
        let plain = serde_json::to_vec(envelope).unwrap();
        let sealed = seal::seal(&plain, SECRET, &mut rng).unwrap();
        let frame = encode_frame(&Frame {
            token: String::new(),
            sealed,
        })
        .unwrap();
        stream.write_all(&frame).await.unwrap();
        stream.flush().await.unwrap();
    }

    #[tokio::test]
    async fn sealed_roundtrip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let aid = Uuid::new_v4();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await;
            assert_eq!(frame.token, "bearer-1");
            let plain = seal::open(&frame.sealed, SECRET).unwrap();
            let envelope: Envelope = serde_json::from_slice(&plain).unwrap();
            assert!(matches!(envelope.body, MessageBody::Checkin));
            write_envelope(&mut stream, &Envelope::new(envelope.id, MessageBody::Checkin)).await;
        });

        let mut transport = TcpTransport::new(addr.to_string());
        transport.set_bearer("bearer-1".into());
        transport.set_secret(SECRET.to_vec());
        let reply = transport
            .send(Envelope::new(aid, MessageBody::Checkin))
            .await
            .unwrap();
        assert_eq!(reply.id, aid);
        assert!(matches!(reply.body, MessageBody::Checkin));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_failed_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let aid = Uuid::new_v4();

        let server = tokio::spawn(async move {
            // First connection: hang up without replying.
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
            // Second connection: answer properly.
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await;
            let plain = seal::open(&frame.sealed, SECRET).unwrap();
            let envelope: Envelope = serde_json::from_slice(&plain).unwrap();
            write_envelope(&mut stream, &Envelope::new(envelope.id, MessageBody::Checkin)).await;
        });

        let mut transport = TcpTransport::new(addr.to_string());
        transport.set_secret(SECRET.to_vec());
        assert!(transport
            .send(Envelope::new(aid, MessageBody::Checkin))
            .await
            .is_err());
        let reply = transport
            .send(Envelope::new(aid, MessageBody::Checkin))
            .await
            .unwrap();
        assert_eq!(reply.id, aid);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_secret_reply_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream).await;
            let mut rng = StdRng::from_entropy();
            let sealed = seal::seal(b"{}", b"a different secret", &mut rng).unwrap();
            let frame = encode_frame(&Frame {
                token: String::new(),
                sealed,
            })
            .unwrap();
            stream.write_all(&frame).await.unwrap();
        });

        let mut transport = TcpTransport::new(addr.to_string());
        transport.set_secret(SECRET.to_vec());
        assert!(transport
            .send(Envelope::new(Uuid::new_v4(), MessageBody::Checkin))
            .await
            .is_err());
        server.await.unwrap();
    }
}
