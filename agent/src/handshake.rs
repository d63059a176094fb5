//! Session establishment state machine.
//!
//! Drives the PAKE exchange over a [`Transport`]: a three-message
//! registration that derives the long-term authentication key, then a
//! two-message authentication that derives the per-session secret. The
//! server telling us it has no record of this agent is a recoverable
//! outcome, not an error; the caller loops and re-registers.
//!
//! Mismatched recipient ids and unexpected message types are fatal for the
//! attempt. All handshake traffic is sealed under the interim PSK-derived
//! secret; the session secret is installed on the transport only after both
//! confirmation tags verify.

use anyhow::{bail, ensure, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::{CryptoRng, RngCore};
use tracing::{info, warn};
use uuid::Uuid;
use waypost_protocol::{Envelope, HandshakeMessage, MessageBody};

use crate::pake::{self, RegistrationRecord};
use crate::token;
use crate::transport::Transport;

pub(crate) const CLIENT_REGISTER: &[u8] = b"client register";
pub(crate) const SERVER_REGISTER: &[u8] = b"server register";
pub(crate) const CLIENT_AUTH: &[u8] = b"client auth";
pub(crate) const SERVER_AUTH: &[u8] = b"server auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unregistered,
    RegisterInitSent,
    RegisterCompleteSent,
    AuthInitSent,
    Authenticated,
}

/// How an authentication attempt ended short of an error.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Session secret established and installed on the transport.
    Established(Vec<u8>),
    /// The server has no record of this agent; state has been reset and the
    /// caller should retry with a forced registration.
    ReRegister,
}

pub struct SessionHandshake<R: RngCore + CryptoRng> {
    aid: Uuid,
    psk: String,
    padding_max: usize,
    token_lifetime_secs: u64,
    rng: R,
    state: HandshakeState,
    record: Option<RegistrationRecord>,
}

impl<R: RngCore + CryptoRng> SessionHandshake<R> {
    pub fn new(
        aid: Uuid,
        psk: String,
        padding_max: usize,
        token_lifetime_secs: u64,
        rng: R,
    ) -> Self {
        Self {
            aid,
            psk,
            padding_max,
            token_lifetime_secs,
            rng,
            state: HandshakeState::Unregistered,
            record: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.record.is_some()
    }

    /// Keep handshake padding in step with a runtime padding change.
    pub fn set_padding_max(&mut self, max: usize) {
        self.padding_max = max;
    }

    /// Run the full exchange: register when forced or unregistered, then
    /// authenticate. On success the session secret is already installed on
    /// the transport.
    pub async fn authenticate<T: Transport>(
        &mut self,
        transport: &mut T,
        force_register: bool,
    ) -> Result<AuthOutcome> {
        let interim = pake::interim_secret(&self.psk);
        transport.set_secret(interim.clone());
        let bearer = token::issue(&self.aid, &interim, self.token_lifetime_secs)
            .context("issuing bearer token")?;
        transport.set_bearer(bearer.value);

        if force_register || self.record.is_none() {
            self.record = None;
            self.state = HandshakeState::Unregistered;
            self.register(transport).await.context("registration")?;
        }
        self.auth(transport).await.context("authentication")
    }

    async fn register<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let pad = pake::blinding_pad(&self.psk, &self.aid, pake::REGISTER_LABEL);
        let keys = pake::KeyPair::generate(&mut self.rng);
        let blinded = pake::blind(&keys.public, &pad);

        let init = self.envelope(HandshakeMessage::RegisterInit {
            blinded: BASE64.encode(blinded),
        });
        self.state = HandshakeState::RegisterInitSent;
        let reply = transport.send(init).await?;
        let (server_blinded, salt) = match self.expect_handshake(reply)? {
            HandshakeMessage::RegisterResponse { blinded, salt } => (
                decode_key(&blinded)?,
                BASE64.decode(&salt).context("decoding registration salt")?,
            ),
            other => bail!("expected RegisterResponse, got {}", step_name(&other)),
        };

        let server_public = pake::unblind(&server_blinded, &pad);
        let shared = keys.shared_secret(&server_public);
        let auth_key = pake::derive_auth_key(&shared, &salt);
        let transcript =
            [blinded.as_slice(), server_blinded.as_slice(), salt.as_slice()].concat();

        let confirm = pake::confirm_tag(&auth_key, CLIENT_REGISTER, &transcript);
        let complete = self.envelope(HandshakeMessage::RegisterComplete {
            confirm: BASE64.encode(confirm),
        });
        self.state = HandshakeState::RegisterCompleteSent;
        let reply = transport.send(complete).await?;
        let server_confirm = match self.expect_handshake(reply)? {
            HandshakeMessage::RegisterComplete { confirm } => BASE64
                .decode(&confirm)
                .context("decoding server registration confirmation")?,
            other => bail!("expected RegisterComplete ack, got {}", step_name(&other)),
        };
        ensure!(
            pake::verify_confirm(&auth_key, SERVER_REGISTER, &transcript, &server_confirm),
            "server registration confirmation mismatch"
        );

        info!(agent_id = %self.aid, "registration complete");
        self.record = Some(RegistrationRecord { salt, auth_key });
        Ok(())
    }

    async fn auth<T: Transport>(&mut self, transport: &mut T) -> Result<AuthOutcome> {
        let record = self
            .record
            .clone()
            .context("authenticating without a registration record")?;

        let pad = pake::blinding_pad(&self.psk, &self.aid, pake::AUTH_LABEL);
        let keys = pake::KeyPair::generate(&mut self.rng);
        let blinded = pake::blind(&keys.public, &pad);
        let proof = pake::auth_proof(&record.auth_key, &blinded);

        let init = self.envelope(HandshakeMessage::AuthInit {
            blinded: BASE64.encode(blinded),
            proof: BASE64.encode(proof),
        });
        self.state = HandshakeState::AuthInitSent;
        let reply = transport.send(init).await?;
        let (server_blinded, server_confirm) = match self.expect_handshake(reply)? {
            HandshakeMessage::ReRegister => {
                warn!(agent_id = %self.aid, "server has no record of this agent, re-registering");
                self.record = None;
                self.state = HandshakeState::Unregistered;
                return Ok(AuthOutcome::ReRegister);
            }
            HandshakeMessage::AuthResponse { blinded, confirm } => (
                decode_key(&blinded)?,
                BASE64
                    .decode(&confirm)
                    .context("decoding server session confirmation")?,
            ),
            other => bail!("expected AuthResponse, got {}", step_name(&other)),
        };

        let server_public = pake::unblind(&server_blinded, &pad);
        let shared = keys.shared_secret(&server_public);
        let session = pake::derive_session_secret(&shared, &record.auth_key, &record.salt);
        let transcript = [blinded.as_slice(), server_blinded.as_slice()].concat();
        ensure!(
            pake::verify_confirm(&session, SERVER_AUTH, &transcript, &server_confirm),
            "server session confirmation mismatch"
        );

        let confirm = pake::confirm_tag(&session, CLIENT_AUTH, &transcript);
        let complete = self.envelope(HandshakeMessage::AuthComplete {
            confirm: BASE64.encode(confirm),
        });
        let reply = transport.send(complete).await?;
        ensure!(
            reply.id == self.aid,
            "handshake reply addressed to {} (expected {})",
            reply.id,
            self.aid
        );

        transport.set_secret(session.clone());
        self.state = HandshakeState::Authenticated;
        info!(agent_id = %self.aid, "session established");
        Ok(AuthOutcome::Established(session))
    }

    fn envelope(&mut self, msg: HandshakeMessage) -> Envelope {
        Envelope::new(self.aid, MessageBody::Handshake(msg))
            .with_padding(&mut self.rng, self.padding_max)
    }

    /// Reject replies addressed to someone else or carrying a non-handshake
    /// body. Both are fatal for the attempt.
    fn expect_handshake(&self, reply: Envelope) -> Result<HandshakeMessage> {
        ensure!(
            reply.id == self.aid,
            "handshake reply addressed to {} (expected {})",
            reply.id,
            self.aid
        );
        match reply.body {
            MessageBody::Handshake(msg) => Ok(msg),
            MessageBody::Checkin => bail!("unexpected Checkin during handshake"),
            MessageBody::Jobs(_) => bail!("unexpected Jobs message during handshake"),
        }
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64.decode(encoded).context("decoding blinded key")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("blinded key must be 32 bytes"))
}

pub(crate) fn step_name(msg: &HandshakeMessage) -> &'static str {
    match msg {
        HandshakeMessage::RegisterInit { .. } => "RegisterInit",
        HandshakeMessage::RegisterResponse { .. } => "RegisterResponse",
        HandshakeMessage::RegisterComplete { .. } => "RegisterComplete",
        HandshakeMessage::AuthInit { .. } => "AuthInit",
        HandshakeMessage::AuthResponse { .. } => "AuthResponse",
        HandshakeMessage::AuthComplete { .. } => "AuthComplete",
        HandshakeMessage::ReRegister => "ReRegister",
    }
}
