//! Server-side double for the PAKE exchange, shared by handshake and
//! controller tests. Implements the exact math the agent expects, plus
//! knobs for the failure modes worth exercising.

use anyhow::{bail, ensure, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::StdRng;
use rand::SeedableRng;
use uuid::Uuid;
use waypost_protocol::{Envelope, HandshakeMessage, MessageBody};

use crate::handshake::{step_name, CLIENT_AUTH, CLIENT_REGISTER, SERVER_AUTH, SERVER_REGISTER};
use crate::pake;
use crate::transport::Transport;

#[derive(Clone, Copy, PartialEq)]
pub(crate) enum Tamper {
    None,
    WrongId,
    WrongType,
    FailSend,
    BadAuthConfirm,
}

pub(crate) struct MockServer {
    pub(crate) psk: String,
    pub(crate) rng: StdRng,
    pub(crate) record: Option<(Vec<u8>, [u8; 32])>,
    pub(crate) pending_register: Option<([u8; 32], Vec<u8>, Vec<u8>)>,
    pub(crate) pending_auth: Option<(Vec<u8>, Vec<u8>)>,
    pub(crate) session: Option<Vec<u8>>,
    pub(crate) secrets_seen: Vec<Vec<u8>>,
    pub(crate) bearer: String,
    pub(crate) register_inits: usize,
    pub(crate) tamper: Tamper,
    /// Answer every AuthInit with ReRegister, registration or not.
    pub(crate) reregister_always: bool,
}

impl MockServer {
    pub(crate) fn new(psk: &str) -> Self {
        Self {
            psk: psk.into(),
            rng: StdRng::seed_from_u64(1000),
            record: None,
            pending_register: None,
            pending_auth: None,
            session: None,
            secrets_seen: Vec::new(),
            bearer: String::new(),
            register_inits: 0,
            tamper: Tamper::None,
            reregister_always: false,
        }
    }

    fn decode32(encoded: &str) -> Result<[u8; 32]> {
        let bytes = BASE64.decode(encoded)?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected 32 bytes"))
    }

    fn handle(&mut self, aid: Uuid, msg: HandshakeMessage) -> Result<HandshakeMessage> {
        match msg {
            HandshakeMessage::RegisterInit { blinded } => {
                self.register_inits += 1;
                let pad = pake::blinding_pad(&self.psk, &aid, pake::REGISTER_LABEL);
                let agent_blinded = Self::decode32(&blinded)?;
                let agent_public = pake::unblind(&agent_blinded, &pad);
                let keys = pake::KeyPair::generate(&mut self.rng);
                let server_blinded = pake::blind(&keys.public, &pad);
                let salt = pake::random_salt(&mut self.rng).to_vec();
                let auth_key = pake::derive_auth_key(&keys.shared_secret(&agent_public), &salt);
                let transcript = [
                    agent_blinded.as_slice(),
                    server_blinded.as_slice(),
                    salt.as_slice(),
                ]
                .concat();
                self.pending_register = Some((auth_key, transcript, salt.clone()));
                Ok(HandshakeMessage::RegisterResponse {
                    blinded: BASE64.encode(server_blinded),
                    salt: BASE64.encode(salt),
                })
            }
            HandshakeMessage::RegisterComplete { confirm } => {
                let (auth_key, transcript, salt) = self
                    .pending_register
                    .take()
                    .context("no registration in flight")?;
                let tag = BASE64.decode(&confirm)?;
                ensure!(
                    pake::verify_confirm(&auth_key, CLIENT_REGISTER, &transcript, &tag),
                    "client registration confirmation mismatch"
                );
                self.record = Some((salt, auth_key));
                Ok(HandshakeMessage::RegisterComplete {
                    confirm: BASE64
                        .encode(pake::confirm_tag(&auth_key, SERVER_REGISTER, &transcript)),
                })
            }
            HandshakeMessage::AuthInit { blinded, proof } => {
                if self.reregister_always {
                    return Ok(HandshakeMessage::ReRegister);
                }
                let Some((salt, auth_key)) = self.record.clone() else {
                    return Ok(HandshakeMessage::ReRegister);
                };
                let agent_blinded = Self::decode32(&blinded)?;
                let tag = BASE64.decode(&proof)?;
                ensure!(
                    pake::auth_proof(&auth_key, &agent_blinded).as_slice() == tag,
                    "auth proof mismatch"
                );
                let pad = pake::blinding_pad(&self.psk, &aid, pake::AUTH_LABEL);
                let agent_public = pake::unblind(&agent_blinded, &pad);
                let keys = pake::KeyPair::generate(&mut self.rng);
                let server_blinded = pake::blind(&keys.public, &pad);
                let session = pake::derive_session_secret(
                    &keys.shared_secret(&agent_public),
                    &auth_key,
                    &salt,
                );
                let transcript = [agent_blinded.as_slice(), server_blinded.as_slice()].concat();
                let mut confirm = pake::confirm_tag(&session, SERVER_AUTH, &transcript);
                if self.tamper == Tamper::BadAuthConfirm {
                    confirm[0] ^= 1;
                }
                self.pending_auth = Some((session, transcript));
                Ok(HandshakeMessage::AuthResponse {
                    blinded: BASE64.encode(server_blinded),
                    confirm: BASE64.encode(confirm),
                })
            }
            HandshakeMessage::AuthComplete { confirm } => {
                let (session, transcript) =
                    self.pending_auth.take().context("no auth in flight")?;
                let tag = BASE64.decode(&confirm)?;
                ensure!(
                    pake::verify_confirm(&session, CLIENT_AUTH, &transcript, &tag),
                    "client session confirmation mismatch"
                );
                self.session = Some(session);
                // Placeholder; send() acknowledges AuthComplete with Checkin.
                Ok(HandshakeMessage::ReRegister)
            }
            other => bail!("mock got unexpected step {}", step_name(&other)),
        }
    }
}

// Lets a test keep the server around for inspection after handing it to a
// consuming API.
impl Transport for &mut MockServer {
    fn set_bearer(&mut self, token: String) {
        Transport::set_bearer(&mut **self, token);
    }

    fn set_secret(&mut self, secret: Vec<u8>) {
        Transport::set_secret(&mut **self, secret);
    }

    async fn send(&mut self, envelope: Envelope) -> Result<Envelope> {
        Transport::send(&mut **self, envelope).await
    }
}

impl Transport for MockServer {
    fn set_bearer(&mut self, token: String) {
        self.bearer = token;
    }

    fn set_secret(&mut self, secret: Vec<u8>) {
        self.secrets_seen.push(secret);
    }

    async fn send(&mut self, envelope: Envelope) -> Result<Envelope> {
        if self.tamper == Tamper::FailSend {
            bail!("connection refused");
        }
        let aid = envelope.id;
        let msg = match envelope.body {
            MessageBody::Handshake(msg) => msg,
            other => bail!("mock got non-handshake body: {:?}", other),
        };
        let is_complete = matches!(msg, HandshakeMessage::AuthComplete { .. });
        let reply = self.handle(aid, msg)?;

        let id = if self.tamper == Tamper::WrongId {
            Uuid::new_v4()
        } else {
            aid
        };
        if self.tamper == Tamper::WrongType {
            return Ok(Envelope::new(id, MessageBody::Jobs(vec![])));
        }
        let body = if is_complete {
            MessageBody::Checkin
        } else {
            MessageBody::Handshake(reply)
        };
        Ok(Envelope::new(id, body))
    }
}
