/// Outbound delivery: one queue, spaced peer contacts, retry with backoff.
///
/// Every frame a group wants to send goes through a single dispatcher task.
/// Successive contacts are spaced by `peer_contact_spacing`; a failed send
/// is retried after `retry_backoff * 2^attempt` until `max_send_attempts`.
/// Jobs carry their group's cancellation token so deleting a group stops
/// its retries.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::crdt::ids::GroupID;

/// Transport address of a peer (an onion service address in production).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(pub String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        PeerAddress(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self.0)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Send timed out")]
    Timeout,

    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Delivers one frame to one peer. Best effort; the dispatcher retries.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer: &PeerAddress, frame: Vec<u8>) -> Result<(), TransportError>;
}

#[derive(Clone, Debug)]
pub struct DispatchPolicy {
    pub spacing: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl DispatchPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        DispatchPolicy {
            spacing: config.peer_contact_spacing(),
            max_attempts: config.max_send_attempts.max(1),
            backoff: config.retry_backoff(),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff
            .checked_mul(1u32 << attempt.saturating_sub(1).min(16))
            .unwrap_or(Duration::MAX)
    }
}

struct Job {
    group_id: GroupID,
    peer: PeerAddress,
    frame: Vec<u8>,
    attempt: u32,
    cancel: CancellationToken,
}

/// Handle to the dispatcher task. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Start the dispatcher task. It stops when `shutdown` fires or every
    /// handle is dropped.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        policy: DispatchPolicy,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let retry_tx = tx.downgrade();
        let handle = tokio::spawn(run(transport, policy, rx, retry_tx, shutdown));
        (Dispatcher { tx }, handle)
    }

    /// Queue a frame for `peer`. Returns false once the dispatcher is gone.
    pub fn enqueue(
        &self,
        group_id: GroupID,
        peer: PeerAddress,
        frame: Vec<u8>,
        cancel: CancellationToken,
    ) -> bool {
        self.tx
            .send(Job {
                group_id,
                peer,
                frame,
                attempt: 1,
                cancel,
            })
            .is_ok()
    }
}

async fn run(
    transport: Arc<dyn Transport>,
    policy: DispatchPolicy,
    mut rx: mpsc::UnboundedReceiver<Job>,
    retry_tx: mpsc::WeakUnboundedSender<Job>,
    shutdown: CancellationToken,
) {
    let mut last_contact: Option<Instant> = None;

    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if job.cancel.is_cancelled() {
            log::debug!("dispatch: dropped frame for deleted group {}", job.group_id);
            continue;
        }

        if let Some(last) = last_contact {
            let next = last + policy.spacing;
            if next > Instant::now() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = time::sleep_until(next) => {}
                }
            }
        }
        last_contact = Some(Instant::now());

        match transport.send(&job.peer, job.frame.clone()).await {
            Ok(()) => {
                log::trace!("dispatch: {} bytes to {} (attempt {})", job.frame.len(), job.peer, job.attempt);
            }
            Err(e) if job.attempt < policy.max_attempts => {
                let delay = policy.backoff_for(job.attempt);
                log::debug!(
                    "dispatch: send to {} failed ({}), retry {} in {:?}",
                    job.peer,
                    e,
                    job.attempt + 1,
                    delay
                );
                schedule_retry(job, delay, retry_tx.clone());
            }
            Err(e) => {
                log::warn!(
                    "dispatch: giving up on {} for group {} after {} attempts: {}",
                    job.peer,
                    job.group_id,
                    job.attempt,
                    e
                );
            }
        }
    }
    log::debug!("dispatch: stopped");
}

fn schedule_retry(mut job: Job, delay: Duration, retry_tx: mpsc::WeakUnboundedSender<Job>) {
    tokio::spawn(async move {
        tokio::select! {
            _ = job.cancel.cancelled() => return,
            _ = time::sleep(delay) => {}
        }
        job.attempt += 1;
        if let Some(tx) = retry_tx.upgrade() {
            let _ = tx.send(job);
        }
    });
}
