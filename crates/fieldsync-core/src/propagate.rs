//! Shared propagation loop
//!
//! Saves and sync passes talk to the remote through the same loop so they
//! follow the same rules:
//!
//! 1. Cancellation and reachability are checked before every attempt.
//! 2. Each attempt is bounded by the attempt timeout; a timeout counts as a
//!    transient failure.
//! 3. Permanent errors stop immediately.
//! 4. At most `max_attempts` attempts run per call. A transient failure
//!    before the last one waits `delay_for_attempt(n)` and tries again;
//!    the last one reports exhaustion.
//! 5. The wait before a retry ends early when the token is cancelled.
//!
//! An attempt that is already in flight is never interrupted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, RemoteError};
use crate::models::{RecordId, RevisionedPayload};
use crate::network::{NetworkMonitor, NetworkState};
use crate::remote::RemoteBackend;
use crate::retry::{RetryAttempt, RetryPolicy};

/// Progress notifications from the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationStep {
    /// Attempt `n` (1-based) is about to start
    Attempting(u32),
    /// Attempt failed transiently; waiting before the next one
    RetryScheduled(RetryAttempt),
}

/// Terminal result of the loop
#[derive(Debug, Clone, PartialEq)]
pub enum PropagationOutcome<T> {
    Done { value: T, attempts: u32 },
    /// Network was offline before an attempt could start
    Offline { attempts: u32 },
    /// Retry budget used up on transient failures
    Exhausted { attempts: u32, error: RemoteError },
    /// The remote refused for good
    Permanent { attempts: u32, error: RemoteError },
    Cancelled { attempts: u32 },
}

impl<T> PropagationOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            PropagationOutcome::Done { attempts, .. }
            | PropagationOutcome::Offline { attempts }
            | PropagationOutcome::Exhausted { attempts, .. }
            | PropagationOutcome::Permanent { attempts, .. }
            | PropagationOutcome::Cancelled { attempts } => *attempts,
        }
    }

    /// Error kind of a non-successful outcome
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            PropagationOutcome::Done { .. } => None,
            PropagationOutcome::Offline { .. } | PropagationOutcome::Exhausted { .. } => {
                Some(ErrorKind::TransientNetwork)
            }
            PropagationOutcome::Permanent { .. } => Some(ErrorKind::PermanentRemote),
            PropagationOutcome::Cancelled { .. } => Some(ErrorKind::Cancelled),
        }
    }
}

/// Runs remote operations under the retry policy
#[derive(Clone)]
pub struct Propagator {
    remote: Arc<dyn RemoteBackend>,
    network: Arc<NetworkMonitor>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl std::fmt::Debug for Propagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Propagator")
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl Propagator {
    pub fn new(
        remote: Arc<dyn RemoteBackend>,
        network: Arc<NetworkMonitor>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            network,
            policy,
            attempt_timeout,
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteBackend> {
        &self.remote
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Push one record version
    pub async fn push(
        &self,
        record_id: &RecordId,
        payload: &RevisionedPayload,
        token: &CancellationToken,
        observe: impl FnMut(PropagationStep),
    ) -> PropagationOutcome<()> {
        self.run(token, observe, || self.remote.push(record_id, payload))
            .await
    }

    /// Run `op` until it succeeds, fails for good, or the budget runs out
    pub async fn run<T, F, Fut>(
        &self,
        token: &CancellationToken,
        mut observe: impl FnMut(PropagationStep),
        mut op: F,
    ) -> PropagationOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempts = 0;
        loop {
            if token.is_cancelled() {
                return PropagationOutcome::Cancelled { attempts };
            }
            if !self.network.is_online() {
                debug!(attempts, "Offline, handing off");
                return PropagationOutcome::Offline { attempts };
            }

            attempts += 1;
            observe(PropagationStep::Attempting(attempts));

            let result = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(self.attempt_timeout)),
            };

            let error = match result {
                Ok(value) => return PropagationOutcome::Done { value, attempts },
                Err(error) => error,
            };

            if error.kind() == ErrorKind::PermanentRemote {
                warn!(attempts, %error, "Permanent remote failure");
                return PropagationOutcome::Permanent { attempts, error };
            }
            if error == RemoteError::Unreachable {
                self.network.report(NetworkState::Offline);
            }

            // A zero budget still runs the first attempt
            let retry = if attempts < self.policy.max_attempts.max(1) {
                self.policy.attempt(attempts, error.kind())
            } else {
                None
            };
            let Some(retry) = retry else {
                warn!(attempts, %error, "Retries exhausted");
                return PropagationOutcome::Exhausted { attempts, error };
            };

            debug!(
                attempt = retry.attempt_number,
                delay_ms = retry.scheduled_delay.as_millis() as u64,
                %error,
                "Scheduling retry"
            );
            observe(PropagationStep::RetryScheduled(retry));

            tokio::select! {
                _ = token.cancelled() => {
                    return PropagationOutcome::Cancelled { attempts };
                }
                _ = tokio::time::sleep(retry.scheduled_delay) => {}
            }
        }
    }
}
