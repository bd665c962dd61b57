//! Connection resilience controller
//!
//! Client-side state machine deciding whether sync should be attempted.
//! One check cycle runs: reachability → credentials → remote health
//! probe, and lands in one of four states:
//!
//! - `Offline` — no connectivity; push/pull are never attempted
//! - `Connecting` — a check cycle is in flight
//! - `Connected` — the probe succeeded; the retry counter resets to 0
//! - `LocalOnly` — reachable but no credential (terminal for this cycle)
//!   or the probe failed (a retry is scheduled with exponential backoff)
//!
//! Retry delay is `min(1000ms * 2^retry_count, 64000ms)`; retries continue
//! indefinitely until success or until the network goes offline. At most
//! one retry timer is ever pending: scheduling a new one cancels the
//! previous, and a manual [`ConnectionController::check_now`] cancels it
//! too before running the cycle immediately.
//!
//! Dependent subsystems gate their remote transport on the published
//! watch channel and tear it down whenever the state leaves `Connected`.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Connection state as seen by dependent subsystems. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Offline,
    Connecting,
    Connected,
    LocalOnly,
}

/// Network-reachability oracle (e.g. the OS link state)
pub trait NetworkOracle: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Credential oracle; `None` means no signed-in session exists
pub trait CredentialOracle: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Remote health probe, answering whether the sync backend responds
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> BoxFuture<'_, bool>;
}

/// Reachability oracle that always reports connectivity.
///
/// Stand-in for platforms without a link-state signal; the health probe
/// then carries the full weight of detecting an unreachable remote.
pub struct AlwaysOnline;

impl NetworkOracle for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Credential oracle backed by a fixed optional token
pub struct StaticCredentials(pub Option<String>);

impl CredentialOracle for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Backoff delay in milliseconds for the k-th retry
pub fn retry_delay_ms(retry_count: u32) -> u64 {
    1000u64
        .saturating_mul(1u64 << retry_count.min(16))
        .min(64_000)
}

struct RetryState {
    count: u32,
    pending: Option<JoinHandle<()>>,
}

struct Inner {
    network: Arc<dyn NetworkOracle>,
    credentials: Arc<dyn CredentialOracle>,
    probe: Arc<dyn HealthProbe>,
    state_tx: watch::Sender<ConnectionState>,
    retry: Mutex<RetryState>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        // Re-entering the current state is a no-op for watchers.
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(?state, "Connection state changed");
                *current = state;
                true
            }
        });
    }

    fn cancel_pending(&self) {
        let mut retry = self.retry.lock();
        if let Some(handle) = retry.pending.take() {
            handle.abort();
        }
    }

    async fn run_cycle(self: Arc<Self>) {
        if !self.network.is_online() {
            // Retrying is pointless without connectivity; reachability
            // returning re-enters the cycle via check_now.
            self.cancel_pending();
            self.set_state(ConnectionState::Offline);
            return;
        }

        self.set_state(ConnectionState::Connecting);

        if self.credentials.token().is_none() {
            info!("No credentials found, working in local-only mode");
            self.set_state(ConnectionState::LocalOnly);
            return;
        }

        if self.probe.probe().await {
            self.set_state(ConnectionState::Connected);
            self.retry.lock().count = 0;
        } else {
            self.set_state(ConnectionState::LocalOnly);
            Self::schedule_retry(&self);
        }
    }

    fn schedule_retry(inner: &Arc<Self>) {
        let mut retry = inner.retry.lock();
        if let Some(handle) = retry.pending.take() {
            handle.abort();
        }
        let delay = std::time::Duration::from_millis(retry_delay_ms(retry.count));
        info!(delay_ms = delay.as_millis() as u64, "Scheduling connection retry");

        let inner = inner.clone();
        retry.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut retry = inner.retry.lock();
                retry.count += 1;
                retry.pending = None;
            }
            inner.clone().run_cycle().await;
        }));
    }
}

/// Handle to the resilience state machine. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<Inner>,
}

impl ConnectionController {
    /// Create a controller in the `Connecting` state. No check runs until
    /// [`start`](Self::start) or [`check_now`](Self::check_now).
    pub fn new(
        network: Arc<dyn NetworkOracle>,
        credentials: Arc<dyn CredentialOracle>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(Inner {
                network,
                credentials,
                probe,
                state_tx,
                retry: Mutex::new(RetryState {
                    count: 0,
                    pending: None,
                }),
            }),
        }
    }

    /// Run the initial check cycle
    pub async fn start(&self) {
        self.check_now().await;
    }

    /// Run a check cycle immediately, cancelling any pending retry timer
    /// so no duplicate probe can fire concurrently.
    ///
    /// Also the entry point for reachability changes: callers invoke this
    /// when the network oracle reports a transition.
    pub async fn check_now(&self) {
        self.inner.cancel_pending();
        self.inner.clone().run_cycle().await;
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Current retry counter (next backoff exponent)
    pub fn retry_count(&self) -> u32 {
        self.inner.retry.lock().count
    }

    /// Cancel any pending retry
    pub fn shutdown(&self) {
        self.inner.cancel_pending();
    }
}
