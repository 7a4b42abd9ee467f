//! Readiness handshake for the shared private reply queue.
//!
//! One broker-named queue carries the replies for every request made through
//! a channel. The first caller to need it installs a fresh generation in
//! INITIALIZING state and runs the declaration; callers arriving while that
//! is in flight subscribe to the generation's watch channel and wait for the
//! READY transition. A caller whose wait window elapses clears the slot, but
//! only if it still holds the generation it was watching, and tries again
//! from the top. The whole protocol is bounded by `max_attempts`.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::RpcOptions;
use crate::error::{BusError, Result};

/// Broadcast state of one reply-queue generation.
#[derive(Clone, Debug)]
enum QueueState {
    Initializing,
    Ready(String),
}

struct Generation {
    state: watch::Receiver<QueueState>,
}

/// The one shared slot per channel.
pub(crate) struct ReplyQueueSlot {
    current: Mutex<Option<Generation>>,
}

/// What `claim` found under the lock.
enum Role {
    Ready(String),
    Initiator(watch::Sender<QueueState>),
    Waiter(watch::Receiver<QueueState>),
}

impl ReplyQueueSlot {
    pub(crate) fn new() -> Self {
        ReplyQueueSlot {
            current: Mutex::new(None),
        }
    }

    /// Name of the ready queue, if a generation has reached READY.
    pub(crate) fn ready_name(&self) -> Option<String> {
        let current = self.current.lock().unwrap();
        current.as_ref().and_then(|generation| match &*generation.state.borrow() {
            QueueState::Ready(name) => Some(name.clone()),
            QueueState::Initializing => None,
        })
    }

    /// Resolve the shared queue name, declaring the queue if this caller
    /// gets there first.
    ///
    /// `declare` runs at most once per generation, in the task that
    /// installed it. It must declare the broker queue, attach the reply
    /// consumer, and return the broker-generated name. A declaration
    /// failure surfaces to the initiating caller alone; waiters ride out
    /// their windows and retry, so a transient broker problem costs them
    /// time but not an error.
    pub(crate) async fn resolve<F, Fut>(&self, options: &RpcOptions, declare: F) -> Result<String>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        for attempt in 1..=options.max_attempts {
            match self.claim() {
                Role::Ready(name) => return Ok(name),
                Role::Initiator(state_tx) => {
                    let window = wait_window(options);
                    match tokio::time::timeout(window, declare()).await {
                        Ok(Ok(name)) => {
                            state_tx.send_replace(QueueState::Ready(name.clone()));
                            debug!(queue = %name, attempt, "private reply queue ready");
                            return Ok(name);
                        }
                        Ok(Err(err)) => {
                            self.clear_generation(&state_tx.subscribe());
                            warn!(attempt, error = %err, "private reply queue declaration failed");
                            return Err(err);
                        }
                        Err(_elapsed) => {
                            self.clear_generation(&state_tx.subscribe());
                            debug!(attempt, "private reply queue declaration timed out");
                        }
                    }
                }
                Role::Waiter(mut state) => {
                    let window = wait_window(options);
                    let outcome = tokio::time::timeout(window, async {
                        loop {
                            if let QueueState::Ready(name) = &*state.borrow() {
                                return name.clone();
                            }
                            if state.changed().await.is_err() {
                                // The initiator went away without reaching
                                // READY. Hold until our window elapses, then
                                // retry like any timed-out waiter.
                                std::future::pending::<()>().await;
                            }
                        }
                    })
                    .await;
                    match outcome {
                        Ok(name) => return Ok(name),
                        Err(_elapsed) => {
                            self.clear_generation(&state);
                            debug!(attempt, "timed out waiting for the private reply queue");
                        }
                    }
                }
            }
        }
        Err(BusError::RpcTimeout {
            timeout_ms: options.call_timeout.as_millis() as u64,
            attempts: options.max_attempts,
        })
    }

    /// Inspect the slot, installing a new generation when it is empty.
    fn claim(&self) -> Role {
        let mut current = self.current.lock().unwrap();
        if let Some(generation) = current.as_ref() {
            if let QueueState::Ready(name) = &*generation.state.borrow() {
                return Role::Ready(name.clone());
            }
            return Role::Waiter(generation.state.clone());
        }
        let (state_tx, state_rx) = watch::channel(QueueState::Initializing);
        *current = Some(Generation { state: state_rx });
        Role::Initiator(state_tx)
    }

    /// Clear the slot, but only while it still holds the generation the
    /// caller interacted with. A newer generation installed meanwhile is
    /// someone else's fresh start and stays.
    fn clear_generation(&self, state: &watch::Receiver<QueueState>) {
        let mut current = self.current.lock().unwrap();
        if current
            .as_ref()
            .map_or(false, |generation| generation.state.same_channel(state))
        {
            *current = None;
        }
    }
}

/// `call_timeout` shifted by up to the configured jitter in either
/// direction, so callers that timed out together do not stampede together.
fn wait_window(options: &RpcOptions) -> Duration {
    let base_ms = options.call_timeout.as_millis() as i64;
    let jitter_ms = options.jitter.as_millis() as i64;
    let offset = if jitter_ms == 0 {
        0
    } else {
        (rand::random::<f64>() * (2 * jitter_ms) as f64) as i64 - jitter_ms
    };
    Duration::from_millis((base_ms + offset).max(1) as u64)
}
