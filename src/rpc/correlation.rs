use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// A call waiting for its reply: where to deliver it, whether the payload is
/// passed through raw, and when the entry stops being worth keeping.
struct PendingCall {
    reply_tx: oneshot::Sender<Vec<u8>>,
    raw: bool,
    expires_at: Instant,
}

/// Outcome of routing one reply into the map.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    /// Delivered to a waiting caller.
    Completed,
    /// No entry under that id. Already answered, expired, or not ours.
    Unknown,
    /// The entry wanted JSON and the payload is not valid JSON. The entry is
    /// kept so the caller keeps waiting for a usable reply.
    Malformed,
    /// Entry found but the caller stopped waiting.
    Gone,
}

/// Pending calls keyed by correlation id.
///
/// Ids are generated here so uniqueness among live entries is guaranteed at
/// the point of insertion.
pub(crate) struct CorrelationMap {
    entries: Mutex<HashMap<String, PendingCall>>,
}

impl CorrelationMap {
    pub(crate) fn new() -> Self {
        CorrelationMap {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh pending call and hand back its id and the receiving
    /// end of the reply. Regenerates the id on the vanishingly rare
    /// collision with a live entry.
    pub(crate) fn register(&self, raw: bool, ttl: Duration) -> (String, oneshot::Receiver<Vec<u8>>) {
        let mut entries = self.entries.lock().unwrap();
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        entries.insert(
            id.clone(),
            PendingCall {
                reply_tx,
                raw,
                expires_at: Instant::now() + ttl,
            },
        );
        (id, reply_rx)
    }

    /// Route one reply payload to its pending call.
    pub(crate) fn complete(&self, id: &str, payload: &[u8]) -> RouteOutcome {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(id) {
            None => RouteOutcome::Unknown,
            Some(call) if !call.raw && !is_json(payload) => RouteOutcome::Malformed,
            Some(_) => {
                let call = match entries.remove(id) {
                    Some(call) => call,
                    None => return RouteOutcome::Unknown,
                };
                match call.reply_tx.send(payload.to_vec()) {
                    Ok(()) => RouteOutcome::Completed,
                    Err(_) => RouteOutcome::Gone,
                }
            }
        }
    }

    /// Forget a pending call. Used when the caller gives up first.
    pub(crate) fn remove(&self, id: &str) {
        self.entries.lock().unwrap().remove(id);
    }

    /// Evict entries past their deadline. Returns how many went.
    pub(crate) fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, call| call.expires_at > now);
        before - entries.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn is_json(payload: &[u8]) -> bool {
    serde_json::from_slice::<serde::de::IgnoredAny>(payload).is_ok()
}
