//! Pending Request Tracking
//!
//! One [`PendingEntry`] per outstanding CALL, keyed by request id. An entry
//! is removed exactly once (by response arrival, by its timeout firing, or
//! by forced rejection on teardown), and removal happens under the map lock
//! before the caller is completed, so a response racing its own timeout can
//! never complete the caller twice.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use hubrpc_common::protocol::{Result, RpcError};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

/// Client-side record of one outstanding CALL.
struct PendingEntry {
    completer: oneshot::Sender<Result<Value>>,
    timer: Option<JoinHandle<()>>,
    /// Originating call shape, for diagnostics.
    method: String,
    target: String,
    created_at: Instant,
}

/// The map from request id to pending entry.
///
/// The lock is a plain mutex: insert, complete, and drain are all
/// non-blocking and never held across an await point.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh entry and hands back the receiver the caller awaits.
    pub(crate) fn insert(
        &self,
        id: String,
        method: String,
        target: String,
    ) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("pending map lock poisoned");
        inner.insert(
            id,
            PendingEntry {
                completer: tx,
                timer: None,
                method,
                target,
                created_at: Instant::now(),
            },
        );
        rx
    }

    /// Attaches the timeout task to an entry. If the entry already
    /// completed, the freshly armed timer is cancelled instead.
    pub(crate) fn set_timer(&self, id: &str, timer: JoinHandle<()>) {
        let mut inner = self.inner.lock().expect("pending map lock poisoned");
        match inner.get_mut(id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Completes the entry for `id`, cancelling its timer. Returns false if
    /// no entry exists: the request already completed or was never ours,
    /// and the result is dropped.
    pub(crate) fn complete(&self, id: &str, result: Result<Value>) -> bool {
        let entry = {
            let mut inner = self.inner.lock().expect("pending map lock poisoned");
            inner.remove(id)
        };
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                trace!(
                    request = id,
                    method = %entry.method,
                    target = %entry.target,
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Completing pending request"
                );
                // the caller may have stopped awaiting; that is fine
                let _ = entry.completer.send(result);
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding entry, e.g. on disconnect. `make_err`
    /// produces one error per entry.
    pub(crate) fn fail_all(&self, make_err: impl Fn() -> RpcError) {
        let drained: Vec<(String, PendingEntry)> = {
            let mut inner = self.inner.lock().expect("pending map lock poisoned");
            inner.drain().collect()
        };
        for (id, entry) in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            trace!(request = %id, "Rejecting pending request on teardown");
            let _ = entry.completer.send(Err(make_err()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("pending map lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_resolves_the_receiver() {
        let pending = PendingRequests::new();
        let rx = pending.insert("req-1".into(), "m".into(), "t".into());

        assert!(pending.complete("req-1", Ok(json!({"ok": true}))));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_completes_exactly_once() {
        let pending = PendingRequests::new();
        let _rx = pending.insert("req-1".into(), "m".into(), "t".into());

        assert!(pending.complete("req-1", Ok(json!(1))));
        // the losing side of the race is a no-op
        assert!(!pending.complete("req-1", Err(RpcError::Timeout(100))));
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let pending = PendingRequests::new();
        assert!(!pending.complete("req-ghost", Ok(json!(null))));
    }

    #[tokio::test]
    async fn test_fail_all_rejects_everything() {
        let pending = PendingRequests::new();
        let rx1 = pending.insert("req-1".into(), "m".into(), "t".into());
        let rx2 = pending.insert("req-2".into(), "m".into(), "t".into());

        pending.fail_all(|| RpcError::NotConnected);

        for rx in [rx1, rx2] {
            let err = rx.await.unwrap().unwrap_err();
            assert_eq!(err.code(), hubrpc_common::protocol::ErrorCode::NotConnected);
        }
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_timer_attached_after_completion_is_cancelled() {
        let pending = PendingRequests::new();
        let _rx = pending.insert("req-1".into(), "m".into(), "t".into());
        pending.complete("req-1", Ok(json!(null)));

        let timer = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        pending.set_timer("req-1", timer);
        // the orphaned timer must have been aborted, not left sleeping
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_racing_completions_deliver_one_result() {
        use std::sync::Arc;
        let pending = Arc::new(PendingRequests::new());
        let rx = pending.insert("req-1".into(), "m".into(), "t".into());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let pending = pending.clone();
            tasks.push(tokio::spawn(async move {
                pending.complete("req-1", Ok(json!(i)))
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(rx.await.unwrap().is_ok());
    }
}
