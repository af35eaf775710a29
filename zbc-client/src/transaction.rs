//! Correlation of responses with in-flight requests.
//!
//! Every request/response exchange on a connection gets a transaction id from
//! a strided sequence that starts at a random seed. The reader task hands each
//! response to the waiter registered under its id.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use zbc_core::protocol::Message;
use zbc_core::{Result, ZbcError};

/// Default distance between consecutive transaction ids. Odd, so the sequence
/// visits every `u64` before repeating.
pub const DEFAULT_TRANSACTION_STRIDE: u64 = 129;

/// Callback run by the reader task when a response arrives, before the next
/// frame is read.
pub type ResponseHook = Box<dyn FnOnce(&Message) + Send + Sync + 'static>;

struct LateHook(ResponseHook);

impl std::fmt::Debug for LateHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LateHook")
    }
}

struct ResponseSlot {
    sender: oneshot::Sender<Result<Message>>,
    hook: Option<ResponseHook>,
}

impl std::fmt::Debug for ResponseSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSlot")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Registered, request not yet written.
    Created,
    /// Waiting for the response.
    AwaitingResponse,
    /// Response or connection failure delivered.
    Completed,
    /// No response within the timeout.
    TimedOut,
    /// Dropped by the caller before completion.
    Cancelled,
}

/// Registry of in-flight transactions for one connection.
#[derive(Debug)]
pub struct TransactionRegistry {
    pending: DashMap<u64, ResponseSlot>,
    late: DashMap<u64, LateHook>,
    next_id: AtomicU64,
    stride: u64,
    closed: AtomicBool,
}

impl TransactionRegistry {
    /// Creates a registry seeded from the thread RNG.
    pub fn new() -> Self {
        Self::with_seed(rand::random(), DEFAULT_TRANSACTION_STRIDE)
    }

    /// Creates a registry with an explicit seed and stride.
    pub fn with_seed(seed: u64, stride: u64) -> Self {
        Self {
            pending: DashMap::new(),
            late: DashMap::new(),
            next_id: AtomicU64::new(seed),
            stride: stride.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a new transaction.
    ///
    /// Ids still in flight are skipped, so a live waiter is never replaced.
    pub fn begin(&self) -> Result<PendingTransaction<'_>> {
        self.begin_with_hook(None)
    }

    /// Registers a new transaction whose response first runs `hook`.
    pub fn begin_with_hook(&self, hook: Option<ResponseHook>) -> Result<PendingTransaction<'_>> {
        if self.is_closed() {
            return Err(ZbcError::ConnectionClosed(
                "connection is closed".to_string(),
            ));
        }

        let (sender, rx) = oneshot::channel();
        let mut slot = Some(ResponseSlot { sender, hook });
        let id = loop {
            let id = self.next_id.fetch_add(self.stride, Ordering::Relaxed);
            match self.pending.entry(id) {
                Entry::Occupied(_) => {
                    tracing::error!(
                        request_id = id,
                        "transaction id collision with an in-flight request, skipping"
                    );
                }
                Entry::Vacant(vacant) => {
                    if let Some(slot) = slot.take() {
                        vacant.insert(slot);
                    }
                    break id;
                }
            }
        };

        // fail_all may have drained the map between the check above and the insert.
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(ZbcError::ConnectionClosed(
                "connection is closed".to_string(),
            ));
        }

        Ok(PendingTransaction {
            id,
            registry: self,
            response: rx,
            state: TransactionState::Created,
        })
    }

    /// Delivers a response to its waiter.
    ///
    /// Returns false if no waiter is registered for `id`, for example because
    /// it timed out; the response is dropped after running the late hook the
    /// waiter left behind, if any.
    pub fn complete(&self, id: u64, message: Message) -> bool {
        match self.pending.remove(&id) {
            Some((_, slot)) => {
                if let Some(hook) = slot.hook {
                    hook(&message);
                }
                if slot.sender.send(Ok(message)).is_err() {
                    tracing::debug!(request_id = id, "waiter went away before response");
                    return false;
                }
                true
            }
            None => {
                if let Some((_, LateHook(hook))) = self.late.remove(&id) {
                    tracing::debug!(request_id = id, "late response for timed out transaction");
                    hook(&message);
                } else {
                    tracing::debug!(request_id = id, "dropping response for unknown transaction");
                }
                false
            }
        }
    }

    /// Fails every waiter with `ConnectionClosed` and rejects new transactions.
    pub fn fail_all(&self, reason: &str) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.late.clear();

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot
                    .sender
                    .send(Err(ZbcError::ConnectionClosed(reason.to_string())));
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::debug!(failed, reason, "failed pending transactions");
        }
        failed
    }

    /// Returns true once [`TransactionRegistry::fail_all`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the number of in-flight transactions.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns the number of timed out transactions still waiting for a late
    /// response.
    pub fn late_hooks(&self) -> usize {
        self.late.len()
    }

    /// Returns true if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered transaction awaiting its response.
///
/// Dropping it before completion removes the response slot.
#[derive(Debug)]
pub struct PendingTransaction<'a> {
    id: u64,
    registry: &'a TransactionRegistry,
    response: oneshot::Receiver<Result<Message>>,
    state: TransactionState,
}

impl PendingTransaction<'_> {
    /// Returns the transaction id to stamp into the request header.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Waits for the response.
    pub async fn wait(self, timeout: Duration) -> Result<Message> {
        self.wait_or_leave(timeout, None).await
    }

    /// Waits for the response. On timeout, `late` is left behind and runs on
    /// the reader task if the response still arrives.
    pub async fn wait_or_leave(
        mut self,
        timeout: Duration,
        late: Option<ResponseHook>,
    ) -> Result<Message> {
        self.state = TransactionState::AwaitingResponse;
        let outcome = tokio::time::timeout(timeout, &mut self.response).await;
        match outcome {
            Ok(Ok(result)) => {
                self.state = TransactionState::Completed;
                result
            }
            Ok(Err(_)) => {
                self.state = TransactionState::Completed;
                Err(ZbcError::ConnectionClosed(format!(
                    "response slot for request {} was dropped",
                    self.id
                )))
            }
            Err(_) => {
                if let Some(hook) = late {
                    // Installed before the slot goes away, so the reader sees one or the other.
                    self.registry.late.insert(self.id, LateHook(hook));
                    if self.registry.pending.remove(&self.id).is_none() {
                        // The reader claimed the slot first and is delivering.
                        self.registry.late.remove(&self.id);
                        self.state = TransactionState::Completed;
                        return match (&mut self.response).await {
                            Ok(result) => result,
                            Err(_) => Err(ZbcError::ConnectionClosed(format!(
                                "response slot for request {} was dropped",
                                self.id
                            ))),
                        };
                    }
                }
                self.state = TransactionState::TimedOut;
                Err(ZbcError::Timeout(format!(
                    "no response to request {} within {:?}",
                    self.id, timeout
                )))
            }
        }
    }
}

impl Drop for PendingTransaction<'_> {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TransactionState::Created | TransactionState::AwaitingResponse
        ) {
            self.state = TransactionState::Cancelled;
            tracing::trace!(request_id = self.id, "transaction cancelled");
        }
        self.registry.pending.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::Arc;
    use zbc_core::protocol::ControlMessageResponse;

    fn response(id: u64) -> Message {
        Message::request(
            id,
            ControlMessageResponse {
                data: Bytes::from_static(b"\x80"),
            },
        )
    }

    #[test]
    fn test_ids_follow_stride() {
        let registry = TransactionRegistry::with_seed(10, 3);
        let a = registry.begin().unwrap();
        let b = registry.begin().unwrap();
        assert_eq!(a.id(), 10);
        assert_eq!(b.id(), 13);
        assert_eq!(a.state(), TransactionState::Created);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_live_id_is_skipped_after_wrap() {
        let registry = TransactionRegistry::with_seed(u64::MAX, 1);
        let first = registry.begin().unwrap();
        assert_eq!(first.id(), u64::MAX);

        // Force the sequence back onto the live id.
        registry.next_id.store(u64::MAX, Ordering::Relaxed);
        let second = registry.begin().unwrap();
        assert_eq!(second.id(), 0);
    }

    #[tokio::test]
    async fn test_complete_delivers_response() {
        let registry = TransactionRegistry::with_seed(1, 1);
        let pending = registry.begin().unwrap();
        let id = pending.id();

        assert!(registry.complete(id, response(id)));
        let message = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(message.request_id(), Some(id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_late_response_is_dropped() {
        let registry = TransactionRegistry::with_seed(1, 1);
        let pending = registry.begin().unwrap();
        let id = pending.id();

        let err = pending.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ZbcError::Timeout(_)));
        assert!(registry.is_empty());
        assert!(!registry.complete(id, response(id)));
    }

    #[tokio::test]
    async fn test_late_hook_runs_for_late_response() {
        let registry = TransactionRegistry::with_seed(1, 1);
        let seen = Arc::new(AtomicU64::new(0));
        let late_seen = Arc::clone(&seen);
        let pending = registry.begin().unwrap();
        let id = pending.id();

        let err = pending
            .wait_or_leave(
                Duration::from_millis(10),
                Some(Box::new(move |message: &Message| {
                    late_seen.store(message.request_id().unwrap_or(0), Ordering::SeqCst);
                })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ZbcError::Timeout(_)));
        assert!(registry.is_empty());
        assert_eq!(registry.late_hooks(), 1);

        assert!(!registry.complete(id, response(id)));
        assert_eq!(seen.load(Ordering::SeqCst), id);
        assert_eq!(registry.late_hooks(), 0);

        // A second copy finds nothing left to run.
        assert!(!registry.complete(id, response(id)));
    }

    #[tokio::test]
    async fn test_late_hooks_cleared_on_fail_all() {
        let registry = TransactionRegistry::with_seed(1, 1);
        let pending = registry.begin().unwrap();
        let _ = pending
            .wait_or_leave(Duration::from_millis(10), Some(Box::new(|_: &Message| {})))
            .await;
        assert_eq!(registry.late_hooks(), 1);

        registry.fail_all("closed");
        assert_eq!(registry.late_hooks(), 0);
    }

    #[tokio::test]
    async fn test_hook_runs_before_waiter_wakes() {
        let registry = TransactionRegistry::with_seed(1, 1);
        let seen = Arc::new(AtomicU64::new(0));
        let hook_seen = Arc::clone(&seen);
        let pending = registry
            .begin_with_hook(Some(Box::new(move |message: &Message| {
                hook_seen.store(message.request_id().unwrap_or(0), Ordering::SeqCst);
            })))
            .unwrap();
        let id = pending.id();

        assert!(registry.complete(id, response(id)));
        assert_eq!(seen.load(Ordering::SeqCst), id);
        pending.wait(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn test_drop_removes_slot() {
        let registry = TransactionRegistry::new();
        {
            let _pending = registry.begin().unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let registry = TransactionRegistry::new();
        let a = registry.begin().unwrap();
        let b = registry.begin().unwrap();

        assert_eq!(registry.fail_all("socket reset"), 2);
        assert!(matches!(
            a.wait(Duration::from_secs(1)).await,
            Err(ZbcError::ConnectionClosed(_))
        ));
        assert!(matches!(
            b.wait(Duration::from_secs(1)).await,
            Err(ZbcError::ConnectionClosed(_))
        ));
        assert!(matches!(
            registry.begin(),
            Err(ZbcError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_ids_are_unique() {
        let registry = Arc::new(TransactionRegistry::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                let mut held = Vec::new();
                for _ in 0..200 {
                    let pending = registry.begin().unwrap();
                    ids.push(pending.id());
                    held.push(pending);
                }
                drop(held);
                ids
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(all.insert(id), "duplicate transaction id {id}");
            }
        }
        assert_eq!(all.len(), 16 * 200);
        assert!(registry.is_empty());
    }
}
