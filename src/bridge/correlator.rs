//! Request/reply correlation over one duplex bridge stream
//!
//! Each request registers a oneshot completion under a fresh id before it
//! is written, and that entry is settled exactly once: by the matching
//! reply, by a timeout, or by its peer going away. Requests made while no
//! peer is attached wait in a FIFO queue that is flushed in order when one
//! attaches.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::Framed;

use super::WireError;
use crate::core::{BrowseError, Result};
use crate::protocol::{Decoded, FrameCodec};

struct Pending {
    reply: oneshot::Sender<Result<Value>>,
    /// Peer generation the request was written to, `None` while queued
    sent_to: Option<u64>,
}

struct Peer {
    generation: u64,
    tx: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    generation: u64,
    peer: Option<Peer>,
    pending: HashMap<String, Pending>,
    queue: VecDeque<(String, Value)>,
}

impl Inner {
    /// Write to the current peer or queue; returns the generation written to
    fn dispatch(&mut self, id: &str, message: Value) -> Option<u64> {
        let message = match &self.peer {
            Some(peer) => match peer.tx.send(message) {
                Ok(()) => return Some(peer.generation),
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        self.queue.push_back((id.to_string(), message));
        None
    }

    /// Fail everything written to a peer generation
    fn fail_sent_to(&mut self, generation: u64) {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.sent_to == Some(generation))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(BrowseError::PeerDisconnected));
            }
        }
    }
}

/// Daemon side of the host bridge; clones share the same state
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Mutex<Inner>>,
    timeout: Duration,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `{method, params}` and wait for the matching reply
    pub async fn request(&self, message: Value) -> Result<Value> {
        self.request_within(message, self.timeout).await
    }

    /// Like `request`, with its own deadline instead of the default one
    pub async fn request_within(&self, mut message: Value, deadline: Duration) -> Result<Value> {
        let (id, rx) = {
            let mut inner = self.inner.lock().await;
            inner.next_id += 1;
            let id = format!("req-{}", inner.next_id);
            if let Value::Object(map) = &mut message {
                map.insert("id".to_string(), Value::String(id.clone()));
            }
            let (tx, rx) = oneshot::channel();
            let sent_to = inner.dispatch(&id, message);
            if sent_to.is_none() {
                tracing::debug!(id = %id, "no bridge peer attached, request queued");
            }
            inner.pending.insert(id.clone(), Pending { reply: tx, sent_to });
            (id, rx)
        };

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrowseError::PeerDisconnected),
            Err(_) => {
                let mut inner = self.inner.lock().await;
                inner.pending.remove(&id);
                inner.queue.retain(|(queued, _)| *queued != id);
                tracing::warn!(id = %id, "bridge request timed out");
                Err(BrowseError::BridgeTimeout {
                    id,
                    secs: deadline.as_secs(),
                })
            }
        }
    }

    /// Attach a peer stream, replacing any current peer.
    ///
    /// Requests in flight to the replaced peer fail with
    /// `PeerDisconnected`; queued requests go to the new peer in order.
    pub async fn attach<S>(&self, stream: S) -> u64
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut inner = self.inner.lock().await;
            inner.generation += 1;
            let generation = inner.generation;
            if let Some(old) = inner.peer.take() {
                tracing::info!(old = old.generation, new = generation, "replacing bridge peer");
                inner.fail_sent_to(old.generation);
            }
            let flushed = inner.queue.len();
            while let Some((id, message)) = inner.queue.pop_front() {
                if tx.send(message).is_ok() {
                    if let Some(pending) = inner.pending.get_mut(&id) {
                        pending.sent_to = Some(generation);
                    }
                }
            }
            inner.peer = Some(Peer { generation, tx });
            tracing::info!(generation, flushed, "bridge peer attached");
            generation
        };

        let correlator = self.clone();
        tokio::spawn(async move {
            correlator.pump(stream, rx, generation).await;
        });
        generation
    }

    async fn pump<S>(&self, stream: S, mut rx: mpsc::UnboundedReceiver<Value>, generation: u64)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut frames) = Framed::new(stream, FrameCodec).split();
        loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            tracing::warn!(generation, error = %e, "bridge write failed");
                            break;
                        }
                    }
                    // Replaced by a newer peer
                    None => break,
                },
                incoming = frames.next() => match incoming {
                    Some(Ok(Decoded::Message(value))) => self.settle(value).await,
                    Some(Ok(Decoded::Malformed(reason))) => {
                        tracing::warn!(generation, reason = %reason, "dropping malformed bridge frame");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(generation, error = %e, "bridge read failed");
                        break;
                    }
                    None => break,
                },
            }
        }
        self.detach(generation).await;
    }

    /// Deliver a reply to its pending request
    async fn settle(&self, reply: Value) {
        let Some(id) = reply.get("id").and_then(Value::as_str) else {
            tracing::warn!("dropping bridge reply without id");
            return;
        };
        let pending = self.inner.lock().await.pending.remove(id);
        let Some(pending) = pending else {
            tracing::warn!(id = %id, "dropping reply for unknown or expired request");
            return;
        };
        let result = match reply.get("error") {
            Some(error) => Err(WireError::from_value(error).into_error()),
            None => Ok(reply.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = pending.reply.send(result);
    }

    async fn detach(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.peer.as_ref().is_some_and(|p| p.generation == generation) {
            inner.peer = None;
            tracing::info!(generation, "bridge peer detached");
        }
        inner.fail_sent_to(generation);
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.peer.is_some()
    }

    /// Requests awaiting a reply, queued ones included
    pub async fn pending(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn queued(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::DuplexStream;

    type PeerEnd = Framed<DuplexStream, FrameCodec>;

    async fn attached(correlator: &Correlator) -> PeerEnd {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        correlator.attach(ours).await;
        Framed::new(theirs, FrameCodec)
    }

    async fn next_request(peer: &mut PeerEnd) -> Value {
        match peer.next().await {
            Some(Ok(Decoded::Message(value))) => value,
            other => panic!("expected a request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replies_match_by_id() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let mut peer = attached(&correlator).await;

        let first = tokio::spawn({
            let c = correlator.clone();
            async move { c.request(json!({"method": "page_info", "params": {"page": 1}})).await }
        });
        let second = tokio::spawn({
            let c = correlator.clone();
            async move { c.request(json!({"method": "page_info", "params": {"page": 2}})).await }
        });

        let a = next_request(&mut peer).await;
        let b = next_request(&mut peer).await;
        // Answer out of order
        for req in [&b, &a] {
            let page = req["params"]["page"].clone();
            peer.send(json!({"id": req["id"], "result": {"page": page}}))
                .await
                .unwrap();
        }

        assert_eq!(first.await.unwrap().unwrap(), json!({"page": 1}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"page": 2}));
        assert_eq!(correlator.pending().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_drops_late_reply() {
        let correlator = Correlator::new(Duration::from_millis(50));
        let mut peer = attached(&correlator).await;

        let err = correlator
            .request(json!({"method": "launch"}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrowseError::BridgeTimeout { ref id, .. } if id == "req-1"));
        assert_eq!(correlator.pending().await, 0);

        // The late reply is dropped, not matched to the next request
        let request = next_request(&mut peer).await;
        peer.send(json!({"id": request["id"], "result": "late"}))
            .await
            .unwrap();

        let next = tokio::spawn({
            let c = correlator.clone();
            async move { c.request(json!({"method": "launch"})).await }
        });
        let request = next_request(&mut peer).await;
        assert_eq!(request["id"], "req-2");
        peer.send(json!({"id": "req-2", "result": null})).await.unwrap();
        assert_eq!(next.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_own_deadline_outlives_default() {
        let correlator = Correlator::new(Duration::from_millis(50));
        let mut peer = attached(&correlator).await;

        let slow = tokio::spawn({
            let c = correlator.clone();
            async move {
                c.request_within(json!({"method": "wait_for"}), Duration::from_secs(5))
                    .await
            }
        });
        let request = next_request(&mut peer).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(correlator.pending().await, 1);

        peer.send(json!({"id": request["id"], "result": null}))
            .await
            .unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), Value::Null);
        assert_eq!(correlator.pending().await, 0);
    }

    #[tokio::test]
    async fn test_queue_flushes_in_order_on_attach() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let mut handles = Vec::new();
        for n in 0..3 {
            let c = correlator.clone();
            handles.push(tokio::spawn(async move {
                c.request(json!({"method": "new_page", "params": {"context": n}}))
                    .await
            }));
            // Keep the queue order deterministic
            while correlator.queued().await < n + 1 {
                tokio::task::yield_now().await;
            }
        }
        assert!(!correlator.is_attached().await);

        let mut peer = attached(&correlator).await;
        for n in 0..3 {
            let request = next_request(&mut peer).await;
            assert_eq!(request["params"]["context"], n);
            peer.send(json!({"id": request["id"], "result": n})).await.unwrap();
        }
        for (n, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), json!(n));
        }
    }

    #[tokio::test]
    async fn test_replacement_fails_in_flight_requests() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let mut old = attached(&correlator).await;

        let in_flight = tokio::spawn({
            let c = correlator.clone();
            async move { c.request(json!({"method": "launch"})).await }
        });
        next_request(&mut old).await;

        let mut new = attached(&correlator).await;
        assert!(matches!(
            in_flight.await.unwrap(),
            Err(BrowseError::PeerDisconnected)
        ));

        let next = tokio::spawn({
            let c = correlator.clone();
            async move { c.request(json!({"method": "shutdown"})).await }
        });
        let request = next_request(&mut new).await;
        new.send(json!({"id": request["id"], "error": {"kind": "unsupported", "message": "shutdown"}}))
            .await
            .unwrap();
        assert_eq!(
            next.await.unwrap().unwrap_err().to_string(),
            "Unsupported by engine: shutdown"
        );
    }

    #[tokio::test]
    async fn test_detach_fails_in_flight_requests() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let mut peer = attached(&correlator).await;
        let in_flight = tokio::spawn({
            let c = correlator.clone();
            async move { c.request(json!({"method": "launch"})).await }
        });
        next_request(&mut peer).await;
        drop(peer);

        assert!(matches!(
            in_flight.await.unwrap(),
            Err(BrowseError::PeerDisconnected)
        ));
        assert!(!correlator.is_attached().await);
    }
}
