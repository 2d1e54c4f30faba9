//! Completion queues: the engine's per-thread event source.
//!
//! Each queue delivers an ordered stream of [`QueueItem`]s to exactly one
//! poll task. A dequeue waits at most a bounded interval and reports one of
//! three outcomes (event, timeout, shutdown-complete), so a poll task can
//! notice shutdown promptly without busy-spinning. After shutdown is
//! signalled the queue refuses new items but still hands out its backlog;
//! only an empty, cancelled queue reports [`Dequeue::Shutdown`].
//!
//! Call correlation is a typed [`CallToken`] carried in the item, and the
//! receive completion carries the inbound request itself, so no opaque
//! pointer casting is involved anywhere.

use quiver_core::{CallToken, Payload, Reply};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A decoded inbound request paired with the channel its reply travels back
/// on. Delivered by the receive completion of a pending call.
#[derive(Debug)]
pub(crate) struct InboundRequest {
    pub(crate) body: Payload,
    pub(crate) reply_tx: oneshot::Sender<Reply>,
}

/// One item delivered by a completion queue.
#[derive(Debug)]
pub(crate) enum QueueItem {
    /// A transport completion for an outstanding operation on `token`.
    ///
    /// `ok == false` means the operation failed; what that signifies depends
    /// on the call's current state (reply-write failure vs. shutdown drain).
    /// A successful receive completion carries the inbound request.
    Completion {
        token: CallToken,
        ok: bool,
        inbound: Option<InboundRequest>,
    },
    /// A handler finished producing its reply; the write back to the client
    /// starts when this item is processed.
    StartReply { token: CallToken, reply: Reply },
}

/// Outcome of one bounded-wait dequeue.
pub(crate) enum Dequeue {
    Event(QueueItem),
    Timeout,
    Shutdown,
}

/// Sending half of a completion queue. Cloned into receive slots, factories
/// and reply sinks.
#[derive(Clone)]
pub(crate) struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueItem>,
    shutdown: CancellationToken,
    next_token: Arc<AtomicU64>,
}

impl QueueHandle {
    /// Allocates a token unique within this queue.
    pub(crate) fn allocate_token(&self) -> CallToken {
        CallToken::new(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Pushes an item onto the queue. Fails only once the queue has begun
    /// draining, at which point new work must be refused.
    pub(crate) fn push(&self, item: QueueItem) -> core::result::Result<(), QueueItem> {
        self.tx.send(item).map_err(|err| err.0)
    }

    /// Signals the queue to drain and stop.
    pub(crate) fn shut_down(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Receiving half of a completion queue; owned by exactly one poll task.
pub(crate) struct CompletionQueue {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    handle: QueueHandle,
}

impl CompletionQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            handle: QueueHandle {
                tx,
                shutdown: CancellationToken::new(),
                next_token: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    pub(crate) fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Dequeues the next item, waiting at most `wait`.
    ///
    /// Once shutdown has been signalled the receiver is closed so new pushes
    /// fail, but items already queued are still delivered; the backlog must
    /// run dry before [`Dequeue::Shutdown`] is reported.
    pub(crate) async fn next(&mut self, wait: Duration) -> Dequeue {
        if self.handle.shutdown.is_cancelled() {
            self.rx.close();
            return match self.rx.try_recv() {
                Ok(item) => Dequeue::Event(item),
                Err(_) => Dequeue::Shutdown,
            };
        }
        tokio::select! {
            item = self.rx.recv() => match item {
                Some(item) => Dequeue::Event(item),
                None => Dequeue::Shutdown,
            },
            () = self.handle.shutdown.cancelled() => Dequeue::Timeout,
            () = tokio::time::sleep(wait) => Dequeue::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    fn completion(handle: &QueueHandle, ok: bool) -> QueueItem {
        QueueItem::Completion {
            token: handle.allocate_token(),
            ok,
            inbound: None,
        }
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let mut queue = CompletionQueue::new();
        assert!(matches!(queue.next(WAIT).await, Dequeue::Timeout));
    }

    #[tokio::test]
    async fn items_are_delivered_in_order() {
        let mut queue = CompletionQueue::new();
        let handle = queue.handle();
        handle.push(completion(&handle, true)).unwrap();
        handle.push(completion(&handle, false)).unwrap();

        match queue.next(WAIT).await {
            Dequeue::Event(QueueItem::Completion { token, ok: true, .. }) => {
                assert_eq!(token.raw(), 0);
            }
            _ => panic!("expected first completion"),
        }
        match queue.next(WAIT).await {
            Dequeue::Event(QueueItem::Completion { token, ok: false, .. }) => {
                assert_eq!(token.raw(), 1);
            }
            _ => panic!("expected second completion"),
        }
    }

    #[tokio::test]
    async fn backlog_drains_before_shutdown_is_reported() {
        let mut queue = CompletionQueue::new();
        let handle = queue.handle();
        handle.push(completion(&handle, true)).unwrap();
        handle.shut_down();

        assert!(matches!(queue.next(WAIT).await, Dequeue::Event(_)));
        assert!(matches!(queue.next(WAIT).await, Dequeue::Shutdown));
        // Once draining has been observed, new pushes are refused.
        assert!(handle.push(completion(&handle, true)).is_err());
    }

    #[tokio::test]
    async fn tokens_are_unique_per_queue() {
        let queue = CompletionQueue::new();
        let handle = queue.handle();
        let a = handle.allocate_token();
        let b = handle.allocate_token();
        assert_ne!(a, b);
    }
}
