//! Per-call state tracking.
//!
//! A call exists from the moment its factory pre-posts it as receive
//! capacity until it reaches a terminal outcome, at which point it is
//! removed from its queue's registry and dropped. Calls never move between
//! queues, and only the owning queue's poll task touches them, so state
//! needs no synchronization.

use crate::server::factory::CallFactory;
use quiver_core::{CallToken, Reply};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Lifecycle states of an in-flight call.
///
/// The terminal state is implicit: a finished call is removed from the
/// registry and no further event may reference its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    /// Registered with the transport, waiting for an inbound request, or
    /// busy inside its handler.
    Pending,
    /// The handler produced a reply and it is being written back.
    SendingReply,
}

/// One in-flight RPC invocation, owned by its queue's poll task.
pub(crate) struct ServerCall {
    state: CallState,
    factory: Arc<CallFactory>,
    reply_tx: Option<oneshot::Sender<Reply>>,
}

impl ServerCall {
    pub(crate) fn new(factory: Arc<CallFactory>) -> Self {
        Self {
            state: CallState::Pending,
            factory,
            reply_tx: None,
        }
    }

    pub(crate) fn state(&self) -> CallState {
        self.state
    }

    pub(crate) fn factory(&self) -> &Arc<CallFactory> {
        &self.factory
    }

    /// Attaches the reply channel delivered by the receive completion.
    pub(crate) fn attach_reply_channel(&mut self, reply_tx: oneshot::Sender<Reply>) {
        debug_assert!(
            self.reply_tx.is_none(),
            "receive completed twice for one call"
        );
        self.reply_tx = Some(reply_tx);
    }

    /// Moves the call into [`CallState::SendingReply`] and attempts the
    /// write. Returns the write's success flag: `false` when the client has
    /// gone away.
    pub(crate) fn start_reply(&mut self, reply: Reply) -> bool {
        self.state = CallState::SendingReply;
        match self.reply_tx.take() {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

/// All calls currently owned by one queue, keyed by token.
pub(crate) type CallRegistry = HashMap<CallToken, ServerCall>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::queue::CompletionQueue;
    use crate::server::service::RpcHandler;
    use crate::server::transport::SlotRouter;
    use quiver_core::Payload;

    struct Noop;

    impl RpcHandler for Noop {
        fn handle(&self, _request: Payload, _reply: crate::server::service::ReplySink) {}
    }

    fn test_call() -> ServerCall {
        let queue = CompletionQueue::new();
        let factory = Arc::new(CallFactory::new(
            "svc/Method".to_string(),
            Arc::new(Noop),
            -1,
            None,
            queue.handle(),
            Arc::new(SlotRouter::default()),
        ));
        ServerCall::new(factory)
    }

    #[tokio::test]
    async fn reply_write_succeeds_while_client_listens() {
        let mut call = test_call();
        assert_eq!(call.state(), CallState::Pending);

        let (tx, rx) = oneshot::channel();
        call.attach_reply_channel(tx);
        assert!(call.start_reply(Ok(Payload::from_static(b"pong"))));
        assert_eq!(call.state(), CallState::SendingReply);
        assert_eq!(rx.await.unwrap().unwrap(), Payload::from_static(b"pong"));
    }

    #[tokio::test]
    async fn reply_write_fails_when_client_is_gone() {
        let mut call = test_call();
        let (tx, rx) = oneshot::channel();
        call.attach_reply_channel(tx);
        drop(rx);
        assert!(!call.start_reply(Ok(Payload::from_static(b"pong"))));
    }
}
