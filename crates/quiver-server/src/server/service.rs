//! Services, method handlers and the reply sink.
//!
//! A [`Service`] is a named group of methods. Registration fans each method
//! out into one call factory per completion queue; the handler itself is
//! shared. Handlers receive the decoded request payload and a move-only
//! [`ReplySink`], which makes the "exactly one completion, exactly once"
//! contract unrepresentable to violate.

use crate::server::factory::CallFactory;
use crate::server::queue::{QueueHandle, QueueItem};
use crate::server::transport::SlotRouter;
use quiver_core::{CallToken, ClusterId, Error, Payload, Reply, Result, Status};
use std::sync::Arc;

/// A method handler supplied by the embedding application.
///
/// [`handle`](Self::handle) runs on the owning queue's poll task and must
/// return quickly: long-running work should be handed off (spawned, queued
/// elsewhere) and the sink consumed once the reply is ready, from whatever
/// context that happens in.
pub trait RpcHandler: Send + Sync + 'static {
    /// Called once per call with the decoded request.
    fn handle(&self, request: Payload, reply: ReplySink);

    /// Called after a reply was written back successfully.
    fn on_reply_sent(&self) {}

    /// Called when writing the reply back failed, e.g. the client
    /// disconnected or its deadline passed mid-reply.
    fn on_reply_failed(&self) {}
}

/// One-shot reply channel handed to a handler.
///
/// Consuming it via [`succeed`](Self::succeed) or [`fail`](Self::fail)
/// starts the reply write on the call's owning queue.
pub struct ReplySink {
    token: CallToken,
    queue: QueueHandle,
}

impl ReplySink {
    pub(crate) fn new(token: CallToken, queue: QueueHandle) -> Self {
        Self { token, queue }
    }

    /// Completes the call with a response payload.
    pub fn succeed(self, response: Payload) {
        self.finish(Ok(response));
    }

    /// Completes the call with a failure status.
    pub fn fail(self, status: Status) {
        self.finish(Err(status));
    }

    fn finish(self, reply: Reply) {
        // The push only fails once the queue is draining; the reply is
        // dropped and the call resolves through the shutdown path instead.
        if self
            .queue
            .push(QueueItem::StartReply {
                token: self.token,
                reply,
            })
            .is_err()
        {
            tracing::debug!(token = %self.token, "reply dropped, queue is draining");
        }
    }
}

/// Definition of one RPC method within a service.
struct MethodDef {
    name: String,
    handler: Arc<dyn RpcHandler>,
    max_active_calls: i64,
}

/// A named group of RPC methods.
pub struct Service {
    name: String,
    methods: Vec<MethodDef>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a method.
    ///
    /// `max_active_calls` bounds how many receive slots are pre-posted for
    /// the method across all queues; `-1` means no bound, in which case a
    /// fixed per-queue default is provisioned instead. Values below `-1`
    /// are rejected at registration.
    pub fn method(
        mut self,
        name: impl Into<String>,
        max_active_calls: i64,
        handler: Arc<dyn RpcHandler>,
    ) -> Self {
        self.methods.push(MethodDef {
            name: name.into(),
            handler,
            max_active_calls,
        });
        self
    }

    /// Rejects concurrency bounds below the `-1` sentinel; anything more
    /// negative has no meaning and would be catastrophic as a slot count.
    pub(crate) fn validate(&self) -> Result<()> {
        for def in &self.methods {
            if def.max_active_calls < -1 {
                return Err(Error::InvalidConfig {
                    reason: format!(
                        "method `{}`: max_active_calls must be -1 or non-negative, got {}",
                        method_key(&self.name, &def.name),
                        def.max_active_calls
                    ),
                });
            }
        }
        Ok(())
    }

    /// Builds one call factory per method, bound to `queue`.
    pub(crate) fn build_call_factories(
        &self,
        queue: &QueueHandle,
        router: &Arc<SlotRouter>,
        cluster_id: Option<ClusterId>,
    ) -> Vec<Arc<CallFactory>> {
        self.methods
            .iter()
            .map(|def| {
                Arc::new(CallFactory::new(
                    method_key(&self.name, &def.name),
                    Arc::clone(&def.handler),
                    def.max_active_calls,
                    cluster_id,
                    queue.clone(),
                    Arc::clone(router),
                ))
            })
            .collect()
    }
}

/// Fully-qualified method key used for slot routing.
pub(crate) fn method_key(service: &str, method: &str) -> String {
    format!("{service}/{method}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::queue::CompletionQueue;

    struct Noop;

    impl RpcHandler for Noop {
        fn handle(&self, _request: Payload, _reply: ReplySink) {}
    }

    #[test]
    fn concurrency_bounds_below_the_sentinel_are_rejected() {
        let bad = Service::new("svc").method("A", -2, Arc::new(Noop));
        assert!(matches!(
            bad.validate(),
            Err(Error::InvalidConfig { .. })
        ));

        let good = Service::new("svc")
            .method("A", -1, Arc::new(Noop))
            .method("B", 0, Arc::new(Noop));
        assert!(good.validate().is_ok());
    }

    #[test]
    fn factories_fan_out_per_method() {
        let service = Service::new("svc")
            .method("A", 4, Arc::new(Noop))
            .method("B", -1, Arc::new(Noop));

        let queue = CompletionQueue::new();
        let router = Arc::new(SlotRouter::default());
        let factories = service.build_call_factories(&queue.handle(), &router, None);

        let methods: Vec<&str> = factories.iter().map(|f| f.method()).collect();
        assert_eq!(methods, vec!["svc/A", "svc/B"]);
    }
}
