//! Call factories: per-(method, queue) call creation and capacity
//! provisioning.
//!
//! A factory is built for every (method, queue) pair during service
//! registration and lives for the server's lifetime. It pre-posts the
//! method's initial receive slots at startup and re-posts one slot each
//! time a call it created completes, keeping outstanding receive capacity
//! constant. The slot count is advisory provisioning, not admission
//! control: nothing rejects excess concurrent calls.

use crate::server::call::{CallRegistry, ServerCall};
use crate::server::queue::QueueHandle;
use crate::server::service::RpcHandler;
use crate::server::transport::{ReceiveSlot, SlotRouter};
use quiver_core::ClusterId;
use std::sync::Arc;

/// Receive slots pre-posted per queue for methods without a configured
/// concurrency bound. Purely ensures enough receives are outstanding; it
/// does not throttle concurrency.
pub(crate) const DEFAULT_SLOTS_PER_QUEUE: usize = 32;

/// Creates [`ServerCall`]s for one method, bound to one queue.
pub(crate) struct CallFactory {
    method: String,
    handler: Arc<dyn RpcHandler>,
    max_active_calls: i64,
    cluster_id: Option<ClusterId>,
    queue: QueueHandle,
    router: Arc<SlotRouter>,
}

impl CallFactory {
    pub(crate) fn new(
        method: String,
        handler: Arc<dyn RpcHandler>,
        max_active_calls: i64,
        cluster_id: Option<ClusterId>,
        queue: QueueHandle,
        router: Arc<SlotRouter>,
    ) -> Self {
        let factory = Self {
            method,
            handler,
            max_active_calls,
            cluster_id,
            queue,
            router,
        };
        tracing::debug!(
            method = %factory.method,
            max_active_calls = factory.max_active_calls,
            cluster_id = ?factory.cluster_id,
            "built call factory"
        );
        factory
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn handler(&self) -> &Arc<dyn RpcHandler> {
        &self.handler
    }

    /// Number of calls to pre-create on this factory's queue, given the
    /// server's queue count.
    ///
    /// With a configured maximum `M` and `T` queues, each queue gets
    /// `max(1, M / T)` so the aggregate outstanding receives approximate the
    /// limit; `-1` (unbounded) gets the fixed default instead. The `-1` case
    /// only affects this initial sizing, never steady-state replenishment.
    pub(crate) fn initial_slots(&self, num_queues: usize) -> usize {
        slots_per_queue(self.max_active_calls, num_queues)
    }

    /// Registers a fresh pending call and posts its receive slot.
    ///
    /// A no-op once the queue is draining: re-posting receive capacity
    /// during shutdown would hand new work to a server that is stopping.
    /// Outside shutdown this cannot fail.
    pub(crate) fn create_call(self: &Arc<Self>, registry: &mut CallRegistry) {
        if self.queue.is_shutting_down() {
            return;
        }
        let token = self.queue.allocate_token();
        registry.insert(token, ServerCall::new(Arc::clone(self)));
        self.router.post_receive(
            &self.method,
            ReceiveSlot {
                token,
                queue: self.queue.clone(),
            },
        );
    }
}

pub(crate) fn slots_per_queue(max_active_calls: i64, num_queues: usize) -> usize {
    if max_active_calls == -1 {
        DEFAULT_SLOTS_PER_QUEUE
    } else {
        core::cmp::max(1, max_active_calls as usize / num_queues)
    }
}
