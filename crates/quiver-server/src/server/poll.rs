//! Per-queue poll loop: drives call state transitions from completions.
//!
//! One instance of [`poll_loop`] runs per completion queue and exclusively
//! owns that queue's call registry, so the steady-state path takes no
//! locks. The transition table is keyed on `(state, ok)`; a failed
//! completion means either a reply-write failure or a shutdown drain, and
//! only the call's current state can tell the two apart.

use crate::server::call::{CallRegistry, CallState};
use crate::server::queue::{CompletionQueue, Dequeue, InboundRequest, QueueHandle, QueueItem};
use crate::server::service::ReplySink;
use quiver_core::CallToken;
use std::sync::Arc;
use std::time::Duration;

/// Bound on a single dequeue wait: short enough that a shutdown signal is
/// noticed promptly, long enough to avoid busy-spinning.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Services one completion queue until it reports shutdown-complete.
///
/// On exit, every call still registered is flushed as a failed completion:
/// receives that never saw a request are torn down silently and no
/// replacement capacity is posted.
pub(crate) async fn poll_loop(index: usize, mut queue: CompletionQueue, mut registry: CallRegistry) {
    tracing::trace!(queue = index, calls = registry.len(), "poll loop started");
    let handle = queue.handle();
    loop {
        match queue.next(POLL_INTERVAL).await {
            Dequeue::Timeout => continue,
            Dequeue::Shutdown => break,
            Dequeue::Event(item) => process_item(&mut registry, &handle, item),
        }
    }
    // The backlog has run dry; whatever is still registered never completed.
    let stranded: Vec<CallToken> = registry.keys().copied().collect();
    if !stranded.is_empty() {
        tracing::debug!(queue = index, stranded = stranded.len(), "draining stranded calls");
    }
    for token in stranded {
        apply_completion(&mut registry, &handle, token, false, None);
    }
    tracing::trace!(queue = index, "poll loop stopped");
}

fn process_item(registry: &mut CallRegistry, handle: &QueueHandle, item: QueueItem) {
    match item {
        QueueItem::Completion { token, ok, inbound } => {
            apply_completion(registry, handle, token, ok, inbound);
        }
        QueueItem::StartReply { token, reply } => {
            let call = registry
                .get_mut(&token)
                .unwrap_or_else(|| panic!("reply started for unknown call {token}"));
            let ok = call.start_reply(reply);
            let completion = QueueItem::Completion {
                token,
                ok,
                inbound: None,
            };
            if handle.push(completion).is_err() {
                // The queue stopped taking items mid-drain; apply the write's
                // completion inline instead of losing it.
                apply_completion(registry, handle, token, ok, None);
            }
        }
    }
}

/// The per-call transition table.
fn apply_completion(
    registry: &mut CallRegistry,
    handle: &QueueHandle,
    token: CallToken,
    ok: bool,
    inbound: Option<InboundRequest>,
) {
    let state = registry
        .get(&token)
        .unwrap_or_else(|| panic!("completion for unknown call {token}"))
        .state();
    match (state, ok) {
        (CallState::Pending, true) => {
            // An inbound request arrived. The call stays registered (and
            // Pending) until its handler starts the reply.
            let InboundRequest { body, reply_tx } = inbound
                .unwrap_or_else(|| panic!("receive completion without a request for call {token}"));
            let call = registry.get_mut(&token).expect("call looked up above");
            call.attach_reply_channel(reply_tx);
            let handler = Arc::clone(call.factory().handler());
            handler.handle(body, ReplySink::new(token, handle.clone()));
        }
        (CallState::SendingReply, sent_ok) => {
            // The reply write finished, successfully or not. Either way the
            // call is done and one replacement is requested so outstanding
            // receive capacity stays constant.
            let call = registry.remove(&token).expect("call looked up above");
            if sent_ok {
                call.factory().handler().on_reply_sent();
            } else {
                call.factory().handler().on_reply_failed();
            }
            call.factory().create_call(registry);
        }
        (CallState::Pending, false) => {
            // Only reachable while the queue drains during shutdown: this
            // pre-posted receive never saw a request. No handler ran, none
            // is notified, and no replacement is created.
            registry.remove(&token);
        }
    }
}
