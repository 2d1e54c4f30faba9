//! Server orchestration: queue construction, service registration, startup
//! and shutdown.
//!
//! ## Structure
//!
//! - [`config`] - Resolved configuration passed in by the embedder.
//! - [`service`] - Services, handlers and the reply sink.
//! - [`transport`] - Listener/TLS, receive-slot routing, request injection.
//! - [`queue`] / [`poll`] - Completion queues and their poll tasks.
//! - [`call`] / [`factory`] - Per-call state and capacity provisioning.

pub(crate) mod call;
pub mod config;
pub(crate) mod factory;
pub(crate) mod poll;
pub(crate) mod queue;
pub mod service;
pub mod transport;

use crate::server::call::CallRegistry;
use crate::server::config::ServerConfig;
use crate::server::factory::CallFactory;
use crate::server::queue::{CompletionQueue, QueueHandle};
use crate::server::service::Service;
use crate::server::transport::{RequestInjector, ServerConnection, SlotRouter};
use futures::future::join_all;
use parking_lot::Mutex;
use quiver_core::{ClusterId, Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on accepted connections waiting to be picked up by the
/// embedding transport layer.
const ACCEPT_BACKLOG: usize = 64;

/// An asynchronous, multi-queue RPC server engine.
///
/// The server owns `N` completion queues and spawns one poll task per
/// queue. Registering a service creates one call factory per (method,
/// queue) pair; [`run`](Self::run) pre-provisions each factory's receive
/// slots and starts polling. Decoded requests enter through the
/// [`RequestInjector`] returned by [`injector`](Self::injector); accepted
/// connections are handed out through [`connections`](Self::connections)
/// for the embedding layer to decode.
pub struct Server {
    config: ServerConfig,
    cluster_id: Option<ClusterId>,
    router: Arc<SlotRouter>,
    shutdown: CancellationToken,
    /// Signalled once every task has been joined, so shutdown callers that
    /// lose the race still wait for completion.
    stopped: CancellationToken,
    /// Sending halves, index-aligned with `queue_rxs`.
    queues: Vec<QueueHandle>,
    /// Receiving halves, consumed when the poll tasks spawn.
    queue_rxs: Vec<CompletionQueue>,
    /// Factories grouped by owning queue index.
    factories: Vec<Vec<Arc<CallFactory>>>,
    service_names: Vec<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    conn_rx: Option<mpsc::Receiver<ServerConnection>>,
    local_addr: Option<SocketAddr>,
    started: bool,
    running: AtomicBool,
}

impl Server {
    /// Creates a server from resolved configuration.
    ///
    /// `cluster_id` is the identity handed to token-authenticated services;
    /// it may be `None` when no registered service requests token auth.
    pub fn new(config: ServerConfig, cluster_id: Option<ClusterId>) -> Result<Self> {
        config.validate()?;
        let queue_rxs: Vec<CompletionQueue> = (0..config.num_queues)
            .map(|_| CompletionQueue::new())
            .collect();
        let queues: Vec<QueueHandle> = queue_rxs.iter().map(CompletionQueue::handle).collect();
        let factories = vec![Vec::new(); config.num_queues];
        Ok(Self {
            config,
            cluster_id,
            router: Arc::new(SlotRouter::default()),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            queues,
            queue_rxs,
            factories,
            service_names: Vec::new(),
            tasks: Mutex::new(Vec::new()),
            conn_rx: None,
            local_addr: None,
            started: false,
            running: AtomicBool::new(false),
        })
    }

    /// Registers `service`, building one call factory per (method, queue).
    ///
    /// With `token_auth` set, a non-nil cluster identity must have been
    /// supplied at construction; its absence is a registration error and no
    /// polling ever starts. Registration must happen before
    /// [`run`](Self::run).
    pub fn register_service(&mut self, service: Service, token_auth: bool) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyRunning);
        }
        service.validate()?;
        if token_auth && !self.cluster_id.is_some_and(|id| !id.is_nil()) {
            return Err(Error::MissingClusterId {
                service: service.name().to_string(),
            });
        }
        let cluster_id = if token_auth { self.cluster_id } else { None };
        for (index, queue) in self.queues.iter().enumerate() {
            let built = service.build_call_factories(queue, &self.router, cluster_id);
            for factory in &built {
                self.router.register_method(factory.method());
            }
            self.factories[index].extend(built);
        }
        tracing::debug!(service = service.name(), token_auth, "service registered");
        self.service_names.push(service.name().to_string());
        Ok(())
    }

    /// Starts the server.
    ///
    /// Validates credentials, binds the listen socket (failing fast with a
    /// port diagnostic), pre-provisions every factory's receive slots and
    /// spawns one poll task per queue plus the accept task. Returns once
    /// the server is running; serving happens on the spawned tasks.
    pub async fn run(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyRunning);
        }
        let bound =
            transport::bind_listener(&self.config.listen, &self.config.credentials).await?;
        self.local_addr = Some(bound.local_addr);

        if self.service_names.is_empty() {
            tracing::warn!(name = %self.config.name, "no service registered before startup");
        }

        let num_queues = self.config.num_queues;
        let mut tasks = Vec::with_capacity(num_queues + 1);
        for (index, queue) in self.queue_rxs.drain(..).enumerate() {
            let mut registry = CallRegistry::new();
            for factory in &self.factories[index] {
                for _ in 0..factory.initial_slots(num_queues) {
                    factory.create_call(&mut registry);
                }
            }
            tasks.push(tokio::spawn(poll::poll_loop(index, queue, registry)));
        }

        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_BACKLOG);
        self.conn_rx = Some(conn_rx);
        tasks.push(tokio::spawn(transport::accept_loop(
            bound.listener,
            bound.tls,
            conn_tx,
            self.shutdown.clone(),
        )));
        *self.tasks.lock() = tasks;

        self.started = true;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            name = %self.config.name,
            addr = %bound.local_addr,
            queues = num_queues,
            max_message_bytes = self.config.tuning.max_message_bytes,
            keepalive_time_ms = self.config.tuning.keepalive_time_ms,
            keepalive_timeout_ms = self.config.tuning.keepalive_timeout_ms,
            min_ping_interval_ms = self.config.tuning.clamped_min_ping_interval_ms(),
            write_buffer_bytes = self.config.tuning.write_buffer_bytes,
            "server started"
        );
        Ok(())
    }

    /// Stops the server and waits for every task to finish.
    ///
    /// Idempotent, and callable from any thread. New work is refused
    /// immediately: the accept loop and the injector observe the shutdown
    /// signal, and un-consumed receive slots disappear with the router.
    /// Each queue then drains its backlog, stranded pending calls are
    /// deleted without running handlers, and all tasks are joined before
    /// this returns. Concurrent callers all block until the joins finish,
    /// not just the caller that initiated the teardown.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            if self.started {
                self.stopped.cancelled().await;
            }
            return;
        }
        tracing::info!(name = %self.config.name, "shutting down");
        self.shutdown.cancel();
        self.router.clear();
        for queue in &self.queues {
            queue.shut_down();
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for joined in join_all(tasks).await {
            if let Err(err) = joined {
                tracing::error!("task panicked during shutdown: {err}");
            }
        }
        self.stopped.cancel();
        tracing::info!(name = %self.config.name, "shutdown complete");
    }

    /// The address actually bound, available after [`run`](Self::run). With
    /// a requested port of `0` this reports the ephemeral port the OS chose.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// `true` between a successful [`run`](Self::run) and
    /// [`shutdown`](Self::shutdown).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The seam through which decoded requests enter the engine.
    pub fn injector(&self) -> RequestInjector {
        RequestInjector::new(Arc::clone(&self.router), self.shutdown.clone())
    }

    /// Takes the stream of accepted connections. Yields `None` if taken
    /// already or called before [`run`](Self::run).
    pub fn connections(&mut self) -> Option<mpsc::Receiver<ServerConnection>> {
        self.conn_rx.take()
    }
}
