//! The transport seam: listener binding, TLS credentials, the receive-slot
//! router and the request injection point.
//!
//! The engine owns the listen socket and validates credential material, but
//! it never reads or writes connection bytes; accepted connections are
//! handed to the embedding layer, which decodes requests and feeds them
//! back in through a [`RequestInjector`]. That keeps the engine agnostic of
//! any particular wire format while still owning the operational contract
//! around ports and credentials.

use crate::server::config::{CredentialConfig, ListenConfig};
use crate::server::queue::{InboundRequest, QueueHandle, QueueItem};
use crate::server::service::method_key;
use parking_lot::Mutex;
use quiver_core::{CallToken, Error, Payload, Reply, Result};
use rustls_pki_types::CertificateDer;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A pre-posted receive slot: one pending call ready to accept the next
/// request for its method.
pub(crate) struct ReceiveSlot {
    pub(crate) token: CallToken,
    pub(crate) queue: QueueHandle,
}

/// Map from method key to its posted receive slots.
///
/// The only state shared across queues. Slots are posted by poll tasks and
/// taken by the dispatch side, hence the mutex; everything else about a
/// call is queue-affine.
#[derive(Default)]
pub(crate) struct SlotRouter {
    slots: Mutex<HashMap<String, VecDeque<ReceiveSlot>>>,
}

impl SlotRouter {
    /// Makes a method known to the router, so an exhausted method and an
    /// unregistered one fail dispatch differently.
    pub(crate) fn register_method(&self, method: &str) {
        self.slots.lock().entry(method.to_string()).or_default();
    }

    pub(crate) fn post_receive(&self, method: &str, slot: ReceiveSlot) {
        let mut slots = self.slots.lock();
        // During shutdown the map is already cleared; the slot is dropped.
        if let Some(queue) = slots.get_mut(method) {
            queue.push_back(slot);
        }
    }

    fn take_slot(&self, method: &str) -> Result<ReceiveSlot> {
        let mut slots = self.slots.lock();
        match slots.get_mut(method) {
            None => Err(Error::UnknownMethod {
                method: method.to_string(),
            }),
            Some(queue) => queue.pop_front().ok_or_else(|| Error::NoCapacity {
                method: method.to_string(),
            }),
        }
    }

    pub(crate) fn available_slots(&self, method: &str) -> usize {
        self.slots.lock().get(method).map_or(0, VecDeque::len)
    }

    pub(crate) fn clear(&self) {
        self.slots.lock().clear();
    }
}

/// Handle through which the transport glue (or tests) delivers decoded
/// inbound requests to the engine.
#[derive(Clone)]
pub struct RequestInjector {
    router: Arc<SlotRouter>,
    shutdown: CancellationToken,
}

impl RequestInjector {
    pub(crate) fn new(router: Arc<SlotRouter>, shutdown: CancellationToken) -> Self {
        Self { router, shutdown }
    }

    /// Delivers one decoded request for `service`/`method`.
    ///
    /// Consumes a posted receive slot and wakes the owning queue. The
    /// returned [`PendingReply`] resolves once the handler's reply has been
    /// written; dropping it models a client that went away first, which the
    /// engine observes as a failed reply write.
    ///
    /// # Errors
    ///
    /// - [`Error::ShuttingDown`] once server shutdown has begun.
    /// - [`Error::UnknownMethod`] if no such method was ever registered.
    /// - [`Error::NoCapacity`] if every receive slot is currently occupied.
    pub fn dispatch(&self, service: &str, method: &str, body: Payload) -> Result<PendingReply> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let slot = self.router.take_slot(&method_key(service, method))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let item = QueueItem::Completion {
            token: slot.token,
            ok: true,
            inbound: Some(InboundRequest { body, reply_tx }),
        };
        if slot.queue.push(item).is_err() {
            return Err(Error::ShuttingDown);
        }
        Ok(PendingReply { rx: reply_rx })
    }

    /// Posted receive capacity for one method, summed across all queues.
    pub fn available_slots(&self, service: &str, method: &str) -> usize {
        self.router.available_slots(&method_key(service, method))
    }
}

/// The client half of one dispatched request.
pub struct PendingReply {
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    /// Waits for the handler's reply.
    ///
    /// # Errors
    ///
    /// [`Error::CallDropped`] when the call was torn down (server shutdown)
    /// before any reply was written.
    pub async fn recv(self) -> Result<Reply> {
        self.rx.await.map_err(|_| Error::CallDropped)
    }
}

/// An accepted connection, handed to the embedding transport layer.
///
/// The engine does not touch the stream. `tls` carries the server
/// credentials to drive a TLS acceptor with when secure transport is
/// configured.
pub struct ServerConnection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

#[derive(Debug)]
pub(crate) struct BoundListener {
    pub(crate) listener: TcpListener,
    pub(crate) local_addr: SocketAddr,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
}

/// Builds credentials and binds the listen socket.
///
/// Credential material is validated before the bind, so a server with
/// unusable certificates never occupies a port.
pub(crate) async fn bind_listener(
    listen: &ListenConfig,
    credentials: &CredentialConfig,
) -> Result<BoundListener> {
    let tls = match credentials {
        CredentialConfig::Insecure => None,
        CredentialConfig::Tls {
            root_ca_pem,
            server_cert_pem,
            server_key_pem,
        } => Some(Arc::new(build_server_tls(
            root_ca_pem,
            server_cert_pem,
            server_key_pem,
        )?)),
    };
    let addr = listen.socket_addr();
    let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
        addr,
        port: listen.port,
        source,
    })?;
    let local_addr = listener.local_addr().map_err(|source| Error::Bind {
        addr,
        port: listen.port,
        source,
    })?;
    Ok(BoundListener {
        listener,
        local_addr,
        tls,
    })
}

/// Server-side TLS from PEM blobs: trust anchors from the root CA, client
/// certificates required and verified, a single server cert/key pair.
fn build_server_tls(
    root_ca_pem: &[u8],
    server_cert_pem: &[u8],
    server_key_pem: &[u8],
) -> Result<rustls::ServerConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in read_certs(root_ca_pem, "root CA")? {
        roots.add(cert).map_err(|err| Error::Credentials {
            reason: format!("bad root CA certificate: {err}"),
        })?;
    }
    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| Error::Credentials {
            reason: format!("client certificate verifier: {err}"),
        })?;
    let certs = read_certs(server_cert_pem, "server certificate")?;
    let key = rustls_pemfile::private_key(&mut &server_key_pem[..])
        .map_err(|err| Error::Credentials {
            reason: format!("unreadable server key PEM: {err}"),
        })?
        .ok_or_else(|| Error::Credentials {
            reason: "no private key found in server key PEM".to_string(),
        })?;
    rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|err| Error::Credentials {
            reason: format!("bad server cert/key pair: {err}"),
        })
}

fn read_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| Error::Credentials {
            reason: format!("unreadable {what} PEM: {err}"),
        })?;
    if certs.is_empty() {
        return Err(Error::Credentials {
            reason: format!("no certificates found in {what} PEM"),
        });
    }
    Ok(certs)
}

/// Accepts connections until shutdown and forwards them to the embedder.
///
/// If nobody is consuming connections, or the consumer lags behind the
/// backlog, the connection is dropped; the engine never reads the stream
/// itself.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
    conn_tx: mpsc::Sender<ServerConnection>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "accepted connection");
                    let conn = ServerConnection {
                        stream,
                        peer,
                        tls: tls.clone(),
                    };
                    if let Err(err) = conn_tx.try_send(conn) {
                        tracing::warn!(%peer, "dropping connection: {err}");
                    }
                }
                Err(err) => {
                    tracing::warn!("accept failed: {err}");
                }
            },
        }
    }
    tracing::debug!("accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::queue::CompletionQueue;

    #[test]
    fn garbage_pem_is_rejected_as_credentials_error() {
        let garbage = b"not a pem at all";
        let err = build_server_tls(garbage, garbage, garbage).unwrap_err();
        assert!(matches!(err, Error::Credentials { .. }));
    }

    #[test]
    fn router_distinguishes_unknown_from_exhausted() {
        let router = SlotRouter::default();
        assert!(matches!(
            router.take_slot("svc/Nope"),
            Err(Error::UnknownMethod { .. })
        ));

        router.register_method("svc/Echo");
        assert!(matches!(
            router.take_slot("svc/Echo"),
            Err(Error::NoCapacity { .. })
        ));
    }

    #[tokio::test]
    async fn router_hands_out_slots_in_fifo_order() {
        let router = SlotRouter::default();
        router.register_method("svc/Echo");
        let queue = CompletionQueue::new();
        let handle = queue.handle();
        let first = handle.allocate_token();
        let second = handle.allocate_token();
        router.post_receive(
            "svc/Echo",
            ReceiveSlot {
                token: first,
                queue: handle.clone(),
            },
        );
        router.post_receive(
            "svc/Echo",
            ReceiveSlot {
                token: second,
                queue: handle.clone(),
            },
        );
        assert_eq!(router.available_slots("svc/Echo"), 2);
        assert_eq!(router.take_slot("svc/Echo").unwrap().token, first);
        assert_eq!(router.take_slot("svc/Echo").unwrap().token, second);
    }

    #[tokio::test]
    async fn binding_an_occupied_port_reports_the_port() {
        let free = bind_listener(
            &ListenConfig {
                localhost_only: true,
                port: 0,
            },
            &CredentialConfig::Insecure,
        )
        .await
        .unwrap();
        let taken_port = free.local_addr.port();

        let err = bind_listener(
            &ListenConfig {
                localhost_only: true,
                port: taken_port,
            },
            &CredentialConfig::Insecure,
        )
        .await
        .unwrap_err();
        match err {
            Error::Bind { port, .. } => assert_eq!(port, taken_port),
            other => panic!("expected bind error, got {other}"),
        }
    }
}
