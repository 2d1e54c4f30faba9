//! Error types for the RPC server engine.
//!
//! This module defines the central `Error` enum, which captures every
//! reportable failure in the engine. Startup problems (binding, credential
//! material, missing auth identity) indicate misconfiguration and are meant
//! to be propagated out of `run`/`register_service` and treated as fatal by
//! the embedding binary; per-call problems stay local to their call and are
//! routed through handler continuations instead of this type.
//!
//! ## Error Cases
//! - `Bind`: The listen socket could not be bound (commonly a port conflict).
//! - `Credentials`: TLS material was missing, unreadable, or inconsistent.
//! - `MissingClusterId`: A service requested token auth without an identity.
//! - `AlreadyRunning`: Startup-phase operations invoked on a running server.
//! - `ShuttingDown`: A request arrived while the server was draining.
//! - `UnknownMethod` / `NoCapacity`: Dispatch could not find a receive slot.
//! - `CallDropped`: A call was torn down before producing a reply.
//! - `InvalidConfig`: Rejected configuration values.

use std::net::SocketAddr;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the RPC server engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The listen socket could not be bound.
    ///
    /// The message deliberately names the requested port and how to find the
    /// conflicting process: a server that cannot bind its port must not
    /// silently continue.
    #[error(
        "failed to bind {addr}: {source}. The requested port was {port}; if the \
         error is `Address already in use`, another process is listening on it. \
         Try running `lsof -i :{port}` to find out which one"
    )]
    Bind {
        addr: SocketAddr,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Transport credential material was missing or unusable.
    #[error("invalid transport credentials: {reason}")]
    Credentials { reason: String },

    /// A service requested token authentication, but no valid cluster
    /// identity was supplied at server construction.
    #[error("service `{service}` requested token auth but no cluster ID is configured")]
    MissingClusterId { service: String },

    /// The server has already been started.
    #[error("server is already running")]
    AlreadyRunning,

    /// The server is in the process of shutting down.
    #[error("server is shutting down")]
    ShuttingDown,

    /// No handler was ever registered for this method.
    #[error("no handler registered for method `{method}`")]
    UnknownMethod { method: String },

    /// All pre-posted receive slots for this method are currently occupied.
    #[error("no receive slot available for method `{method}`")]
    NoCapacity { method: String },

    /// The call was deleted (server shutdown) before a reply was written.
    #[error("call terminated before a reply was produced")]
    CallDropped,

    /// The supplied configuration was rejected.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}
