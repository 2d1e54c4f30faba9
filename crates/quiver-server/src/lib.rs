#![doc = include_str!("../README.md")]

mod server;

pub use quiver_core::{
    CallToken, ClusterId, Error, Payload, Reply, Result, Status, StatusCode,
};
pub use server::Server;
pub use server::config::{CredentialConfig, ListenConfig, ServerConfig, TuningConfig};
pub use server::service::{ReplySink, RpcHandler, Service};
pub use server::transport::{PendingReply, RequestInjector, ServerConnection};
