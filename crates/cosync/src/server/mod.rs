//! Server-side reconciliation and relay.
//!
//! This module hosts the deployable half of the crate: an HTTP API for
//! reconciliation and presence, and a WebSocket relay that fans channel
//! publishes out to subscribers. Both share one [`ServerContext`] holding
//! the operation store, the presence store and the injected auth seams.
//!
//! The relay follows an actor-like layout: every connection runs in its
//! own task and talks to a shared registry, and a broadcast channel
//! signals shutdown to every loop.

pub mod auth;
pub mod http;
pub mod relay;

use crate::presence::PresenceStore;
use crate::store::OperationStore;
use auth::{AccessPolicy, AllowAllPolicy, AcceptAllAuthProvider, AuthProvider};
use std::sync::Arc;

pub use auth::{AuthenticatedUser, StaticAccessPolicy, StaticTokenAuthProvider};
pub use http::router;
pub use relay::{RelayServer, RelayStats, ShutdownHandle};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_address: String,
    /// Port for the HTTP API.
    pub http_port: u16,
    /// Port for the WebSocket relay.
    pub relay_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
            relay_port: 8081,
        }
    }
}

impl ServerConfig {
    /// Create a configuration with the specified ports.
    pub fn with_ports(http_port: u16, relay_port: u16) -> Self {
        Self {
            http_port,
            relay_port,
            ..Default::default()
        }
    }

    /// Read configuration from `COSYNC_BIND_ADDRESS`, `COSYNC_HTTP_PORT`
    /// and `COSYNC_RELAY_PORT`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_address: std::env::var("COSYNC_BIND_ADDRESS")
                .unwrap_or(defaults.bind_address),
            http_port: parse_port(std::env::var("COSYNC_HTTP_PORT").ok(), defaults.http_port),
            relay_port: parse_port(std::env::var("COSYNC_RELAY_PORT").ok(), defaults.relay_port),
        }
    }

    /// Full bind address for the HTTP API.
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.http_port)
    }

    /// Full bind address for the relay.
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.relay_port)
    }
}

fn parse_port(value: Option<String>, default: u16) -> u16 {
    match value {
        Some(raw) => match raw.parse() {
            Ok(port) => port,
            Err(_) => {
                tracing::warn!("Ignoring unparseable port value '{}'", raw);
                default
            }
        },
        None => default,
    }
}

/// Shared services behind the HTTP API and the relay.
pub struct ServerContext<A = AcceptAllAuthProvider, P = AllowAllPolicy> {
    /// Durable operation log.
    pub store: Arc<dyn OperationStore>,
    /// Presence rows.
    pub presence: Arc<dyn PresenceStore>,
    /// Token resolution.
    pub auth: Arc<A>,
    /// Per-resource write authorization.
    pub policy: Arc<P>,
}

impl<A: AuthProvider, P: AccessPolicy> ServerContext<A, P> {
    pub fn new(
        store: Arc<dyn OperationStore>,
        presence: Arc<dyn PresenceStore>,
        auth: A,
        policy: P,
    ) -> Self {
        Self {
            store,
            presence,
            auth: Arc::new(auth),
            policy: Arc::new(policy),
        }
    }
}

impl<A, P> Clone for ServerContext<A, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            presence: Arc::clone(&self.presence),
            auth: Arc::clone(&self.auth),
            policy: Arc::clone(&self.policy),
        }
    }
}
