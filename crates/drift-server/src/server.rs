// SPDX-License-Identifier: Apache-2.0
//! Server facade: accepts transports, mints sessions, owns shutdown.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hooks::Hooks;
use crate::registry::Registry;
use crate::session;
use drift_proto::transport::{self, BoxedReader, BoxedWriter};
use drift_store::DocStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

/// One Drift hub. Owns the document registry and the drain flag; multiple
/// servers in one process are fine, each with its own registry.
pub struct Server {
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    shutdown_tx: watch::Sender<bool>,
    next_session_id: AtomicU64,
    hooks: Arc<dyn Hooks>,
}

impl Server {
    /// Builds a server. Pass a store to enable persistence (it is only used
    /// when `config.allow_save` is set).
    pub fn new(
        config: ServerConfig,
        hooks: Arc<dyn Hooks>,
        store: Option<Arc<dyn DocStore>>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Registry::new(hooks.clone(), store, config.clone(), shutdown_rx);
        Arc::new(Self {
            config,
            registry,
            shutdown_tx,
            next_session_id: AtomicU64::new(1),
            hooks,
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The document registry (mainly for tools and tests).
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Wires an already-established framed transport in as a new session.
    /// This is how the in-memory transport (tests) and any bridged
    /// transport (peer-to-peer data channels) join; TCP accept uses it too.
    pub fn attach(self: &Arc<Self>, reader: BoxedReader, writer: BoxedWriter) -> u64 {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let registry = self.registry.clone();
        let hooks = self.hooks.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            session::run(id, reader, writer, registry, hooks, config, shutdown).await;
        });
        id
    }

    /// Binds the configured TCP port.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = ("0.0.0.0", self.config.port);
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accepts transports until shutdown. Losing the listener is the one
    /// fatal error in the system.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        info!(addr = %listener.local_addr()?, "drift hub listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = transport::tcp_split(stream);
                    let id = self.attach(reader, writer);
                    debug!(%peer, session = id, "transport accepted");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drains the whole hub: stop accepting, close every session with a
    /// Goodbye, let in-flight ticks finish, flush persistence.
    pub async fn shutdown(&self) {
        info!("drift hub draining");
        let _ = self.shutdown_tx.send(true);
        self.registry.shutdown().await;
    }

    /// True once [`Server::shutdown`] has started.
    pub fn is_draining(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}
