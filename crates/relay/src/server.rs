// Wires the relay together and runs it: bridge subscription first, then the
// HTTP listener. Shutdown closes every session (each publishes its `Left`)
// and waits a bounded time for them to finish.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::access::DocumentAccessStore;
use crate::app::build_router;
use crate::bridge::{BridgeTasks, RelayBridge};
use crate::bus::Bus;
use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::metrics::RelayMetrics;
use crate::rooms::RoomRegistry;
use crate::ws::{Gatekeeper, HeartbeatConfig, WsState};

pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RelayServer {
    local_addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    metrics: Arc<RelayMetrics>,
    shutdown: watch::Sender<bool>,
    sessions_done: mpsc::Receiver<()>,
    serve: JoinHandle<std::io::Result<()>>,
    bridge_tasks: BridgeTasks,
}

impl RelayServer {
    /// Bind `config.listen_addr` and start serving with the given bus and
    /// access store.
    pub async fn start(
        config: &RelayConfig,
        bus: Bus,
        access: DocumentAccessStore,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(RelayMetrics::default());
        let registry = Arc::new(RoomRegistry::default());
        let bridge = RelayBridge::new(bus, Arc::clone(&metrics));
        let bridge_tasks = bridge
            .start(
                Dispatcher::new(Arc::clone(&registry), Arc::clone(&metrics)),
                config.dispatch_queue_capacity,
            )
            .await
            .context("failed to subscribe to room topics")?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (active_sessions, sessions_done) = mpsc::channel(1);
        let ws_state = WsState {
            gatekeeper: Gatekeeper::new(access, config.access_policy),
            registry: Arc::clone(&registry),
            bridge,
            metrics: Arc::clone(&metrics),
            outbound_queue_capacity: config.outbound_queue_capacity,
            heartbeat: HeartbeatConfig {
                interval: config.heartbeat_interval,
                timeout: config.heartbeat_timeout,
            },
            shutdown: shutdown_rx.clone(),
            active_sessions,
        };

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;
        let local_addr = listener.local_addr().context("failed to read relay listen address")?;

        let app = build_router(ws_state);
        let mut stop = shutdown_rx;
        let serve = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopping| *stopping).await;
                })
                .await
        });

        info!(
            listen_addr = %local_addr,
            access_policy = config.access_policy.as_str(),
            "relay server listening"
        );

        Ok(Self { local_addr, registry, metrics, shutdown, sessions_done, serve, bridge_tasks })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Stop accepting connections, close every session, and wait up to
    /// `drain_timeout` for them to unregister and publish their `Left`.
    pub async fn shutdown(mut self, drain_timeout: Duration) -> anyhow::Result<()> {
        self.shutdown.send_replace(true);

        let serve_result = self.serve.await.context("relay server task failed")?;
        serve_result.context("relay server exited unexpectedly")?;

        // Every sender lives in a session task once the router is gone.
        let drained =
            tokio::time::timeout(drain_timeout, self.sessions_done.recv()).await.is_ok();
        if drained {
            info!("all connections drained");
        } else {
            let remaining_connections = self.registry.connection_count().await;
            let remaining_rooms = self.registry.room_count().await;
            warn!(remaining_connections, remaining_rooms, "shutdown drain timed out");
        }

        self.bridge_tasks.abort();
        Ok(())
    }
}
