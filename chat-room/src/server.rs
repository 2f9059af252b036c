use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::{Html, Response},
    routing::get,
};
use tokio::{net::TcpListener, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    connection,
    hub::{Hub, spawn_hub},
    trace::Tracer,
};

const CHAT_PAGE: &str = include_str!("../templates/chat.html");

/// Tunables for the room. Defaults match the command-line defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomConfig {
    /// Capacity of each client's outbound queue.
    pub queue_capacity: usize,
    /// WebSocket write buffer size in bytes. Only the write side is tunable;
    /// reads use the WebSocket layer's default buffer.
    pub socket_buffer_size: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            socket_buffer_size: 1024,
        }
    }
}

#[derive(Clone)]
struct AppState {
    hub: Hub,
    config: RoomConfig,
}

pub struct Server {
    listener: TcpListener,
    hub: Hub,
    hub_task: JoinHandle<()>,
    config: RoomConfig,
}

impl Server {
    /// Spawns the hub; must be called inside a tokio runtime.
    pub fn new(listener: TcpListener, config: RoomConfig, tracer: Arc<dyn Tracer>) -> Self {
        let (hub, hub_task) = spawn_hub(tracer);
        Self {
            listener,
            hub,
            hub_task,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            hub,
            hub_task,
            config,
        } = self;

        axum::serve(listener, router(hub.clone(), config))
            .with_graceful_shutdown(shutdown)
            .await
            .context("http server failed")?;

        info!("room shutting down");
        hub.shutdown();
        if let Err(err) = hub_task.await {
            warn!(error = ?err, "hub task panicked");
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Builds the HTTP surface: the chat page at `/` and the socket at `/room`.
pub fn router(hub: Hub, config: RoomConfig) -> Router {
    Router::new()
        .route("/", get(chat_page))
        .route("/room", get(join_room))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { hub, config })
}

async fn chat_page() -> Html<&'static str> {
    Html(CHAT_PAGE)
}

async fn join_room(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let AppState { hub, config } = state;
    ws.write_buffer_size(config.socket_buffer_size)
        .on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| connection::serve_socket(socket, hub, config.queue_capacity))
}
