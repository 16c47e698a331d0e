// SPDX-License-Identifier: Apache-2.0
//! WebSocket ↔ TCP bridge for the Drift hub.
//!
//! Browsers speak WebSocket; the hub speaks length-prefixed TCP frames.
//! Each binary WS message is exactly one frame payload: toward the hub the
//! bridge adds the `u32` length prefix, toward the browser it strips it.
//! The hub sees a bridged browser as just another framed transport.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::{
    extract::ws::{Message, WebSocket},
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use drift_proto::frame;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, Mutex},
    time::{self, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Drift WebSocket gateway")]
struct Args {
    /// TCP listener for browser clients (e.g. 0.0.0.0:8787).
    #[arg(long, default_value = "0.0.0.0:8787")]
    listen: SocketAddr,
    /// Address of the Drift hub's TCP listener.
    #[arg(long, default_value = "127.0.0.1:8230")]
    hub: String,
    /// Maximum frame payload in bytes.
    #[arg(long, default_value_t = frame::MAX_PAYLOAD)]
    max_frame_bytes: usize,
    /// Allowed Origin values (repeatable). Empty accepts all origins.
    #[arg(long)]
    allow_origin: Vec<String>,
}

#[derive(Debug)]
struct ConnMetrics {
    peer: SocketAddr,
    opened_at_ms: u64,
}

#[derive(Debug, Default)]
struct GatewayMetrics {
    next_conn_id: u64,
    total_connections: u64,
    active_connections: usize,
    ws_to_hub_bytes: u64,
    ws_to_hub_frames: u64,
    hub_to_ws_bytes: u64,
    hub_to_ws_frames: u64,
    invalid_ws_frames: u64,
    connections: HashMap<u64, ConnMetrics>,
}

impl GatewayMetrics {
    fn alloc_conn(&mut self, peer: SocketAddr, now_ms: u64) -> u64 {
        let conn_id = self.next_conn_id;
        self.next_conn_id = self.next_conn_id.wrapping_add(1);
        self.total_connections = self.total_connections.wrapping_add(1);
        self.active_connections = self.active_connections.saturating_add(1);
        self.connections.insert(
            conn_id,
            ConnMetrics {
                peer,
                opened_at_ms: now_ms,
            },
        );
        conn_id
    }

    fn remove_conn(&mut self, conn_id: u64) {
        self.active_connections = self.active_connections.saturating_sub(1);
        self.connections.remove(&conn_id);
    }
}

#[derive(Debug, Serialize)]
struct DirectionCounters {
    bytes: u64,
    frames: u64,
}

#[derive(Debug, Serialize)]
struct ConnResponse {
    conn_id: u64,
    peer: String,
    opened_at_ms: u64,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    uptime_ms: u64,
    active_connections: usize,
    total_connections: u64,
    ws_to_hub: DirectionCounters,
    hub_to_ws: DirectionCounters,
    invalid_ws_frames: u64,
    connections: Vec<ConnResponse>,
}

struct AppState {
    hub_addr: String,
    max_frame_bytes: usize,
    allow_origins: Option<HashSet<String>>,
    start_instant: Instant,
    metrics: Arc<Mutex<GatewayMetrics>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let allow_origins = if args.allow_origin.is_empty() {
        None
    } else {
        Some(args.allow_origin.iter().cloned().collect())
    };

    let state = Arc::new(AppState {
        hub_addr: args.hub.clone(),
        max_frame_bytes: args.max_frame_bytes,
        allow_origins,
        start_instant: Instant::now(),
        metrics: Arc::new(Mutex::new(GatewayMetrics::default())),
    });

    let app = Router::new()
        .route("/api/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!(listen = %args.listen, hub = %args.hub, "ws gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("ws gateway draining");
    })
    .await?;

    Ok(())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime_ms: u64 = state
        .start_instant
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX);

    let snapshot = {
        let metrics = state.metrics.lock().await;
        let mut connections: Vec<ConnResponse> = metrics
            .connections
            .iter()
            .map(|(&conn_id, c)| ConnResponse {
                conn_id,
                peer: c.peer.to_string(),
                opened_at_ms: c.opened_at_ms,
            })
            .collect();
        connections.sort_by_key(|c| c.conn_id);
        MetricsResponse {
            uptime_ms,
            active_connections: metrics.active_connections,
            total_connections: metrics.total_connections,
            ws_to_hub: DirectionCounters {
                bytes: metrics.ws_to_hub_bytes,
                frames: metrics.ws_to_hub_frames,
            },
            hub_to_ws: DirectionCounters {
                bytes: metrics.hub_to_ws_bytes,
                frames: metrics.hub_to_ws_frames,
            },
            invalid_ws_frames: metrics.invalid_ws_frames,
            connections,
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, max-age=0"),
    );
    (headers, Json(snapshot))
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !origin_allowed(&state, &headers) {
        let origin = headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("<missing>");
        warn!(?addr, origin = %origin, "origin rejected");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, peer: SocketAddr) {
    let hub = match time::timeout(Duration::from_secs(2), TcpStream::connect(&state.hub_addr)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            error!(?err, hub = %state.hub_addr, "failed to connect to hub");
            let _ = socket
                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: axum::extract::ws::close_code::ERROR,
                    reason: "upstream unavailable".into(),
                })))
                .await;
            return;
        }
        Err(_) => {
            warn!(?peer, hub = %state.hub_addr, "timed out connecting to hub");
            let _ = socket
                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: axum::extract::ws::close_code::ERROR,
                    reason: "upstream connect timeout".into(),
                })))
                .await;
            return;
        }
    };
    let _ = hub.set_nodelay(true);

    let conn_id = {
        let now_ms: u64 = state
            .start_instant
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX);
        let mut metrics = state.metrics.lock().await;
        metrics.alloc_conn(peer, now_ms)
    };
    debug!(?peer, conn_id, "bridge open");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut hub_read, mut hub_write) = hub.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);

    // Writer: WS outbound (binary frames, pongs, pings).
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Hub -> WS: reassemble length-prefixed frames, forward payloads.
    let max_len = state.max_frame_bytes;
    let out_tx_hub = out_tx.clone();
    let metrics_hub = state.metrics.clone();
    let mut hub_to_ws = tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
        loop {
            let n = hub_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            acc.extend_from_slice(&buf[..n]);
            loop {
                match frame::try_extract(&mut acc) {
                    Ok(Some(payload)) => {
                        {
                            let mut metrics = metrics_hub.lock().await;
                            metrics.hub_to_ws_frames = metrics.hub_to_ws_frames.wrapping_add(1);
                            metrics.hub_to_ws_bytes = metrics
                                .hub_to_ws_bytes
                                .wrapping_add(payload.len() as u64);
                        }
                        if out_tx_hub.send(Message::Binary(payload.into())).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(err) => anyhow::bail!("hub framing error: {err}"),
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    });

    // WS -> hub: add the length prefix and forward.
    let metrics_ws = state.metrics.clone();
    let pong_tx = out_tx.clone();
    let mut ws_to_hub = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if data.len() > max_len {
                        let mut metrics = metrics_ws.lock().await;
                        metrics.invalid_ws_frames = metrics.invalid_ws_frames.wrapping_add(1);
                        warn!(?peer, len = data.len(), "oversized frame from client");
                        break;
                    }
                    {
                        let mut metrics = metrics_ws.lock().await;
                        metrics.ws_to_hub_frames = metrics.ws_to_hub_frames.wrapping_add(1);
                        metrics.ws_to_hub_bytes =
                            metrics.ws_to_hub_bytes.wrapping_add(data.len() as u64);
                    }
                    if hub_write.write_all(&frame::encode(&data)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = pong_tx.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(_)) => {
                    warn!(?peer, "ignoring text frame");
                    break;
                }
                Err(err) => {
                    debug!(?err, ?peer, "ws recv error");
                    break;
                }
                _ => {}
            }
        }
    });

    // Keep-alive pings toward the browser.
    let ping_tx = out_tx.clone();
    let ping = tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;
            if ping_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut ws_to_hub => {}
        res = &mut hub_to_ws => {
            if let Ok(Err(err)) = res {
                warn!(?peer, ?err, "hub side failed");
            }
            let _ = time::timeout(
                Duration::from_millis(250),
                out_tx.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: axum::extract::ws::close_code::ERROR,
                    reason: "upstream disconnected".into(),
                }))),
            )
            .await;
        }
        _ = &mut writer => {}
    }

    ping.abort();
    ws_to_hub.abort();
    hub_to_ws.abort();
    drop(out_tx);

    // Best-effort flush of the close frame.
    if time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }

    {
        let mut metrics = state.metrics.lock().await;
        metrics.remove_conn(conn_id);
    }
    debug!(?peer, conn_id, "bridge closed");
}

fn origin_allowed(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(allow) = &state.allow_origins else {
        return true;
    };
    if let Some(origin) = headers.get("origin") {
        if let Ok(origin_str) = origin.to_str() {
            return allow.contains(origin_str);
        }
    }
    false
}
