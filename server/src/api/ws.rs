//! WebSocket transport adapter
//!
//! Adapts an accepted axum WebSocket to the gateway's connection-sink
//! interface. Outbound frames go through an unbounded channel drained by a
//! writer task, so gateway code never blocks on the socket; inbound frames
//! are dispatched to the supervisor. All protocol logic lives behind the
//! sink abstraction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::AppState;
use crate::core::constants::CLOSE_NORMAL;
use crate::gateway::{ConnectionSink, ReadyState, SinkError};

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Outbound frames queued for the writer task
enum WsOut {
    Text(String),
    Ping,
    Close(u16, String),
}

/// Connection sink over an axum WebSocket
struct WsSink {
    tx: mpsc::UnboundedSender<WsOut>,
    state: AtomicU8,
}

impl WsSink {
    fn new(tx: mpsc::UnboundedSender<WsOut>) -> Self {
        Self {
            tx,
            state: AtomicU8::new(STATE_OPEN),
        }
    }

    fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
    }
}

impl ConnectionSink for WsSink {
    fn send_text(&self, text: String) -> Result<(), SinkError> {
        if self.state.load(Ordering::SeqCst) != STATE_OPEN {
            return Err(SinkError::Closed);
        }
        self.tx
            .send(WsOut::Text(text))
            .map_err(|_| SinkError::Closed)
    }

    fn send_ping(&self) -> Result<(), SinkError> {
        if self.state.load(Ordering::SeqCst) != STATE_OPEN {
            return Err(SinkError::Closed);
        }
        self.tx.send(WsOut::Ping).map_err(|_| SinkError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        // First close wins; later calls are no-ops
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.tx.send(WsOut::Close(code, reason.to_string()));
        }
    }

    fn ready_state(&self) -> ReadyState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => ReadyState::Open,
            STATE_CLOSING => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(rename = "streamName")]
    pub stream_name: Option<String>,
}

/// WebSocket upgrade endpoint
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket, addr, query.stream_name))
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    addr: SocketAddr,
    stream_name: Option<String>,
) {
    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(WsSink::new(out_tx));

    let writer = tokio::spawn(write_loop(ws_tx, out_rx, sink.clone()));

    let connection = match state
        .supervisor
        .accept(
            sink.clone(),
            &addr.ip().to_string(),
            stream_name.as_deref(),
        )
        .await
    {
        Ok(connection) => connection,
        Err(e) => {
            // accept already queued the close frame (1008/1011)
            tracing::debug!(%addr, error = %e, "Connection rejected");
            let _ = writer.await;
            return;
        }
    };

    read_loop(&state, &connection.connection_id, ws_rx).await;

    state
        .supervisor
        .disconnect(&connection.connection_id, CLOSE_NORMAL, "Client disconnected")
        .await;
    let _ = writer.await;
}

/// Dispatch inbound frames until the socket ends
async fn read_loop(state: &AppState, connection_id: &str, mut ws_rx: SplitStream<WebSocket>) {
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                state.supervisor.handle_text(connection_id, text.as_str()).await;
            }
            Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => {
                // The protocol layer answers pings; both directions prove
                // liveness
                state.supervisor.handle_pong(connection_id);
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!(%connection_id, "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(%connection_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }
}

/// Drain queued frames onto the socket; ends on close or transport error
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<WsOut>,
    sink: Arc<WsSink>,
) {
    while let Some(out) = out_rx.recv().await {
        let result = match out {
            WsOut::Text(text) => ws_tx.send(Message::Text(text.into())).await,
            WsOut::Ping => ws_tx.send(Message::Ping(Vec::new().into())).await,
            WsOut::Close(code, reason) => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "WebSocket write failed");
            break;
        }
    }
    sink.mark_closed();
}
