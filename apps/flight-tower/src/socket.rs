use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::error::{FlightError, RegistrationError};
use crate::network::source_address;
use crate::protocol::{decode_binary, decode_text, ClientMessage, ServerMessage};
use crate::registry::{Outbound, Outbox};
use crate::server::AppState;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket upgrade handler. The origin gate runs before the upgrade.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if let Err(rejection) = state.config.origin_policy.check(origin) {
        counter!(
            "flight_tower_origin_rejections_total",
            1,
            "reason" => rejection.metric_label()
        );
        warn!(peer = %peer, error = %rejection, "rejecting websocket upgrade");
        return StatusCode::FORBIDDEN.into_response();
    }

    let source = source_address(peer, &headers, state.config.trust_proxy);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let transport_limit = state.config.transport_limit();

    ws.max_message_size(transport_limit)
        .max_frame_size(transport_limit)
        .on_upgrade(move |socket| handle_socket(socket, state, source, user_agent))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    source: String,
    user_agent: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbox, mut rx) = Outbox::channel();
    let cancel = outbox.cancellation();
    let id = state
        .tower
        .with(|coord| coord.register(source, user_agent, outbox));

    if let Err(err) = send_registered(&mut ws_tx, &id).await {
        error!(connection_id = %id, error = %err, "registration failed; closing connection");
        state.tower.with(|coord| coord.disconnect(&id));
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::ERROR,
                reason: Cow::Borrowed("registration failed"),
            })))
            .await;
        return;
    }

    let writer_id = id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Some((message, last)) = encode(frame) else {
                continue;
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
            if last {
                break;
            }
        }
        debug!(connection_id = %writer_id, "writer task finished");
    });

    let max_frame_bytes = state.config.max_frame_bytes;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(connection_id = %id, "connection closed by tower");
                break;
            }
            next = ws_rx.next() => next,
        };
        let Some(frame) = next else {
            break;
        };

        match frame {
            Ok(Message::Text(text)) => {
                dispatch(&state, &id, decode_text(&text, max_frame_bytes));
            }
            Ok(Message::Binary(bytes)) => {
                dispatch(&state, &id, decode_binary(&bytes, max_frame_bytes));
            }
            Ok(Message::Pong(_)) => state.tower.with(|coord| coord.mark_alive(&id)),
            // axum answers pings on its own.
            Ok(Message::Ping(_)) => {}
            Ok(Message::Close(frame)) => {
                info!(
                    connection_id = %id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Err(err) => {
                let code = read_error_close_code(&err);
                error!(connection_id = %id, error = %err, close_code = code, "websocket read failed");
                state.tower.with(|coord| {
                    coord.send_error(&id, format!("Protocol error: {err}"));
                    coord.close(&id, code, close_reason(code));
                });
                break;
            }
        }
    }

    state.tower.with(|coord| coord.disconnect(&id));

    // The registry held the last sender, so the writer drains and stops.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        warn!(connection_id = %id, "writer did not drain in time");
        writer.abort();
    }
}

async fn send_registered(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    id: &str,
) -> Result<(), RegistrationError> {
    let payload = serde_json::to_string(&ServerMessage::Registered { id: id.to_string() })?;
    ws_tx.send(Message::Text(payload)).await?;
    Ok(())
}

/// 1009 for frames over the transport ceiling, 1002 for anything else the
/// websocket layer refuses.
fn read_error_close_code(err: &axum::Error) -> u16 {
    if err.to_string().contains("Space limit exceeded") {
        close_code::SIZE
    } else {
        close_code::PROTOCOL
    }
}

fn close_reason(code: u16) -> &'static str {
    if code == close_code::SIZE {
        "message too large"
    } else {
        "protocol error"
    }
}

fn dispatch(state: &AppState, id: &str, decoded: Result<ClientMessage, FlightError>) {
    state.tower.with(|coord| match decoded {
        Ok(message) => {
            if let Err(err) = coord.handle(id, message) {
                coord.report(id, &err);
            }
        }
        Err(err) => {
            warn!(connection_id = %id, error = %err, "discarding malformed frame");
            coord.report(id, &err);
        }
    });
}

/// Turn a queued frame into a socket message. The flag marks a close frame,
/// after which the writer stops.
fn encode(frame: Outbound) -> Option<(Message, bool)> {
    match frame {
        Outbound::Message(message) => match serde_json::to_string(&message) {
            Ok(json) => Some((Message::Text(json), false)),
            Err(err) => {
                error!(error = %err, "failed to encode server message");
                None
            }
        },
        Outbound::Ping => Some((Message::Ping(Vec::new()), false)),
        Outbound::Close { code, reason } => Some((
            Message::Close(Some(CloseFrame {
                code,
                reason: Cow::Owned(reason),
            })),
            true,
        )),
    }
}
