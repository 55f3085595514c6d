use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::StreamExt;
use futures::SinkExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::db::bars::BarKind;
use crate::feed::ChartSession;
use crate::state::AppState;

/// WebSocket upgrade handler for the chart feed protocol.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Messages the charting widget sends.  The widget's own callback
/// vocabulary stays in the frontend adapter; this protocol speaks in terms
/// of series, bars and subscriptions.
#[derive(Debug, Deserialize)]
struct WsClientMsg {
    #[serde(rename = "type")]
    msg_type: String,
    series: Option<String>,
    kind: Option<String>,
    from: Option<i64>,
    to: Option<i64>,
    resolution: Option<u32>,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // One chart session per connection; its buffer dies with the socket.
    let mut session: Option<Arc<ChartSession>> = None;
    let mut forwarder: Option<tokio::task::JoinHandle<()>> = None;

    let (tx_to_client, mut rx_to_client) = tokio::sync::mpsc::channel::<String>(64);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx_to_client.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        let Ok(parsed) = serde_json::from_str::<WsClientMsg>(&text) else {
            let _ = tx_to_client
                .send(json!({"type": "error", "error": "malformed message"}).to_string())
                .await;
            continue;
        };

        match parsed.msg_type.as_str() {
            "open" => {
                let kind = parsed
                    .kind
                    .as_deref()
                    .map(BarKind::parse)
                    .unwrap_or(Ok(BarKind::Price));
                match (parsed.series, kind) {
                    (Some(series), Ok(kind)) => {
                        // Switching series tears the old stream down first.
                        if let Some(task) = forwarder.take() {
                            task.abort();
                            if let Some(old) = session.as_ref() {
                                old.unsubscribe().await;
                            }
                        }
                        session = None;
                        let opened = Arc::new(state.open_session(&series, kind));
                        let info = opened.describe_series();
                        session = Some(opened);
                        let _ = tx_to_client
                            .send(json!({"type": "series", "series": info}).to_string())
                            .await;
                    }
                    _ => {
                        let _ = tx_to_client
                            .send(
                                json!({"type": "error", "error": "open needs series and a valid kind"})
                                    .to_string(),
                            )
                            .await;
                    }
                }
            }
            "get_bars" => {
                let Some(session) = session.as_ref() else {
                    let _ = tx_to_client
                        .send(json!({"type": "error", "error": "no open series"}).to_string())
                        .await;
                    continue;
                };
                let (from, to) = (parsed.from.unwrap_or(0), parsed.to.unwrap_or(0));
                let resolution = parsed.resolution.unwrap_or(1).max(1);
                match session.get_bars(from, to, resolution).await {
                    Ok((bars, has_more)) => {
                        let _ = tx_to_client
                            .send(
                                json!({"type": "bars", "bars": bars, "has_more": has_more})
                                    .to_string(),
                            )
                            .await;
                    }
                    Err(e) => {
                        let _ = tx_to_client
                            .send(json!({"type": "error", "error": e.to_string()}).to_string())
                            .await;
                    }
                }
            }
            "subscribe" => {
                let Some(session) = session.as_ref() else {
                    let _ = tx_to_client
                        .send(json!({"type": "error", "error": "no open series"}).to_string())
                        .await;
                    continue;
                };
                if forwarder.is_some() {
                    continue; // already streaming
                }
                let mut rx = session.subscribe().await;
                let tx = tx_to_client.clone();
                forwarder = Some(tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(bar) => {
                                let msg = json!({"type": "bar", "bar": bar}).to_string();
                                if tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            // Lagged: skip ahead to the latest bar.
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }));
            }
            "unsubscribe" => {
                if let Some(task) = forwarder.take() {
                    task.abort();
                    if let Some(session) = session.as_ref() {
                        session.unsubscribe().await;
                    }
                }
            }
            "ping" => {
                let _ = tx_to_client.send(r#"{"type":"pong"}"#.to_string()).await;
            }
            _ => {}
        }
    }

    // Socket gone: release the live feed before dropping the session.
    if let Some(task) = forwarder.take() {
        task.abort();
        if let Some(session) = session.as_ref() {
            session.unsubscribe().await;
        }
    }
    send_task.abort();
}
