use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};

use crate::wsproto::{self, Decoded, WS_MAX_MESSAGE_BYTES};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Long-lived event-channel task: keeps one websocket to the server,
/// reconnecting with capped backoff. Inbound frames are decoded onto
/// `inbound`; frames queued on `outbound` are sent as binary messages.
/// Returns when `shutdown` fires or either channel closes.
pub async fn run_event_channel(
    url: String,
    inbound: mpsc::Sender<Decoded>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    shutdown: Arc<Notify>,
) {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_BYTES);
    config.max_frame_size = Some(WS_MAX_MESSAGE_BYTES);

    let mut backoff = INITIAL_BACKOFF;
    loop {
        let conn = tokio::select! {
            _ = shutdown.notified() => return,
            conn = connect_async_with_config(url.as_str(), Some(config), false) => conn,
        };

        match conn {
            Ok((stream, _resp)) => {
                crate::logging::info("event channel connected");
                backoff = INITIAL_BACKOFF;
                let (mut write, mut read) = stream.split();
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => {
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                        frame = outbound.recv() => {
                            let Some(bytes) = frame else { return };
                            if let Err(err) = write.send(Message::Binary(bytes)).await {
                                crate::logging::error(format!("event channel send error: {err}"));
                                break;
                            }
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(txt))) => {
                                    match wsproto::decode_text_json(&txt) {
                                        Ok(decoded) => {
                                            if inbound.send(decoded).await.is_err() {
                                                return;
                                            }
                                        }
                                        Err(err) => crate::logging::error(format!(
                                            "event channel decode error: {err}"
                                        )),
                                    }
                                }
                                Some(Ok(Message::Binary(bin))) => {
                                    match wsproto::decode_binary(&bin) {
                                        Ok(decoded) => {
                                            if inbound.send(decoded).await.is_err() {
                                                return;
                                            }
                                        }
                                        Err(err) => crate::logging::error(format!(
                                            "event channel decode error: {err}"
                                        )),
                                    }
                                }
                                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            }
                        }
                    }
                }
                crate::logging::warn("event channel disconnected, reconnecting");
            }
            Err(err) => {
                crate::logging::error(format!("event channel connect error: {err}"));
            }
        }

        tokio::select! {
            _ = shutdown.notified() => return,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
