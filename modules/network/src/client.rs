use std::time::Duration;

use bevy::log;
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionSettings;
use crate::protocol::{self, ClientMessage, DecodeError};
use crate::{ClientEvent, ConnectionState};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Upper bound on delivering the close frame when a disconnect is requested.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How a single session ended.
enum SessionEnd {
    Closed(String),
    Cancelled,
}

/// Connection loop: connect, run the session, wait `reconnect_delay`, repeat.
///
/// This loop is the only place a connection attempt is started, and the
/// reconnect delay is raced against `cancel_token`, so at most one reconnect
/// chain exists per task.
pub(crate) async fn run_client(
    settings: ConnectionSettings,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    mut outbound_rx: mpsc::Receiver<ClientMessage>,
    state_tx: watch::Sender<ConnectionState>,
    cancel_token: CancellationToken,
) {
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        state_tx.send_replace(ConnectionState::Connecting);
        let _ = event_tx.send(ClientEvent::Connecting { attempt });

        let end = run_session(
            &settings.endpoint,
            &event_tx,
            &mut outbound_rx,
            &state_tx,
            &cancel_token,
        )
        .await;

        state_tx.send_replace(ConnectionState::Disconnected);

        // Nothing queued for a dead session survives into the next one.
        while outbound_rx.try_recv().is_ok() {}

        let reason = match end {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Closed(reason)) => {
                log::info!("WebSocket closed: {reason}");
                reason
            }
            Err(e) => {
                log::error!("WebSocket error: {e}");
                let _ = event_tx.send(ClientEvent::Error(format!("Client error: {e}")));
                e.to_string()
            }
        };
        let _ = event_tx.send(ClientEvent::Disconnected { reason });

        log::info!(
            "Reconnecting to {} in {:?}",
            settings.endpoint,
            settings.reconnect_delay
        );
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(settings.reconnect_delay) => {}
        }
    }

    log::info!("Client disconnect requested");
    state_tx.send_replace(ConnectionState::Disconnected);
    let _ = event_tx.send(ClientEvent::Disconnected {
        reason: "Disconnect requested".into(),
    });
}

async fn run_session(
    endpoint: &str,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
    outbound_rx: &mut mpsc::Receiver<ClientMessage>,
    state_tx: &watch::Sender<ConnectionState>,
    cancel_token: &CancellationToken,
) -> Result<SessionEnd, BoxError> {
    log::info!("Connecting to {endpoint}...");
    let (socket, _response) = tokio::select! {
        _ = cancel_token.cancelled() => return Ok(SessionEnd::Cancelled),
        result = tokio_tungstenite::connect_async(endpoint) => result?,
    };
    log::info!("WebSocket connected to {endpoint}");

    let (mut write, mut read) = socket.split();

    while outbound_rx.try_recv().is_ok() {}
    state_tx.send_replace(ConnectionState::Connected);
    let _ = event_tx.send(ClientEvent::Connected);

    let request = protocol::encode(&ClientMessage::RequestGridState)?;
    write.send(Message::Text(request)).await?;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                match tokio::time::timeout(CLOSE_TIMEOUT, write.send(Message::Close(None))).await {
                    Ok(Ok(())) => log::debug!("Close frame sent to {endpoint}"),
                    Ok(Err(e)) => log::debug!("Failed to send close frame: {e}"),
                    Err(_) => log::debug!("Timed out sending close frame to {endpoint}"),
                }
                return Ok(SessionEnd::Cancelled);
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch_frame(&text, event_tx),
                Some(Ok(Message::Binary(bytes))) => {
                    log::debug!("Ignoring {} byte binary frame", bytes.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("closed by server ({}): {}", f.code, f.reason))
                        .unwrap_or_else(|| "closed by server".into());
                    return Ok(SessionEnd::Closed(reason));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(SessionEnd::Closed("connection closed".into())),
            },
            Some(message) = outbound_rx.recv() => {
                let text = protocol::encode(&message)?;
                write.send(Message::Text(text)).await?;
            }
        }
    }
}

/// Decodes one text frame and hands it to the handler. Bad frames are logged
/// and dropped; the session keeps running.
fn dispatch_frame(text: &str, event_tx: &mpsc::UnboundedSender<ClientEvent>) {
    log::debug!("socket message: {text}");
    match protocol::decode(text) {
        Ok(message) => {
            let _ = event_tx.send(ClientEvent::ServerMessageReceived(message));
        }
        Err(DecodeError::UnknownType(kind)) => {
            log::warn!("Unknown message type: {kind}");
        }
        Err(e) => {
            log::error!("Failed to parse WebSocket message: {e}");
        }
    }
}
