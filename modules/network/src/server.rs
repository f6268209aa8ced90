use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bevy::log;
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::ServerEvent;
use crate::protocol::{ClientId, DecodeError, decode_client_message, encode};
use crate::runtime::ServerCommand;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Bounded channel buffer size per client to prevent memory exhaustion from slow clients.
/// Allows brief bursts while providing backpressure.
const PER_PEER_BUFFER_SIZE: usize = 100;

/// Upper bound on delivering a close frame to a client at shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-client write channels carrying encoded text frames.
type ClientSenders = Arc<tokio::sync::Mutex<HashMap<ClientId, mpsc::Sender<String>>>>;

pub(crate) async fn run_server(
    port: u16,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    server_cmd_rx: mpsc::UnboundedReceiver<ServerCommand>,
    cancel_token: CancellationToken,
) {
    if let Err(e) = run_server_inner(port, &event_tx, server_cmd_rx, cancel_token).await {
        if let Err(err) = event_tx.send(ServerEvent::Error(format!("Server error: {e}"))) {
            log::error!("Failed to send ServerEvent::Error: {}", err);
        }
        if let Err(err) = event_tx.send(ServerEvent::HostingStopped) {
            log::error!("Failed to send ServerEvent::HostingStopped: {}", err);
        }
    }
}

async fn run_server_inner(
    port: u16,
    event_tx: &mpsc::UnboundedSender<ServerEvent>,
    mut server_cmd_rx: mpsc::UnboundedReceiver<ServerCommand>,
    cancel_token: CancellationToken,
) -> Result<(), BoxError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    log::info!("Server listening on {local_addr}");
    if let Err(e) = event_tx.send(ServerEvent::HostingStarted {
        port: local_addr.port(),
    }) {
        log::error!("Failed to send HostingStarted event: {}", e);
    }

    let next_client_id = AtomicU64::new(1);
    let client_senders: ClientSenders = Arc::new(tokio::sync::Mutex::new(HashMap::new()));

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("Server cancellation requested");
                break;
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let client_id = ClientId(next_client_id.fetch_add(1, Ordering::SeqCst));
                tokio::spawn(serve_client(
                    stream,
                    addr,
                    client_id,
                    event_tx.clone(),
                    client_senders.clone(),
                    cancel_token.clone(),
                ));
            }
            cmd = server_cmd_rx.recv() => {
                match cmd {
                    Some(ServerCommand::SendTo { client, message }) => {
                        match encode(&message) {
                            Ok(text) => {
                                let senders = client_senders.lock().await;
                                if let Some(sender) = senders.get(&client) {
                                    if let Err(e) = sender.try_send(text) {
                                        log::error!("Failed to route message to client {} (buffer full or disconnecting): {}", client, e);
                                    }
                                } else {
                                    log::error!("Client {} not found for send_to (already disconnected)", client);
                                }
                            }
                            Err(e) => {
                                log::error!("Failed to encode message for client {}: {}", client, e);
                            }
                        }
                    }
                    Some(ServerCommand::Broadcast { message }) => {
                        match encode(&message) {
                            Ok(text) => {
                                let senders = client_senders.lock().await;
                                for (client_id, sender) in senders.iter() {
                                    if let Err(e) = sender.try_send(text.clone()) {
                                        log::error!("Failed to broadcast to client {} (buffer full or disconnecting): {}", client_id, e);
                                    }
                                }
                            }
                            Err(e) => {
                                log::error!("Failed to encode broadcast message: {}", e);
                            }
                        }
                    }
                    None => {
                        log::info!("Server command channel closed");
                        break;
                    }
                }
            }
        }
    }

    if let Err(err) = event_tx.send(ServerEvent::HostingStopped) {
        log::error!("Failed to send ServerEvent::HostingStopped: {}", err);
    }
    Ok(())
}

/// Runs one client session: WebSocket handshake, then a select loop that
/// forwards decoded client messages and writes routed server messages.
async fn serve_client(
    stream: TcpStream,
    addr: SocketAddr,
    client_id: ClientId,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    client_senders: ClientSenders,
    cancel_token: CancellationToken,
) {
    let socket = tokio::select! {
        _ = cancel_token.cancelled() => return,
        handshake = tokio_tungstenite::accept_async(stream) => match handshake {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("WebSocket handshake with {} failed: {}", addr, e);
                return;
            }
        },
    };
    log::info!("Client connected from {} with ClientId {}", addr, client_id);

    let (mut write, mut read) = socket.split();
    let (write_tx, mut write_rx) = mpsc::channel::<String>(PER_PEER_BUFFER_SIZE);
    client_senders.lock().await.insert(client_id, write_tx);

    if let Err(err) = event_tx.send(ServerEvent::ClientConnected {
        id: client_id,
        addr,
    }) {
        log::error!("Failed to send ClientConnected event: {}", err);
    }

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::debug!("Session cancelled for client {} (server shutdown)", client_id);
                if tokio::time::timeout(CLOSE_TIMEOUT, write.send(Message::Close(None)))
                    .await
                    .is_err()
                {
                    log::debug!("Timed out closing session for client {}", client_id);
                }
                break;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode_client_message(&text) {
                    Ok(message) => {
                        if let Err(err) = event_tx.send(ServerEvent::ClientMessageReceived {
                            from: client_id,
                            message,
                        }) {
                            log::error!("Failed to send ClientMessageReceived event: {}", err);
                        }
                    }
                    Err(DecodeError::UnknownType(kind)) => {
                        log::warn!("Unknown message type {:?} from client {}", kind, client_id);
                    }
                    Err(e) => {
                        log::error!("Failed to decode message from client {}: {}", client_id, e);
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Client {} disconnected", client_id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("Stream error from client {}: {}", client_id, e);
                    break;
                }
            },
            text = write_rx.recv() => match text {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        log::error!("Failed to send to client {}: {}", client_id, e);
                        break;
                    }
                }
                None => {
                    log::debug!("Write channel closed for client {}", client_id);
                    break;
                }
            },
        }
    }

    client_senders.lock().await.remove(&client_id);

    if let Err(err) = event_tx.send(ServerEvent::ClientDisconnected { id: client_id }) {
        log::error!("Failed to send ClientDisconnected event: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::sink::SinkExt;
    use futures_util::stream::StreamExt;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
    use tokio_util::sync::CancellationToken;

    use super::run_server;
    use crate::ServerEvent;
    use crate::protocol::{ClientMessage, ServerMessage, Terrain, TilePatch, TileState, decode};
    use crate::runtime::ServerCommand;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for server event")
            .expect("event channel closed")
    }

    async fn next_server_message(socket: &mut ClientSocket) -> ServerMessage {
        let frame = tokio::time::timeout(TEST_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("frame error");
        match frame {
            Message::Text(text) => decode(&text).expect("server sent an undecodable frame"),
            other => panic!("Expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_routes_client_sessions() {
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_server(0, event_tx, cmd_rx, cancel.clone()));

        let port = match next_event(&mut events).await {
            ServerEvent::HostingStarted { port } => port,
            other => panic!("Expected HostingStarted, got {other:?}"),
        };
        let (mut socket, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .expect("connect");

        let id = match next_event(&mut events).await {
            ServerEvent::ClientConnected { id, .. } => id,
            other => panic!("Expected ClientConnected, got {other:?}"),
        };

        // Broken and unknown frames are skipped; the session keeps going.
        for text in [
            "{not json",
            r#"{"type":"grid_state","width":1,"height":1,"tiles":[]}"#,
            r#"{"type":"request_grid_state"}"#,
        ] {
            socket
                .send(Message::Text(text.into()))
                .await
                .expect("send frame");
        }
        match next_event(&mut events).await {
            ServerEvent::ClientMessageReceived { from, message } => {
                assert_eq!(from, id);
                assert_eq!(message, ClientMessage::RequestGridState);
            }
            other => panic!("Expected ClientMessageReceived, got {other:?}"),
        }

        let snapshot = ServerMessage::GridState {
            width: 1,
            height: 1,
            tiles: vec![TileState {
                col: 0,
                row: 0,
                data: TilePatch::terrain(Terrain::Wild),
            }],
        };
        cmd_tx
            .send(ServerCommand::SendTo {
                client: id,
                message: snapshot.clone(),
            })
            .expect("send_to");
        assert_eq!(next_server_message(&mut socket).await, snapshot);

        let update = ServerMessage::TileUpdate {
            col: 0,
            row: 0,
            data: TilePatch::terrain(Terrain::Mine),
        };
        cmd_tx
            .send(ServerCommand::Broadcast {
                message: update.clone(),
            })
            .expect("broadcast");
        assert_eq!(next_server_message(&mut socket).await, update);

        socket.close(None).await.expect("close");
        match next_event(&mut events).await {
            ServerEvent::ClientDisconnected { id: gone } => assert_eq!(gone, id),
            other => panic!("Expected ClientDisconnected, got {other:?}"),
        }

        cancel.cancel();
        assert!(matches!(
            next_event(&mut events).await,
            ServerEvent::HostingStopped
        ));
        tokio::time::timeout(TEST_TIMEOUT, task)
            .await
            .expect("server task did not stop")
            .expect("server task panicked");
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_sessions() {
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_server(0, event_tx, cmd_rx, cancel.clone()));

        let port = match next_event(&mut events).await {
            ServerEvent::HostingStarted { port } => port,
            other => panic!("Expected HostingStarted, got {other:?}"),
        };
        let (mut socket, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
            .await
            .expect("connect");
        assert!(matches!(
            next_event(&mut events).await,
            ServerEvent::ClientConnected { .. }
        ));

        cancel.cancel();
        let frame = tokio::time::timeout(TEST_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for close")
            .expect("socket ended without a close frame")
            .expect("frame error");
        assert!(matches!(frame, Message::Close(_)), "got {frame:?}");

        let _ = tokio::time::timeout(TEST_TIMEOUT, task).await;
    }
}
