use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use bevy::{log, prelude::*};
use tokio::sync::{mpsc, watch};

mod client;
mod config;
mod protocol;
mod runtime;
mod server;

pub use config::{ConnectionSettings, DEFAULT_ENDPOINT, DEFAULT_RECONNECT_DELAY};
pub use protocol::{
    ClientId, ClientMessage, DecodeError, EncodeError, ServerMessage, Terrain, TilePatch,
    TileState, decode, decode_client_message, encode,
};
use runtime::{
    ClientEventReceiver, ClientEventSender, NetworkRuntime, NetworkTasks, ServerCommand,
    ServerEventReceiver, ServerEventSender,
};

/// Bounded channel buffer size for client outbound messages.
/// Prevents memory exhaustion if game code produces messages faster than network can send.
const CLIENT_BUFFER_SIZE: usize = 100;

/// System set for network systems. Game code should read network events
/// after `NetworkSet::Receive` and write `NetCommand` messages before
/// `NetworkSet::Send`.
#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkSet {
    /// Drains async events into Bevy messages.
    Receive,
    /// Processes commands and dispatches them to async tasks.
    Send,
}

/// Commands sent by game code to control the network layer.
#[derive(Message, Clone, Debug)]
pub enum NetCommand {
    /// Starts the authoritative WebSocket server. Port 0 picks a free port,
    /// reported by `ServerEvent::HostingStarted`.
    Host { port: u16 },
    StopHosting,
    /// Opens the persistent session; it reconnects on its own until `Disconnect`.
    Connect { settings: ConnectionSettings },
    Disconnect,
}

/// Lifecycle of the single client session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Reflect)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the server side of the network layer.
#[derive(Message, Clone, Debug)]
pub enum ServerEvent {
    HostingStarted {
        port: u16,
    },
    HostingStopped,
    ClientConnected {
        id: ClientId,
        addr: SocketAddr,
    },
    ClientMessageReceived {
        from: ClientId,
        message: ClientMessage,
    },
    ClientDisconnected {
        id: ClientId,
    },
    Error(String),
}

/// Events emitted by the client side of the network layer.
#[derive(Message, Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Connecting { attempt: u64 },
    Connected,
    Disconnected { reason: String },
    ServerMessageReceived(ServerMessage),
    Error(String),
}

/// Latest known connection state, for status indicators.
#[derive(Resource, Debug, Clone, Copy, Default, PartialEq, Eq, Reflect)]
#[reflect(Resource, Debug)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Connection attempts made by the current client task, starting at 1.
    pub attempt: u64,
    /// Whether a session has been established at least once.
    pub ever_connected: bool,
}

impl ConnectionStatus {
    /// True while the client is trying to get back a session it already had.
    pub fn is_reconnecting(&self) -> bool {
        self.ever_connected && self.state != ConnectionState::Connected
    }

    fn observe(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::Connecting { attempt } => {
                self.state = ConnectionState::Connecting;
                self.attempt = *attempt;
            }
            ClientEvent::Connected => {
                self.state = ConnectionState::Connected;
                self.ever_connected = true;
            }
            ClientEvent::Disconnected { .. } => {
                self.state = ConnectionState::Disconnected;
            }
            ClientEvent::ServerMessageReceived(_) | ClientEvent::Error(_) => {}
        }
    }
}

/// Resource for sending messages from the server to clients.
/// Inserted when the server task starts, removed once hosting has stopped.
#[derive(Resource, Clone)]
pub struct NetServerSender {
    tx: mpsc::UnboundedSender<ServerCommand>,
}

impl NetServerSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ServerCommand>) -> Self {
        Self { tx }
    }

    /// Send a message to a specific client.
    pub fn send_to(&self, client: ClientId, message: &ServerMessage) {
        if let Err(e) = self.tx.send(ServerCommand::SendTo {
            client,
            message: message.clone(),
        }) {
            log::warn!("Failed to send message to client {}: {}", client, e);
        }
    }

    /// Broadcast a message to all connected clients.
    pub fn broadcast(&self, message: &ServerMessage) {
        if let Err(e) = self.tx.send(ServerCommand::Broadcast {
            message: message.clone(),
        }) {
            log::warn!("Failed to broadcast message: {}", e);
        }
    }
}

/// Resource for sending messages from the client to the server.
/// Inserted when the client task starts, removed on disconnect.
#[derive(Resource, Clone)]
pub struct NetClientSender {
    tx: mpsc::Sender<ClientMessage>,
    state: watch::Receiver<ConnectionState>,
}

impl NetClientSender {
    /// Create a new client sender from a channel and the session state it gates on.
    pub(crate) fn new(tx: mpsc::Sender<ClientMessage>, state: watch::Receiver<ConnectionState>) -> Self {
        Self { tx, state }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Send a message to the server.
    /// Returns true if the message was queued for the open session. While the
    /// session is not open the call is a no-op: nothing is buffered for later.
    pub fn send(&self, message: &ClientMessage) -> bool {
        if self.state() != ConnectionState::Connected {
            log::debug!("Not connected, message dropped");
            return false;
        }

        match self.tx.try_send(message.clone()) {
            Ok(_) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Client send buffer full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Client sender channel closed, message dropped");
                false
            }
        }
    }
}

/// Maximum number of network events to process per frame to prevent stalling.
const MAX_NET_EVENTS_PER_FRAME: usize = 100;

/// Flag to track if we've already warned about hitting the event cap.
static CAP_WARNING_LOGGED: AtomicBool = AtomicBool::new(false);

pub struct NetworkPlugin;

impl Plugin for NetworkPlugin {
    fn build(&self, app: &mut App) {
        let (server_event_tx, server_event_rx) = mpsc::unbounded_channel();
        let (client_event_tx, client_event_rx) = mpsc::unbounded_channel();

        app.insert_resource(NetworkRuntime::new());
        app.insert_resource(NetworkTasks::default());
        app.insert_resource(ServerEventSender(server_event_tx));
        app.insert_resource(ServerEventReceiver(server_event_rx));
        app.insert_resource(ClientEventSender(client_event_tx));
        app.insert_resource(ClientEventReceiver(client_event_rx));
        app.init_resource::<ConnectionStatus>();
        app.register_type::<ConnectionStatus>();
        app.add_message::<NetCommand>();
        app.add_message::<ServerEvent>();
        app.add_message::<ClientEvent>();
        app.configure_sets(PreUpdate, NetworkSet::Receive.before(NetworkSet::Send));
        app.add_systems(
            PreUpdate,
            (drain_server_events, drain_client_events).in_set(NetworkSet::Receive),
        );
        app.add_systems(PreUpdate, process_net_commands.in_set(NetworkSet::Send));
    }
}

/// Drains server events from the async mpsc channel and writes them as Bevy messages.
fn drain_server_events(
    mut commands: Commands,
    mut receiver: ResMut<ServerEventReceiver>,
    mut writer: MessageWriter<ServerEvent>,
) {
    let mut count = 0;
    while count < MAX_NET_EVENTS_PER_FRAME {
        match receiver.0.try_recv() {
            Ok(event) => {
                if matches!(&event, ServerEvent::HostingStopped) {
                    commands.remove_resource::<NetServerSender>();
                }

                writer.write(event);
                count += 1;
            }
            Err(_) => return,
        }
    }

    if !receiver.0.is_empty() {
        warn_event_cap_once();
    }
}

/// Drains client events from the async mpsc channel and writes them as Bevy messages.
/// Frames are written in arrival order, which is the order the transport delivered them.
fn drain_client_events(
    mut receiver: ResMut<ClientEventReceiver>,
    mut status: ResMut<ConnectionStatus>,
    mut writer: MessageWriter<ClientEvent>,
) {
    let mut count = 0;
    while count < MAX_NET_EVENTS_PER_FRAME {
        match receiver.0.try_recv() {
            Ok(event) => {
                status.observe(&event);
                writer.write(event);
                count += 1;
            }
            Err(_) => return, // Channel empty, no more events to process
        }
    }

    // If we processed MAX_NET_EVENTS_PER_FRAME events, warn if there are more waiting
    if !receiver.0.is_empty() {
        warn_event_cap_once();
    }
}

fn warn_event_cap_once() {
    if !CAP_WARNING_LOGGED.swap(true, Ordering::SeqCst) {
        log::warn!(
            "Hit MAX_NET_EVENTS_PER_FRAME limit of {MAX_NET_EVENTS_PER_FRAME}. \
            Additional events will be processed next frame. \
            This warning will only be shown once."
        );
    }
}

/// Reads NetCommand Bevy messages and spawns or stops async tasks accordingly.
fn process_net_commands(
    mut commands: Commands,
    mut commands_reader: MessageReader<NetCommand>,
    runtime: Res<NetworkRuntime>,
    server_event_tx: Res<ServerEventSender>,
    client_event_tx: Res<ClientEventSender>,
    mut tasks: ResMut<NetworkTasks>,
) {
    tasks.cleanup_finished();

    for command in commands_reader.read() {
        match command {
            NetCommand::Host { port } => {
                if tasks.is_hosting() {
                    let _ = server_event_tx
                        .0
                        .send(ServerEvent::Error("Already hosting a server".into()));
                    continue;
                }

                let (server_cmd_tx, server_cmd_rx) = mpsc::unbounded_channel();
                commands.insert_resource(NetServerSender::new(server_cmd_tx));

                let tx = server_event_tx.0.clone();
                let cancel_token = tokio_util::sync::CancellationToken::new();
                let token_clone = cancel_token.clone();
                let handle =
                    runtime.spawn(server::run_server(*port, tx, server_cmd_rx, token_clone));
                tasks.server_task = Some((handle, cancel_token));
            }
            NetCommand::StopHosting => {
                tasks.stop_hosting();
            }
            NetCommand::Connect { settings } => {
                // Prevent duplicate connections
                if tasks.is_connected() {
                    let _ = client_event_tx
                        .0
                        .send(ClientEvent::Error("Already connected to a server".into()));
                    continue;
                }

                // Bounded channel provides backpressure if game code sends faster than network can handle.
                let (client_msg_tx, client_msg_rx) = mpsc::channel(CLIENT_BUFFER_SIZE);
                let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
                commands.insert_resource(NetClientSender::new(client_msg_tx, state_rx));

                let tx = client_event_tx.0.clone();
                let cancel_token = tokio_util::sync::CancellationToken::new();
                let token_clone = cancel_token.clone();
                let handle = runtime.spawn(client::run_client(
                    settings.clone(),
                    tx,
                    client_msg_rx,
                    state_tx,
                    token_clone,
                ));
                tasks.client_task = Some((handle, cancel_token));
            }
            NetCommand::Disconnect => {
                // The task still closes the session and reports Disconnected;
                // nothing new is queued for it meanwhile.
                commands.remove_resource::<NetClientSender>();
                tasks.disconnect();
            }
        }
    }
}
