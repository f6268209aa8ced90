use std::sync::Arc;

use bevy::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ClientId, ServerMessage};
use crate::{ClientEvent, ServerEvent};

#[derive(Resource)]
pub(crate) struct NetworkRuntime {
    rt: Arc<tokio::runtime::Runtime>,
}

impl NetworkRuntime {
    pub(crate) fn new() -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("hexmap-net")
            .enable_all()
            .build()
            .expect("failed to create tokio runtime");
        Self { rt: Arc::new(rt) }
    }

    pub(crate) fn spawn(
        &self,
        future: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> JoinHandle<()> {
        self.rt.spawn(future)
    }
}

/// async → Bevy bridge: the server task clones this sender to emit events.
#[derive(Resource, Clone)]
pub(crate) struct ServerEventSender(pub(crate) mpsc::UnboundedSender<ServerEvent>);

/// async → Bevy bridge: drained each frame in PreUpdate.
#[derive(Resource)]
pub(crate) struct ServerEventReceiver(pub(crate) mpsc::UnboundedReceiver<ServerEvent>);

/// Bevy → async: outbound traffic for the server task to route.
#[derive(Debug)]
pub(crate) enum ServerCommand {
    SendTo {
        client: ClientId,
        message: ServerMessage,
    },
    Broadcast {
        message: ServerMessage,
    },
}

/// async → Bevy bridge: the client task clones this sender to emit events.
#[derive(Resource, Clone)]
pub(crate) struct ClientEventSender(pub(crate) mpsc::UnboundedSender<ClientEvent>);

/// async → Bevy bridge: drained each frame in PreUpdate.
#[derive(Resource)]
pub(crate) struct ClientEventReceiver(pub(crate) mpsc::UnboundedReceiver<ClientEvent>);

/// Tracks the network tasks and the tokens that stop them. Cancelling the
/// client token also stops any reconnect delay it is currently waiting on.
#[derive(Resource, Default)]
pub(crate) struct NetworkTasks {
    pub(crate) server_task: Option<(JoinHandle<()>, CancellationToken)>,
    pub(crate) client_task: Option<(JoinHandle<()>, CancellationToken)>,
}

impl NetworkTasks {
    pub(crate) fn is_hosting(&self) -> bool {
        self.server_task.is_some()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.client_task.is_some()
    }

    /// Asks the server task to close its sessions and stop. The handle stays
    /// tracked until the task has finished, so `Host` is refused meanwhile.
    pub(crate) fn stop_hosting(&mut self) {
        if let Some((_, token)) = &self.server_task {
            token.cancel();
        }
    }

    /// Asks the client task to send a close frame and stop. The handle stays
    /// tracked until the task has finished, so `Connect` is refused meanwhile.
    pub(crate) fn disconnect(&mut self) {
        if let Some((_, token)) = &self.client_task {
            token.cancel();
        }
    }

    /// Forgets tasks that have ended so new `Host`/`Connect` commands are accepted.
    pub(crate) fn cleanup_finished(&mut self) {
        if self
            .server_task
            .as_ref()
            .is_some_and(|(handle, _)| handle.is_finished())
        {
            self.server_task = None;
        }
        if self
            .client_task
            .as_ref()
            .is_some_and(|(handle, _)| handle.is_finished())
        {
            self.client_task = None;
        }
    }
}
