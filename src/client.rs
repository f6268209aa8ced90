use bevy::prelude::*;
use network::{ConnectionState, ConnectionStatus, NetCommand, NetworkSet};
use tiles::{GridCreated, TileRedraw};

use crate::config::AppConfig;

/// Headless stand-in for the rendering layer: opens the session on startup,
/// reports connection status and logs what a renderer would redraw.
pub struct ClientPlugin;

impl Plugin for ClientPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<LastReportedState>();
        app.add_systems(Startup, connect);
        app.add_systems(
            PreUpdate,
            report_connection_status.after(NetworkSet::Receive),
        );
        app.add_systems(Update, log_redraws);
    }
}

/// What the status indicator last showed.
#[derive(Resource, Debug, Default)]
struct LastReportedState {
    state: ConnectionState,
    report: Option<StatusReport>,
}

/// A line the status indicator shows when the connection state moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusReport {
    Connected,
    Restored { attempts: u64 },
    Reconnecting { attempt: u64 },
    Lost,
}

fn connect(config: Res<AppConfig>, mut net_commands: MessageWriter<NetCommand>) {
    let settings = config.network.connection_settings();
    info!("Connecting to {}", settings.endpoint);
    net_commands.write(NetCommand::Connect { settings });
}

fn status_report(status: &ConnectionStatus) -> Option<StatusReport> {
    match status.state {
        ConnectionState::Connected if status.attempt > 1 => Some(StatusReport::Restored {
            attempts: status.attempt,
        }),
        ConnectionState::Connected => Some(StatusReport::Connected),
        ConnectionState::Connecting if status.is_reconnecting() => {
            Some(StatusReport::Reconnecting {
                attempt: status.attempt,
            })
        }
        ConnectionState::Disconnected if status.ever_connected => Some(StatusReport::Lost),
        ConnectionState::Connecting | ConnectionState::Disconnected => None,
    }
}

/// The visible "reconnecting" indicator.
fn report_connection_status(status: Res<ConnectionStatus>, mut last: ResMut<LastReportedState>) {
    if !status.is_changed() || last.state == status.state {
        return;
    }
    last.state = status.state;
    last.report = status_report(&status);

    match last.report {
        Some(StatusReport::Connected) => info!("Connected"),
        Some(StatusReport::Restored { attempts }) => {
            info!("Connection restored after {attempts} attempts");
        }
        Some(StatusReport::Reconnecting { attempt }) => {
            warn!("Reconnecting (attempt {attempt})...");
        }
        Some(StatusReport::Lost) => warn!("Connection lost, waiting to reconnect"),
        None => {}
    }
}

fn log_redraws(mut created: MessageReader<GridCreated>, mut redraws: MessageReader<TileRedraw>) {
    for grid in created.read() {
        info!("Drawing {}x{} hex grid", grid.width, grid.height);
    }
    for redraw in redraws.read() {
        debug!(
            "x: {}, y: {}, terrain: {}",
            redraw.coord.col, redraw.coord.row, redraw.terrain
        );
    }
}
