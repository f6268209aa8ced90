use std::time::Duration;

use bevy::app::ScheduleRunnerPlugin;
use bevy::log::LogPlugin;
use bevy::prelude::*;
use network::{NetCommand, NetworkPlugin};
use tiles::GridServerPlugin;

mod config;

use config::ServerConfig;

/// Frame rate of the headless schedule runner.
const TICK_RATE_HZ: f64 = 30.0;

fn main() {
    let mut app = App::new();
    app.add_plugins(
        MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(Duration::from_secs_f64(
            1.0 / TICK_RATE_HZ,
        ))),
    )
    .add_plugins(LogPlugin::default());

    let config = config::load_config();

    app.add_plugins(NetworkPlugin)
        .add_plugins(GridServerPlugin::new(config.grid))
        .insert_resource(config)
        .add_systems(Startup, host_on_startup)
        .run();
}

/// Startup system: sends `NetCommand::Host` so the server begins listening immediately.
fn host_on_startup(mut net_commands: MessageWriter<NetCommand>, config: Res<ServerConfig>) {
    net_commands.write(NetCommand::Host {
        port: config.network.port,
    });
    info!("Auto-hosting on port {}", config.network.port);
}
