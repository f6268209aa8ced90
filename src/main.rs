use std::time::Duration;

use bevy::app::ScheduleRunnerPlugin;
use bevy::log::LogPlugin;
use bevy::prelude::*;
use network::NetworkPlugin;
use tiles::TilesPlugin;

mod client;
mod config;

/// Frame rate of the headless schedule runner.
const TICK_RATE_HZ: f64 = 60.0;

fn main() {
    let mut app = App::new();
    app.add_plugins(
        MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(Duration::from_secs_f64(
            1.0 / TICK_RATE_HZ,
        ))),
    )
    .add_plugins(LogPlugin::default());

    // Loaded after LogPlugin so a bad config file is reported.
    let config = config::load_config();

    app.add_plugins(NetworkPlugin)
        .add_plugins(TilesPlugin::new(config.tiles))
        .insert_resource(config)
        .add_plugins(client::ClientPlugin)
        .run();
}
