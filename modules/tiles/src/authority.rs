use std::time::Duration;

use bevy::prelude::*;
use network::{
    ClientMessage, NetServerSender, NetworkSet, ServerEvent, ServerMessage, Terrain, TilePatch,
    TileState,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::{HexGrid, MAX_GRID_TILES};

/// Terrains a freshly generated grid is drawn from.
const INITIAL_TERRAINS: [Terrain; 2] = [Terrain::Wild, Terrain::Mine];

/// Shape of the served grid and of its background mutation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Resource, Reflect)]
#[reflect(Debug, Resource)]
pub struct AuthoritySettings {
    pub width: u32,
    pub height: u32,
    pub mutation_interval_ms: u64,
    /// Tiles sampled per mutation pass. Only `Wild` samples change.
    pub mutation_samples: usize,
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self {
            width: 20,
            height: 40,
            mutation_interval_ms: 5000,
            mutation_samples: 3,
        }
    }
}

/// Where the answer to a client message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    ToSender(ServerMessage),
    Broadcast(ServerMessage),
}

/// The server's copy of the grid. Every client view is derived from it.
#[derive(Debug, Clone, Resource)]
pub struct GridAuthority {
    grid: HexGrid,
}

impl GridAuthority {
    pub fn new(grid: HexGrid) -> Self {
        Self { grid }
    }

    /// A `width` x `height` grid with each tile drawn at random from `Wild` and `Mine`.
    pub fn random(width: u32, height: u32, rng: &mut impl Rng) -> Self {
        let mut grid = HexGrid::new(width, height, Terrain::Wild);
        let coords: Vec<_> = grid.iter().map(|(coord, _)| coord).collect();
        for coord in coords {
            if let Some(&terrain) = INITIAL_TERRAINS.choose(rng) {
                grid.apply_patch(
                    coord.col as i32,
                    coord.row as i32,
                    &TilePatch::terrain(terrain),
                );
            }
        }
        Self { grid }
    }

    pub fn grid(&self) -> &HexGrid {
        &self.grid
    }

    pub fn snapshot(&self) -> ServerMessage {
        ServerMessage::GridState {
            width: self.grid.width(),
            height: self.grid.height(),
            tiles: self.grid.tile_states(),
        }
    }

    /// Applies one client message. Updates for cells outside the grid are
    /// refused and nothing is sent.
    pub fn handle(&mut self, message: &ClientMessage) -> Option<Reply> {
        match message {
            ClientMessage::RequestGridState => Some(Reply::ToSender(self.snapshot())),
            ClientMessage::TileUpdate { col, row, data } => {
                if self.grid.get(*col, *row).is_none() {
                    warn!("Refusing update for [{col},{row}] outside the grid");
                    return None;
                }
                self.grid.apply_patch(*col, *row, data);
                Some(Reply::Broadcast(ServerMessage::TileUpdate {
                    col: *col,
                    row: *row,
                    data: *data,
                }))
            }
        }
    }

    /// Samples up to `samples` distinct tiles and turns the `Wild` ones into
    /// `Mine`. Returns the changed tiles.
    pub fn mutate(&mut self, samples: usize, rng: &mut impl Rng) -> Vec<TileState> {
        let len = self.grid.len();
        let width = self.grid.width() as usize;

        let mut changed = Vec::new();
        for idx in rand::seq::index::sample(rng, len, samples.min(len)) {
            let col = (idx % width) as i32;
            let row = (idx / width) as i32;
            if self.grid.get(col, row).map(|tile| tile.terrain) != Some(Terrain::Wild) {
                continue;
            }
            let data = TilePatch::terrain(Terrain::Mine);
            self.grid.apply_patch(col, row, &data);
            changed.push(TileState { col, row, data });
        }
        changed
    }
}

#[derive(Resource)]
struct AuthorityRng(StdRng);

#[derive(Resource)]
struct MutationTimer(Timer);

/// Serves the authoritative grid to clients of the network server.
#[derive(Default)]
pub struct GridServerPlugin {
    pub settings: AuthoritySettings,
}

impl GridServerPlugin {
    pub fn new(settings: AuthoritySettings) -> Self {
        Self { settings }
    }
}

impl Plugin for GridServerPlugin {
    fn build(&self, app: &mut App) {
        let mut settings = self.settings;
        let cells = (settings.width as usize).saturating_mul(settings.height as usize);
        if cells > MAX_GRID_TILES {
            error!(
                "Configured {}x{} grid exceeds {MAX_GRID_TILES} tiles, using defaults",
                settings.width, settings.height
            );
            settings = AuthoritySettings::default();
        }

        let mut rng = StdRng::from_entropy();
        let authority = GridAuthority::random(settings.width, settings.height, &mut rng);

        app.register_type::<AuthoritySettings>();
        app.insert_resource(settings);
        app.insert_resource(authority);
        app.insert_resource(AuthorityRng(rng));
        app.insert_resource(MutationTimer(Timer::new(
            Duration::from_millis(settings.mutation_interval_ms),
            TimerMode::Repeating,
        )));
        app.add_systems(
            PreUpdate,
            answer_clients
                .after(NetworkSet::Receive)
                .before(NetworkSet::Send),
        );
        app.add_systems(Update, mutate_grid);
    }
}

fn answer_clients(
    mut events: MessageReader<ServerEvent>,
    mut authority: ResMut<GridAuthority>,
    sender: Option<Res<NetServerSender>>,
) {
    for event in events.read() {
        match event {
            ServerEvent::HostingStarted { port } => {
                let grid = authority.grid();
                info!(
                    "Serving {}x{} grid on ws://0.0.0.0:{port}/ws",
                    grid.width(),
                    grid.height()
                );
            }
            ServerEvent::HostingStopped => info!("Hosting stopped"),
            ServerEvent::ClientConnected { id, addr } => info!("Client {id} joined from {addr}"),
            ServerEvent::ClientDisconnected { id } => info!("Client {id} left"),
            ServerEvent::Error(e) => error!("{e}"),
            ServerEvent::ClientMessageReceived { from, message } => {
                let Some(reply) = authority.handle(message) else {
                    continue;
                };
                let Some(sender) = sender.as_ref() else {
                    continue;
                };
                match reply {
                    Reply::ToSender(message) => sender.send_to(*from, &message),
                    Reply::Broadcast(message) => sender.broadcast(&message),
                }
            }
        }
    }
}

fn mutate_grid(
    time: Res<Time>,
    settings: Res<AuthoritySettings>,
    mut timer: ResMut<MutationTimer>,
    mut authority: ResMut<GridAuthority>,
    mut rng: ResMut<AuthorityRng>,
    sender: Option<Res<NetServerSender>>,
) {
    if !timer.0.tick(time.delta()).just_finished() {
        return;
    }

    let tiles = authority.mutate(settings.mutation_samples, &mut rng.0);
    if tiles.is_empty() {
        return;
    }
    debug!("Mutated {} tiles", tiles.len());

    if let Some(sender) = sender.as_ref() {
        sender.broadcast(&ServerMessage::TilesUpdate { tiles });
    }
}
