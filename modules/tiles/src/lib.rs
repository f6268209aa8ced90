use bevy::prelude::*;
use network::{
    ClientEvent, ClientMessage, NetClientSender, NetworkSet, ServerMessage, Terrain, TilePatch,
    TileState,
};
use serde::Deserialize;

mod authority;

pub use authority::{AuthoritySettings, GridAuthority, GridServerPlugin, Reply};

/// Snapshots describing more cells than this are refused.
pub const MAX_GRID_TILES: usize = 1 << 20;

/// Grid coordinate of a tile that exists in the current grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Reflect)]
#[reflect(Debug, PartialEq)]
pub struct TileCoord {
    pub col: u32,
    pub row: u32,
}

impl TileCoord {
    pub fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

/// Client-side record of one hex tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Reflect)]
#[reflect(Debug, PartialEq)]
pub struct HexTile {
    pub terrain: Terrain,
}

impl HexTile {
    pub fn new(terrain: Terrain) -> Self {
        Self { terrain }
    }

    /// Merges the fields present in `patch` into this tile. Returns true if the
    /// patch wrote the terrain, even when the value is unchanged.
    pub fn merge(&mut self, patch: &TilePatch) -> bool {
        match patch.terrain {
            Some(terrain) => {
                self.terrain = terrain;
                true
            }
            None => false,
        }
    }
}

/// Rectangular hex grid stored row-major: `row * width + col`.
#[derive(Debug, Clone, Reflect)]
#[reflect(Debug)]
pub struct HexGrid {
    width: u32,
    height: u32,
    tiles: Vec<HexTile>,
}

impl HexGrid {
    pub fn new(width: u32, height: u32, fill: Terrain) -> Self {
        let size = width as usize * height as usize;
        Self {
            width,
            height,
            tiles: vec![HexTile::new(fill); size],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    fn coord_to_index(&self, col: i32, row: i32) -> Option<usize> {
        let col = u32::try_from(col).ok()?;
        let row = u32::try_from(row).ok()?;
        if col < self.width && row < self.height {
            Some(row as usize * self.width as usize + col as usize)
        } else {
            None
        }
    }

    pub fn get(&self, col: i32, row: i32) -> Option<&HexTile> {
        self.coord_to_index(col, row).map(|idx| &self.tiles[idx])
    }

    /// Applies a patch to the tile at `(col, row)`. Unknown coordinates are
    /// ignored. Returns the redraw for this patch, carrying the terrain it set.
    pub fn apply_patch(&mut self, col: i32, row: i32, patch: &TilePatch) -> Option<TileRedraw> {
        let idx = self.coord_to_index(col, row)?;
        let tile = &mut self.tiles[idx];
        if tile.merge(patch) {
            Some(TileRedraw {
                coord: TileCoord::new(col as u32, row as u32),
                terrain: tile.terrain,
            })
        } else {
            None
        }
    }

    /// Applies each entry in order. Not atomic.
    pub fn apply_batch(&mut self, tiles: &[TileState]) -> Vec<TileRedraw> {
        tiles
            .iter()
            .filter_map(|tile| self.apply_patch(tile.col, tile.row, &tile.data))
            .collect()
    }

    /// Returns an iterator over all tiles in row-major order
    pub fn iter(&self) -> impl Iterator<Item = (TileCoord, &HexTile)> + '_ {
        let width = self.width.max(1);
        self.tiles.iter().enumerate().map(move |(idx, tile)| {
            let idx = idx as u32;
            (TileCoord::new(idx % width, idx / width), tile)
        })
    }

    /// Every tile as an addressed entry, in row-major order.
    pub fn tile_states(&self) -> Vec<TileState> {
        self.iter()
            .map(|(coord, tile)| TileState {
                col: coord.col as i32,
                row: coord.row as i32,
                data: TilePatch::terrain(tile.terrain),
            })
            .collect()
    }

    /// One redraw per tile, in row-major order.
    fn full_redraw(&self) -> Vec<TileRedraw> {
        self.iter()
            .map(|(coord, tile)| TileRedraw {
                coord,
                terrain: tile.terrain,
            })
            .collect()
    }
}

/// Result of applying a `grid_state` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// The grid was allocated by this snapshot.
    pub created: bool,
    /// Tiles to redraw, in the order their patches were applied.
    pub redraw: Vec<TileRedraw>,
}

/// Authoritative client-side view of the tile grid. The grid is allocated by
/// the first snapshot and patched in place afterwards.
#[derive(Debug, Clone, Resource, Reflect)]
#[reflect(Debug, Resource)]
pub struct TileStore {
    grid: Option<HexGrid>,
    default_terrain: Terrain,
}

impl Default for TileStore {
    fn default() -> Self {
        Self::new(TileSettings::default().default_terrain)
    }
}

impl TileStore {
    pub fn new(default_terrain: Terrain) -> Self {
        Self {
            grid: None,
            default_terrain,
        }
    }

    pub fn grid(&self) -> Option<&HexGrid> {
        self.grid.as_ref()
    }

    pub fn get(&self, col: i32, row: i32) -> Option<&HexTile> {
        self.grid.as_ref()?.get(col, row)
    }

    /// Allocates the grid on first use, then applies `tiles` as patches.
    /// Later snapshots keep the existing grid and dimensions are not re-checked.
    pub fn apply_snapshot(&mut self, width: u32, height: u32, tiles: &[TileState]) -> SnapshotOutcome {
        match self.grid.as_mut() {
            Some(grid) => SnapshotOutcome {
                created: false,
                redraw: grid.apply_batch(tiles),
            },
            None => {
                let cells = (width as usize).saturating_mul(height as usize);
                if cells > MAX_GRID_TILES {
                    warn!("Refusing {width}x{height} grid ({cells} tiles, max {MAX_GRID_TILES})");
                    return SnapshotOutcome::default();
                }

                let mut grid = HexGrid::new(width, height, self.default_terrain);
                grid.apply_batch(tiles);
                let redraw = grid.full_redraw();
                self.grid = Some(grid);

                info!("Created {width}x{height} hex grid");
                SnapshotOutcome {
                    created: true,
                    redraw,
                }
            }
        }
    }

    pub fn apply_patch(&mut self, col: i32, row: i32, patch: &TilePatch) -> Option<TileRedraw> {
        self.grid.as_mut()?.apply_patch(col, row, patch)
    }

    pub fn apply_batch(&mut self, tiles: &[TileState]) -> Vec<TileRedraw> {
        match self.grid.as_mut() {
            Some(grid) => grid.apply_batch(tiles),
            None => Vec::new(),
        }
    }

    /// Routes one decoded server message into the store.
    pub fn apply_server_message(&mut self, message: &ServerMessage) -> SnapshotOutcome {
        match message {
            ServerMessage::GridState {
                width,
                height,
                tiles,
            } => self.apply_snapshot(*width, *height, tiles),
            ServerMessage::TileUpdate { col, row, data } => SnapshotOutcome {
                created: false,
                redraw: self.apply_patch(*col, *row, data).into_iter().collect(),
            },
            ServerMessage::TilesUpdate { tiles } => SnapshotOutcome {
                created: false,
                redraw: self.apply_batch(tiles),
            },
        }
    }
}

/// Tile-level policy that is configuration rather than game rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Resource, Reflect)]
#[reflect(Debug, Resource)]
pub struct TileSettings {
    /// Terrain of every cell when the grid is first allocated.
    pub default_terrain: Terrain,
    /// Terrain requested when a tile is clicked.
    pub click_terrain: Terrain,
}

impl Default for TileSettings {
    fn default() -> Self {
        Self {
            default_terrain: Terrain::Wild,
            click_terrain: Terrain::Slime,
        }
    }
}

/// Written once, when the first snapshot allocates the grid.
#[derive(Message, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridCreated {
    pub width: u32,
    pub height: u32,
}

/// A patch wrote a tile's terrain and its visual must be re-derived.
#[derive(Message, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRedraw {
    pub coord: TileCoord,
    pub terrain: Terrain,
}

/// Pointer click on a tile, written by the rendering layer.
#[derive(Message, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileClicked {
    pub col: i32,
    pub row: i32,
}

/// Builds the outbound update for a clicked tile. The tile's current state is
/// not consulted.
pub fn click_message(click: &TileClicked, settings: &TileSettings) -> ClientMessage {
    ClientMessage::TileUpdate {
        col: click.col,
        row: click.row,
        data: TilePatch::terrain(settings.click_terrain),
    }
}

#[derive(Default)]
pub struct TilesPlugin {
    pub settings: TileSettings,
}

impl TilesPlugin {
    pub fn new(settings: TileSettings) -> Self {
        Self { settings }
    }
}

impl Plugin for TilesPlugin {
    fn build(&self, app: &mut App) {
        app.register_type::<HexTile>();
        app.register_type::<TileStore>();
        app.register_type::<TileSettings>();
        app.insert_resource(self.settings);
        app.insert_resource(TileStore::new(self.settings.default_terrain));
        app.add_message::<GridCreated>();
        app.add_message::<TileRedraw>();
        app.add_message::<TileClicked>();
        app.add_systems(
            PreUpdate,
            (
                apply_server_messages.after(NetworkSet::Receive),
                send_tile_clicks.before(NetworkSet::Send),
            ),
        );
    }
}

fn apply_server_messages(
    mut events: MessageReader<ClientEvent>,
    mut store: ResMut<TileStore>,
    mut created: MessageWriter<GridCreated>,
    mut redraws: MessageWriter<TileRedraw>,
) {
    for event in events.read() {
        let ClientEvent::ServerMessageReceived(message) = event else {
            continue;
        };

        let outcome = store.apply_server_message(message);

        if outcome.created
            && let Some(grid) = store.grid()
        {
            created.write(GridCreated {
                width: grid.width(),
                height: grid.height(),
            });
        }

        redraws.write_batch(outcome.redraw);
    }
}

fn send_tile_clicks(
    mut clicks: MessageReader<TileClicked>,
    settings: Res<TileSettings>,
    sender: Option<Res<NetClientSender>>,
) {
    for click in clicks.read() {
        debug!("Clicked hex at [{},{}]", click.col, click.row);
        if let Some(sender) = sender.as_ref() {
            sender.send(&click_message(click, &settings));
        }
    }
}
