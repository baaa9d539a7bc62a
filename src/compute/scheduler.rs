use crate::foundation::{
    core::{Canvas, LaneId, TileSize},
    error::{FractError, FractResult},
};

/// Rectangular canvas region; the unit of scheduling and dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tile {
    /// Row-major position in the grid.
    pub index: usize,
    /// Grid row (`i`).
    pub row: u32,
    /// Grid column (`j`).
    pub col: u32,
    pub origin_x: u32,
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
}

impl Tile {
    pub fn lane(&self) -> LaneId {
        assign_lane(self.row, self.col)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.origin_x
            && y >= self.origin_y
            && x < self.origin_x + self.width
            && y < self.origin_y + self.height
    }
}

/// Checkerboard assignment `(i + j) mod 2`.
pub fn assign_lane(row: u32, col: u32) -> LaneId {
    LaneId::from_parity(u64::from(row) + u64::from(col))
}

/// The full row-major tile grid of a canvas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileGrid {
    pub canvas: Canvas,
    pub tile: TileSize,
    pub rows: u32,
    pub cols: u32,
    pub tiles: Vec<Tile>,
}

impl TileGrid {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tile_at(&self, row: u32, col: u32) -> Option<&Tile> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.tiles.get((row as usize) * (self.cols as usize) + col as usize)
    }

    /// Tile covering pixel `(x, y)`.
    pub fn tile_for_pixel(&self, x: u32, y: u32) -> Option<&Tile> {
        if x >= self.canvas.width || y >= self.canvas.height {
            return None;
        }
        self.tile_at(y / self.tile.height, x / self.tile.width)
    }
}

/// Grid plus the two ordered per-lane tile lists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub grid: TileGrid,
    lanes: [Vec<Tile>; 2],
}

impl Schedule {
    pub fn lane(&self, lane: LaneId) -> &[Tile] {
        &self.lanes[lane.index()]
    }

    pub fn lane_sizes(&self) -> [usize; 2] {
        [self.lanes[0].len(), self.lanes[1].len()]
    }
}

/// Partitions a canvas into equal tiles and assigns them to lanes.
#[derive(Clone, Copy, Debug)]
pub struct TileScheduler {
    canvas: Canvas,
    tile: TileSize,
}

impl TileScheduler {
    /// Fails with a configuration error unless `tile` evenly divides `canvas`.
    pub fn new(canvas: Canvas, tile: TileSize) -> FractResult<Self> {
        Canvas::new(canvas.width, canvas.height)?;
        if tile.width == 0 || tile.height == 0 {
            return Err(FractError::config(format!("tile must be non-empty, got {tile}")));
        }
        if canvas.width % tile.width != 0 || canvas.height % tile.height != 0 {
            return Err(FractError::config(format!(
                "canvas {canvas} is not an exact multiple of tile {tile}"
            )));
        }
        Ok(Self { canvas, tile })
    }

    pub fn grid(&self) -> TileGrid {
        let rows = self.canvas.height / self.tile.height;
        let cols = self.canvas.width / self.tile.width;
        let mut tiles = Vec::with_capacity((rows as usize) * (cols as usize));
        for i in 0..rows {
            for j in 0..cols {
                tiles.push(Tile {
                    index: tiles.len(),
                    row: i,
                    col: j,
                    origin_x: j * self.tile.width,
                    origin_y: i * self.tile.height,
                    width: self.tile.width,
                    height: self.tile.height,
                });
            }
        }
        TileGrid {
            canvas: self.canvas,
            tile: self.tile,
            rows,
            cols,
            tiles,
        }
    }

    #[tracing::instrument(skip(self), fields(canvas = %self.canvas, tile = %self.tile))]
    pub fn schedule(&self) -> Schedule {
        let grid = self.grid();
        let mut lanes: [Vec<Tile>; 2] = [Vec::new(), Vec::new()];
        for tile in &grid.tiles {
            lanes[tile.lane().index()].push(*tile);
        }
        tracing::debug!(
            tiles = grid.len(),
            lane0 = lanes[0].len(),
            lane1 = lanes[1].len(),
            "scheduled tiles"
        );
        Schedule { grid, lanes }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/compute/scheduler.rs"]
mod tests;
