//! Ocean grid and random fleet placement

use rand::Rng;

use crate::ws::protocol::{Coord, Direction, Ship, ShipType};

/// Untouched water
pub const EMPTY: i8 = 0;
/// Fired upon, nothing there
pub const MISS: i8 = -1;
/// Fired upon, ship segment destroyed
pub const HIT: i8 = -2;

/// The fleet every participant receives, in placement order
pub const FLEET: [ShipType; 4] = [
    ShipType::Carrier,
    ShipType::Battleship,
    ShipType::Cruiser,
    ShipType::Submarine,
];

/// Random draws per ship before falling back to exhaustive search
pub const MAX_PLACEMENT_ATTEMPTS: usize = 256;

/// Square grid of cell values.
///
/// `0` is untouched water, a positive value is an unfired ship segment (the
/// ship's size), `-1` and `-2` are resolved misses and hits. Resolved cells
/// never change again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    size: usize,
    cells: Vec<i8>,
}

/// Outcome of striking a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strike {
    Miss,
    Hit,
    /// Out of bounds or already resolved; nothing changed
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("no room left for {0:?} on a {1}x{1} grid")]
    NoRoom(ShipType, usize),
}

impl Grid {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            cells: vec![EMPTY; size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn index(&self, x: usize, y: usize) -> Option<usize> {
        (x < self.size && y < self.size).then(|| x * self.size + y)
    }

    /// Cell value, `None` when out of bounds
    pub fn get(&self, x: usize, y: usize) -> Option<i8> {
        self.index(x, y).map(|i| self.cells[i])
    }

    /// Whether the cell has already been fired upon
    pub fn is_resolved(&self, x: usize, y: usize) -> bool {
        matches!(self.get(x, y), Some(MISS) | Some(HIT))
    }

    /// Fire at a cell. Water becomes a miss, a ship segment becomes a hit.
    pub fn strike(&mut self, x: usize, y: usize) -> Strike {
        let Some(i) = self.index(x, y) else {
            return Strike::Ignored;
        };
        match self.cells[i] {
            MISS | HIT => Strike::Ignored,
            EMPTY => {
                self.cells[i] = MISS;
                Strike::Miss
            }
            _ => {
                self.cells[i] = HIT;
                Strike::Hit
            }
        }
    }

    /// Cells that can still be fired upon
    pub fn unresolved_cells(&self) -> impl Iterator<Item = Coord> + '_ {
        (0..self.size)
            .flat_map(move |x| (0..self.size).map(move |y| Coord { x, y }))
            .filter(|c| !self.is_resolved(c.x, c.y))
    }

    /// Whether every cell of `ship` has been hit
    pub fn is_sunk(&self, ship: &Ship) -> bool {
        ship.cells().all(|c| self.get(c.x, c.y) == Some(HIT))
    }

    /// Whether `ship` fits entirely inside the grid on untouched water
    pub fn fits(&self, ship: &Ship) -> bool {
        ship.cells().all(|c| self.get(c.x, c.y) == Some(EMPTY))
    }

    fn mark(&mut self, ship: &Ship) {
        let marker = ship.ship_type.size() as i8;
        for c in ship.cells() {
            if let Some(i) = self.index(c.x, c.y) {
                self.cells[i] = marker;
            }
        }
    }

    /// Place one ship at a uniformly random legal position.
    ///
    /// Draws a random start and direction until one fits, up to
    /// [`MAX_PLACEMENT_ATTEMPTS`]; after that every legal placement is
    /// enumerated and one is picked uniformly.
    pub fn place_ship<R: Rng + ?Sized>(
        &mut self,
        ship_type: ShipType,
        rng: &mut R,
    ) -> Result<Ship, PlacementError> {
        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            let ship = Ship {
                ship_type,
                start: Coord {
                    x: rng.gen_range(0..self.size),
                    y: rng.gen_range(0..self.size),
                },
                direction: if rng.gen_bool(0.5) {
                    Direction::Horizontal
                } else {
                    Direction::Vertical
                },
            };
            if self.fits(&ship) {
                self.mark(&ship);
                return Ok(ship);
            }
        }

        let candidates = self.legal_placements(ship_type);
        if candidates.is_empty() {
            return Err(PlacementError::NoRoom(ship_type, self.size));
        }
        let ship = candidates[rng.gen_range(0..candidates.len())];
        self.mark(&ship);
        Ok(ship)
    }

    /// Every placement of `ship_type` that currently fits
    pub fn legal_placements(&self, ship_type: ShipType) -> Vec<Ship> {
        let mut out = Vec::new();
        for x in 0..self.size {
            for y in 0..self.size {
                for direction in [Direction::Horizontal, Direction::Vertical] {
                    let ship = Ship {
                        ship_type,
                        start: Coord { x, y },
                        direction,
                    };
                    if self.fits(&ship) {
                        out.push(ship);
                    }
                }
            }
        }
        out
    }

    /// Place the whole fleet on this grid
    pub fn deploy_fleet<R: Rng + ?Sized>(
        &mut self,
        fleet: &[ShipType],
        rng: &mut R,
    ) -> Result<Vec<Ship>, PlacementError> {
        fleet.iter().map(|t| self.place_ship(*t, rng)).collect()
    }
}
