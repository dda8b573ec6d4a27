//! Match state machine and per-match actor loop

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::ws::hub::ConnectionHub;
use crate::ws::protocol::{ConnectionId, Coord, EndReason, Ship, ServerMsg, ShotResult};

use super::grid::{Grid, PlacementError, Strike, FLEET};

/// Deterministic identifier of a match: `"<attacker>-<defender>"`
pub type MatchId = String;

/// Final outcome per participant
pub type EndState = HashMap<ConnectionId, EndReason>;

pub fn match_id(attacker: ConnectionId, defender: ConnectionId) -> MatchId {
    format!("{}-{}", attacker, defender)
}

/// Tunables shared by every match
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Side length of each grid
    pub grid_size: usize,
    /// Auto-fire for a player who stalls this long; `None` waits forever
    pub turn_timeout: Option<Duration>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            grid_size: 6,
            turn_timeout: None,
        }
    }
}

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Fleets placed, nobody told to act yet
    AwaitingFirstTurn,
    /// Only this participant may fire
    TurnOf(ConnectionId),
    /// Terminal
    Over,
}

/// One side of a match
#[derive(Debug, Clone)]
pub struct Combatant {
    pub id: ConnectionId,
    pub grid: Grid,
    pub ships: Vec<Ship>,
    pub ships_sunk: usize,
}

impl Combatant {
    fn deploy(id: ConnectionId, grid_size: usize, rng: &mut ChaCha8Rng) -> Result<Self, PlacementError> {
        let mut grid = Grid::new(grid_size);
        let ships = grid.deploy_fleet(&FLEET, rng)?;
        Ok(Self {
            id,
            grid,
            ships,
            ships_sunk: 0,
        })
    }

    pub fn fleet_destroyed(&self) -> bool {
        self.ships_sunk >= self.ships.len()
    }
}

/// A message addressed to one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: ConnectionId,
    pub msg: ServerMsg,
}

impl Outgoing {
    fn new(to: ConnectionId, msg: ServerMsg) -> Self {
        Self { to, msg }
    }
}

/// Match-scoped request routed from a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCommand {
    Fire { x: i64, y: i64 },
    Forfeit,
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchInput {
    pub from: ConnectionId,
    pub command: MatchCommand,
}

/// Authoritative state of one match. Every handler returns the messages it
/// wants delivered; none of them block or fail.
pub struct MatchState {
    pub id: MatchId,
    pub seed: u64,
    pub phase: MatchPhase,
    pub attacker: Combatant,
    pub defender: Combatant,
    pub end_state: Option<EndState>,
    rng: ChaCha8Rng,
}

impl MatchState {
    pub fn new(
        attacker: ConnectionId,
        defender: ConnectionId,
        grid_size: usize,
        seed: u64,
    ) -> Result<Self, PlacementError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let attacker_side = Combatant::deploy(attacker, grid_size, &mut rng)?;
        let defender_side = Combatant::deploy(defender, grid_size, &mut rng)?;

        Ok(Self {
            id: match_id(attacker, defender),
            seed,
            phase: MatchPhase::AwaitingFirstTurn,
            attacker: attacker_side,
            defender: defender_side,
            end_state: None,
            rng,
        })
    }

    /// Announce the match, hand each side its own fleet and give the
    /// attacker the first turn
    pub fn start(&mut self) -> Vec<Outgoing> {
        if self.phase != MatchPhase::AwaitingFirstTurn {
            return Vec::new();
        }

        let start = ServerMsg::StartGame {
            attacker: self.attacker.id,
            defender: self.defender.id,
        };
        self.phase = MatchPhase::TurnOf(self.attacker.id);

        vec![
            Outgoing::new(self.attacker.id, start.clone()),
            Outgoing::new(self.defender.id, start),
            Outgoing::new(
                self.attacker.id,
                ServerMsg::InitShips {
                    ships: self.attacker.ships.clone(),
                },
            ),
            Outgoing::new(
                self.defender.id,
                ServerMsg::InitShips {
                    ships: self.defender.ships.clone(),
                },
            ),
            Outgoing::new(self.attacker.id, ServerMsg::YourTurn),
        ]
    }

    pub fn current_turn(&self) -> Option<ConnectionId> {
        match self.phase {
            MatchPhase::TurnOf(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_over(&self) -> bool {
        self.phase == MatchPhase::Over
    }

    pub fn participants(&self) -> [ConnectionId; 2] {
        [self.attacker.id, self.defender.id]
    }

    pub fn involves(&self, id: ConnectionId) -> bool {
        self.attacker.id == id || self.defender.id == id
    }

    /// Dispatch a routed command
    pub fn apply(&mut self, input: MatchInput) -> Vec<Outgoing> {
        match input.command {
            MatchCommand::Fire { x, y } => self.handle_fire(input.from, x, y),
            MatchCommand::Forfeit => self.handle_forfeit(input.from),
            MatchCommand::Disconnect => self.handle_disconnect(input.from),
        }
    }

    /// Resolve a shot by the participant whose turn it is.
    ///
    /// Out-of-turn shots, out-of-range coordinates and already resolved cells
    /// change nothing and keep the turn where it is.
    pub fn handle_fire(&mut self, from: ConnectionId, x: i64, y: i64) -> Vec<Outgoing> {
        if self.phase != MatchPhase::TurnOf(from) {
            debug!(match_id = %self.id, connection_id = %from, "Ignoring out-of-turn fire");
            return Vec::new();
        }

        let grid_size = self.attacker.grid.size();
        let (x, y) = match (usize::try_from(x), usize::try_from(y)) {
            (Ok(x), Ok(y)) if x < grid_size && y < grid_size => (x, y),
            _ => {
                debug!(match_id = %self.id, connection_id = %from, x, y, "Ignoring out-of-range fire");
                return Vec::new();
            }
        };

        let (shooter, target) = if from == self.attacker.id {
            (&mut self.attacker, &mut self.defender)
        } else {
            (&mut self.defender, &mut self.attacker)
        };

        let hit = match target.grid.strike(x, y) {
            Strike::Ignored => return Vec::new(),
            Strike::Miss => false,
            Strike::Hit => true,
        };

        let sunk = if hit {
            let cell = Coord { x, y };
            let sunk = target
                .ships
                .iter()
                .find(|s| s.covers(cell))
                .filter(|s| target.grid.is_sunk(s))
                .map(|s| s.ship_type);
            if sunk.is_some() {
                target.ships_sunk += 1;
            }
            sunk
        } else {
            None
        };

        let result = ServerMsg::Result(ShotResult {
            fired_by: shooter.id,
            x,
            y,
            hit,
            sunk,
        });
        let (shooter_id, target_id) = (shooter.id, target.id);
        let defeated = target.fleet_destroyed();

        let mut out = vec![
            Outgoing::new(shooter_id, result.clone()),
            Outgoing::new(target_id, result),
        ];

        if defeated {
            info!(match_id = %self.id, winner = %shooter_id, "Fleet destroyed");
            out.extend(self.finish(HashMap::from([
                (target_id, EndReason::Lose),
                (shooter_id, EndReason::Win),
            ])));
            return out;
        }

        self.phase = MatchPhase::TurnOf(target_id);
        out.push(Outgoing::new(shooter_id, ServerMsg::EndTurn));
        out.push(Outgoing::new(target_id, ServerMsg::YourTurn));
        out
    }

    /// End the match in favour of the other participant, whoever's turn it is
    pub fn handle_forfeit(&mut self, from: ConnectionId) -> Vec<Outgoing> {
        if !self.involves(from) {
            return Vec::new();
        }
        let end_state = self
            .participants()
            .into_iter()
            .map(|id| {
                let reason = if id == from {
                    EndReason::Forfeit
                } else {
                    EndReason::Win
                };
                (id, reason)
            })
            .collect();
        self.finish(end_state)
    }

    /// A participant's connection dropped; both sides are marked disconnected
    pub fn handle_disconnect(&mut self, from: ConnectionId) -> Vec<Outgoing> {
        if !self.involves(from) {
            return Vec::new();
        }
        let end_state = self
            .participants()
            .into_iter()
            .map(|id| (id, EndReason::Disconnect))
            .collect();
        self.finish(end_state)
    }

    /// Fire a random legal shot for the player whose turn it is
    pub fn handle_turn_timeout(&mut self) -> Vec<Outgoing> {
        let Some(current) = self.current_turn() else {
            return Vec::new();
        };
        let target = if current == self.attacker.id {
            &self.defender
        } else {
            &self.attacker
        };
        let open: Vec<Coord> = target.grid.unresolved_cells().collect();
        if open.is_empty() {
            return Vec::new();
        }
        let cell = open[self.rng.gen_range(0..open.len())];
        info!(match_id = %self.id, connection_id = %current, x = cell.x, y = cell.y, "Turn timed out, firing for player");
        self.handle_fire(current, cell.x as i64, cell.y as i64)
    }

    /// Move to `Over` and announce the result. Only the first call has any
    /// effect.
    fn finish(&mut self, end_state: EndState) -> Vec<Outgoing> {
        if self.is_over() {
            return Vec::new();
        }
        self.phase = MatchPhase::Over;
        self.end_state = Some(end_state.clone());

        self.participants()
            .into_iter()
            .map(|id| {
                Outgoing::new(
                    id,
                    ServerMsg::GameOver {
                        end_state: end_state.clone(),
                    },
                )
            })
            .collect()
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: MatchId,
    pub input_tx: mpsc::Sender<MatchInput>,
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<MatchId, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    /// Insert unless a match with the same id is already running
    pub fn try_insert(&self, handle: MatchHandle) -> bool {
        match self.matches.entry(handle.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A match running as its own task. Inputs from both participants arrive on
/// one channel and are applied strictly in arrival order.
pub struct GameMatch {
    state: MatchState,
    input_rx: mpsc::Receiver<MatchInput>,
    hub: Arc<ConnectionHub>,
    turn_timeout: Option<Duration>,
}

impl GameMatch {
    /// Place both fleets and create the match with its handle
    pub fn new(
        attacker: ConnectionId,
        defender: ConnectionId,
        config: &MatchConfig,
        seed: u64,
        hub: Arc<ConnectionHub>,
    ) -> Result<(Self, MatchHandle), PlacementError> {
        let state = MatchState::new(attacker, defender, config.grid_size, seed)?;
        let (input_tx, input_rx) = mpsc::channel(64);

        let handle = MatchHandle {
            id: state.id.clone(),
            input_tx,
        };

        let game_match = Self {
            state,
            input_rx,
            hub,
            turn_timeout: config.turn_timeout,
        };

        Ok((game_match, handle))
    }

    /// Drive the match until it reaches `Over`. Returns the final outcome, or
    /// `None` when every handle was dropped first.
    pub async fn run(mut self) -> Option<EndState> {
        info!(match_id = %self.state.id, seed = self.state.seed, "Match started");

        let opening = self.state.start();
        self.deliver(opening);

        let mut turn_holder = self.state.current_turn();
        let mut deadline = self.turn_timeout.map(|t| Instant::now() + t);

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let out = tokio::select! {
                input = self.input_rx.recv() => match input {
                    Some(input) => self.state.apply(input),
                    None => {
                        warn!(match_id = %self.state.id, "Match inputs closed before game over");
                        break;
                    }
                },
                _ = timer => self.state.handle_turn_timeout(),
            };
            self.deliver(out);

            if self.state.is_over() {
                break;
            }

            let holder = self.state.current_turn();
            let expired = deadline.is_some_and(|at| at <= Instant::now());
            if holder != turn_holder || expired {
                turn_holder = holder;
                deadline = self.turn_timeout.map(|t| Instant::now() + t);
            }
        }

        info!(match_id = %self.state.id, "Match ended");
        self.state.end_state.take()
    }

    fn deliver(&self, out: Vec<Outgoing>) {
        for Outgoing { to, msg } in out {
            self.hub.send(to, msg);
        }
    }
}
