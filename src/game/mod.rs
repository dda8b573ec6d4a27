//! Naval combat: grids, fleet placement and the per-match turn engine

pub mod grid;
pub mod r#match;

pub use r#match::{
    GameMatch, MatchCommand, MatchConfig, MatchHandle, MatchId, MatchInput, MatchRegistry,
};
