//! Initiative rolls and starting positions for a room that is about to start.
//!
//! Every player draws an initiative value in `1..=20` and a secondary
//! tiebreak value up front. Ordering compares initiative (descending), then
//! the tiebreak (descending), then the player's position in the input list,
//! so the comparator is total and a given set of draws always yields the
//! same order.

use crate::types::UserId;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Highest initiative a player can roll.
pub const INITIATIVE_DIE: u8 = 20;

/// The pre-drawn values for one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiativeRoll {
    pub user_id: UserId,
    pub initiative: u8,
    pub tiebreak: u32,
}

/// Result of resolving a room's turn order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOrder {
    /// Player ids in play sequence.
    pub order: Vec<UserId>,
    /// 1-based rank of every player in `order`.
    pub positions: HashMap<UserId, u8>,
}

/// Resolves play sequence once per game, at the WAITING to STARTING transition.
pub struct TurnOrderResolver;

impl TurnOrderResolver {
    /// Draws initiative and tiebreak values for each player.
    pub fn roll<R: Rng + ?Sized>(players: &[UserId], rng: &mut R) -> Vec<InitiativeRoll> {
        players
            .iter()
            .map(|user_id| InitiativeRoll {
                user_id: user_id.clone(),
                initiative: rng.gen_range(1..=INITIATIVE_DIE),
                tiebreak: rng.gen(),
            })
            .collect()
    }

    /// Rolls for `players` and orders them.
    ///
    /// # Arguments
    ///
    /// * `players` - Player ids in room join order
    /// * `rng` - Source of the draws; inject a seeded RNG for reproducible results
    ///
    /// # Returns
    ///
    /// A [`TurnOrder`] whose `order` is a permutation of `players`.
    pub fn resolve<R: Rng + ?Sized>(players: &[UserId], rng: &mut R) -> TurnOrder {
        Self::resolve_rolls(Self::roll(players, rng))
    }

    /// Orders already drawn rolls. Pure; no randomness involved.
    pub fn resolve_rolls(rolls: Vec<InitiativeRoll>) -> TurnOrder {
        let mut ranked: Vec<(usize, InitiativeRoll)> = rolls.into_iter().enumerate().collect();
        ranked.sort_by(|(ai, a), (bi, b)| compare_rolls(a, *ai, b, *bi));

        let order: Vec<UserId> = ranked.into_iter().map(|(_, roll)| roll.user_id).collect();
        let positions = order
            .iter()
            .enumerate()
            .map(|(rank, user_id)| (user_id.clone(), (rank + 1) as u8))
            .collect();

        TurnOrder { order, positions }
    }
}

fn compare_rolls(a: &InitiativeRoll, a_index: usize, b: &InitiativeRoll, b_index: usize) -> Ordering {
    b.initiative
        .cmp(&a.initiative)
        .then_with(|| b.tiebreak.cmp(&a.tiebreak))
        .then_with(|| a_index.cmp(&b_index))
}
