use piecework_core::BitField;
use rand::{Rng, SeedableRng, rngs::SmallRng};

use crate::{peers::ConnectedPeer, wire::BlockRequest};

use super::{Next, PickerStage};

/// Splits the range at a random point and tries the upper half first, so
/// peers with identical bitfields don't all converge on the lowest pieces.
/// Only applies to single-block picks.
#[derive(Debug)]
pub struct RandomisedStage {
    rng: SmallRng,
}

impl Default for RandomisedStage {
    fn default() -> Self {
        Self::new(SmallRng::from_os_rng())
    }
}

impl RandomisedStage {
    pub fn new(rng: SmallRng) -> Self {
        Self { rng }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(SmallRng::seed_from_u64(seed))
    }
}

impl PickerStage for RandomisedStage {
    fn pick_piece(
        &mut self,
        mut next: Next<'_>,
        peer: &ConnectedPeer,
        available: &BitField,
        others: &[&ConnectedPeer],
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<BlockRequest> {
        if count > 1 || start >= end {
            return next.pick_piece(peer, available, others, count, start, end);
        }
        let midpoint = self.rng.random_range(start..=end);
        let picked = next.pick_piece(peer, available, others, count, midpoint, end);
        if !picked.is_empty() || midpoint == start {
            return picked;
        }
        next.pick_piece(peer, available, others, count, start, midpoint - 1)
    }
}
