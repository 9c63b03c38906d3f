use piecework_core::BitField;

use crate::{peers::ConnectedPeer, wire::BlockRequest};

use super::{Next, NextRef, PickerContext, PickerStage};

/// Removes pieces we must not ask for: already verified, waiting for a hash
/// check, unverified after resume, or entirely unwanted.
#[derive(Debug, Default)]
pub struct IgnoringStage {
    mask: BitField,
}

impl IgnoringStage {
    fn filter(&self, available: &BitField) -> BitField {
        let mut b = available.clone();
        if b.len() == self.mask.len() {
            b.nand(&self.mask);
        }
        b
    }
}

impl PickerStage for IgnoringStage {
    fn refresh(&mut self, ctx: &PickerContext<'_>) {
        let mut mask = ctx.have.clone();
        mask.or(ctx.ignored);
        self.mask = mask;
    }

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
        let filtered = self.filter(available);
        if filtered.all_false() {
            return Vec::new();
        }
        next.pick_piece(peer, &filtered, others, count, start, end)
    }

    fn is_interesting(&self, next: NextRef<'_>, peer: &ConnectedPeer, available: &BitField) -> bool {
        let filtered = self.filter(available);
        !filtered.all_false() && next.is_interesting(peer, &filtered)
    }
}
