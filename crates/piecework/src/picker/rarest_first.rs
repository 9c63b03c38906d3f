use piecework_core::BitField;

use crate::{peers::ConnectedPeer, wire::BlockRequest};

use super::{Next, PickerStage};

/// Prefers pieces few other peers have.
///
/// Builds a stack of successively narrower bitfields by removing each other
/// peer's pieces in turn, then tries the narrowest (rarest) set first. Only
/// applies to single-block picks; bulk requests go straight through.
#[derive(Debug, Default, Clone, Copy)]
pub struct RarestFirstStage;

impl RarestFirstStage {
    fn rarity_stack(peer: &ConnectedPeer, available: &BitField, others: &[&ConnectedPeer]) -> Vec<BitField> {
        let mut stack = vec![available.clone()];
        for other in others {
            if other.handle == peer.handle || other.is_seeder() {
                continue;
            }
            if other.bitfield.len() != available.len() {
                continue;
            }
            let Some(top) = stack.last() else {
                break;
            };
            let mut narrower = top.clone();
            narrower.nand(&other.bitfield);
            if narrower.all_false() {
                break;
            }
            if narrower != *top {
                stack.push(narrower);
            }
        }
        stack
    }
}

impl PickerStage for RarestFirstStage {
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
        if count > 1 {
            return next.pick_piece(peer, available, others, count, start, end);
        }
        let mut stack = Self::rarity_stack(peer, available, others);
        while let Some(candidates) = stack.pop() {
            let picked = next.pick_piece(peer, &candidates, others, count, start, end);
            if !picked.is_empty() {
                return picked;
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use piecework_core::lengths::Lengths;

    use super::*;
    use crate::picker::{
        PickerPipeline, PiecePicker, StandardPicker,
        test_peers::{peer, seeder},
    };

    #[test]
    fn test_picks_piece_nobody_else_has() {
        let lengths = Lengths::new(16384 * 4, 16384).unwrap();
        let mut base = StandardPicker::default();
        base.initialise(&lengths);
        let mut picker = PickerPipeline::new(base).with_stage(RarestFirstStage);

        let a = seeder(1, 4);
        let mut b = peer(2, 4);
        b.bitfield = BitField::from_indices(4, [0]);
        let mut c = peer(3, 4);
        c.bitfield = BitField::from_indices(4, [0, 1]);
        let s = seeder(4, 4);

        let order: Vec<u32> = (0..4)
            .map(|_| picker.pick_piece(&a, &a.bitfield, &[&b, &c, &s], 1, 0, 3)[0].piece)
            .collect();
        assert_eq!(order, vec![2, 3, 1, 0]);
    }

    #[test]
    fn test_bulk_picks_bypass() {
        let lengths = Lengths::new(16384 * 4, 16384).unwrap();
        let mut base = StandardPicker::default();
        base.initialise(&lengths);
        let mut picker = PickerPipeline::new(base).with_stage(RarestFirstStage);
        let a = seeder(1, 4);
        let mut b = peer(2, 4);
        b.bitfield = BitField::from_indices(4, [0, 1]);
        let r = picker.pick_piece(&a, &a.bitfield, &[&b], 2, 0, 3);
        assert_eq!(r[0].piece, 0);
    }
}
