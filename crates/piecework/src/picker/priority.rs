use piecework_core::BitField;

use crate::{peers::ConnectedPeer, torrent_info::Priority, wire::BlockRequest};

use super::{Next, NextRef, PickerContext, PickerStage};

/// Tries pieces of higher priority files first. Pieces belonging only to
/// `DoNotDownload` files are never forwarded.
#[derive(Debug, Default)]
pub struct PriorityStage {
    priorities: Vec<Priority>,
    /// One mask per distinct priority, highest first. Empty when every file
    /// shares the same wanted priority.
    groups: Vec<(Priority, BitField)>,
    /// Nothing is wanted at all.
    nothing: bool,
}

impl PriorityStage {
    fn rebuild(&mut self, ctx: &PickerContext<'_>) {
        self.priorities = ctx.priorities.to_vec();
        self.groups.clear();
        let piece_count = ctx.have.len();

        let wanted: Vec<(usize, Priority)> = ctx
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.length > 0)
            .map(|(i, _)| (i, ctx.priorities.get(i).copied().unwrap_or_default()))
            .collect();

        self.nothing = !wanted.is_empty() && wanted.iter().all(|(_, p)| *p == Priority::DoNotDownload);
        let uniform = wanted.windows(2).all(|w| w[0].1 == w[1].1);
        if self.nothing || uniform {
            return;
        }

        let mut distinct: Vec<Priority> = wanted
            .iter()
            .map(|(_, p)| *p)
            .filter(|p| *p != Priority::DoNotDownload)
            .collect();
        distinct.sort_unstable_by(|a, b| b.cmp(a));
        distinct.dedup();

        for priority in distinct {
            let mut mask = BitField::new(piece_count);
            for (i, p) in wanted.iter() {
                if *p == priority {
                    let f = &ctx.files[*i];
                    mask.set_range(f.start_piece as usize, f.end_piece as usize, true);
                }
            }
            self.groups.push((priority, mask));
        }
    }
}

impl PickerStage for PriorityStage {
    fn refresh(&mut self, ctx: &PickerContext<'_>) {
        if self.priorities.as_slice() != ctx.priorities
            || self.groups.first().is_some_and(|(_, m)| m.len() != ctx.have.len())
        {
            self.rebuild(ctx);
        }
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
        if self.nothing {
            return Vec::new();
        }
        if self.groups.is_empty() {
            return next.pick_piece(peer, available, others, count, start, end);
        }
        for (_, mask) in self.groups.iter() {
            let mut candidates = available.clone();
            candidates.and(mask);
            if candidates.all_false() {
                continue;
            }
            let picked = next.pick_piece(peer, &candidates, others, count, start, end);
            if !picked.is_empty() {
                return picked;
            }
        }
        Vec::new()
    }

    fn is_interesting(&self, next: NextRef<'_>, peer: &ConnectedPeer, available: &BitField) -> bool {
        if self.nothing {
            return false;
        }
        if self.groups.is_empty() {
            return next.is_interesting(peer, available);
        }
        self.groups.iter().any(|(_, mask)| {
            let mut candidates = available.clone();
            candidates.and(mask);
            !candidates.all_false() && next.is_interesting(peer, &candidates)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use piecework_core::Id20;

    use super::*;
    use crate::{
        picker::{PickerPipeline, PiecePicker, StandardPicker, test_peers::seeder},
        torrent_info::{PieceHashes, TorrentInfo},
    };

    fn setup(priorities: &[Priority]) -> (TorrentInfo, PickerPipeline<StandardPicker>) {
        let info = TorrentInfo::new(
            Id20::default(),
            "t",
            16384,
            [
                (PathBuf::from("a"), 16384 * 2),
                (PathBuf::from("b"), 16384 * 2),
            ],
            PieceHashes::default(),
        )
        .unwrap();
        let mut base = StandardPicker::default();
        base.initialise(&info.lengths);
        let mut picker = PickerPipeline::new(base).with_stage(PriorityStage::default());
        let have = BitField::new(4);
        picker.refresh(&PickerContext {
            lengths: &info.lengths,
            have: &have,
            ignored: &have,
            files: &info.files,
            priorities,
        });
        (info, picker)
    }

    #[test]
    fn test_high_priority_file_first() {
        let (_info, mut picker) = setup(&[Priority::Low, Priority::High]);
        let a = seeder(1, 4);
        let r = picker.pick_piece(&a, &a.bitfield, &[], 1, 0, 3);
        assert_eq!(r[0].piece, 2);
    }

    #[test]
    fn test_do_not_download_excluded() {
        let (_info, mut picker) = setup(&[Priority::DoNotDownload, Priority::Normal]);
        let a = seeder(1, 4);
        let mut picked = Vec::new();
        loop {
            let r = picker.pick_piece(&a, &a.bitfield, &[], 1, 0, 3);
            if r.is_empty() {
                break;
            }
            picked.extend(r);
        }
        assert!(picked.iter().all(|r| r.piece >= 2));
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn test_all_do_not_download_yields_nothing() {
        let (_info, mut picker) = setup(&[Priority::DoNotDownload, Priority::DoNotDownload]);
        let a = seeder(1, 4);
        assert!(picker.pick_piece(&a, &a.bitfield, &[], 1, 0, 3).is_empty());
        assert!(!picker.is_interesting(&a, &a.bitfield));
    }
}
