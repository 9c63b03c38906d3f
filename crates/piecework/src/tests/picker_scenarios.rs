use std::path::PathBuf;

use piecework_core::{BitField, Id20, lengths::Lengths};

use crate::{
    peers::PeerHandle,
    picker::{PickerContext, PiecePicker, default_picker, test_peers},
    torrent_info::{PieceHashes, Priority, TorrentInfo},
};

use super::test_util::setup_test_logging;

fn four_small_pieces() -> TorrentInfo {
    let mut info = TorrentInfo::new(
        Id20::default(),
        "four",
        16384,
        [(PathBuf::from("four.bin"), 4 * 16384)],
        PieceHashes::default(),
    )
    .unwrap();
    info.lengths = Lengths::with_block_length(4 * 16384, 16384, 8192).unwrap();
    info
}

#[test]
fn test_peers_only_get_pieces_they_have_and_completion_reports_contributors() {
    setup_test_logging();
    let info = four_small_pieces();
    let mut have = BitField::new(4);
    let ignored = BitField::new(4);
    let priorities = vec![Priority::Normal];

    let mut picker = default_picker(0);
    picker.initialise(&info.lengths);
    picker.refresh(&PickerContext {
        lengths: &info.lengths,
        have: &have,
        ignored: &ignored,
        files: &info.files,
        priorities: &priorities,
    });

    let mut a = test_peers::peer(1, 4);
    a.bitfield = BitField::from_indices(4, [0, 1]);
    let mut b = test_peers::peer(2, 4);
    b.bitfield = BitField::from_indices(4, [2, 3]);

    let mut for_a = Vec::new();
    loop {
        let picked = picker.pick_piece(&a, &a.bitfield, &[&b], 2, 0, 3);
        if picked.is_empty() {
            break;
        }
        for_a.extend(picked);
    }
    assert_eq!(for_a.len(), 4);
    assert!(for_a.iter().all(|r| r.piece == 0 || r.piece == 1));
    assert!(for_a.iter().all(|r| r.length == 8192));

    let for_b = picker.pick_piece(&b, &b.bitfield, &[&a], 4, 0, 3);
    assert!(!for_b.is_empty());
    assert!(for_b.iter().all(|r| r.piece == 2 || r.piece == 3));

    let mut piece0: Vec<_> = for_a.iter().filter(|r| r.piece == 0).copied().collect();
    piece0.sort();
    let first = picker.validate_piece(a.handle, &piece0[0]).unwrap();
    assert!(!first.piece_complete);
    let second = picker.validate_piece(a.handle, &piece0[1]).unwrap();
    assert!(second.piece_complete);
    assert_eq!(second.peers_involved, vec![PeerHandle(1)]);
    assert!(picker.validate_piece(a.handle, &piece0[1]).is_none());

    // Hash passed.
    have.set(0, true);
    picker.refresh(&PickerContext {
        lengths: &info.lengths,
        have: &have,
        ignored: &ignored,
        files: &info.files,
        priorities: &priorities,
    });
    assert!(
        picker
            .export_active_requests()
            .iter()
            .all(|r| r.request.piece != 0)
    );
    assert!(picker.is_interesting(&a, &a.bitfield));
}

#[test]
fn test_nothing_to_pick_from_a_peer_with_only_what_we_have() {
    let info = four_small_pieces();
    let have = BitField::from_indices(4, [0, 1]);
    let ignored = BitField::new(4);
    let priorities = vec![Priority::Normal];

    let mut picker = default_picker(0);
    picker.initialise(&info.lengths);
    picker.refresh(&PickerContext {
        lengths: &info.lengths,
        have: &have,
        ignored: &ignored,
        files: &info.files,
        priorities: &priorities,
    });

    let mut a = test_peers::peer(1, 4);
    a.bitfield = BitField::from_indices(4, [0, 1]);
    assert!(!picker.is_interesting(&a, &a.bitfield));
    assert!(picker.pick_piece(&a, &a.bitfield, &[], 4, 0, 3).is_empty());
}

#[test]
fn test_endgame_starts_once_few_blocks_remain() {
    let info = TorrentInfo::new(
        Id20::default(),
        "many",
        16384,
        [(PathBuf::from("many.bin"), 300 * 16384)],
        PieceHashes::default(),
    )
    .unwrap();
    let ignored = BitField::new(300);
    let priorities = vec![Priority::Normal];
    let mut picker = default_picker(256);
    picker.initialise(&info.lengths);

    let refresh = |picker: &mut dyn PiecePicker, have_count: usize| {
        let have = BitField::from_indices(300, 0..have_count);
        picker.refresh(&PickerContext {
            lengths: &info.lengths,
            have: &have,
            ignored: &ignored,
            files: &info.files,
            priorities: &priorities,
        });
    };

    refresh(&mut picker, 0);
    assert!(!picker.in_endgame_mode());
    // 256 blocks left is not yet below the threshold.
    refresh(&mut picker, 44);
    assert!(!picker.in_endgame_mode());
    refresh(&mut picker, 45);
    assert!(picker.in_endgame_mode());

    let seeder = test_peers::seeder(1, 300);
    let picked = picker.pick_piece(&seeder, &seeder.bitfield, &[], 4, 0, 299);
    assert!(!picked.is_empty());
    assert!(picked.iter().all(|r| r.piece >= 45));
}
