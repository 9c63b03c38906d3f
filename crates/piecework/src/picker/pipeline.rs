use piecework_core::{BitField, lengths::Lengths};

use crate::{
    peers::{ConnectedPeer, PeerHandle},
    wire::BlockRequest,
};

use super::{ActivePieceRequest, PickerContext, PiecePicker, Validated};

/// A filter in front of a base picker. Only piece selection and interest
/// checks pass through stages; request bookkeeping always goes to the base.
pub trait PickerStage: Send {
    fn refresh(&mut self, _ctx: &PickerContext<'_>) {}

    #[allow(clippy::too_many_arguments)]
    fn pick_piece(
        &mut self,
        next: Next<'_>,
        peer: &ConnectedPeer,
        available: &BitField,
        others: &[&ConnectedPeer],
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<BlockRequest>;

    fn is_interesting(&self, next: NextRef<'_>, peer: &ConnectedPeer, available: &BitField) -> bool {
        next.is_interesting(peer, available)
    }
}

/// The remainder of a pipeline, as seen from one stage.
pub struct Next<'a> {
    stages: &'a mut [Box<dyn PickerStage>],
    base: &'a mut dyn PiecePicker,
}

impl Next<'_> {
    pub fn pick_piece(
        &mut self,
        peer: &ConnectedPeer,
        available: &BitField,
        others: &[&ConnectedPeer],
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<BlockRequest> {
        match self.stages.split_first_mut() {
            Some((stage, rest)) => stage.pick_piece(
                Next {
                    stages: rest,
                    base: &mut *self.base,
                },
                peer,
                available,
                others,
                count,
                start,
                end,
            ),
            None => self
                .base
                .pick_piece(peer, available, others, count, start, end),
        }
    }

    /// Skips the remaining stages.
    pub fn base(&mut self) -> &mut dyn PiecePicker {
        &mut *self.base
    }
}

pub struct NextRef<'a> {
    stages: &'a [Box<dyn PickerStage>],
    base: &'a dyn PiecePicker,
}

impl NextRef<'_> {
    pub fn is_interesting(&self, peer: &ConnectedPeer, available: &BitField) -> bool {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.is_interesting(
                NextRef {
                    stages: rest,
                    base: self.base,
                },
                peer,
                available,
            ),
            None => self.base.is_interesting(peer, available),
        }
    }
}

/// Stages in front of a base picker. A pipeline is itself a picker, so
/// pipelines nest.
pub struct PickerPipeline<B> {
    stages: Vec<Box<dyn PickerStage>>,
    base: B,
}

impl<B: PiecePicker + 'static> PickerPipeline<B> {
    pub fn new(base: B) -> Self {
        Self {
            stages: Vec::new(),
            base,
        }
    }

    /// Adds a stage in front of the existing ones.
    pub fn with_stage(mut self, stage: impl PickerStage + 'static) -> Self {
        self.stages.insert(0, Box::new(stage));
        self
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut B {
        &mut self.base
    }

    pub fn stages_mut(&mut self) -> &mut [Box<dyn PickerStage>] {
        &mut self.stages
    }
}

impl<B: PiecePicker + 'static> PiecePicker for PickerPipeline<B> {
    fn initialise(&mut self, lengths: &Lengths) {
        self.base.initialise(lengths)
    }

    fn import_active_requests(&mut self, requests: &[ActivePieceRequest]) {
        self.base.import_active_requests(requests)
    }

    fn refresh(&mut self, ctx: &PickerContext<'_>) {
        for stage in self.stages.iter_mut() {
            stage.refresh(ctx);
        }
        self.base.refresh(ctx)
    }

    fn pick_piece(
        &mut self,
        peer: &ConnectedPeer,
        available: &BitField,
        others: &[&ConnectedPeer],
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<BlockRequest> {
        if count == 0 || start > end {
            return Vec::new();
        }
        Next {
            stages: &mut self.stages,
            base: &mut self.base,
        }
        .pick_piece(peer, available, others, count, start, end)
    }

    fn continue_existing_request(
        &mut self,
        peer: &ConnectedPeer,
        start: u32,
        end: u32,
    ) -> Option<BlockRequest> {
        self.base.continue_existing_request(peer, start, end)
    }

    fn continue_any_existing_request(
        &mut self,
        peer: &ConnectedPeer,
        start: u32,
        end: u32,
        max_duplicates: usize,
    ) -> Option<BlockRequest> {
        self.base
            .continue_any_existing_request(peer, start, end, max_duplicates)
    }

    fn validate_piece(&mut self, peer: PeerHandle, request: &BlockRequest) -> Option<Validated> {
        self.base.validate_piece(peer, request)
    }

    fn cancel_requests(&mut self, peer: PeerHandle, start: u32, end: u32) -> Vec<BlockRequest> {
        self.base.cancel_requests(peer, start, end)
    }

    fn request_rejected(&mut self, peer: PeerHandle, request: &BlockRequest) -> bool {
        self.base.request_rejected(peer, request)
    }

    fn is_interesting(&self, peer: &ConnectedPeer, available: &BitField) -> bool {
        NextRef {
            stages: &self.stages,
            base: &self.base,
        }
        .is_interesting(peer, available)
    }

    fn export_active_requests(&self) -> Vec<ActivePieceRequest> {
        self.base.export_active_requests()
    }

    fn current_request_count(&self) -> usize {
        self.base.current_request_count()
    }

    fn received_block_count(&self) -> usize {
        self.base.received_block_count()
    }

    fn in_endgame_mode(&self) -> bool {
        self.base.in_endgame_mode()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::picker::{StandardPicker, test_peers::peer};

    /// Records the ranges it sees and forwards them untouched.
    struct Recorder(Arc<Mutex<Vec<(&'static str, u32, u32)>>>, &'static str);

    impl PickerStage for Recorder {
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
            self.0.lock().unwrap().push((self.1, start, end));
            next.pick_piece(peer, available, others, count, start, end)
        }
    }

    #[test]
    fn test_stages_run_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let lengths = Lengths::new(16384 * 4, 16384).unwrap();
        let mut base = StandardPicker::default();
        base.initialise(&lengths);
        let mut pipeline = PickerPipeline::new(base)
            .with_stage(Recorder(log.clone(), "inner"))
            .with_stage(Recorder(log.clone(), "outer"));

        let mut p = peer(1, 4);
        p.bitfield = BitField::new_all_true(4);
        let picked = pipeline.pick_piece(&p, &p.bitfield.clone(), &[], 1, 0, 3);
        assert_eq!(picked.len(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec![("outer", 0, 3), ("inner", 0, 3)]
        );
    }
}
