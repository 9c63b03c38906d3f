use crate::peers::PeerHandle;

/// An ordered list of peers with the rate each was ranked by, walked with a
/// cursor during slot reallocation.
#[derive(Debug, Default, Clone)]
pub struct PeerList {
    entries: Vec<(PeerHandle, f64)>,
    cursor: usize,
}

impl PeerList {
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    pub fn push(&mut self, peer: PeerHandle, rate: f64) {
        self.entries.push((peer, rate));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, peer: PeerHandle) -> bool {
        self.entries.iter().any(|(p, _)| *p == peer)
    }

    pub fn remove(&mut self, peer: PeerHandle) {
        if let Some(pos) = self.entries.iter().position(|(p, _)| *p == peer) {
            self.entries.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
        }
    }

    /// Fastest first. Equal rates keep insertion (connection) order.
    pub fn sort_by_rate(&mut self) {
        self.entries.sort_by(|a, b| b.1.total_cmp(&a.1));
        self.cursor = 0;
    }

    pub fn handles(&self) -> impl Iterator<Item = PeerHandle> + '_ {
        self.entries.iter().map(|(p, _)| *p)
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    pub fn next_peer(&mut self) -> Option<PeerHandle> {
        let p = self.entries.get(self.cursor).map(|(p, _)| *p)?;
        self.cursor += 1;
        Some(p)
    }

    /// Entries the cursor has not reached yet.
    pub fn remaining(&self) -> impl Iterator<Item = PeerHandle> + '_ {
        self.entries[self.cursor.min(self.entries.len())..]
            .iter()
            .map(|(p, _)| *p)
    }
}
