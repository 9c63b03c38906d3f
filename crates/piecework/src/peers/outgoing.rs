use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::wire::{BlockRequest, Message};

/// An item waiting to be written to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Message(Message),
    /// Block owed to the peer; its data is read from disk when it is sent.
    Upload(BlockRequest),
}

struct Queues {
    priority: VecDeque<Message>,
    normal: VecDeque<Outgoing>,
    choking: bool,
    allowed_fast: Vec<u32>,
}

impl Default for Queues {
    fn default() -> Self {
        Self {
            priority: Default::default(),
            normal: Default::default(),
            choking: true,
            allowed_fast: Vec::new(),
        }
    }
}

/// Per-peer outgoing queue.
///
/// Strictly FIFO, except that Choke/Unchoke/Cancel go to a priority lane that
/// is always drained first, in the order those control messages were pushed.
#[derive(Default)]
pub struct OutgoingQueue {
    queues: Mutex<Queues>,
    notify: Notify,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, msg: Message) {
        {
            let mut g = self.queues.lock();
            match msg {
                Message::Choke => g.choking = true,
                Message::Unchoke => g.choking = false,
                _ => {}
            }
            if msg.is_priority() {
                g.priority.push_back(msg);
            } else {
                g.normal.push_back(Outgoing::Message(msg));
            }
        }
        self.notify.notify_one();
    }

    pub fn push_upload(&self, request: BlockRequest) {
        self.queues.lock().normal.push_back(Outgoing::Upload(request));
        self.notify.notify_one();
    }

    /// Removes a queued upload. Returns false if it was not queued (already sent or never asked).
    pub fn cancel_upload(&self, request: &BlockRequest) -> bool {
        let mut g = self.queues.lock();
        let before = g.normal.len();
        g.normal
            .retain(|o| !matches!(o, Outgoing::Upload(r) if r == request));
        g.normal.len() != before
    }

    /// Removes queued uploads for which `drop` returns true, returning them in queue order.
    pub fn remove_uploads(&self, mut drop: impl FnMut(&BlockRequest) -> bool) -> Vec<BlockRequest> {
        let mut g = self.queues.lock();
        let mut removed = Vec::new();
        g.normal.retain(|o| match o {
            Outgoing::Upload(r) if drop(r) => {
                removed.push(*r);
                false
            }
            _ => true,
        });
        removed
    }

    /// Pieces the peer may fetch while choked.
    pub fn set_allowed_fast(&self, pieces: Vec<u32>) {
        self.queues.lock().allowed_fast = pieces;
    }

    /// Checked by the writer right before a block goes out, since a choke
    /// may have been queued while the block was being read from disk.
    pub fn upload_permitted(&self, piece: u32) -> bool {
        let g = self.queues.lock();
        !g.choking || g.allowed_fast.contains(&piece)
    }

    pub fn queued_uploads(&self) -> usize {
        self.queues
            .lock()
            .normal
            .iter()
            .filter(|o| matches!(o, Outgoing::Upload(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        let g = self.queues.lock();
        g.priority.len() + g.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_pop(&self) -> Option<Outgoing> {
        let mut g = self.queues.lock();
        if let Some(m) = g.priority.pop_front() {
            return Some(Outgoing::Message(m));
        }
        g.normal.pop_front()
    }

    /// Waits for the next item.
    pub async fn next(&self) -> Outgoing {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }
}
