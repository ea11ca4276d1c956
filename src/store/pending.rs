//! Holding area for part updates that arrive before their message.

use std::collections::VecDeque;

use opencode_api::Part;

#[derive(Debug, Clone)]
struct PendingPart {
    session_id: String,
    message_id: String,
    part: Part,
    queued_at: u64,
}

impl PendingPart {
    fn belongs_to(&self, session_id: &str, message_id: &str) -> bool {
        self.session_id == session_id && self.message_id == message_id
    }
}

/// Bounded FIFO of orphan parts.
///
/// An entry lives for `grace` store mutations after it was last refreshed.
/// Once `capacity` entries are held the oldest one is evicted.
#[derive(Debug, Clone)]
pub(crate) struct PendingParts {
    entries: VecDeque<PendingPart>,
    grace: u64,
    capacity: usize,
}

impl PendingParts {
    pub(crate) fn new(grace: u64, capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            grace,
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Queue `part`; a newer snapshot of an already queued part replaces it in place.
    pub(crate) fn push(&mut self, session_id: &str, message_id: &str, part: Part, seq: u64) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|entry| entry.belongs_to(session_id, message_id) && entry.part.id == part.id)
        {
            existing.part = part;
            existing.queued_at = seq;
            return;
        }

        if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::warn!(
                    session_id = %evicted.session_id,
                    message_id = %evicted.message_id,
                    part_id = %evicted.part.id,
                    "pending part buffer full; dropping oldest orphan part"
                );
            }
        }

        self.entries.push_back(PendingPart {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            part,
            queued_at: seq,
        });
    }

    /// Remove and return the parts queued for one message, in arrival order.
    pub(crate) fn take_for(&mut self, session_id: &str, message_id: &str) -> Vec<Part> {
        if !self
            .entries
            .iter()
            .any(|entry| entry.belongs_to(session_id, message_id))
        {
            return Vec::new();
        }

        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.belongs_to(session_id, message_id) {
                taken.push(entry.part);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        taken
    }

    pub(crate) fn discard_for(&mut self, session_id: &str, message_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !entry.belongs_to(session_id, message_id));
        before - self.entries.len()
    }

    pub(crate) fn discard_session(&mut self, session_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.session_id != session_id);
        before - self.entries.len()
    }

    /// Drop entries whose grace period ended before `seq`.
    pub(crate) fn expire(&mut self, seq: u64) -> usize {
        let grace = self.grace;
        let before = self.entries.len();
        self.entries.retain(|entry| {
            let alive = entry.queued_at.saturating_add(grace) >= seq;
            if !alive {
                tracing::warn!(
                    session_id = %entry.session_id,
                    message_id = %entry.message_id,
                    part_id = %entry.part.id,
                    "dropping part whose message never arrived"
                );
            }
            alive
        });
        before - self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
