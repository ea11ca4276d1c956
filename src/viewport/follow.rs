//! Bottom-follow bookkeeping for the virtual list.

/// Tracks whether the list should stay pinned to its last row.
///
/// Following pauses when the user scrolls up past the threshold and resumes
/// once they scroll back down within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FollowState {
    follow_bottom: bool,
    threshold: u32,
}

impl FollowState {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            follow_bottom: true,
            threshold,
        }
    }

    pub(crate) fn is_following(&self) -> bool {
        self.follow_bottom
    }

    pub(crate) fn is_near_bottom(&self, offset: u32, max_offset: u32) -> bool {
        max_offset.saturating_sub(offset) <= self.threshold
    }

    pub(crate) fn follow(&mut self) {
        self.follow_bottom = true;
    }

    pub(crate) fn reset(&mut self) {
        self.follow_bottom = true;
    }

    /// Update follow mode after a user scroll from `previous` to `offset`.
    pub(crate) fn note_user_scroll(&mut self, previous: u32, offset: u32, max_offset: u32) {
        let near = self.is_near_bottom(offset, max_offset);
        if self.follow_bottom {
            if offset < previous && !near {
                self.follow_bottom = false;
            }
        } else if offset > previous && near {
            self.follow_bottom = true;
        }
    }
}
