//! Virtualized list geometry: which rows to render, where they sit, and how
//! the scroll position reacts to rows growing.
//!
//! Sizes are abstract units (terminal lines for the bundled front end). Row
//! sizes start as an estimate and are replaced by measurements taken after a
//! paint. Rendering follows a two-stage protocol:
//!
//! 1. [`VirtualList::layout`] returns the rows to render and marks them mounted.
//! 2. [`VirtualList::on_paint`] runs once the frame is on screen: it measures
//!    rows queued for measurement, then honours pending scroll-to-bottom
//!    requests.

mod follow;
mod paint;

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use follow::FollowState;
pub use paint::{PaintQueue, PaintTask};

pub const DEFAULT_ESTIMATE_SIZE: u32 = 200;
pub const DEFAULT_OVERSCAN: usize = 5;
pub const DEFAULT_FOLLOW_THRESHOLD: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualListOptions {
    pub estimate_size: u32,
    pub overscan: usize,
    /// Distance from the bottom that still counts as "at the bottom".
    pub follow_threshold: u32,
}

impl Default for VirtualListOptions {
    fn default() -> Self {
        Self {
            estimate_size: DEFAULT_ESTIMATE_SIZE,
            overscan: DEFAULT_OVERSCAN,
            follow_threshold: DEFAULT_FOLLOW_THRESHOLD,
        }
    }
}

/// A row positioned for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleRow {
    pub index: usize,
    pub key: String,
    pub start: u32,
    pub size: u32,
    pub measured: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaintOutcome {
    pub measured: usize,
    pub ignored: usize,
    pub scrolled: bool,
}

#[derive(Debug, Clone)]
struct Row {
    key: String,
    size: u32,
    measured: bool,
}

#[derive(Debug, Clone)]
pub struct VirtualList {
    options: VirtualListOptions,
    rows: Vec<Row>,
    index: HashMap<String, usize>,
    starts: Vec<u32>,
    total: u32,
    viewport_height: u32,
    scroll_offset: u32,
    follow: FollowState,
    mounted: HashSet<String>,
    paint: PaintQueue,
}

impl Default for VirtualList {
    fn default() -> Self {
        Self::new(VirtualListOptions::default())
    }
}

impl VirtualList {
    pub fn new(options: VirtualListOptions) -> Self {
        Self {
            options,
            rows: Vec::new(),
            index: HashMap::new(),
            starts: Vec::new(),
            total: 0,
            viewport_height: 0,
            scroll_offset: 0,
            follow: FollowState::new(options.follow_threshold),
            mounted: HashSet::new(),
            paint: PaintQueue::default(),
        }
    }

    pub fn options(&self) -> VirtualListOptions {
        self.options
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn total_size(&self) -> u32 {
        self.total
    }

    pub fn viewport_height(&self) -> u32 {
        self.viewport_height
    }

    pub fn scroll_offset(&self) -> u32 {
        self.scroll_offset
    }

    pub fn max_scroll_offset(&self) -> u32 {
        self.total.saturating_sub(self.viewport_height)
    }

    pub fn is_following(&self) -> bool {
        self.follow.is_following()
    }

    pub fn pending_paint(&self) -> &PaintQueue {
        &self.paint
    }

    pub fn item_start(&self, index: usize) -> Option<u32> {
        self.starts.get(index).copied()
    }

    pub fn item_size(&self, key: &str) -> Option<u32> {
        self.index.get(key).map(|&index| self.rows[index].size)
    }

    pub fn is_mounted(&self, key: &str) -> bool {
        self.mounted.contains(key)
    }

    /// Forget every row and return to the initial following state.
    pub fn reset(&mut self) {
        self.rows.clear();
        self.index.clear();
        self.mounted.clear();
        self.paint.clear();
        self.scroll_offset = 0;
        self.follow.reset();
        self.rebuild_starts();
    }

    /// Reconcile the row set with `keys`, in display order.
    ///
    /// Known keys keep their size; new keys start at the estimate. Any change
    /// while following queues a scroll to the bottom for after the next paint.
    pub fn sync_rows<I, K>(&mut self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut previous: HashMap<String, Row> = self
            .rows
            .drain(..)
            .map(|row| (row.key.clone(), row))
            .collect();
        let previous_len = previous.len();
        let mut changed = false;

        self.index.clear();
        for key in keys {
            let key = key.as_ref();
            if self.index.contains_key(key) {
                tracing::debug!(key, "ignoring duplicate row key");
                continue;
            }
            let row = previous.remove(key).unwrap_or_else(|| {
                changed = true;
                Row {
                    key: key.to_string(),
                    size: self.options.estimate_size,
                    measured: false,
                }
            });
            self.index.insert(row.key.clone(), self.rows.len());
            self.rows.push(row);
        }
        changed |= !previous.is_empty() || self.rows.len() != previous_len;

        self.mounted.retain(|key| self.index.contains_key(key));
        self.rebuild_starts();
        self.clamp_scroll();

        if changed && self.follow.is_following() {
            self.paint.push(PaintTask::ScrollToBottom);
        }
    }

    pub fn set_viewport_height(&mut self, height: u32) {
        self.viewport_height = height;
        if self.follow.is_following() {
            self.scroll_offset = self.max_scroll_offset();
        } else {
            self.clamp_scroll();
        }
    }

    /// User-driven scroll to an absolute offset.
    pub fn scroll_to(&mut self, offset: u32) {
        let previous = self.scroll_offset;
        self.scroll_offset = offset.min(self.max_scroll_offset());
        self.follow
            .note_user_scroll(previous, self.scroll_offset, self.max_scroll_offset());
    }

    pub fn scroll_by(&mut self, delta: i64) {
        let target = (i64::from(self.scroll_offset) + delta).clamp(0, i64::from(u32::MAX));
        self.scroll_to(u32::try_from(target).unwrap_or(u32::MAX));
    }

    /// Explicit request to jump to the newest row; re-applied after the next paint.
    pub fn scroll_to_bottom(&mut self) {
        self.follow.follow();
        self.scroll_offset = self.max_scroll_offset();
        self.paint.push(PaintTask::ScrollToBottom);
    }

    /// Row indexes intersecting the viewport, widened by the overscan.
    pub fn visible_range(&self) -> Range<usize> {
        if self.rows.is_empty() {
            return 0..0;
        }

        let top = self.scroll_offset;
        let bottom = top.saturating_add(self.viewport_height);
        let first = self
            .starts
            .partition_point(|&start| start <= top)
            .saturating_sub(1);
        let last = if self.viewport_height == 0 {
            first + 1
        } else {
            self.starts.partition_point(|&start| start < bottom).max(first + 1)
        };

        let start = first.saturating_sub(self.options.overscan);
        let end = (last + self.options.overscan).min(self.rows.len());
        start..end
    }

    /// Stage one: rows to render for the current offset.
    ///
    /// The returned rows become the mounted set. Unmeasured ones are queued
    /// for measurement after the paint.
    pub fn layout(&mut self) -> Vec<VisibleRow> {
        let range = self.visible_range();
        self.mounted.clear();

        let mut visible = Vec::with_capacity(range.len());
        for index in range {
            let row = &self.rows[index];
            self.mounted.insert(row.key.clone());
            if !row.measured {
                self.paint.push(PaintTask::Measure(row.key.clone()));
            }
            visible.push(VisibleRow {
                index,
                key: row.key.clone(),
                start: self.starts[index],
                size: row.size,
                measured: row.measured,
            });
        }
        visible
    }

    /// Stage two: run the tasks queued before this paint.
    ///
    /// `measure` reports the rendered size of a row, or `None` when the row
    /// has nothing on screen.
    pub fn on_paint<F>(&mut self, mut measure: F) -> PaintOutcome
    where
        F: FnMut(&str) -> Option<u32>,
    {
        let mut outcome = PaintOutcome::default();
        for task in self.paint.take() {
            match task {
                PaintTask::Measure(key) => {
                    let Some(size) = measure(&key) else {
                        outcome.ignored += 1;
                        continue;
                    };
                    if self.apply_measurement(&key, size) {
                        outcome.measured += 1;
                    } else {
                        outcome.ignored += 1;
                    }
                }
                PaintTask::ScrollToBottom => {
                    if self.follow.is_following() {
                        self.scroll_offset = self.max_scroll_offset();
                        outcome.scrolled = true;
                    }
                }
            }
        }
        outcome
    }

    /// A mounted row changed size after its first measurement.
    pub fn resize_observed(&mut self, key: &str, size: u32) -> bool {
        self.apply_measurement(key, size)
    }

    /// Mark a row for re-measurement the next time it is laid out.
    pub fn invalidate_size(&mut self, key: &str) {
        if let Some(&index) = self.index.get(key) {
            self.rows[index].measured = false;
        }
    }

    fn apply_measurement(&mut self, key: &str, size: u32) -> bool {
        if !self.mounted.contains(key) {
            tracing::debug!(key, "ignoring measurement for unmounted row");
            return false;
        }
        let Some(&index) = self.index.get(key) else {
            tracing::debug!(key, "ignoring measurement for unknown row");
            return false;
        };

        let row = &mut self.rows[index];
        row.measured = true;
        let old = row.size;
        if old == size {
            return true;
        }
        row.size = size;
        let start = self.starts[index];
        self.rebuild_starts();

        if self.follow.is_following() {
            self.scroll_offset = self.max_scroll_offset();
        } else if start.saturating_add(old) <= self.scroll_offset {
            let shifted = i64::from(self.scroll_offset) + i64::from(size) - i64::from(old);
            self.scroll_offset = u32::try_from(shifted.max(0)).unwrap_or(u32::MAX);
            self.clamp_scroll();
        } else {
            self.clamp_scroll();
        }
        true
    }

    fn rebuild_starts(&mut self) {
        self.starts.clear();
        let mut cursor = 0u32;
        for row in &self.rows {
            self.starts.push(cursor);
            cursor = cursor.saturating_add(row.size);
        }
        self.total = cursor;
    }

    fn clamp_scroll(&mut self) {
        self.scroll_offset = self.scroll_offset.min(self.max_scroll_offset());
    }
}
