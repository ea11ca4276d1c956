//! Work deferred until after the next paint.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaintTask {
    /// Read the rendered size of a mounted row.
    Measure(String),
    /// Re-pin to the bottom once sizes are settled, if still following.
    ScrollToBottom,
}

/// Tasks queued between two paints. Duplicates are collapsed.
#[derive(Debug, Clone, Default)]
pub struct PaintQueue {
    tasks: Vec<PaintTask>,
}

impl PaintQueue {
    pub fn push(&mut self, task: PaintTask) {
        if !self.tasks.contains(&task) {
            self.tasks.push(task);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn tasks(&self) -> &[PaintTask] {
        &self.tasks
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// Hand out everything queued so far, measurements before scrolls.
    /// Tasks pushed afterwards wait for the following paint.
    pub fn take(&mut self) -> Vec<PaintTask> {
        let mut tasks = std::mem::take(&mut self.tasks);
        tasks.sort_by_key(|task| matches!(task, PaintTask::ScrollToBottom));
        tasks
    }
}
