//! Pending event actions ordered by time, priority and insertion.

use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum QueuedAction {
    /// Compute the assignment values when executed, then assign them.
    Calculation { event: usize },
    /// Assign values computed when the event fired.
    Assignment { event: usize, values: Vec<f64> },
}

impl QueuedAction {
    pub fn event(&self) -> usize {
        match self {
            QueuedAction::Calculation { event } | QueuedAction::Assignment { event, .. } => *event,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub time: f64,
    pub sequence: u64,
    pub action: QueuedAction,
}

/// Outcome of one `process_queue` call.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QueueStatus {
    pub state_changed: bool,
    pub processed: usize,
    /// Time of the earliest action still pending.
    pub next_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQueue {
    entries: Vec<QueueEntry>,
    next_sequence: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn push(&mut self, time: f64, action: QueuedAction) {
        self.entries.push(QueueEntry {
            time,
            sequence: self.next_sequence,
            action,
        });
        self.next_sequence += 1;
    }

    pub fn next_time(&self) -> Option<f64> {
        self.entries
            .iter()
            .map(|entry| entry.time)
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Drops every pending action of `event`; returns how many were dropped.
    pub fn remove_event(&mut self, event: usize) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.action.event() != event);
        before - self.entries.len()
    }

    /// Removes and returns the next action due at `time`.
    ///
    /// Actions scheduled before `time` are always due; actions scheduled
    /// exactly at `time` only when `equality` is set. Among due actions the
    /// earliest wins, then the highest priority (NaN ranks last), then the
    /// earliest insertion.
    pub fn pop_due(
        &mut self,
        time: f64,
        equality: bool,
        priority: impl Fn(usize) -> f64,
    ) -> Option<QueueEntry> {
        let due = |entry: &QueueEntry| entry.time < time || (equality && entry.time == time);
        let rank = |entry: &QueueEntry| {
            let value = priority(entry.action.event());
            if value.is_nan() {
                f64::NEG_INFINITY
            } else {
                value
            }
        };
        let position = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| due(entry))
            .min_by(|(_, a), (_, b)| {
                a.time
                    .total_cmp(&b.time)
                    .then_with(|| rank(b).partial_cmp(&rank(a)).unwrap_or(Ordering::Equal))
                    .then_with(|| a.sequence.cmp(&b.sequence))
            })
            .map(|(position, _)| position)?;
        Some(self.entries.remove(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_earliest_then_priority_then_insertion() {
        let mut queue = EventQueue::new();
        queue.push(2.0, QueuedAction::Calculation { event: 0 });
        queue.push(1.0, QueuedAction::Calculation { event: 1 });
        queue.push(1.0, QueuedAction::Calculation { event: 2 });
        queue.push(1.0, QueuedAction::Calculation { event: 3 });

        let priority = |event: usize| if event == 3 { 5.0 } else { f64::NAN };
        let order: Vec<usize> = std::iter::from_fn(|| queue.pop_due(2.0, true, priority))
            .map(|entry| entry.action.event())
            .collect();
        assert_eq!(order, vec![3, 1, 2, 0]);
    }

    #[test]
    fn equality_controls_actions_at_exact_time() {
        let mut queue = EventQueue::new();
        queue.push(1.0, QueuedAction::Calculation { event: 0 });
        assert!(queue.pop_due(1.0, false, |_| 0.0).is_none());
        assert!(queue.pop_due(1.0, true, |_| 0.0).is_some());
    }

    #[test]
    fn remove_event_drops_pending_actions() {
        let mut queue = EventQueue::new();
        queue.push(1.0, QueuedAction::Calculation { event: 0 });
        queue.push(3.0, QueuedAction::Assignment {
            event: 0,
            values: vec![1.0],
        });
        queue.push(2.0, QueuedAction::Calculation { event: 1 });
        assert_eq!(queue.remove_event(0), 2);
        assert_eq!(queue.next_time(), Some(2.0));
    }
}
