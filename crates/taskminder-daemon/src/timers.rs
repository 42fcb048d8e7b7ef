//! Timer registry keyed by schedule id, with long-delay chaining.
//!
//! Timers carry their true wall-clock target. A single wait ("link") never
//! exceeds [`MAX_TIMER_DELAY_MS`]; when a link elapses short of the target the
//! next one is measured again from the current time.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;

/// Longest single wait, matching the common 32-bit millisecond timer limit.
pub const MAX_TIMER_DELAY_MS: i64 = 2_147_483_647;

pub fn max_timer_delay() -> Duration {
    Duration::milliseconds(MAX_TIMER_DELAY_MS)
}

/// A timer whose target was reached, removed from the registry.
#[derive(Debug)]
pub struct FiredTimer<T> {
    pub id: String,
    pub target: DateTime<Utc>,
    /// Number of links waited, 1 for a direct timer.
    pub links: u32,
    pub payload: T,
}

#[derive(Debug)]
struct ArmedTimer<T> {
    seq: u64,
    target: DateTime<Utc>,
    link_due: DateTime<Utc>,
    links: u32,
    payload: T,
}

/// At most one live timer per id. Superseded heap links are discarded lazily.
#[derive(Debug)]
pub struct TimerRegistry<T> {
    armed: IndexMap<String, ArmedTimer<T>>,
    queue: BinaryHeap<QueuedLink>,
    next_seq: u64,
}

impl<T> Default for TimerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerRegistry<T> {
    pub fn new() -> Self {
        Self {
            armed: IndexMap::new(),
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Arm `id` for `target`, superseding any timer already armed under it.
    pub fn set(&mut self, id: impl Into<String>, target: DateTime<Utc>, now: DateTime<Utc>, payload: T) {
        let id = id.into();
        let seq = self.bump_seq();
        let link_due = link_deadline(target, now);
        self.queue.push(QueuedLink {
            due: link_due,
            seq,
            id: id.clone(),
        });
        self.armed.insert(
            id,
            ArmedTimer {
                seq,
                target,
                link_due,
                links: 1,
                payload,
            },
        );
        self.maybe_compact();
    }

    /// Cancel every timer. Returns how many were live.
    pub fn clear_all(&mut self) -> usize {
        let live = self.armed.len();
        self.armed.clear();
        self.queue.clear();
        live
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.armed.contains_key(id)
    }

    #[cfg(test)]
    pub fn target(&self, id: &str) -> Option<DateTime<Utc>> {
        self.armed.get(id).map(|timer| timer.target)
    }

    #[cfg(test)]
    pub fn link_count(&self, id: &str) -> Option<u32> {
        self.armed.get(id).map(|timer| timer.links)
    }

    /// Armed ids in the order they were first armed.
    #[cfg(test)]
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.armed.keys().map(String::as_str)
    }

    /// Wall-clock time of the next link to wake for.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(link) = self.queue.peek() {
            if self.is_current(link) {
                return Some(link.due);
            }
            self.queue.pop();
        }
        None
    }

    /// Remove and return timers whose target is reached, re-linking early wakes.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<FiredTimer<T>> {
        let mut fired = Vec::new();
        while let Some(link) = self.queue.peek() {
            if link.due > now {
                break;
            }
            let Some(link) = self.queue.pop() else {
                break;
            };
            if !self.is_current(&link) {
                continue;
            }
            let reached = self
                .armed
                .get(&link.id)
                .map(|timer| timer.target <= now)
                .unwrap_or(false);
            if reached {
                if let Some(timer) = self.armed.shift_remove(&link.id) {
                    fired.push(FiredTimer {
                        id: link.id,
                        target: timer.target,
                        links: timer.links,
                        payload: timer.payload,
                    });
                }
                continue;
            }
            let seq = self.bump_seq();
            if let Some(timer) = self.armed.get_mut(&link.id) {
                timer.seq = seq;
                timer.link_due = link_deadline(timer.target, now);
                timer.links += 1;
                self.queue.push(QueuedLink {
                    due: timer.link_due,
                    seq,
                    id: link.id,
                });
            }
        }
        fired
    }

    fn is_current(&self, link: &QueuedLink) -> bool {
        self.armed
            .get(&link.id)
            .map(|timer| timer.seq == link.seq)
            .unwrap_or(false)
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    fn maybe_compact(&mut self) {
        let threshold = self.armed.len().saturating_mul(4).max(128);
        if self.queue.len() <= threshold {
            return;
        }
        self.queue = self
            .armed
            .iter()
            .map(|(id, timer)| QueuedLink {
                due: timer.link_due,
                seq: timer.seq,
                id: id.clone(),
            })
            .collect();
    }
}

/// End of the next link toward `target`, capped at the maximum delay.
fn link_deadline(target: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if target - now > max_timer_delay() {
        now + max_timer_delay()
    } else {
        target
    }
}

#[derive(Debug, Clone)]
struct QueuedLink {
    due: DateTime<Utc>,
    seq: u64,
    id: String,
}

impl PartialEq for QueuedLink {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedLink {}

impl PartialOrd for QueuedLink {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedLink {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the earliest link; ties go to the earlier arm.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
