//! Round-robin selection.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotates through a fixed list of targets.
#[derive(Debug)]
pub struct RoundRobin<T> {
    targets: Vec<T>,
    counter: AtomicUsize,
}

impl<T> RoundRobin<T> {
    pub fn new(targets: Vec<T>) -> Self {
        Self {
            targets,
            counter: AtomicUsize::new(0),
        }
    }

    /// Next target, or `None` when the list is empty.
    pub fn next(&self) -> Option<&T> {
        if self.targets.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        self.targets.get(index)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
