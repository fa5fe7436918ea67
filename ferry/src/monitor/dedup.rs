//! Bounded memory of recently handled events.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Seen {
    by_key: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

/// Keys seen within a time window, capped in size.
///
/// The oldest keys are forgotten first when the cap is reached.
#[derive(Debug)]
pub struct RecentEvents {
    window: Duration,
    capacity: usize,
    seen: Mutex<Seen>,
}

impl RecentEvents {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: Mutex::new(Seen::default()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let mut seen = self.seen.lock();
        self.expire(&mut seen);
        seen.by_key.contains_key(key)
    }

    pub fn record(&self, key: &str) {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        self.expire(&mut seen);
        seen.by_key.insert(key.to_string(), now);
        seen.order.push_back((key.to_string(), now));
        while seen.by_key.len() > self.capacity {
            let Some((oldest, at)) = seen.order.pop_front() else {
                break;
            };
            // Only drop the entry if it was not recorded again since.
            if seen.by_key.get(&oldest) == Some(&at) {
                seen.by_key.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        let mut seen = self.seen.lock();
        self.expire(&mut seen);
        seen.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire(&self, seen: &mut Seen) {
        while let Some((key, at)) = seen.order.front() {
            if at.elapsed() < self.window {
                break;
            }
            if seen.by_key.get(key) == Some(at) {
                seen.by_key.remove(key);
            }
            seen.order.pop_front();
        }
    }
}
