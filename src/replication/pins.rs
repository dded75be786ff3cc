//! Retention pins.
//!
//! A multiset of ticks that log garbage collection must not reclaim past.
//! Sync batches and key-chunk sessions each hold one pin while alive.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::wal::Tick;

#[derive(Debug, Default)]
pub struct TickPins {
    pins: Mutex<BTreeMap<Tick, usize>>,
}

impl TickPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, tick: Tick) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        *pins.entry(tick).or_insert(0) += 1;
    }

    pub fn unpin(&self, tick: Tick) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = pins.get_mut(&tick) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&tick);
            }
        } else {
            tracing::error!("Unpinning tick {} that was never pinned", tick);
        }
    }

    /// Pin the tick returned by `current`, evaluated while the pin set is
    /// locked. Collectors that read `min()` after choosing their horizon
    /// therefore never reclaim past a pin taken this way.
    pub fn pin_current<F>(&self, current: F) -> Tick
    where
        F: FnOnce() -> Tick,
    {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        let tick = current();
        *pins.entry(tick).or_insert(0) += 1;
        tick
    }

    /// Move one pin from `from` to `to`
    pub fn repin(&self, from: Tick, to: Tick) {
        if from != to {
            self.pin(to);
            self.unpin(from);
        }
    }

    /// Lowest pinned tick
    pub fn min(&self) -> Option<Tick> {
        let pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        pins.keys().next().copied()
    }

    /// Total number of pins held
    pub fn len(&self) -> usize {
        let pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        pins.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.min().is_none()
    }
}
