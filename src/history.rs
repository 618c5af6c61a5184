//! Scroll memory
//!
//! Every history entry the router creates carries an index in its history
//! state. Scroll positions are remembered per index so going back and forward
//! restores where the user was, and survive a reload through session storage.

use crate::platform::{ScrollPosition, SessionStorage};
use crate::{trace_log, warn_log};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scroll positions keyed by history index
pub struct ScrollMemory {
    positions: BTreeMap<u64, ScrollPosition>,
    storage: Arc<dyn SessionStorage>,
    key: String,
}

impl ScrollMemory {
    /// Restore the positions saved under `key`
    ///
    /// Missing or unreadable storage starts out empty.
    pub fn load(storage: Arc<dyn SessionStorage>, key: impl Into<String>) -> Self {
        let key = key.into();
        let positions = match storage.get(&key) {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|error| {
                warn_log!("Discarding unreadable scroll positions: {}", error);
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };

        Self {
            positions,
            storage,
            key,
        }
    }

    pub fn get(&self, index: u64) -> Option<ScrollPosition> {
        self.positions.get(&index).copied()
    }

    pub fn save(&mut self, index: u64, position: ScrollPosition) {
        trace_log!("Saving scroll {:?} for history index {}", position, index);
        self.positions.insert(index, position);
    }

    /// Forget every entry after `index`; those entries are gone once a new one
    /// is pushed on top of `index`
    pub fn prune_after(&mut self, index: u64) {
        if let Some(next) = index.checked_add(1) {
            self.positions.split_off(&next);
        }
    }

    /// Write the positions to session storage
    pub fn flush(&self) {
        match serde_json::to_string(&self.positions) {
            Ok(json) => self.storage.set(&self.key, json),
            Err(error) => {
                warn_log!("Could not persist scroll positions: {}", error);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl std::fmt::Debug for ScrollMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrollMemory")
            .field("positions", &self.positions)
            .field("key", &self.key)
            .finish()
    }
}
