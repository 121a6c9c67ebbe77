//! Primary and secondary table slots.

use crate::core::error::{EngineError, EngineResult};
use crate::lut::cache::LutCache;
use crate::lut::parser::parse_cube_bytes;
use crate::lut::table::LookupTable;
use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Which of the two tables an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableSlot {
    /// Applied first; required for processing.
    Primary,
    /// Applied on top of the primary result.
    Secondary,
}

impl fmt::Display for TableSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableSlot::Primary => write!(f, "primary"),
            TableSlot::Secondary => write!(f, "secondary"),
        }
    }
}

/// Tables captured at task start.
///
/// Later loads or clears do not affect a task that already holds a snapshot.
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    /// Primary table, if loaded.
    pub primary: Option<Arc<LookupTable>>,
    /// Secondary table, if loaded.
    pub secondary: Option<Arc<LookupTable>>,
}

/// Two independently loadable table slots.
#[derive(Debug, Default)]
pub struct LutStore {
    primary: RwLock<Option<Arc<LookupTable>>>,
    secondary: RwLock<Option<Arc<LookupTable>>>,
}

impl LutStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, slot: TableSlot) -> &RwLock<Option<Arc<LookupTable>>> {
        match slot {
            TableSlot::Primary => &self.primary,
            TableSlot::Secondary => &self.secondary,
        }
    }

    /// Parse `.cube` bytes into a slot, replacing its previous table.
    ///
    /// On a parse error the slot keeps its previous contents.
    pub fn load(&self, slot: TableSlot, bytes: &[u8]) -> EngineResult<Arc<LookupTable>> {
        let table = Arc::new(parse_cube_bytes(bytes)?);
        info!("Loaded {} LUT ({}^3)", slot, table.size());
        self.set(slot, Some(Arc::clone(&table)));
        Ok(table)
    }

    /// Load a slot from a file through the shared cache.
    pub fn load_from_path(
        &self,
        slot: TableSlot,
        path: &Path,
        cache: &LutCache,
    ) -> EngineResult<Arc<LookupTable>> {
        let table = cache.get_or_load(path, |p| LookupTable::open(p).map_err(EngineError::from))?;
        info!("Loaded {} LUT from {} ({}^3)", slot, path.display(), table.size());
        self.set(slot, Some(Arc::clone(&table)));
        Ok(table)
    }

    /// Replace or clear a slot.
    pub fn set(&self, slot: TableSlot, table: Option<Arc<LookupTable>>) {
        *self.slot(slot).write() = table;
    }

    /// Clear a slot.
    pub fn clear(&self, slot: TableSlot) {
        self.set(slot, None);
    }

    /// Clear both slots.
    pub fn clear_all(&self) {
        self.clear(TableSlot::Primary);
        self.clear(TableSlot::Secondary);
    }

    /// Current table in a slot.
    pub fn get(&self, slot: TableSlot) -> Option<Arc<LookupTable>> {
        self.slot(slot).read().clone()
    }

    /// Parse `.cube` bytes into the primary slot.
    pub fn load_primary(&self, bytes: &[u8]) -> EngineResult<Arc<LookupTable>> {
        self.load(TableSlot::Primary, bytes)
    }

    /// Parse `.cube` bytes into the secondary slot.
    pub fn load_secondary(&self, bytes: &[u8]) -> EngineResult<Arc<LookupTable>> {
        self.load(TableSlot::Secondary, bytes)
    }

    /// Load the primary slot from a file through the cache.
    pub fn load_primary_from_path(&self, path: &Path, cache: &LutCache) -> EngineResult<Arc<LookupTable>> {
        self.load_from_path(TableSlot::Primary, path, cache)
    }

    /// Load the secondary slot from a file through the cache.
    pub fn load_secondary_from_path(&self, path: &Path, cache: &LutCache) -> EngineResult<Arc<LookupTable>> {
        self.load_from_path(TableSlot::Secondary, path, cache)
    }

    /// Clear the primary slot.
    pub fn clear_primary(&self) {
        self.clear(TableSlot::Primary);
    }

    /// Clear the secondary slot.
    pub fn clear_secondary(&self) {
        self.clear(TableSlot::Secondary);
    }

    /// Current primary table.
    pub fn primary(&self) -> Option<Arc<LookupTable>> {
        self.get(TableSlot::Primary)
    }

    /// Current secondary table.
    pub fn secondary(&self) -> Option<Arc<LookupTable>> {
        self.get(TableSlot::Secondary)
    }

    /// Capture both slots.
    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            primary: self.primary(),
            secondary: self.secondary(),
        }
    }

    /// Bytes held by the loaded tables.
    pub fn memory_usage(&self) -> usize {
        [self.primary(), self.secondary()]
            .iter()
            .flatten()
            .map(|t| t.memory_size())
            .sum()
    }
}
