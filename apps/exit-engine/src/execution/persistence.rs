//! State persistence for crash recovery.
//!
//! The live set of scaled positions is written through to a JSON
//! snapshot on every state-changing transition, so a restart loses at
//! most the in-progress transition. Writes are atomic: the snapshot is
//! serialized to a sibling temp file and renamed over the live path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::ScaledPosition;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem error.
    #[error("state file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be serialized or parsed.
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// JSON snapshot store for the live scaled-position set.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store writing to the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the full position set.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the atomic replace fails.
    /// Callers treat failure as non-fatal: in-memory state stays
    /// authoritative, but a crash would lose recent transitions.
    pub fn save(&self, positions: &HashMap<String, ScaledPosition>) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec_pretty(positions)?;

        let mut tmp_path = self.path.clone();
        tmp_path.set_extension("json.tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.path)?;

        debug!(
            count = positions.len(),
            path = %self.path.display(),
            "State snapshot saved"
        );
        Ok(())
    }

    /// Load the position set from disk.
    ///
    /// A missing file yields an empty set. Entries already closed in the
    /// snapshot are dropped: a closed position should have been evicted
    /// before the write, but a crash can leave one behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<HashMap<String, ScaledPosition>, PersistenceError> {
        let contents = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No state snapshot found, starting empty");
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut positions: HashMap<String, ScaledPosition> = serde_json::from_slice(&contents)?;

        let before = positions.len();
        positions.retain(|symbol, pos| {
            if pos.is_closed() {
                warn!(symbol = %symbol, "Dropping closed position from snapshot");
                false
            } else {
                true
            }
        });

        info!(
            restored = positions.len(),
            dropped = before - positions.len(),
            path = %self.path.display(),
            "State snapshot loaded"
        );
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitPlan, Side};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn make_position(symbol: &str) -> ScaledPosition {
        ScaledPosition::open(
            symbol,
            Side::Buy,
            dec!(100),
            dec!(100),
            &ExitPlan {
                tp1: dec!(101),
                tp2: Some(dec!(102)),
                tp3: Some(dec!(103)),
                sl: dec!(99),
            },
            10,
        )
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("positions.json"));

        let mut positions = HashMap::new();
        let mut pos = make_position("BTC-USDT");
        pos.tp1_hit = true;
        pos.remaining_size = dec!(50);
        pos.tp2_order_id = Some("tpsl-9".to_string());
        positions.insert(pos.symbol.clone(), pos);

        store.save(&positions).expect("save");
        let restored = store.load().expect("load");

        assert_eq!(restored.len(), 1);
        let pos = &restored["BTC-USDT"];
        assert!(pos.tp1_hit);
        assert_eq!(pos.remaining_size, dec!(50));
        assert_eq!(pos.original_size, dec!(100));
        assert_eq!(pos.tp2_order_id.as_deref(), Some("tpsl-9"));
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("nope.json"));
        assert!(store.load().expect("load").is_empty());
    }

    #[test]
    fn test_closed_positions_dropped_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("positions.json"));

        let mut positions = HashMap::new();
        positions.insert("BTC-USDT".to_string(), make_position("BTC-USDT"));

        let mut closed = make_position("ETH-USDT");
        closed.tp3_hit = true;
        closed.remaining_size = Decimal::ZERO;
        positions.insert("ETH-USDT".to_string(), closed);

        store.save(&positions).expect("save");
        let restored = store.load().expect("load");

        assert_eq!(restored.len(), 1);
        assert!(restored.contains_key("BTC-USDT"));
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("positions.json"));

        let mut positions = HashMap::new();
        positions.insert("BTC-USDT".to_string(), make_position("BTC-USDT"));
        store.save(&positions).expect("first save");

        positions.remove("BTC-USDT");
        store.save(&positions).expect("second save");

        assert!(store.load().expect("load").is_empty());
        // No temp file left behind.
        assert!(!dir.path().join("positions.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("positions.json");
        std::fs::write(&path, b"not json").expect("write");

        let store = StateStore::new(path);
        assert!(matches!(
            store.load(),
            Err(PersistenceError::Serialization(_))
        ));
    }
}
