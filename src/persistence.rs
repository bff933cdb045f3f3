use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::log::Log;

/// The durable triple spec section 3 requires to survive a restart before a
/// node may answer any RPC: `{current_term, voted_for, log}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Log,
}

/// Writes `HardState` to disk via write-to-temp-then-rename, the same
/// pattern the original prototype's `cache.py` uses for its own (separate,
/// non-authoritative) persistence file — here it is the thing safety
/// actually depends on, so every mutation of term/vote/log must go through
/// this before the RPC that caused it is answered (spec section 4.2, 5).
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(data_dir: &Path, node_id: &str) -> Self {
        Store {
            path: data_dir.join(format!("{node_id}.raftstate")),
        }
    }

    pub fn load(&self) -> Result<HardState, PersistenceError> {
        if !self.path.exists() {
            return Ok(HardState::default());
        }
        let bytes = std::fs::read(&self.path)
            .map_err(|e| PersistenceError::Read(self.path.clone(), e))?;
        bincode::deserialize(&bytes)
            .map_err(|e| PersistenceError::Decode(self.path.clone(), e))
    }

    pub fn save(&self, state: &HardState) -> Result<(), PersistenceError> {
        let bytes = bincode::serialize(state).map_err(PersistenceError::Encode)?;
        let tmp = self.path.with_extension("raftstate.tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| PersistenceError::Write(tmp.clone(), e))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| PersistenceError::Write(self.path.clone(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Command;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), "node1");

        let mut state = store.load().unwrap();
        assert_eq!(state.current_term, 0);
        assert!(state.voted_for.is_none());

        state.current_term = 4;
        state.voted_for = Some("node2".to_string());
        state.log.append(
            4,
            Command::Set {
                key: "k".to_string(),
                value: vec![9],
                ttl_millis: None,
            },
        );
        store.save(&state).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.current_term, 4);
        assert_eq!(reloaded.voted_for.as_deref(), Some("node2"));
        assert_eq!(reloaded.log.last_index(), 1);
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path(), "nodeX");
        let state = store.load().unwrap();
        assert_eq!(state.current_term, 0);
        assert_eq!(state.log.last_index(), 0);
    }
}
