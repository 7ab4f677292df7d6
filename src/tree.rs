//! The window tree as the core sees it: something that can be persisted to a
//! snapshot, restored from one, and told which windows it manages.

use std::{collections::HashMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{ManagerError, Result};

pub trait LayoutTree {
    /// Rebuild from a snapshot written by [`LayoutTree::persist`]. On error
    /// the tree is left as it was.
    fn restore(&mut self, snapshot: &Path) -> Result<()>;

    /// Fresh tree for a start without (usable) snapshot.
    fn init_default(&mut self);

    fn persist(&self, snapshot: &Path) -> Result<()>;

    fn is_managed(&self, window: u32) -> bool;

    /// Returns false if the window was already managed.
    fn manage(&mut self, window: u32) -> bool;

    fn unmanage(&mut self, window: u32) -> bool;

    /// Drop restored placeholders nobody claimed. Returns how many.
    fn prune_placeholders(&mut self) -> usize;

    fn managed_windows(&self) -> Vec<u32>;
}

pub type TreeBox = Box<dyn LayoutTree>;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    windows: Vec<u32>,
}

/// Flat, ordered stand-in for the container tree.
#[derive(Debug, Default)]
pub struct WindowTree {
    managed: Vec<u32>,
    /// Snapshot position of every window restored but not yet claimed again.
    placeholders: HashMap<u32, usize>,
    /// Snapshot position of every window the current tree was restored with.
    snapshot_order: HashMap<u32, usize>,
}

impl WindowTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn order_of(&self, window: u32) -> usize {
        self.snapshot_order.get(&window).copied().unwrap_or(usize::MAX)
    }
}

impl LayoutTree for WindowTree {
    fn restore(&mut self, snapshot: &Path) -> Result<()> {
        let raw = fs::read(snapshot).map_err(|err| ManagerError::Snapshot {
            path: snapshot.to_path_buf(),
            message: format!("failed to read: {err}"),
        })?;
        let parsed: Snapshot = serde_json::from_slice(&raw).map_err(|err| ManagerError::Snapshot {
            path: snapshot.to_path_buf(),
            message: format!("malformed: {err}"),
        })?;
        if parsed.version != SNAPSHOT_VERSION {
            return Err(ManagerError::Snapshot {
                path: snapshot.to_path_buf(),
                message: format!("unsupported version {}", parsed.version),
            });
        }

        self.managed.clear();
        self.snapshot_order = parsed
            .windows
            .iter()
            .enumerate()
            .map(|(index, &window)| (window, index))
            .collect();
        self.placeholders = self.snapshot_order.clone();
        tracing::info!(windows = parsed.windows.len(), "tree restored from snapshot");
        Ok(())
    }

    fn init_default(&mut self) {
        self.managed.clear();
        self.placeholders.clear();
        self.snapshot_order.clear();
    }

    fn persist(&self, snapshot: &Path) -> Result<()> {
        let payload = Snapshot {
            version: SNAPSHOT_VERSION,
            windows: self.managed.clone(),
        };
        let json = serde_json::to_vec_pretty(&payload).map_err(|err| ManagerError::Snapshot {
            path: snapshot.to_path_buf(),
            message: format!("failed to serialize: {err}"),
        })?;
        fs::write(snapshot, json).map_err(|err| ManagerError::Snapshot {
            path: snapshot.to_path_buf(),
            message: format!("failed to write: {err}"),
        })
    }

    fn is_managed(&self, window: u32) -> bool {
        self.managed.contains(&window)
    }

    fn manage(&mut self, window: u32) -> bool {
        if self.is_managed(window) {
            return false;
        }
        if self.placeholders.remove(&window).is_some() {
            // Back into the slot it had before the restart.
            let order = self.order_of(window);
            let position = self
                .managed
                .iter()
                .position(|&other| self.order_of(other) > order)
                .unwrap_or(self.managed.len());
            self.managed.insert(position, window);
        } else {
            self.managed.push(window);
        }
        true
    }

    fn unmanage(&mut self, window: u32) -> bool {
        let before = self.managed.len();
        self.managed.retain(|&other| other != window);
        before != self.managed.len()
    }

    fn prune_placeholders(&mut self) -> usize {
        let pruned = self.placeholders.len();
        self.placeholders.clear();
        pruned
    }

    fn managed_windows(&self) -> Vec<u32> {
        self.managed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manage_is_idempotent() {
        let mut tree = WindowTree::new();
        assert!(tree.manage(1));
        assert!(!tree.manage(1));
        assert_eq!(tree.managed_windows(), vec![1]);
        assert!(tree.unmanage(1));
        assert!(!tree.is_managed(1));
    }

    #[test]
    fn restored_windows_return_to_their_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart-state.json");

        let mut before = WindowTree::new();
        for window in [10, 20, 30] {
            before.manage(window);
        }
        before.persist(&path).unwrap();

        let mut after = WindowTree::new();
        after.restore(&path).unwrap();
        assert!(!after.is_managed(10));

        after.manage(30);
        after.manage(99);
        after.manage(10);
        after.manage(20);
        assert_eq!(after.managed_windows(), vec![10, 20, 30, 99]);
        assert_eq!(after.prune_placeholders(), 0);
    }

    #[test]
    fn unclaimed_placeholders_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart-state.json");
        fs::write(&path, r#"{"version":1,"windows":[1,2,3]}"#).unwrap();

        let mut tree = WindowTree::new();
        tree.restore(&path).unwrap();
        tree.manage(2);
        assert_eq!(tree.prune_placeholders(), 2);
        assert_eq!(tree.managed_windows(), vec![2]);
    }

    #[test]
    fn malformed_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart-state.json");
        fs::write(&path, "{ not json").unwrap();

        let mut tree = WindowTree::new();
        tree.manage(5);
        assert!(matches!(
            tree.restore(&path),
            Err(ManagerError::Snapshot { .. })
        ));
        assert_eq!(tree.managed_windows(), vec![5]);
    }

    #[test]
    fn missing_snapshot_is_rejected() {
        let mut tree = WindowTree::new();
        assert!(tree.restore(Path::new("/nonexistent/kestrel/snapshot")).is_err());
    }
}
