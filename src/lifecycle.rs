use std::fmt;

/// Coarse process lifecycle. A fresh image always starts at `Bootstrapping`;
/// inside one image the phase only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Bootstrapping,
    Negotiating,
    RestoringOrBuildingTree,
    ReconcilingExistingWindows,
    Running,
    RestartRequested,
    ShuttingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Bootstrapping => "bootstrapping",
            Phase::Negotiating => "negotiating",
            Phase::RestoringOrBuildingTree => "restoring-or-building-tree",
            Phase::ReconcilingExistingWindows => "reconciling-existing-windows",
            Phase::Running => "running",
            Phase::RestartRequested => "restart-requested",
            Phase::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    phase: Phase,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            phase: Phase::Bootstrapping,
        }
    }
}

impl Lifecycle {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to `next`. Returns false (and stays put) on a backwards move.
    pub fn advance(&mut self, next: Phase) -> bool {
        if next < self.phase {
            tracing::error!(from = %self.phase, to = %next, "refusing backwards lifecycle transition");
            return false;
        }
        if next != self.phase {
            tracing::debug!(from = %self.phase, to = %next, "lifecycle transition");
            self.phase = next;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_forward_through_bootstrap() {
        let mut lifecycle = Lifecycle::default();
        for phase in [
            Phase::Negotiating,
            Phase::RestoringOrBuildingTree,
            Phase::ReconcilingExistingWindows,
            Phase::Running,
            Phase::RestartRequested,
        ] {
            assert!(lifecycle.advance(phase));
            assert_eq!(lifecycle.phase(), phase);
        }
    }

    #[test]
    fn rejects_backwards_moves() {
        let mut lifecycle = Lifecycle::default();
        assert!(lifecycle.advance(Phase::Running));
        assert!(!lifecycle.advance(Phase::Negotiating));
        assert_eq!(lifecycle.phase(), Phase::Running);
        assert!(lifecycle.advance(Phase::ShuttingDown));
    }
}
