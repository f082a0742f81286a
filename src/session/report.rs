use std::fmt;

use serde::Serialize;

use crate::protocol::PlayerId;
use crate::session::flags::{Milestone, MilestoneFlags};
use crate::session::state::{PlayerState, Termination};

/// Outcome of one virtual-user iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[must_use = "SessionReport should be inspected or tallied"]
pub struct SessionReport {
    pub vu: u64,
    pub iteration: u64,
    pub player_id: Option<PlayerId>,
    /// Furthest state reached.
    pub final_state: PlayerState,
    pub turn_index: usize,
    pub flags: MilestoneFlags,
    /// Asserted milestones never observed before teardown.
    pub failed_checks: Vec<Milestone>,
    pub termination: Termination,
}

impl SessionReport {
    /// Report for an iteration whose bootstrap call failed.
    pub fn bootstrap_failed(vu: u64, iteration: u64, context: impl Into<String>) -> Self {
        Self::unstarted(
            vu,
            iteration,
            Termination::BootstrapFailed {
                context: context.into(),
            },
        )
    }

    /// Report for an iteration that ended before its session existed.
    pub fn unstarted(vu: u64, iteration: u64, termination: Termination) -> Self {
        Self {
            vu,
            iteration,
            player_id: None,
            final_state: PlayerState::Offline,
            turn_index: 0,
            flags: MilestoneFlags::default(),
            failed_checks: Vec::new(),
            termination,
        }
    }

    /// An iteration passes when every milestone was observed and it did not
    /// end in a fatal way.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failed_checks.is_empty() && !self.termination.is_fatal()
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vu={} iteration={} state={} turns={} termination={}",
            self.vu, self.iteration, self.final_state, self.turn_index, self.termination
        )?;
        if !self.failed_checks.is_empty() {
            let names: Vec<&str> = self.failed_checks.iter().map(|m| m.check_name()).collect();
            write!(f, " failed=[{}]", names.join(", "))?;
        }
        Ok(())
    }
}
