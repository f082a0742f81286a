use serde::Serialize;

use crate::metrics::names;

/// Milestones asserted when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Milestone {
    Opened,
    Paired,
    GameStarted,
    BalanceUpdated,
    OpponentReady,
    TurnSwitched,
}

impl Milestone {
    /// Milestones whose absence at teardown fails the session.
    pub const ASSERTED: [Self; 6] = [
        Self::Opened,
        Self::Paired,
        Self::GameStarted,
        Self::BalanceUpdated,
        Self::OpponentReady,
        Self::TurnSwitched,
    ];

    /// Name of the check recorded for this milestone.
    #[must_use]
    pub const fn check_name(self) -> &'static str {
        match self {
            Self::Opened => names::CHECK_WS_OPENED,
            Self::Paired => names::CHECK_PAIRED,
            Self::GameStarted => names::CHECK_GAME_START,
            Self::BalanceUpdated => names::CHECK_BALANCE_UPDATE,
            Self::OpponentReady => names::CHECK_OPPONENT_READY,
            Self::TurnSwitched => names::CHECK_TURN_SWITCH,
        }
    }
}

/// Which milestone events a session has observed.
///
/// Flags are idempotent and only feed the end-of-session assertions, never
/// transition logic. `queued` is tracked but not asserted: a run that never
/// gets past the queue already fails on `paired`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneFlags {
    pub opened: bool,
    pub queued: bool,
    pub paired: bool,
    pub game_started: bool,
    pub balance_updated: bool,
    pub opponent_ready: bool,
    pub turn_switched: bool,
}

impl MilestoneFlags {
    #[must_use]
    pub const fn is_set(&self, milestone: Milestone) -> bool {
        match milestone {
            Milestone::Opened => self.opened,
            Milestone::Paired => self.paired,
            Milestone::GameStarted => self.game_started,
            Milestone::BalanceUpdated => self.balance_updated,
            Milestone::OpponentReady => self.opponent_ready,
            Milestone::TurnSwitched => self.turn_switched,
        }
    }

    /// Asserted milestones that were never observed.
    #[must_use]
    pub fn missing(&self) -> Vec<Milestone> {
        Milestone::ASSERTED
            .into_iter()
            .filter(|m| !self.is_set(*m))
            .collect()
    }
}
