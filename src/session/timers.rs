//! Deadlines owned by one session.
//!
//! Timers are plain deadlines checked against an explicit `now`, so the state
//! machine stays free of I/O and the driver decides how to sleep. Deferred
//! sends live here too: they are cancelled with everything else when the
//! session ends, which is what keeps them off a closed connection.

use smallvec::SmallVec;
use web_time::Instant;

/// Named session timers, listed in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Session-wide safety net, armed once when the connection opens.
    Hard,
    /// Waiting for the connection to open.
    Connect,
    /// Waiting for the next transition out of the current state.
    State,
    /// Grace period after the last scripted turn.
    Close,
    /// Next keepalive ping.
    Keepalive,
}

impl TimerKind {
    const ORDER: [Self; 5] = [
        Self::Hard,
        Self::Connect,
        Self::State,
        Self::Close,
        Self::Keepalive,
    ];
}

/// Sends scheduled after a think-time delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredAction {
    SendQueue,
    SendReady,
    /// Play the current scripted turn, if it is still ours when this fires.
    SendMove,
}

/// Something that came due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fired {
    Timer(TimerKind),
    Deferred(DeferredAction),
}

#[derive(Debug, Clone, Copy)]
struct Deferred {
    due: Instant,
    action: DeferredAction,
}

#[derive(Debug, Clone, Default)]
pub struct SessionTimers {
    hard: Option<Instant>,
    connect: Option<Instant>,
    state: Option<Instant>,
    close: Option<Instant>,
    keepalive: Option<Instant>,
    deferred: SmallVec<[Deferred; 4]>,
}

impl SessionTimers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<Instant> {
        match kind {
            TimerKind::Hard => &mut self.hard,
            TimerKind::Connect => &mut self.connect,
            TimerKind::State => &mut self.state,
            TimerKind::Close => &mut self.close,
            TimerKind::Keepalive => &mut self.keepalive,
        }
    }

    /// Arms `kind` to fire at `at`, replacing any earlier deadline.
    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        *self.slot(kind) = Some(at);
    }

    pub fn disarm(&mut self, kind: TimerKind) {
        *self.slot(kind) = None;
    }

    #[must_use]
    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        match kind {
            TimerKind::Hard => self.hard,
            TimerKind::Connect => self.connect,
            TimerKind::State => self.state,
            TimerKind::Close => self.close,
            TimerKind::Keepalive => self.keepalive,
        }
    }

    /// Schedules `action` for `due`. An identical pending action is replaced.
    pub fn schedule(&mut self, action: DeferredAction, due: Instant) {
        self.deferred.retain(|d| d.action != action);
        self.deferred.push(Deferred { due, action });
    }

    #[must_use]
    pub fn is_scheduled(&self, action: DeferredAction) -> bool {
        self.deferred.iter().any(|d| d.action == action)
    }

    #[must_use]
    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Drops every timer and deferred action.
    pub fn cancel_all(&mut self) {
        *self = Self::default();
    }

    /// Earliest armed deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        TimerKind::ORDER
            .into_iter()
            .filter_map(|kind| self.deadline(kind))
            .chain(self.deferred.iter().map(|d| d.due))
            .min()
    }

    /// Removes and returns one thing that is due at `now`.
    ///
    /// Named timers win over deferred sends, in [`TimerKind`] order, so a hard
    /// timeout that is due always beats a send scheduled for the same instant.
    pub fn pop_due(&mut self, now: Instant) -> Option<Fired> {
        for kind in TimerKind::ORDER {
            let slot = self.slot(kind);
            if slot.is_some_and(|at| at <= now) {
                *slot = None;
                return Some(Fired::Timer(kind));
            }
        }
        let position = self
            .deferred
            .iter()
            .enumerate()
            .filter(|(_, d)| d.due <= now)
            .min_by_key(|(_, d)| d.due)
            .map(|(index, _)| index)?;
        let deferred = self.deferred.remove(position);
        Some(Fired::Deferred(deferred.action))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use web_time::Duration;

    #[test]
    fn nothing_due_before_deadline() {
        let start = Instant::now();
        let mut timers = SessionTimers::new();
        timers.arm(TimerKind::State, start + Duration::from_secs(1));
        assert_eq!(timers.pop_due(start), None);
        assert_eq!(timers.next_deadline(), Some(start + Duration::from_secs(1)));
    }

    #[test]
    fn hard_timeout_wins_ties() {
        let start = Instant::now();
        let due = start + Duration::from_millis(10);
        let mut timers = SessionTimers::new();
        timers.schedule(DeferredAction::SendQueue, due);
        timers.arm(TimerKind::Keepalive, due);
        timers.arm(TimerKind::Hard, due);
        assert_eq!(timers.pop_due(due), Some(Fired::Timer(TimerKind::Hard)));
        assert_eq!(timers.pop_due(due), Some(Fired::Timer(TimerKind::Keepalive)));
        assert_eq!(
            timers.pop_due(due),
            Some(Fired::Deferred(DeferredAction::SendQueue))
        );
        assert_eq!(timers.pop_due(due), None);
    }

    #[test]
    fn deferred_fire_in_due_order() {
        let start = Instant::now();
        let mut timers = SessionTimers::new();
        timers.schedule(DeferredAction::SendReady, start + Duration::from_millis(20));
        timers.schedule(DeferredAction::SendMove, start + Duration::from_millis(10));
        let later = start + Duration::from_millis(30);
        assert_eq!(
            timers.pop_due(later),
            Some(Fired::Deferred(DeferredAction::SendMove))
        );
        assert_eq!(
            timers.pop_due(later),
            Some(Fired::Deferred(DeferredAction::SendReady))
        );
    }

    #[test]
    fn rescheduling_replaces_pending_action() {
        let start = Instant::now();
        let mut timers = SessionTimers::new();
        timers.schedule(DeferredAction::SendQueue, start);
        timers.schedule(DeferredAction::SendQueue, start + Duration::from_secs(1));
        assert_eq!(timers.pending_deferred(), 1);
        assert_eq!(timers.pop_due(start), None);
    }

    #[test]
    fn cancel_all_clears_everything() {
        let start = Instant::now();
        let mut timers = SessionTimers::new();
        timers.arm(TimerKind::Hard, start);
        timers.schedule(DeferredAction::SendReady, start);
        timers.cancel_all();
        assert_eq!(timers.next_deadline(), None);
        assert!(!timers.is_scheduled(DeferredAction::SendReady));
    }
}
