//! One virtual player's trip through the game protocol.
//!
//! [`machine::PlayerSession`] holds all protocol logic and is driven with
//! explicit instants; [`driver`] connects it to a real websocket.

pub mod driver;
pub mod flags;
pub mod machine;
pub mod report;
pub mod state;
pub mod timers;

pub use driver::{
    interrupt_channel, run_iteration, run_iteration_until, InterruptSignal, Interrupter,
    SessionContext,
};
pub use flags::{Milestone, MilestoneFlags};
pub use machine::PlayerSession;
pub use report::SessionReport;
pub use state::{PlayerState, Termination};
pub use timers::{DeferredAction, Fired, SessionTimers, TimerKind};
