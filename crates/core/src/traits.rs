//! The state machine contract.

use crate::{Action, Event};
use std::time::Duration;

/// A synchronous, deterministic state machine.
///
/// Implementations mutate internal state but perform no I/O: every
/// external effect is described by a returned [`Action`], executed by the
/// runner. The runner sets the clock before each call, so handlers read
/// time without touching a system clock.
pub trait StateMachine {
    /// Process one event and return the actions it produced.
    fn handle(&mut self, event: &Event) -> Vec<Action>;

    /// Update the machine's notion of the current time.
    fn set_time(&mut self, now: Duration);
}
