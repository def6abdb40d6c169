//! The cooperative transaction state machine.
//!
//! Single-threaded and event-driven: [`Machine::execute`] runs the
//! current state's action, which returns [`ActionResult::Continue`] to
//! suspend the machine until an [`Event`] is fired, or forces a jump
//! straight to a terminal state with `Abort`/`Done`. Transition tables
//! are data, validated once at construction.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Every state a transaction machine can be in.
///
/// `Completed`, `Error`, and `Cancelled` are reserved terminals; the
/// rest are operation states wired up by the per-kind transition sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateId {
    /// Validate preconditions.
    PreCheck,
    /// Fetch the pack.
    Download,
    /// Back-off companion of `Download`.
    DownloadRetry,
    /// Verify signatures and digests.
    Verify,
    /// Resolve and wait on dependencies.
    Dependencies,
    /// Wait companion of `Dependencies`.
    DependenciesWait,
    /// Place the pack's files.
    Install,
    /// Mount the pack.
    Mount,
    /// Load kernel or service modules.
    Load,
    /// Start the pack's services.
    StartServices,
    /// Generate command wrappers.
    GenerateWrappers,
    /// Remove command wrappers.
    RemoveWrappers,
    /// Stop the pack's services.
    StopServices,
    /// Unload kernel or service modules.
    Unload,
    /// Unmount the pack.
    Unmount,
    /// Remove the pack's files.
    Uninstall,
    /// Swap pack contents in place.
    Update,
    /// Terminal: the operation succeeded.
    Completed,
    /// Terminal: the operation failed.
    Error,
    /// Terminal: the user cancelled.
    Cancelled,
}

impl StateId {
    /// Whether this state ends the machine.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// Events that drive transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// The state's work succeeded; advance.
    Ok,
    /// Enter the state's wait companion.
    Wait,
    /// Enter the state's retry companion.
    Retry,
    /// The state's work failed; go to Error.
    Failed,
    /// The user cancelled; go to Cancelled.
    Cancel,
}

/// What a state action tells the machine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    /// Suspend; a later [`Machine::event`] decides the transition.
    Continue,
    /// Force the machine to `Error` regardless of transitions.
    Abort,
    /// Force the machine to `Completed` regardless of transitions.
    Done,
}

/// A state action, run once per [`Machine::execute`] visit.
pub type Action<C> = Box<dyn FnMut(&mut C) -> ActionResult>;

/// One state: id, action, and its outgoing transitions.
pub struct State<C> {
    /// This state's id.
    pub id: StateId,
    /// Work performed when the machine executes this state.
    pub action: Action<C>,
    /// Ordered `(event, target)` pairs; first match wins.
    pub transitions: Vec<(Event, StateId)>,
}

impl<C> std::fmt::Debug for State<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("transitions", &self.transitions)
            .finish_non_exhaustive()
    }
}

/// Result of one [`Machine::execute`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The action ran and the machine awaits an event.
    AwaitingEvent,
    /// The machine reached a terminal state.
    Terminal(StateId),
}

/// A validated machine over a context type `C`.
pub struct Machine<C> {
    /// The transition table.
    states: Vec<State<C>>,
    /// Current state id.
    current: StateId,
    /// Set after an action returns `Continue`; cleared by `event`.
    awaiting_event: bool,
}

impl<C> std::fmt::Debug for Machine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("current", &self.current)
            .field("states", &self.states.len())
            .finish_non_exhaustive()
    }
}

impl<C> Machine<C> {
    /// Builds a machine starting at `initial`.
    ///
    /// Validation is structural: the initial state must exist, every
    /// transition target must exist or be a terminal, and every
    /// non-terminal state must carry a `Failed` transition.
    pub fn new(states: Vec<State<C>>, initial: StateId) -> Result<Self> {
        if !states.iter().any(|s| s.id == initial) {
            return Err(Error::UnknownState(initial));
        }
        for state in &states {
            if !state.transitions.iter().any(|(e, _)| *e == Event::Failed) {
                return Err(Error::MissingFailedTransition(state.id));
            }
            for (_, target) in &state.transitions {
                if !target.is_terminal() && !states.iter().any(|s| s.id == *target) {
                    return Err(Error::UnknownState(*target));
                }
            }
        }
        Ok(Self {
            states,
            current: initial,
            awaiting_event: false,
        })
    }

    /// Rebuilds a machine at a persisted state.
    pub fn resume_at(states: Vec<State<C>>, current: StateId) -> Result<Self> {
        if current.is_terminal() {
            return Err(Error::Terminal(current));
        }
        Self::new(states, current)
    }

    /// Current state id.
    pub const fn current(&self) -> StateId {
        self.current
    }

    /// Runs the current state's action.
    ///
    /// A no-op when the machine is terminal or already suspended
    /// awaiting an event; actions run at most once per visit.
    pub fn execute(&mut self, ctx: &mut C) -> Result<ExecOutcome> {
        if self.current.is_terminal() {
            return Ok(ExecOutcome::Terminal(self.current));
        }
        if self.awaiting_event {
            return Ok(ExecOutcome::AwaitingEvent);
        }

        let current = self.current;
        let state = self
            .states
            .iter_mut()
            .find(|s| s.id == current)
            .ok_or(Error::UnknownState(current))?;

        match (state.action)(ctx) {
            ActionResult::Continue => {
                self.awaiting_event = true;
                Ok(ExecOutcome::AwaitingEvent)
            }
            ActionResult::Abort => {
                debug!(state = ?current, "action aborted");
                self.current = StateId::Error;
                Ok(ExecOutcome::Terminal(StateId::Error))
            }
            ActionResult::Done => {
                self.current = StateId::Completed;
                Ok(ExecOutcome::Terminal(StateId::Completed))
            }
        }
    }

    /// Fires an event: the first matching transition sets the new state.
    ///
    /// `Cancel` is accepted in every non-terminal state; a state without
    /// a recorded `Cancel` transition goes straight to `Cancelled`.
    pub fn event(&mut self, event: Event) -> Result<StateId> {
        if self.current.is_terminal() {
            return Err(Error::Terminal(self.current));
        }
        let state = self
            .states
            .iter()
            .find(|s| s.id == self.current)
            .ok_or(Error::UnknownState(self.current))?;

        let target = match state.transitions.iter().find(|(e, _)| *e == event) {
            Some((_, target)) => *target,
            None if event == Event::Cancel => StateId::Cancelled,
            None => {
                return Err(Error::NoTransition {
                    state: self.current,
                    event,
                });
            }
        };
        debug!(from = ?self.current, ?event, to = ?target, "transition");
        self.current = target;
        self.awaiting_event = false;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(_: &mut ()) -> ActionResult {
        ActionResult::Continue
    }

    fn tiny() -> Vec<State<()>> {
        vec![
            State {
                id: StateId::PreCheck,
                action: Box::new(pass),
                transitions: vec![
                    (Event::Ok, StateId::Download),
                    (Event::Failed, StateId::Error),
                ],
            },
            State {
                id: StateId::Download,
                action: Box::new(pass),
                transitions: vec![
                    (Event::Ok, StateId::Completed),
                    (Event::Failed, StateId::Error),
                ],
            },
        ]
    }

    #[test]
    fn missing_failed_transition_is_rejected() {
        let states = vec![State {
            id: StateId::PreCheck,
            action: Box::new(pass),
            transitions: vec![(Event::Ok, StateId::Completed)],
        }];
        assert!(matches!(
            Machine::new(states, StateId::PreCheck),
            Err(Error::MissingFailedTransition(StateId::PreCheck))
        ));
    }

    #[test]
    fn unknown_transition_target_is_rejected() {
        let states = vec![State {
            id: StateId::PreCheck,
            action: Box::new(pass),
            transitions: vec![
                (Event::Ok, StateId::Download),
                (Event::Failed, StateId::Error),
            ],
        }];
        assert!(matches!(
            Machine::new(states, StateId::PreCheck),
            Err(Error::UnknownState(StateId::Download))
        ));
    }

    #[test]
    fn abort_forces_error_regardless_of_transitions() {
        let mut states = tiny();
        states[0].action = Box::new(|(): &mut ()| ActionResult::Abort);
        let mut m = Machine::new(states, StateId::PreCheck).unwrap();
        assert_eq!(
            m.execute(&mut ()).unwrap(),
            ExecOutcome::Terminal(StateId::Error)
        );
        assert!(matches!(
            m.event(Event::Ok),
            Err(Error::Terminal(StateId::Error))
        ));
    }

    #[test]
    fn done_forces_completed() {
        let mut states = tiny();
        states[0].action = Box::new(|(): &mut ()| ActionResult::Done);
        let mut m = Machine::new(states, StateId::PreCheck).unwrap();
        assert_eq!(
            m.execute(&mut ()).unwrap(),
            ExecOutcome::Terminal(StateId::Completed)
        );
    }

    #[test]
    fn cancel_falls_back_to_cancelled() {
        let mut m = Machine::new(tiny(), StateId::PreCheck).unwrap();
        m.execute(&mut ()).unwrap();
        assert_eq!(m.event(Event::Cancel).unwrap(), StateId::Cancelled);
    }

    #[test]
    fn action_runs_once_per_visit() {
        let mut count = 0u32;
        let states = vec![State {
            id: StateId::PreCheck,
            action: Box::new(move |counter: &mut u32| {
                *counter += 1;
                ActionResult::Continue
            }),
            transitions: vec![
                (Event::Ok, StateId::Completed),
                (Event::Failed, StateId::Error),
            ],
        }];
        let mut m = Machine::new(states, StateId::PreCheck).unwrap();
        m.execute(&mut count).unwrap();
        m.execute(&mut count).unwrap();
        assert_eq!(count, 1);
    }
}
