//! The advance contract between the scheduler and the analysis engine.
//!
//! The scheduler never looks inside an exploration state. It only clones
//! states for checkpointing, hands them to execution units, and dispatches
//! on the [`StepOutcome`] each advance step returns:
//!
//! - [`StepOutcome::Continue`] — the path is still live, keep driving.
//! - [`StepOutcome::Fork`] — a decision point was reached; the carried
//!   [`ForkRequest`] says how to resolve it into successor states.
//! - [`StepOutcome::Terminate`] — the path ended normally, with a reason.
//! - [`StepOutcome::Fail`] — the path is unrecoverable; the state is killed
//!   and the unit driving it retires.
//!
//! Outcomes are plain values, not unwind-based control flow, so the run-loop
//! can dispatch on them with an ordinary `match`.

use thiserror::Error;

/// A unit of analysis work representing one path through the system under
/// analysis.
///
/// Implementations must be cheap enough to clone that the registry can keep
/// a checkpoint copy of every state it tracks; the scheduler clones on every
/// hand-off. Execution units running in child processes additionally require
/// `serde::Serialize + DeserializeOwned` (see the `remote` module).
pub trait ExplorationState: Clone + Send + 'static {
    /// The symbolic condition carried by a fork decision point.
    type Condition: Send;

    /// One resolved outcome of a fork condition.
    type Branch: Send;

    /// Advance this path by one step.
    fn advance(&mut self) -> StepOutcome<Self>;
}

/// What a single advance step produced.
pub enum StepOutcome<S: ExplorationState> {
    /// The step completed normally; the unit keeps driving.
    Continue,
    /// The path splits; successors are described by the request.
    Fork(ForkRequest<S>),
    /// The path reached an end condition.
    Terminate(String),
    /// The path failed unrecoverably.
    Fail(StateFailure),
}

/// Resolves a fork condition into the finite set of branches worth
/// exploring. Scheduling policy lives entirely in this function; the
/// run-loop only counts the branches it returns.
pub type BranchPolicy<C, B> = Box<dyn FnOnce(&C) -> Result<Vec<B>, PolicyError> + Send>;

/// Specializes a clone of the forking parent into the successor for one
/// resolved branch.
pub type Materializer<S, B> = Box<dyn Fn(&mut S, &B) + Send>;

/// Everything the run-loop needs to fork a state: the condition that caused
/// the split, the policy that resolves it, and the callback that builds each
/// successor from a copy of the parent.
pub struct ForkRequest<S: ExplorationState> {
    /// The symbolic condition at the decision point.
    pub condition: S::Condition,
    /// Resolves the condition into concrete branches.
    pub policy: BranchPolicy<S::Condition, S::Branch>,
    /// Builds one successor per branch from a clone of the parent.
    pub materialize: Materializer<S, S::Branch>,
}

/// An unrecoverable failure raised by a state's advance step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StateFailure {
    /// Human-readable description, recorded as the killed state's reason.
    pub message: String,
}

impl StateFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A branch-resolution policy could not resolve a fork condition.
///
/// Policy errors kill the offending state but never retire the unit or the
/// pool (the decision point was bad, not the scheduler).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("branch resolution failed: {message}")]
pub struct PolicyError {
    pub message: String,
}

impl PolicyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Countdown {
        remaining: u32,
    }

    impl ExplorationState for Countdown {
        type Condition = ();
        type Branch = ();

        fn advance(&mut self) -> StepOutcome<Self> {
            if self.remaining == 0 {
                return StepOutcome::Terminate("counted down".to_string());
            }
            self.remaining -= 1;
            StepOutcome::Continue
        }
    }

    #[test]
    fn advance_counts_down_to_terminate() {
        let mut state = Countdown { remaining: 2 };
        assert!(matches!(state.advance(), StepOutcome::Continue));
        assert!(matches!(state.advance(), StepOutcome::Continue));
        match state.advance() {
            StepOutcome::Terminate(reason) => assert_eq!(reason, "counted down"),
            _ => panic!("expected terminate"),
        }
    }

    #[test]
    fn failure_text_is_the_display() {
        let failure = StateFailure::new("guest page fault at 0xdead");
        assert_eq!(failure.to_string(), "guest page fault at 0xdead");

        let policy = PolicyError::new("unsat condition");
        assert_eq!(
            policy.to_string(),
            "branch resolution failed: unsat condition"
        );
    }

    #[test]
    fn fork_request_resolves_and_materializes() {
        let request: ForkRequest<Countdown> = ForkRequest {
            condition: (),
            policy: Box::new(|_| Ok(vec![(), ()])),
            materialize: Box::new(|state, _branch| state.remaining = 7),
        };

        let branches = (request.policy)(&request.condition).unwrap();
        assert_eq!(branches.len(), 2);

        let parent = Countdown { remaining: 1 };
        let mut child = parent.clone();
        (request.materialize)(&mut child, &branches[0]);
        assert_eq!(child.remaining, 7);
    }
}
