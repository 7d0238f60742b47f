//! The execution-unit run-loop.
//!
//! A unit cycles through three phases:
//!
//! ```text
//! STANDBY  blocked in acquire, waiting for a ready state
//! RUNNING  driving one acquired state through advance steps
//! KILLED   loop exited (exhaustion, kill flag, or the unit retired)
//! ```
//!
//! The loop body is identical for every strategy; what differs is how the
//! unit reaches the coordinator. [`UnitBackend`] abstracts that seam: the
//! in-process strategies hand the loop the engine itself, the process
//! strategy hands it a registry-service client. Either way the registry is
//! the only channel between units — nothing a state does can reach another
//! unit except through its successors.
//!
//! Failure containment: each acquired state is driven under a panic
//! boundary. A panic in `advance` or in outcome handling kills that state
//! (save-and-kill, failure text as the reason) and retires the unit; the
//! rest of the pool keeps running.

use std::any::Any;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};

use log::{debug, error, warn};
use thiserror::Error;

use crate::events::PoolEvent;
use crate::registry::{RegistryError, StateId};
use crate::state::{ExplorationState, ForkRequest, StepOutcome};

/// Pool-assigned index of an execution unit.
pub type UnitId = usize;

/// How a unit's run-loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum UnitExit {
    /// Ready and busy drained empty; nothing left to explore.
    Exhausted,
    /// The kill flag was set; any in-flight state was checkpointed.
    Cancelled,
    /// The unit stopped early: a state failed unrecoverably, a panic was
    /// contained, or the backend broke underneath it.
    Retired,
}

/// The run-loop's view of the coordinator.
///
/// Local strategies implement this directly on the engine (infallible apart
/// from contract violations); the process strategy proxies every call over
/// the registry service, where any operation can fail with I/O errors.
/// Backends are shared across threads, so all methods take `&self`.
pub trait UnitBackend<S>: Send + Sync {
    /// Acquire the next ready state, `None` on exhaustion or kill.
    fn next_state(&self, wait: bool) -> Result<Option<(StateId, S)>, BackendError>;
    fn put_ready(&self, state: &S) -> Result<StateId, BackendError>;
    fn put_busy(&self, state: &S) -> Result<StateId, BackendError>;
    fn save(&self, id: StateId, state: &S) -> Result<(), BackendError>;
    fn revive(&self, id: StateId) -> Result<(), BackendError>;
    fn terminate(&self, id: StateId, reason: &str) -> Result<(), BackendError>;
    fn kill(&self, id: StateId, reason: &str) -> Result<(), BackendError>;
    fn discard(&self, id: StateId) -> Result<(), BackendError>;
    /// Whether the pool-wide kill flag is set.
    fn cancelled(&self) -> bool;
    /// Fire-and-forget lifecycle notification.
    fn publish(&self, event: PoolEvent);
}

/// A registry operation could not be carried out through the backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("registry service i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("registry service payload malformed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("registry service rejected the operation: {0}")]
    Rejected(String),
}

/// Drive one execution unit until its loop exits.
///
/// `wait` is passed through to acquire: pool strategies block for work,
/// the single-unit strategy polls (with one unit there is never anything
/// to wait for).
pub fn run_unit<S, B>(unit: UnitId, backend: &B, wait: bool) -> UnitExit
where
    S: ExplorationState,
    B: UnitBackend<S>,
{
    backend.publish(PoolEvent::WillStartWorker { unit });
    debug!("Unit {} starting", unit);

    let exit = acquire_loop(unit, backend, wait);

    backend.publish(PoolEvent::DidTerminateWorker { unit });
    debug!("Unit {} exiting: {:?}", unit, exit);
    exit
}

/// What one drive pass did with its state.
enum DriveEnd {
    /// State handed back to the registry; acquire another.
    Reacquire,
    /// State killed after an unrecoverable failure; the unit retires.
    Retire,
    /// Kill flag observed; state checkpointed and revived.
    Cancelled,
}

fn acquire_loop<S, B>(unit: UnitId, backend: &B, wait: bool) -> UnitExit
where
    S: ExplorationState,
    B: UnitBackend<S>,
{
    loop {
        let (id, state) = match backend.next_state(wait) {
            Ok(Some(acquired)) => acquired,
            Ok(None) => {
                return if backend.cancelled() {
                    UnitExit::Cancelled
                } else {
                    debug!("Unit {}: exploration exhausted", unit);
                    UnitExit::Exhausted
                };
            }
            Err(err) => {
                error!("Unit {}: backend failed in acquire: {}", unit, err);
                return UnitExit::Retired;
            }
        };
        debug!("Unit {} acquired state {}", unit, id);

        // The slot tracks ownership across the panic boundary: it is empty
        // exactly when the state has been handed back to the registry.
        let mut slot = Some((id, state));
        match catch_unwind(AssertUnwindSafe(|| drive(unit, backend, &mut slot))) {
            Ok(Ok(DriveEnd::Reacquire)) => continue,
            Ok(Ok(DriveEnd::Cancelled)) => return UnitExit::Cancelled,
            Ok(Ok(DriveEnd::Retire)) => return UnitExit::Retired,
            Ok(Err(err)) => {
                error!("Unit {}: backend failure while driving: {}", unit, err);
                return UnitExit::Retired;
            }
            Err(payload) => {
                let text = panic_text(payload.as_ref());
                error!("Unit {}: contained a panic: {}", unit, text);
                if let Some((id, state)) = slot.take() {
                    let reason = format!("panic: {}", text);
                    if let Err(err) = kill_state(backend, id, &state, &reason) {
                        error!("Unit {}: could not kill state {} after panic: {}", unit, id, err);
                    }
                }
                return UnitExit::Retired;
            }
        }
    }
}

/// Drive the slotted state until it leaves the unit's hands.
fn drive<S, B>(
    unit: UnitId,
    backend: &B,
    slot: &mut Option<(StateId, S)>,
) -> Result<DriveEnd, BackendError>
where
    S: ExplorationState,
    B: UnitBackend<S>,
{
    loop {
        if backend.cancelled() {
            let (id, state) = slot.take().unwrap();
            debug!("Unit {}: kill flag set, checkpointing state {}", unit, id);
            backend.save(id, &state)?;
            backend.revive(id)?;
            return Ok(DriveEnd::Cancelled);
        }

        let id = slot.as_ref().unwrap().0;
        let outcome = slot.as_mut().unwrap().1.advance();
        match outcome {
            StepOutcome::Continue => {}
            StepOutcome::Fork(request) => {
                handle_fork(unit, backend, slot, request)?;
                if slot.is_none() {
                    return Ok(DriveEnd::Reacquire);
                }
            }
            StepOutcome::Terminate(reason) => {
                let (_, state) = slot.take().unwrap();
                debug!("Unit {}: state {} terminated: {}", unit, id, reason);
                terminate_state(backend, id, &state, &reason)?;
                return Ok(DriveEnd::Reacquire);
            }
            StepOutcome::Fail(failure) => {
                let (_, state) = slot.take().unwrap();
                warn!("Unit {}: state {} failed: {}", unit, id, failure);
                kill_state(backend, id, &state, &failure.to_string())?;
                return Ok(DriveEnd::Retire);
            }
        }
    }
}

/// Resolve a fork request into successor states.
///
/// On return the slot holds the child the unit keeps driving, if any: a
/// single resolved branch is admitted straight into busy and stays with the
/// unit (there is no scheduling choice to make); multiple branches all
/// enter ready, since picking a favorite would smuggle scheduling policy
/// into the run-loop.
///
/// The parent stays in the slot while the embedder's policy and materialize
/// callbacks run, so a panic inside either is caught with the id still
/// recoverable and the panic boundary can save-and-kill it. Children are
/// inserted before the parent is discarded so a blocked acquirer never
/// observes ready and busy both empty in mid-fork.
fn handle_fork<S, B>(
    unit: UnitId,
    backend: &B,
    slot: &mut Option<(StateId, S)>,
    request: ForkRequest<S>,
) -> Result<(), BackendError>
where
    S: ExplorationState,
    B: UnitBackend<S>,
{
    let ForkRequest {
        condition,
        policy,
        materialize,
    } = request;
    let id = slot.as_ref().unwrap().0;

    let branches = match policy(&condition) {
        Ok(branches) => branches,
        Err(err) => {
            // A bad decision point condemns the state, not the unit.
            warn!("Unit {}: branch policy failed on state {}: {}", unit, id, err);
            let (_, parent) = slot.take().unwrap();
            kill_state(backend, id, &parent, &err.to_string())?;
            return Ok(());
        }
    };

    if branches.is_empty() {
        debug!("Unit {}: state {} has no feasible branch", unit, id);
        let (_, parent) = slot.take().unwrap();
        terminate_state(backend, id, &parent, "fork condition unsatisfiable")?;
        return Ok(());
    }

    backend.publish(PoolEvent::WillForkState {
        id,
        branches: branches.len(),
    });

    let keep = branches.len() == 1;
    let mut children = Vec::with_capacity(branches.len());
    let mut kept = None;
    for branch in &branches {
        let mut child = slot.as_ref().unwrap().1.clone();
        materialize(&mut child, branch);
        if keep {
            let child_id = backend.put_busy(&child)?;
            children.push(child_id);
            kept = Some((child_id, child));
        } else {
            children.push(backend.put_ready(&child)?);
        }
    }

    backend.discard(id)?;
    *slot = kept;
    backend.publish(PoolEvent::DidForkState {
        id,
        children: children.clone(),
    });
    debug!(
        "Unit {}: state {} forked into {} children {:?}",
        unit,
        id,
        children.len(),
        children
    );
    Ok(())
}

fn terminate_state<S, B>(backend: &B, id: StateId, state: &S, reason: &str) -> Result<(), BackendError>
where
    B: UnitBackend<S>,
{
    backend.publish(PoolEvent::WillTerminateState {
        id,
        reason: reason.to_string(),
    });
    backend.save(id, state)?;
    backend.terminate(id, reason)?;
    backend.publish(PoolEvent::DidTerminateState { id });
    Ok(())
}

fn kill_state<S, B>(backend: &B, id: StateId, state: &S, reason: &str) -> Result<(), BackendError>
where
    B: UnitBackend<S>,
{
    backend.publish(PoolEvent::WillKillState {
        id,
        reason: reason.to_string(),
    });
    backend.save(id, state)?;
    backend.kill(id, reason)?;
    backend.publish(PoolEvent::DidKillState { id });
    Ok(())
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
