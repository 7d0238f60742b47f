//! The engine: registry ownership, pool orchestration, run classification.
//!
//! An [`Engine`] owns everything a run shares: the state registry, the kill
//! flag, the event sink, and the log buffer feeding the introspection
//! servers. It is cheaply cloneable (all shared parts sit behind `Arc`), and
//! it implements [`UnitBackend`] itself, so in-process execution units drive
//! the run-loop directly against it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::events::{EventSink, NullSink, PoolEvent};
use crate::logbuf::LogBuffer;
use crate::registry::{ListCounts, StateId, StateRegistry};
use crate::state::ExplorationState;
use crate::worker::{run_unit, BackendError, UnitBackend, UnitExit, UnitId};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("could not spawn a pool thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Pool-level knobs for a run.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How many execution units `run` drives in parallel.
    pub units: usize,
    /// Wall-clock budget; when it elapses a watchdog sets the kill flag and
    /// the run winds down cooperatively.
    pub timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            units: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            timeout: None,
        }
    }
}

/// How a finished run is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Every path was explored to an end state.
    Exhausted,
    /// The kill flag stopped the run; unexplored work was checkpointed.
    Cancelled,
    /// Some units retired early but others finished the exploration.
    Degraded,
    /// Every unit retired; the run made no further progress.
    Failed,
}

/// Classify a finished run from the kill flag and the unit exits.
pub fn classify_run(cancelled: bool, exits: &[UnitExit]) -> RunStatus {
    if !exits.is_empty() && exits.iter().all(|e| *e == UnitExit::Retired) {
        RunStatus::Failed
    } else if cancelled {
        RunStatus::Cancelled
    } else if exits.iter().any(|e| *e == UnitExit::Retired) {
        RunStatus::Degraded
    } else {
        RunStatus::Exhausted
    }
}

/// Outcome summary of one `run` call.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    /// Exit of each unit, indexed by unit id.
    pub unit_exits: Vec<UnitExit>,
    /// Registry list sizes when the pool stopped.
    pub counts: ListCounts,
    pub wall_time: Duration,
}

/// Shared coordinator for one exploration run.
pub struct Engine<S> {
    registry: Arc<StateRegistry<S>>,
    cancel: CancelToken,
    sink: Arc<dyn EventSink>,
    log_buffer: Arc<LogBuffer>,
    config: PoolConfig,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            cancel: self.cancel.clone(),
            sink: self.sink.clone(),
            log_buffer: self.log_buffer.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: ExplorationState> Engine<S> {
    pub fn new(config: PoolConfig) -> Self {
        let cancel = CancelToken::new();
        Self {
            registry: Arc::new(StateRegistry::new(cancel.clone())),
            cancel,
            sink: Arc::new(NullSink),
            log_buffer: Arc::new(LogBuffer::default()),
            config,
        }
    }

    /// Replace the event sink (default drops everything).
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Share the log buffer the global logger tees into, so the log dump
    /// server serves real records.
    pub fn with_log_buffer(mut self, buffer: Arc<LogBuffer>) -> Self {
        self.log_buffer = buffer;
        self
    }

    /// Admit an initial state into the ready list.
    pub fn seed(&self, state: &S) -> StateId {
        let id = self.registry.put_ready(state);
        debug!("Seeded state {}", id);
        id
    }

    /// Request cooperative shutdown: set the kill flag and wake every unit
    /// blocked in acquire. Idempotent.
    pub fn kill(&self) {
        info!("Kill requested, waking blocked units");
        self.cancel.cancel();
        self.registry.wake_all();
    }

    /// A handle on the run's kill flag, for signal handlers and watchdogs.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> Arc<StateRegistry<S>> {
        self.registry.clone()
    }

    pub fn log_buffer(&self) -> Arc<LogBuffer> {
        self.log_buffer.clone()
    }

    /// Spawn one execution unit on its own thread.
    pub fn spawn_unit_thread(&self, unit: UnitId) -> io::Result<thread::JoinHandle<UnitExit>> {
        let engine = self.clone();
        thread::Builder::new()
            .name(format!("wyvern-unit-{}", unit))
            .spawn(move || run_unit(unit, &engine, true))
    }

    /// Drive the pool with `config.units` threads until exploration ends.
    pub fn run(&self) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        info!("Starting pool: {} units", self.config.units);

        let watchdog = match self.config.timeout {
            Some(timeout) => Some(Watchdog::arm(self.clone(), timeout)?),
            None => None,
        };

        let mut handles = Vec::with_capacity(self.config.units);
        for unit in 0..self.config.units {
            handles.push(self.spawn_unit_thread(unit)?);
        }
        let unit_exits: Vec<UnitExit> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(UnitExit::Retired))
            .collect();

        if let Some(watchdog) = watchdog {
            watchdog.disarm();
        }

        Ok(self.finish(started, unit_exits))
    }

    /// Drive exploration inline on the calling thread with a single unit.
    pub fn run_single(&self) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        info!("Starting single-unit run");

        let watchdog = match self.config.timeout {
            Some(timeout) => Some(Watchdog::arm(self.clone(), timeout)?),
            None => None,
        };

        // One unit never has a peer to wait on, so acquire polls.
        let exit = run_unit(0, self, false);

        if let Some(watchdog) = watchdog {
            watchdog.disarm();
        }

        Ok(self.finish(started, vec![exit]))
    }

    fn finish(&self, started: Instant, unit_exits: Vec<UnitExit>) -> RunReport {
        let status = classify_run(self.cancel.is_cancelled(), &unit_exits);
        let counts = self.registry.counts();
        let wall_time = started.elapsed();
        info!(
            "Run {:?}: {} terminated, {} killed, {} left ready in {:?}",
            status, counts.terminated, counts.killed, counts.ready, wall_time
        );
        RunReport {
            status,
            unit_exits,
            counts,
            wall_time,
        }
    }
}

impl<S: ExplorationState> UnitBackend<S> for Engine<S> {
    fn next_state(&self, wait: bool) -> Result<Option<(StateId, S)>, BackendError> {
        Ok(self.registry.get_state(wait))
    }

    fn put_ready(&self, state: &S) -> Result<StateId, BackendError> {
        Ok(self.registry.put_ready(state))
    }

    fn put_busy(&self, state: &S) -> Result<StateId, BackendError> {
        Ok(self.registry.put_busy(state))
    }

    fn save(&self, id: StateId, state: &S) -> Result<(), BackendError> {
        Ok(self.registry.save(id, state)?)
    }

    fn revive(&self, id: StateId) -> Result<(), BackendError> {
        Ok(self.registry.revive(id)?)
    }

    fn terminate(&self, id: StateId, reason: &str) -> Result<(), BackendError> {
        Ok(self.registry.terminate(id, reason)?)
    }

    fn kill(&self, id: StateId, reason: &str) -> Result<(), BackendError> {
        Ok(self.registry.kill(id, reason)?)
    }

    fn discard(&self, id: StateId) -> Result<(), BackendError> {
        Ok(self.registry.discard(id)?)
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn publish(&self, event: PoolEvent) {
        self.sink.publish(event);
    }
}

/// Background thread that kills the run when the wall-clock budget elapses.
///
/// `run`/`run_single` arm one automatically from `PoolConfig.timeout`;
/// embedders driving units themselves (the process strategy does) arm and
/// disarm it around their own pool loop.
pub struct Watchdog {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Watchdog {
    pub fn arm<S: ExplorationState>(engine: Engine<S>, timeout: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let watchdog_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("wyvern-watchdog".to_string())
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                while !watchdog_stop.load(Ordering::SeqCst) {
                    if Instant::now() >= deadline {
                        warn!("Run timeout of {:?} elapsed, requesting kill", timeout);
                        engine.kill();
                        return;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            })?;
        Ok(Self { stop, handle })
    }

    /// Stop the watchdog without killing the run, and join its thread.
    pub fn disarm(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}
