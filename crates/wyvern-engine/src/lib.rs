//! Concurrent work scheduling for branching state-space exploration.
//!
//! This crate implements the pool machinery that lets an exploration engine
//! fan out over every decision point a program under test can take:
//!
//! 1. **Seed** one or more initial states into a shared registry
//! 2. A fixed pool of **execution units** acquires ready states, one at a
//!    time, with exclusive ownership
//! 3. Driving a state ends in an outcome: continue, **fork** into one child
//!    per decision branch, terminate with a reason, or fail
//! 4. Fork children land back in the ready list, where any standby unit
//!    picks them up — that is how exploration spreads across the pool
//! 5. The run ends when ready and busy drain empty, the kill flag is set,
//!    or every unit has retired
//!
//! # Architecture
//!
//! ```text
//!            seed                 acquire (exclusive)
//!   caller ───────▶ StateRegistry ◀──────────────────▶ unit 0..N
//!                     ready                              │
//!                     busy        fork children          │ advance loop
//!                     terminated ◀───────────────────────┘
//!                     killed
//! ```
//!
//! The registry is the only channel between units: nothing a state does can
//! reach a sibling except through its successors. That makes the pool safe
//! to run with one unit, N threads, or N child processes (the process
//! strategy proxies registry calls over a loopback service, see [`remote`]).
//!
//! # Example Usage
//!
//! ```no_run
//! use wyvern_engine::engine::{Engine, PoolConfig};
//! use wyvern_engine::report::format_report;
//! use wyvern_engine::state::{ExplorationState, StepOutcome};
//!
//! #[derive(Clone)]
//! struct Countdown(u32);
//!
//! impl ExplorationState for Countdown {
//!     type Condition = ();
//!     type Branch = ();
//!
//!     fn advance(&mut self) -> StepOutcome<Self> {
//!         if self.0 == 0 {
//!             return StepOutcome::Terminate("counted down".to_string());
//!         }
//!         self.0 -= 1;
//!         StepOutcome::Continue
//!     }
//! }
//!
//! let engine = Engine::new(PoolConfig::default());
//! engine.seed(&Countdown(10));
//! let report = engine.run().unwrap();
//! println!("{}", format_report(&report));
//! ```
//!
//! # Module Structure
//!
//! - [`state`] — the contract a domain implements to be explorable
//! - [`registry`] — shared state lists with single-owner handoff
//! - [`worker`] — the execution-unit run-loop and its backend seam
//! - [`engine`] — pool orchestration, run classification, reports
//! - [`remote`] — registry service and child-process units
//! - [`introspect`] — live log-dump and state-snapshot servers
//! - [`events`], [`cancel`], [`logbuf`], [`daemon`], [`report`] — support
//!
//! # Shutdown
//!
//! Shutdown is always cooperative. `Engine::kill` sets a one-way flag and
//! wakes blocked units; each unit checkpoints its in-flight state back to
//! the ready list and exits. Nothing is ever stopped mid-step.

pub mod cancel;
pub mod daemon;
pub mod engine;
pub mod events;
pub mod introspect;
pub mod logbuf;
pub mod registry;
pub mod remote;
pub mod report;
pub mod state;
pub mod worker;

// Re-export main types for convenience
pub use cancel::CancelToken;
pub use engine::{classify_run, Engine, EngineError, PoolConfig, RunReport, RunStatus, Watchdog};
pub use events::{EventLog, EventSink, NullSink, PoolEvent};
pub use logbuf::{BufferingLogger, LogBuffer};
pub use registry::{ListCounts, RegistryError, StateDescriptor, StateId, StateList, StateRegistry};
pub use state::{ExplorationState, ForkRequest, PolicyError, StateFailure, StepOutcome};
pub use worker::{run_unit, BackendError, UnitBackend, UnitExit, UnitId};
