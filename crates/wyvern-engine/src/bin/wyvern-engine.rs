//! Demo CLI for the wyvern exploration engine.
//!
//! Explores a synthetic branching workload (a seeded random walk over a
//! bounded tree) so the scheduling machinery can be exercised end to end
//! without a real execution engine on top.
//!
//! # Usage
//!
//! ```bash
//! # Explore with one thread per core
//! wyvern-engine run
//!
//! # Deterministic single-unit run with a fixed workload seed
//! wyvern-engine run --strategy single --seed 7
//!
//! # One child process per unit, registry served over loopback
//! wyvern-engine run --strategy process --units 4
//!
//! # Cap the run and emit the report as JSON
//! wyvern-engine run --timeout-secs 30 --json
//! ```
//!
//! While a run is live, `nc 127.0.0.1 3214` dumps buffered log records and
//! `nc 127.0.0.1 3215` dumps a state snapshot (see `wyvern_wire` for the
//! framing).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use log::{debug, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use wyvern_engine::engine::{classify_run, Engine, PoolConfig, RunReport, RunStatus, Watchdog};
use wyvern_engine::introspect::IntrospectionServers;
use wyvern_engine::logbuf::BufferingLogger;
use wyvern_engine::remote::{
    exit_code, run_remote_unit, serve_registry, spawn_unit_process, unit_exit_from_status,
};
use wyvern_engine::report::{format_report, json_report};
use wyvern_engine::state::{ExplorationState, ForkRequest, StepOutcome};

#[derive(Parser)]
#[command(name = "wyvern-engine")]
#[command(about = "Work-scheduling demo: branching state-space exploration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Explore the built-in demo workload.
    Run {
        /// Scheduling strategy: "single", "thread", or "process".
        #[arg(short, long, default_value = "thread")]
        strategy: String,

        /// Execution units to drive (0 = one per core).
        #[arg(short, long, default_value = "0")]
        units: usize,

        /// Workload seed; the same seed explores the same tree.
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Depth bound: walks terminate after this many forks.
        #[arg(long, default_value = "6")]
        depth: u32,

        /// Maximum branches per fork (1-8).
        #[arg(long, default_value = "3")]
        fanout: u8,

        /// Kill the run after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Port for the log-dump server (snapshots bind port + 1).
        #[arg(long, default_value_t = wyvern_wire::DEFAULT_LOG_PORT)]
        log_port: u16,

        /// Don't start the introspection servers.
        #[arg(long)]
        no_servers: bool,

        /// Print the report as pretty JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Child worker entry, spawned by the process strategy.
    #[command(hide = true)]
    Worker {
        /// Pool-assigned unit index.
        #[arg(long)]
        unit: usize,

        /// Registry service port on 127.0.0.1.
        #[arg(long)]
        port: u16,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            strategy,
            units,
            seed,
            depth,
            fanout,
            timeout_secs,
            log_port,
            no_servers,
            json,
        } => cmd_run(
            strategy,
            units,
            seed,
            depth,
            fanout,
            timeout_secs,
            log_port,
            no_servers,
            json,
        ),
        Commands::Worker { unit, port } => cmd_worker(unit, port),
    }
}

#[derive(Clone, Copy)]
enum Strategy {
    Single,
    Thread,
    Process,
}

impl Strategy {
    fn label(self) -> &'static str {
        match self {
            Strategy::Single => "single",
            Strategy::Thread => "thread",
            Strategy::Process => "process",
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    strategy: String,
    units: usize,
    seed: u64,
    depth: u32,
    fanout: u8,
    timeout_secs: Option<u64>,
    log_port: u16,
    no_servers: bool,
    json: bool,
) {
    // The buffering logger feeds the log-dump server.
    let buffer = match BufferingLogger::init() {
        Ok(buffer) => buffer,
        Err(err) => {
            eprintln!("Error: logger already installed: {}", err);
            std::process::exit(1);
        }
    };

    // Validate inputs
    let strategy = match strategy.as_str() {
        "single" | "s" => Strategy::Single,
        "thread" | "threads" | "t" => Strategy::Thread,
        "process" | "procs" | "p" => Strategy::Process,
        other => {
            eprintln!(
                "Error: unknown strategy '{}'. Use 'single', 'thread', or 'process'.",
                other
            );
            std::process::exit(1);
        }
    };
    if depth == 0 {
        eprintln!("Error: depth must be at least 1");
        std::process::exit(1);
    }
    if fanout == 0 || fanout > 8 {
        eprintln!("Error: fanout must be between 1 and 8");
        std::process::exit(1);
    }

    let units = match (strategy, units) {
        (Strategy::Single, _) => 1,
        (_, 0) => PoolConfig::default().units,
        (_, n) => n,
    };
    let timeout = timeout_secs.map(Duration::from_secs);

    let engine = Engine::new(PoolConfig { units, timeout }).with_log_buffer(buffer.clone());
    engine.seed(&DemoState::root(seed, depth, fanout));
    hook_signals(&engine);

    let servers = if no_servers {
        None
    } else {
        match IntrospectionServers::spawn(buffer, engine.registry(), log_port) {
            Ok(servers) => Some(servers),
            Err(err) => {
                eprintln!("Warning: introspection servers unavailable: {}", err);
                None
            }
        }
    };

    eprintln!("═══════════════════════════════════════════════════════════════════════");
    eprintln!("  Wyvern Exploration");
    eprintln!("═══════════════════════════════════════════════════════════════════════");
    eprintln!();
    eprintln!("Configuration:");
    eprintln!("  Strategy:       {}", strategy.label());
    eprintln!("  Units:          {}", units);
    eprintln!("  Seed:           {}", seed);
    eprintln!("  Depth bound:    {}", depth);
    eprintln!("  Fanout:         {}", fanout);
    if let Some(timeout) = timeout {
        eprintln!("  Timeout:        {:?}", timeout);
    }
    if let Some(ref servers) = servers {
        eprintln!("  Log dumps:      {}", servers.log_addr());
        eprintln!("  Snapshots:      {}", servers.snapshot_addr());
    }
    eprintln!();
    eprintln!("Starting exploration...");
    eprintln!();

    let result = match strategy {
        Strategy::Single => engine.run_single().map_err(|e| e.to_string()),
        Strategy::Thread => engine.run().map_err(|e| e.to_string()),
        Strategy::Process => run_process_pool(&engine, units, timeout).map_err(|e| e.to_string()),
    };

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            eprintln!();
            eprintln!("Exploration failed: {}", err);
            std::process::exit(1);
        }
    };

    if let Some(servers) = servers {
        servers.stop();
    }

    eprintln!();
    eprintln!("Exploration complete!");
    eprintln!();

    if json {
        match json_report(&report) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                eprintln!("Error: report not serializable: {}", err);
                std::process::exit(1);
            }
        }
    } else {
        println!("{}", format_report(&report));
    }

    std::process::exit(match report.status {
        RunStatus::Exhausted => 0,
        RunStatus::Cancelled => 2,
        RunStatus::Degraded | RunStatus::Failed => 3,
    });
}

fn cmd_worker(unit: usize, port: u16) {
    // Children log plainly to their own stderr; the parent owns the buffer.
    env_logger::init();

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    match run_remote_unit::<DemoState>(unit, addr) {
        Ok(exit) => std::process::exit(exit_code(exit)),
        Err(err) => {
            eprintln!("Error: worker {} lost the registry service: {}", unit, err);
            std::process::exit(1);
        }
    }
}

/// Drive the pool with one child process per unit. The registry stays in
/// this process, exported over the registry service; children proxy every
/// operation through it.
fn run_process_pool(
    engine: &Engine<DemoState>,
    units: usize,
    timeout: Option<Duration>,
) -> io::Result<RunReport> {
    let started = Instant::now();
    let service = serve_registry(engine.clone(), 0)?;
    info!("Registry service on {}", service.addr());

    let watchdog = match timeout {
        Some(timeout) => Some(Watchdog::arm(engine.clone(), timeout)?),
        None => None,
    };

    let mut children = Vec::with_capacity(units);
    for unit in 0..units {
        children.push(spawn_unit_process(unit, service.port())?);
    }

    let mut unit_exits = Vec::with_capacity(units);
    for (unit, mut child) in children.into_iter().enumerate() {
        let status = child.wait()?;
        let exit = unit_exit_from_status(status);
        debug!("Unit {} (pid {}) exited {:?}", unit, child.id(), exit);
        unit_exits.push(exit);
    }
    if let Some(watchdog) = watchdog {
        watchdog.disarm();
    }
    service.stop();

    Ok(RunReport {
        status: classify_run(engine.cancel_token().is_cancelled(), &unit_exits),
        unit_exits,
        counts: engine.registry().counts(),
        wall_time: started.elapsed(),
    })
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Signal hookup for SIGINT + SIGTERM (avoids pulling in the ctrlc crate).
/// The handler only sets a flag; a monitor thread translates it into a
/// pool kill, which is too much work for signal context.
fn hook_signals(engine: &Engine<DemoState>) {
    extern "C" fn handler(_: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    unsafe {
        let h = handler as *const () as libc::sighandler_t;
        libc::signal(libc::SIGINT, h);
        libc::signal(libc::SIGTERM, h);
    }

    let engine = engine.clone();
    let spawned = thread::Builder::new()
        .name("wyvern-signal-monitor".to_string())
        .spawn(move || loop {
            if INTERRUPTED.load(Ordering::SeqCst) {
                eprintln!();
                eprintln!("Interrupted, winding down (in-flight states are checkpointed)...");
                engine.kill();
                return;
            }
            thread::sleep(Duration::from_millis(50));
        });
    if let Err(err) = spawned {
        eprintln!("Warning: signal monitor unavailable: {}", err);
    }
}

/// Straight-line advances between decision points.
const STRAIGHT_STEPS: u32 = 2;

/// Synthetic branching workload: a seeded random walk over a bounded tree.
///
/// Every decision derives from the seed and the path taken so far, so a
/// given seed always explores the same tree no matter how the pool
/// schedules it.
#[derive(Clone, Serialize, Deserialize)]
struct DemoState {
    seed: u64,
    max_depth: u32,
    fanout: u8,
    steps: u32,
    path: Vec<u8>,
}

impl DemoState {
    fn root(seed: u64, max_depth: u32, fanout: u8) -> Self {
        Self {
            seed,
            max_depth,
            fanout,
            steps: STRAIGHT_STEPS,
            path: Vec::new(),
        }
    }

    /// Decision rng, keyed by seed and path (FNV-1a over the branch bytes).
    fn rng(&self) -> ChaCha8Rng {
        let mut mixed = self.seed ^ 0xcbf29ce484222325;
        for byte in &self.path {
            mixed = (mixed ^ *byte as u64).wrapping_mul(0x100000001b3);
        }
        ChaCha8Rng::seed_from_u64(mixed)
    }
}

impl ExplorationState for DemoState {
    type Condition = u8;
    type Branch = u8;

    fn advance(&mut self) -> StepOutcome<Self> {
        if self.steps > 0 {
            self.steps -= 1;
            return StepOutcome::Continue;
        }

        let mut rng = self.rng();
        if self.path.len() as u32 >= self.max_depth {
            return StepOutcome::Terminate(format!(
                "walk complete at depth {}",
                self.path.len()
            ));
        }
        // The root always forks so every seed has something to explore.
        if !self.path.is_empty() && rng.gen_ratio(1, 8) {
            return StepOutcome::Terminate(format!("dead end at depth {}", self.path.len()));
        }

        let width = rng.gen_range(1..=self.fanout);
        StepOutcome::Fork(ForkRequest {
            condition: width,
            policy: Box::new(|width| Ok((0..*width).collect())),
            materialize: Box::new(|state, branch| {
                state.path.push(*branch);
                state.steps = STRAIGHT_STEPS;
            }),
        })
    }
}
