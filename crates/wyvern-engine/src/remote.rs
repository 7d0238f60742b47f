//! The process strategy: registry service and child-side client.
//!
//! Child worker processes run the same run-loop as threads, but their
//! [`UnitBackend`] proxies every registry operation to the parent over a
//! loopback TCP connection. The parent exports the service with
//! [`serve_registry`]; the child entry point is [`run_remote_unit`].
//!
//! Wire format (see `wyvern_wire::rpc`): one persistent connection per
//! unit carrying `[op][len][JSON payload]` request frames and
//! `[status][len][payload]` responses. A second connection per unit feeds
//! a kill watcher that polls the parent's kill flag and mirrors it into
//! the child's local token, so a blocked or long-running advance observes
//! cancellation the same way thread units do.
//!
//! States crossing the service boundary additionally need
//! `Serialize + DeserializeOwned`.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use wyvern_wire::rpc::{
    read_frame, write_frame, OP_DISCARD, OP_EVENT, OP_GET_STATE, OP_KILL, OP_POLL_CANCEL,
    OP_PUT_BUSY, OP_PUT_READY, OP_REVIVE, OP_SAVE, OP_TERMINATE, STATUS_ERR, STATUS_NONE,
    STATUS_OK,
};

use crate::cancel::CancelToken;
use crate::daemon::DaemonUnit;
use crate::engine::Engine;
use crate::events::PoolEvent;
use crate::registry::StateId;
use crate::state::ExplorationState;
use crate::worker::{run_unit, BackendError, UnitBackend, UnitExit, UnitId};

/// How often a child's kill watcher polls the parent.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(20);

// ═══════════════════════════════════════════════════════════════════════
//  Payloads
// ═══════════════════════════════════════════════════════════════════════

#[derive(Serialize, Deserialize)]
struct GetStateReq {
    wait: bool,
}

#[derive(Serialize, Deserialize)]
struct GetStateOk<S> {
    id: StateId,
    state: S,
}

#[derive(Serialize, Deserialize)]
struct IdPayload {
    id: StateId,
}

#[derive(Serialize, Deserialize)]
struct IdReasonReq {
    id: StateId,
    reason: String,
}

#[derive(Serialize, Deserialize)]
struct SaveReq<S> {
    id: StateId,
    state: S,
}

#[derive(Serialize, Deserialize)]
struct CancelledPayload {
    cancelled: bool,
}

// ═══════════════════════════════════════════════════════════════════════
//  Parent side: the service
// ═══════════════════════════════════════════════════════════════════════

/// Export the engine's registry over loopback TCP (port 0 = ephemeral).
///
/// Each connection gets its own handler thread, so one child blocked in a
/// waiting `get_state` never stalls another child's requests.
pub fn serve_registry<S>(engine: Engine<S>, port: u16) -> io::Result<DaemonUnit>
where
    S: ExplorationState + Serialize + DeserializeOwned,
{
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    DaemonUnit::spawn("wyvern-registry-service", addr, move |stream| {
        let engine = engine.clone();
        let spawned = thread::Builder::new()
            .name("wyvern-registry-conn".to_string())
            .spawn(move || handle_connection(engine, stream));
        if let Err(err) = spawned {
            warn!("Registry service: could not spawn handler: {}", err);
        }
    })
}

fn handle_connection<S>(engine: Engine<S>, mut stream: TcpStream)
where
    S: ExplorationState + Serialize + DeserializeOwned,
{
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    debug!("Registry service: {} connected", peer);

    loop {
        let (op, payload) = match read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!("Registry service: read from {} failed: {}", peer, err);
                break;
            }
        };

        let (status, body) = match dispatch(&engine, op, &payload) {
            Ok(response) => response,
            Err(err) => (STATUS_ERR, err.to_string().into_bytes()),
        };
        if let Err(err) = write_frame(&mut stream, status, &body) {
            warn!("Registry service: write to {} failed: {}", peer, err);
            break;
        }
    }

    debug!("Registry service: {} disconnected", peer);
}

fn dispatch<S>(engine: &Engine<S>, op: u8, payload: &[u8]) -> Result<(u8, Vec<u8>), BackendError>
where
    S: ExplorationState + Serialize + DeserializeOwned,
{
    match op {
        OP_GET_STATE => {
            let req: GetStateReq = serde_json::from_slice(payload)?;
            match engine.next_state(req.wait)? {
                Some((id, state)) => {
                    let body = serde_json::to_vec(&GetStateOk { id, state })?;
                    Ok((STATUS_OK, body))
                }
                None => {
                    let body = serde_json::to_vec(&CancelledPayload {
                        cancelled: engine.cancelled(),
                    })?;
                    Ok((STATUS_NONE, body))
                }
            }
        }
        OP_PUT_READY => {
            let state: S = serde_json::from_slice(payload)?;
            let id = engine.put_ready(&state)?;
            Ok((STATUS_OK, serde_json::to_vec(&IdPayload { id })?))
        }
        OP_PUT_BUSY => {
            let state: S = serde_json::from_slice(payload)?;
            let id = engine.put_busy(&state)?;
            Ok((STATUS_OK, serde_json::to_vec(&IdPayload { id })?))
        }
        OP_SAVE => {
            let req: SaveReq<S> = serde_json::from_slice(payload)?;
            engine.save(req.id, &req.state)?;
            Ok((STATUS_OK, Vec::new()))
        }
        OP_REVIVE => {
            let req: IdPayload = serde_json::from_slice(payload)?;
            engine.revive(req.id)?;
            Ok((STATUS_OK, Vec::new()))
        }
        OP_TERMINATE => {
            let req: IdReasonReq = serde_json::from_slice(payload)?;
            engine.terminate(req.id, &req.reason)?;
            Ok((STATUS_OK, Vec::new()))
        }
        OP_KILL => {
            let req: IdReasonReq = serde_json::from_slice(payload)?;
            // Qualified: Engine's inherent kill() is the pool-wide one.
            UnitBackend::kill(engine, req.id, &req.reason)?;
            Ok((STATUS_OK, Vec::new()))
        }
        OP_DISCARD => {
            let req: IdPayload = serde_json::from_slice(payload)?;
            engine.discard(req.id)?;
            Ok((STATUS_OK, Vec::new()))
        }
        OP_POLL_CANCEL => {
            let body = serde_json::to_vec(&CancelledPayload {
                cancelled: engine.cancelled(),
            })?;
            Ok((STATUS_OK, body))
        }
        OP_EVENT => {
            let event: PoolEvent = serde_json::from_slice(payload)?;
            engine.publish(event);
            Ok((STATUS_OK, Vec::new()))
        }
        other => Ok((STATUS_ERR, format!("unknown op {:#04x}", other).into_bytes())),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Child side: the client
// ═══════════════════════════════════════════════════════════════════════

/// Child-process backend proxying every operation to the parent.
///
/// The local [`CancelToken`] mirrors the parent's kill flag: the kill
/// watcher sets it, and a `get_state` answered with "no work, cancelled"
/// sets it too, so exit classification matches the thread strategy.
pub struct ServiceClient {
    conn: Mutex<TcpStream>,
    cancel: CancelToken,
}

impl ServiceClient {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let conn = TcpStream::connect(addr)?;
        conn.set_nodelay(true)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cancel: CancelToken::new(),
        })
    }

    /// The client's local mirror of the pool-wide kill flag.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn request(&self, op: u8, payload: &[u8]) -> Result<(u8, Vec<u8>), BackendError> {
        let mut conn = self.conn.lock().unwrap();
        write_frame(&mut *conn, op, payload)?;
        match read_frame(&mut *conn)? {
            Some(frame) => Ok(frame),
            None => Err(BackendError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "registry service closed the connection",
            ))),
        }
    }

    /// Issue a request whose only interesting answer is `STATUS_OK`.
    fn call_ok(&self, op: u8, payload: &[u8]) -> Result<Vec<u8>, BackendError> {
        let (status, body) = self.request(op, payload)?;
        match status {
            STATUS_OK => Ok(body),
            STATUS_ERR => Err(BackendError::Rejected(
                String::from_utf8_lossy(&body).into_owned(),
            )),
            other => Err(BackendError::Rejected(format!(
                "unexpected status {:#04x}",
                other
            ))),
        }
    }

    /// Ask the parent whether the pool-wide kill flag is set.
    pub fn poll_cancel(&self) -> Result<bool, BackendError> {
        let body = self.call_ok(OP_POLL_CANCEL, b"")?;
        let payload: CancelledPayload = serde_json::from_slice(&body)?;
        Ok(payload.cancelled)
    }
}

impl<S> UnitBackend<S> for ServiceClient
where
    S: ExplorationState + Serialize + DeserializeOwned,
{
    fn next_state(&self, wait: bool) -> Result<Option<(StateId, S)>, BackendError> {
        let payload = serde_json::to_vec(&GetStateReq { wait })?;
        let (status, body) = self.request(OP_GET_STATE, &payload)?;
        match status {
            STATUS_OK => {
                let ok: GetStateOk<S> = serde_json::from_slice(&body)?;
                Ok(Some((ok.id, ok.state)))
            }
            STATUS_NONE => {
                let none: CancelledPayload = serde_json::from_slice(&body)?;
                if none.cancelled {
                    self.cancel.cancel();
                }
                Ok(None)
            }
            STATUS_ERR => Err(BackendError::Rejected(
                String::from_utf8_lossy(&body).into_owned(),
            )),
            other => Err(BackendError::Rejected(format!(
                "unexpected status {:#04x}",
                other
            ))),
        }
    }

    fn put_ready(&self, state: &S) -> Result<StateId, BackendError> {
        let body = self.call_ok(OP_PUT_READY, &serde_json::to_vec(state)?)?;
        let id: IdPayload = serde_json::from_slice(&body)?;
        Ok(id.id)
    }

    fn put_busy(&self, state: &S) -> Result<StateId, BackendError> {
        let body = self.call_ok(OP_PUT_BUSY, &serde_json::to_vec(state)?)?;
        let id: IdPayload = serde_json::from_slice(&body)?;
        Ok(id.id)
    }

    fn save(&self, id: StateId, state: &S) -> Result<(), BackendError> {
        let payload = serde_json::to_vec(&SaveReq { id, state })?;
        self.call_ok(OP_SAVE, &payload)?;
        Ok(())
    }

    fn revive(&self, id: StateId) -> Result<(), BackendError> {
        self.call_ok(OP_REVIVE, &serde_json::to_vec(&IdPayload { id })?)?;
        Ok(())
    }

    fn terminate(&self, id: StateId, reason: &str) -> Result<(), BackendError> {
        let payload = serde_json::to_vec(&IdReasonReq {
            id,
            reason: reason.to_string(),
        })?;
        self.call_ok(OP_TERMINATE, &payload)?;
        Ok(())
    }

    fn kill(&self, id: StateId, reason: &str) -> Result<(), BackendError> {
        let payload = serde_json::to_vec(&IdReasonReq {
            id,
            reason: reason.to_string(),
        })?;
        self.call_ok(OP_KILL, &payload)?;
        Ok(())
    }

    fn discard(&self, id: StateId) -> Result<(), BackendError> {
        self.call_ok(OP_DISCARD, &serde_json::to_vec(&IdPayload { id })?)?;
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn publish(&self, event: PoolEvent) {
        // Fire-and-forget: a lost event must not take the unit down.
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Event {} not serializable: {}", event, err);
                return;
            }
        };
        if let Err(err) = self.call_ok(OP_EVENT, &payload) {
            warn!("Event {} not published: {}", event, err);
        }
    }
}

/// Polls the parent's kill flag on its own connection and mirrors it into
/// the unit's local token.
struct KillWatcher {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl KillWatcher {
    fn spawn(client: ServiceClient, cancel: CancelToken) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let watcher_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("wyvern-kill-watcher".to_string())
            .spawn(move || {
                while !watcher_stop.load(Ordering::SeqCst) {
                    match client.poll_cancel() {
                        Ok(true) => {
                            debug!("Kill watcher: parent requested kill");
                            cancel.cancel();
                            return;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            // Parent gone; the unit's own connection will
                            // surface the failure and retire it.
                            debug!("Kill watcher: poll failed ({}), exiting", err);
                            return;
                        }
                    }
                    thread::sleep(KILL_POLL_INTERVAL);
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Child entry and process plumbing
// ═══════════════════════════════════════════════════════════════════════

/// Run one execution unit inside the current (child) process, against the
/// registry service at `addr`. This is what the hidden `worker` subcommand
/// calls; the process exit code is derived from the returned exit via
/// [`exit_code`].
pub fn run_remote_unit<S>(unit: UnitId, addr: SocketAddr) -> Result<UnitExit, BackendError>
where
    S: ExplorationState + Serialize + DeserializeOwned,
{
    let client = ServiceClient::connect(addr)?;
    let watcher_conn = ServiceClient::connect(addr)?;
    let watcher = KillWatcher::spawn(watcher_conn, client.cancel_token())?;

    let exit = run_unit::<S, ServiceClient>(unit, &client, true);

    watcher.stop();
    Ok(exit)
}

/// Re-execute the current binary as one child worker process.
pub fn spawn_unit_process(unit: UnitId, port: u16) -> io::Result<Child> {
    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .arg("worker")
        .arg("--unit")
        .arg(unit.to_string())
        .arg("--port")
        .arg(port.to_string())
        .spawn()?;
    debug!("Spawned unit {} as pid {}", unit, child.id());
    Ok(child)
}

/// Process exit code for a unit exit: 0 exhausted, 2 cancelled, 3 retired
/// (1 is left to the CLI for usage errors).
pub fn exit_code(exit: UnitExit) -> i32 {
    match exit {
        UnitExit::Exhausted => 0,
        UnitExit::Cancelled => 2,
        UnitExit::Retired => 3,
    }
}

/// Map a child's exit status back to its unit exit. Anything unexpected,
/// including death by signal, counts as retired.
pub fn unit_exit_from_status(status: ExitStatus) -> UnitExit {
    match status.code() {
        Some(0) => UnitExit::Exhausted,
        Some(2) => UnitExit::Cancelled,
        _ => UnitExit::Retired,
    }
}
