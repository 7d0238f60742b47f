//! Introspection servers: live visibility into a running pool.
//!
//! Two request-less daemons, one message per connection (see `wyvern-wire`
//! for the format):
//!
//! - the **log dump server** drains up to [`MAX_LOG_RECORDS_PER_DUMP`]
//!   lines from the shared [`LogBuffer`], oldest first — connecting twice
//!   pages through the backlog;
//! - the **state snapshot server** reports every live state's id, list,
//!   execution count, reason, and milliseconds since it last changed lists.
//!   Destroyed fork parents are filtered out.
//!
//! Both bind loopback only. By convention the snapshot server sits one port
//! above the log server (3214 and 3215 by default).

use std::io;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

use log::warn;
use wyvern_wire::{
    encode_log_batch, encode_state_dump, StateKind, StateRecord, MAX_LOG_RECORDS_PER_DUMP,
};

use crate::daemon::DaemonUnit;
use crate::logbuf::LogBuffer;
use crate::registry::{StateList, StateRegistry};

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Serve destructive log dumps from `buffer` on `port` (0 = ephemeral).
pub fn spawn_log_server(buffer: Arc<LogBuffer>, port: u16) -> io::Result<DaemonUnit> {
    DaemonUnit::spawn("wyvern-log-dump", loopback(port), move |mut stream| {
        let records = buffer.drain(MAX_LOG_RECORDS_PER_DUMP);
        if let Err(err) = stream.write_all(&encode_log_batch(&records)) {
            warn!("Log dump write failed: {}", err);
        }
    })
}

/// Serve state snapshots of `registry` on `port` (0 = ephemeral).
pub fn spawn_snapshot_server<S>(
    registry: Arc<StateRegistry<S>>,
    port: u16,
) -> io::Result<DaemonUnit>
where
    S: Clone + Send + 'static,
{
    DaemonUnit::spawn("wyvern-state-snapshot", loopback(port), move |mut stream| {
        let records = snapshot_records(&registry);
        if let Err(err) = stream.write_all(&encode_state_dump(&records)) {
            warn!("State snapshot write failed: {}", err);
        }
    })
}

/// One wire record per live state, sorted by id.
fn snapshot_records<S: Clone>(registry: &StateRegistry<S>) -> Vec<StateRecord> {
    let mut records: Vec<StateRecord> = registry
        .introspect()
        .into_values()
        .filter_map(|desc| {
            let kind = match desc.list {
                StateList::Ready => StateKind::Ready,
                StateList::Busy => StateKind::Busy,
                StateList::Terminated => StateKind::Terminated,
                StateList::Killed => StateKind::Killed,
                // Consumed fork parents have no schedulable status to report.
                StateList::Destroyed => return None,
            };
            Some(StateRecord {
                id: desc.id,
                kind,
                execs: desc.execs,
                wait_ms: desc.list_changed_at.elapsed().as_millis() as u64,
                reason: desc.reason.unwrap_or_default(),
            })
        })
        .collect();
    records.sort_by_key(|record| record.id);
    records
}

/// The log and snapshot daemons of one engine, started and stopped as a
/// pair.
#[derive(Debug)]
pub struct IntrospectionServers {
    log: DaemonUnit,
    snapshot: DaemonUnit,
}

impl IntrospectionServers {
    /// Start both servers. `log_port` 0 puts both on ephemeral ports;
    /// otherwise the snapshot server binds `log_port + 1`.
    pub fn spawn<S>(
        buffer: Arc<LogBuffer>,
        registry: Arc<StateRegistry<S>>,
        log_port: u16,
    ) -> io::Result<Self>
    where
        S: Clone + Send + 'static,
    {
        let snapshot_port = if log_port == 0 {
            0
        } else {
            log_port.checked_add(1).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "log port has no adjacent snapshot port",
                )
            })?
        };
        let log = spawn_log_server(buffer, log_port)?;
        let snapshot = spawn_snapshot_server(registry, snapshot_port)?;
        Ok(Self { log, snapshot })
    }

    pub fn log_addr(&self) -> SocketAddr {
        self.log.addr()
    }

    pub fn snapshot_addr(&self) -> SocketAddr {
        self.snapshot.addr()
    }

    pub fn stop(self) {
        self.log.stop();
        self.snapshot.stop();
    }
}
