//! Background protocol servers with deterministic shutdown.
//!
//! A [`DaemonUnit`] is the degenerate execution unit that never carries
//! exploration state: it owns a TCP listener and serves connections on a
//! named background thread until told to stop. Shutdown is explicit rather
//! than relying on process exit: set the stop flag, poke the blocked
//! `accept` with a throwaway self-connection, and join the thread. Tests
//! depend on this to get sockets closed before the next case binds.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};

/// Bind a TCP listener with `SO_REUSEADDR` set, so a restarted daemon can
/// take its port back while connections from the previous run are still in
/// TIME_WAIT.
fn bind_reusable(addr: SocketAddr) -> io::Result<TcpListener> {
    let SocketAddr::V4(v4) = addr else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "daemon units bind IPv4 addresses only",
        ));
    };
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let mut sin: libc::sockaddr_in = std::mem::zeroed();
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = v4.port().to_be();
        sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
            || libc::listen(fd, 128) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

/// A named serving thread bound to a TCP listener.
#[derive(Debug)]
pub struct DaemonUnit {
    name: String,
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DaemonUnit {
    /// Bind `addr` and call `serve` once per accepted connection, in accept
    /// order, until [`stop`](Self::stop) is called.
    ///
    /// Binding port 0 picks an ephemeral port; [`addr`](Self::addr) reports
    /// the resolved one.
    pub fn spawn<F>(name: &str, addr: SocketAddr, serve: F) -> io::Result<DaemonUnit>
    where
        F: Fn(TcpStream) + Send + 'static,
    {
        let listener = bind_reusable(addr)?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("Daemon {} listening on {}", thread_name, addr);
                for conn in listener.incoming() {
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match conn {
                        Ok(stream) => serve(stream),
                        Err(err) => warn!("Daemon {}: accept failed: {}", thread_name, err),
                    }
                }
                debug!("Daemon {} stopped", thread_name);
            })?;

        Ok(DaemonUnit {
            name: name.to_string(),
            addr,
            stop,
            handle: Some(handle),
        })
    }

    /// The address the daemon is actually serving on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting, unblock the listener, and join the serving thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.handle.is_none() {
            return;
        }
        debug!("Stopping daemon {}", self.name);
        self.stop.store(true, Ordering::SeqCst);
        // The serving thread sits in accept; a throwaway self-connection
        // makes it re-check the flag.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DaemonUnit {
    fn drop(&mut self) {
        self.shutdown();
    }
}
