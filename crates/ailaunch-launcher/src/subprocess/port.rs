//! Free-port discovery by loopback bind probe.
//!
//! A port is probed by binding `127.0.0.1:<port>`. The winning probe socket is
//! kept open inside [`ReservedPort`] until the caller releases it right before
//! spawning, so the window in which another process can take the port is
//! small. It is not zero: between `release` and the child's own bind, any
//! process on the machine may grab the port.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use tracing::{debug, trace};

use super::error::SupervisorError;

/// Number of ports scanned by [`find_free_port`] including `start`.
pub const DEFAULT_PORT_SPAN: u16 = 100;

/// Default first port tried for the assistant's web UI.
pub const DEFAULT_START_PORT: u16 = 8501;

/// A port won by the probe, still held by the probe socket.
#[derive(Debug)]
pub struct ReservedPort {
    port: u16,
    listener: TcpListener,
}

impl ReservedPort {
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Close the probe socket and hand back the port number.
    pub fn release(self) -> u16 {
        let Self { port, listener } = self;
        drop(listener);
        trace!(port, "Released port reservation");
        port
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Whether `port` can currently be bound on loopback.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(loopback(port)).is_ok()
}

/// Scan `start..=start + DEFAULT_PORT_SPAN - 1` for a bindable port.
pub fn find_free_port(start: u16) -> Result<ReservedPort, SupervisorError> {
    find_free_port_in(start, default_end(start), &HashSet::new())
}

/// Scan like [`find_free_port`] but skip ports claimed by sibling launchers.
pub fn find_free_port_excluding(
    start: u16,
    claimed: &HashSet<u16>,
) -> Result<ReservedPort, SupervisorError> {
    find_free_port_in(start, default_end(start), claimed)
}

/// Last port of the default scan window starting at `start`.
pub const fn default_end(start: u16) -> u16 {
    start.saturating_add(DEFAULT_PORT_SPAN - 1)
}

/// Scan `start..=end` in order, skipping `claimed`, and reserve the first
/// port that binds.
pub fn find_free_port_in(
    start: u16,
    end: u16,
    claimed: &HashSet<u16>,
) -> Result<ReservedPort, SupervisorError> {
    let first = start.max(1);
    for port in first..=end {
        if claimed.contains(&port) {
            trace!(port, "Skipping port claimed by another instance");
            continue;
        }
        match TcpListener::bind(loopback(port)) {
            Ok(listener) => {
                debug!(port, "Found free port");
                return Ok(ReservedPort { port, listener });
            }
            Err(e) => trace!(port, error = %e, "Port busy"),
        }
    }
    Err(SupervisorError::NoPortAvailable { start, end })
}
