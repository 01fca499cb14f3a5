//! Free port allocation
//!
//! Ports are probed by binding a throwaway listener. Each worker starts from
//! its own seed so concurrent workers search disjoint ranges.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use crate::constants::ports;

/// Port allocation errors
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("No free port found in {probes} probes starting at {start}")]
    NoFreePort { start: u16, probes: u32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Check whether a listener can be bound to `port` right now
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).is_ok()
}

/// Find a free port at or above `start`, skipping the default reserved ports
pub fn find_available_port(start: u16) -> Result<u16, PortError> {
    find_available_port_within(start, ports::RESERVED, ports::MAX_PROBES)
}

/// Find a free port at or above `start`, skipping `reserved`, giving up after
/// `max_probes` candidates
pub fn find_available_port_within(
    start: u16,
    reserved: &[u16],
    max_probes: u32,
) -> Result<u16, PortError> {
    let mut candidate = start;

    for _ in 0..max_probes {
        if candidate != 0 && !reserved.contains(&candidate) {
            if let Ok(listener) =
                TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, candidate)))
            {
                let port = listener.local_addr()?.port();
                drop(listener);
                return Ok(port);
            }
            log::debug!("Port {} is in use, trying next", candidate);
        }

        candidate = match candidate.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }

    Err(PortError::NoFreePort {
        start,
        probes: max_probes,
    })
}
