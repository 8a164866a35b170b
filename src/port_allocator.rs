//! Lookup of free local TCP ports.

use std::net::{Ipv4Addr, TcpListener};

use tracing::{instrument, trace};

/// Return up to `limit` ports of `start_port..=end_port`, in ascending order, that could
/// be bound on `127.0.0.1` at call time.
///
/// Each candidate is bound then released immediately, so the caller must use the ports
/// right away. Ports already in use are skipped. A shortfall is not an error: the returned
/// list is simply shorter than `limit`.
#[instrument]
pub fn allocate(start_port: u16, end_port: u16, limit: usize) -> Vec<u16> {
    let mut ports = Vec::new();
    if limit == 0 {
        return ports;
    }

    for port in start_port..=end_port {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => {
                drop(listener);
                ports.push(port);
            }
            Err(e) => {
                trace!(port, "port unavailable: {e}");
                continue;
            }
        }

        if ports.len() >= limit {
            break;
        }
    }

    ports
}
