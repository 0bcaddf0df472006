//! TCP port probing

use std::net::TcpListener;

/// Check whether a port can currently be bound on the given interface.
///
/// Binds a throwaway listener and drops it before returning; the probe
/// must not leak the socket on either path. Advisory only: another process
/// can still take the port between the probe and the spawn.
pub fn port_is_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}
