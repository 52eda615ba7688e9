//! Finding free local ports and waiting for one to accept connections.

use crate::error::{Error, Result};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

/// Delay between two connection attempts in [`wait_for_port_open`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Anything that can tell whether the process behind it is still running.
pub trait Liveness {
    fn is_alive(&self) -> bool;
}

/// Asks the OS for a port nobody listens on.
///
/// The port is released before returning, so another process may grab it
/// before the caller gets to use it.
pub fn find_open_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    debug!("Found open port {}", port);
    Ok(port)
}

/// Whether something accepts TCP connections on `127.0.0.1:port`.
pub fn is_port_open(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
}

/// Polls `port` every [`POLL_INTERVAL`] until it accepts a connection.
///
/// Before every attempt the process is checked first: if it has exited, the
/// port will never open and this fails with [`Error::ProcessDiedEarly`] right
/// away. If `timeout` runs out first, it fails with [`Error::PortTimeout`].
pub fn wait_for_port_open<P: Liveness + ?Sized>(
    port: u16,
    timeout: Duration,
    process: &P,
) -> Result<()> {
    debug!("Waiting up to {:?} for port {} to be opened", timeout, port);
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        thread::sleep(POLL_INTERVAL);

        if !process.is_alive() {
            return Err(Error::ProcessDiedEarly {
                awaited: format!("port {} was opened", port),
                process: None,
            });
        }

        if is_port_open(port) {
            info!("Port {} is open", port);
            return Ok(());
        }
    }

    Err(Error::PortTimeout {
        port,
        timeout,
        process: None,
    })
}
