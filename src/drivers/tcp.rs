use crate::error::DriverError;
use log::debug;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Open a TCP connection within `timeout`
///
/// Every resolved address is tried in turn; read and write timeouts on the
/// returned stream are set to the same value.
///
/// # Errors
///
/// `DriverError::Resolve` if the host has no addresses, otherwise the I/O error
/// of the last address tried.
pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, DriverError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| DriverError::Resolve(format!("{}:{}: {}", host, port, e)))?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                debug!("Connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connection to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => DriverError::Io(e),
        None => DriverError::Resolve(format!("{}:{}: no addresses", host, port)),
    })
}
