//! Learning the device port from the app that hosts the device API.
//!
//! The app connects to us and sends its listening port as decimal text. A valid
//! port is acknowledged with a minimal HTTP response carrying the port back;
//! anything else gets `400 Bad Request` and the app may try again on the same
//! connection.

use crate::cancel::CancelToken;
use crate::channel::{ChannelError, READ_POLL_INTERVAL};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
const ANNOUNCEMENT_BUFFER_SIZE: usize = 1024;

/// Listens for a single port announcement.
#[derive(Debug)]
pub struct PortAnnouncer {
    listener: TcpListener,
}

impl PortAnnouncer {
    pub fn bind(addr: &str) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| ChannelError::Announcement(format!("Failed to bind {addr}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| ChannelError::Announcement(e.to_string()))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.listener
            .local_addr()
            .map_err(|e| ChannelError::Announcement(e.to_string()))
    }

    /// Blocks until some connection announces a valid port. Returns `None` if
    /// cancelled first.
    pub fn wait(&self, cancel: &CancelToken) -> Result<Option<u16>, ChannelError> {
        tracing::info!(
            addr = %self.local_addr()?,
            "Waiting for the device app to announce its port"
        );
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Announcement connection accepted");
                    match serve(stream, cancel) {
                        Ok(Some(port)) => {
                            tracing::info!(%peer, port, "Device port announced");
                            return Ok(Some(port));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "Announcement connection failed")
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(READ_POLL_INTERVAL),
                Err(e) => {
                    return Err(ChannelError::Announcement(format!("Accept failed: {e}")));
                }
            }
        }
    }
}

/// Reads announcements from one connection until a valid port arrives or the
/// peer leaves.
fn serve(mut stream: TcpStream, cancel: &CancelToken) -> std::io::Result<Option<u16>> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;
    let mut buf = [0u8; ANNOUNCEMENT_BUFFER_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e),
        };
        let text = String::from_utf8_lossy(&buf[..n]);
        match parse_port(&text) {
            Some(port) => {
                let body = port.to_string();
                write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                )?;
                stream.flush()?;
                let _ = stream.shutdown(Shutdown::Write);
                return Ok(Some(port));
            }
            None => {
                tracing::warn!(received = %text.trim(), "Invalid port announcement");
                stream.write_all(BAD_REQUEST)?;
            }
        }
    }
}

/// `"8080\n"` -> `Some(8080)`. Port zero is not a port one can connect to.
pub fn parse_port(text: &str) -> Option<u16> {
    text.trim().parse::<u16>().ok().filter(|port| *port != 0)
}
