//! Session-oriented duplex transport to the device under test.
//!
//! The channel ships bytes and hands back whatever bytes the device emits. It
//! never interprets payloads; callers decide when they have seen enough through
//! the sink they pass to [`Channel::receive_until_idle`].

use crate::cancel::CancelToken;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Poll interval for the read loop; bounds how late quiet periods and
/// cancellation are noticed.
pub(crate) const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_BUFFER_SIZE: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Failed to connect to {endpoint}: {message}")]
    Connection { endpoint: String, message: String },
    #[error("Failed to transmit {bytes} bytes: {message}")]
    Transmit { bytes: usize, message: String },
    #[error("No output from the device within {idle_ms} ms")]
    Timeout { idle_ms: u64 },
    #[error("Device closed the session: {0}")]
    Disconnected(String),
    #[error("No open session")]
    NotConnected,
    #[error("Port announcement failed: {0}")]
    Announcement(String),
}

impl ChannelError {
    /// Failures after which the session can no longer be trusted.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            ChannelError::Transmit { .. }
                | ChannelError::Timeout { .. }
                | ChannelError::Disconnected(_)
                | ChannelError::NotConnected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but the last operation failed; the session should be replaced.
    Degraded,
}

/// Snapshot of a channel connection, owned and mutated only by the channel.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub endpoint: Endpoint,
    pub state: SessionState,
    /// Last time the device showed liveness (connection establishment or output).
    pub last_activity: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Session {
    fn new(id: u64, endpoint: Endpoint) -> Self {
        Self {
            id,
            endpoint,
            state: SessionState::Connecting,
            last_activity: Instant::now(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

/// How long a receive may wait.
#[derive(Debug, Clone, Copy)]
pub struct IdleWindow {
    /// Maximum time without any device output before the session is considered dead.
    pub idle_timeout: Duration,
    /// Output is considered complete after this long without new bytes.
    pub quiet_period: Duration,
    /// Upper bound on a single receive, however chatty the device is.
    pub max_capture: Duration,
}

/// Why a successful receive ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// No new output for the quiet period.
    Quiet,
    /// The sink signalled that it has seen what it needed.
    Stopped,
    /// Output kept arriving until `max_capture` elapsed.
    CaptureLimit,
    Cancelled,
}

pub trait Channel: Send {
    /// Opens a new session, replacing any existing one.
    fn connect(&mut self, endpoint: &Endpoint) -> Result<Session, ChannelError>;

    /// Writes `payload` exactly once. A failed send is never retried here.
    fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError>;

    /// Streams device output into `sink` until the output goes quiet, the sink
    /// breaks, `window.max_capture` runs out, or cancellation is requested.
    ///
    /// Bytes are handed to the sink as they arrive, so a failure never loses
    /// output that was already read. Fails with [`ChannelError::Timeout`] when
    /// the device has shown no liveness for `window.idle_timeout`.
    fn receive_until_idle(
        &mut self,
        window: IdleWindow,
        sink: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
        cancel: &CancelToken,
    ) -> Result<ReceiveEnd, ChannelError>;

    /// Releases the session. Safe to call when nothing is open.
    fn close(&mut self);

    fn session(&self) -> Option<&Session>;
}

/// A [`Channel`] over a plain TCP stream.
pub struct TcpChannel {
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    session: Option<Session>,
    next_session_id: u64,
}

impl TcpChannel {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            stream: None,
            session: None,
            next_session_id: 0,
        }
    }

    fn mark(&mut self, state: SessionState) {
        if let Some(session) = self.session.as_mut() {
            session.state = state;
        }
    }

    fn drop_stream(&mut self, state: SessionState) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.mark(state);
    }
}

impl Channel for TcpChannel {
    fn connect(&mut self, endpoint: &Endpoint) -> Result<Session, ChannelError> {
        self.close();
        self.next_session_id += 1;
        self.session = Some(Session::new(self.next_session_id, endpoint.clone()));

        let connection_error = |message: String| ChannelError::Connection {
            endpoint: endpoint.to_string(),
            message,
        };

        let addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| connection_error(format!("address resolution failed: {e}")))?;

        let mut last_error = "no addresses resolved".to_string();
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        let stream = match connected {
            Some(stream) => stream,
            None => {
                self.mark(SessionState::Disconnected);
                return Err(connection_error(last_error));
            }
        };
        stream
            .set_read_timeout(Some(READ_POLL_INTERVAL))
            .and_then(|_| stream.set_write_timeout(Some(self.connect_timeout)))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|e| connection_error(format!("failed to configure socket: {e}")))?;

        self.stream = Some(stream);
        let session = self.session.as_mut().ok_or(ChannelError::NotConnected)?;
        session.state = SessionState::Connected;
        session.last_activity = Instant::now();
        tracing::debug!(endpoint = %endpoint, session = session.id, "Session connected");
        Ok(session.clone())
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        let stream = self.stream.as_mut().ok_or(ChannelError::NotConnected)?;
        let result = stream.write_all(payload).and_then(|_| stream.flush());
        match result {
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    session.bytes_sent += payload.len() as u64;
                }
                Ok(())
            }
            Err(e) => {
                self.mark(SessionState::Degraded);
                Err(ChannelError::Transmit {
                    bytes: payload.len(),
                    message: e.to_string(),
                })
            }
        }
    }

    fn receive_until_idle(
        &mut self,
        window: IdleWindow,
        sink: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
        cancel: &CancelToken,
    ) -> Result<ReceiveEnd, ChannelError> {
        let started = Instant::now();
        let mut last_output: Option<Instant> = None;
        let mut buffer = [0u8; READ_BUFFER_SIZE];

        loop {
            if cancel.is_cancelled() {
                return Ok(ReceiveEnd::Cancelled);
            }
            if started.elapsed() >= window.max_capture {
                tracing::warn!(
                    max_capture_ms = window.max_capture.as_millis() as u64,
                    "Device output did not settle"
                );
                return Ok(ReceiveEnd::CaptureLimit);
            }
            let stream = self.stream.as_mut().ok_or(ChannelError::NotConnected)?;
            match stream.read(&mut buffer) {
                Ok(0) => {
                    self.drop_stream(SessionState::Disconnected);
                    return Err(ChannelError::Disconnected(
                        "end of stream".to_string(),
                    ));
                }
                Ok(n) => {
                    let now = Instant::now();
                    last_output = Some(now);
                    if let Some(session) = self.session.as_mut() {
                        session.last_activity = now;
                        session.bytes_received += n as u64;
                    }
                    if sink(&buffer[..n]).is_break() {
                        return Ok(ReceiveEnd::Stopped);
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    let now = Instant::now();
                    let quiet_since = last_output.unwrap_or(started);
                    if now.duration_since(quiet_since) < window.quiet_period {
                        continue;
                    }
                    if last_output.is_some() {
                        return Ok(ReceiveEnd::Quiet);
                    }
                    let last_activity = self
                        .session
                        .as_ref()
                        .map_or(started, |session| session.last_activity);
                    if now.duration_since(last_activity) >= window.idle_timeout {
                        self.mark(SessionState::Degraded);
                        return Err(ChannelError::Timeout {
                            idle_ms: window.idle_timeout.as_millis() as u64,
                        });
                    }
                    return Ok(ReceiveEnd::Quiet);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.drop_stream(SessionState::Disconnected);
                    return Err(ChannelError::Disconnected(e.to_string()));
                }
            }
        }
    }

    fn close(&mut self) {
        if self.stream.is_some() {
            tracing::debug!(
                session = self.session.as_ref().map(|s| s.id),
                "Closing session"
            );
        }
        self.drop_stream(SessionState::Disconnected);
    }

    fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Closes the wrapped channel's session on every exit path.
pub struct SessionGuard<'a> {
    channel: &'a mut dyn Channel,
}

impl<'a> SessionGuard<'a> {
    pub fn new(channel: &'a mut dyn Channel) -> Self {
        Self { channel }
    }

    pub fn channel(&mut self) -> &mut dyn Channel {
        &mut *self.channel
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.channel.close();
    }
}
