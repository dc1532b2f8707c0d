//! The client's socket state machine, transcribed from §4.4's transition
//! table. State writes are confined to the control task; this type is
//! intentionally passive (it holds state and the glue to drive polling)
//! so the control task can be the only mutator.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use hearth_proto::constants::ERROR_DELAY;

/// One of the six states a client connection passes through. `CONNECTED`
/// is the only state from which application-visible operations succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    WaitForSocket,
    WaitForWritable,
    FirstMessage,
    Connected,
    ErrorDelay,
}

/// Status reported to the application's connection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Failed,
}

/// Drives the socket state machine. Owns the connect socket fd once one
/// exists, and the deadline for the `ERROR_DELAY` backoff.
pub struct SocketStateMachine {
    state: SocketState,
    socket_fd: Option<RawFd>,
    error_delay_until: Option<Instant>,
    client_id: Option<u16>,
}

impl SocketStateMachine {
    pub fn new() -> Self {
        Self {
            state: SocketState::Disconnected,
            socket_fd: None,
            error_delay_until: None,
            client_id: None,
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn client_id(&self) -> Option<u16> {
        self.client_id
    }

    /// `server_connect()`: DISCONNECTED -> WAIT_FOR_SOCKET.
    pub fn begin_connect(&mut self) {
        if self.state == SocketState::Disconnected {
            self.state = SocketState::WaitForSocket;
        }
    }

    /// Socket file appeared: WAIT_FOR_SOCKET -> WAIT_FOR_WRITABLE.
    pub fn on_socket_file_created(&mut self) {
        if self.state == SocketState::WaitForSocket {
            self.state = SocketState::WaitForWritable;
        }
    }

    /// Socket file deleted while waiting: stays in WAIT_FOR_SOCKET.
    pub fn on_socket_file_deleted(&mut self) {
        // No-op transition, named explicitly per the transition table so
        // the intent ("deletion while waiting changes nothing") is not
        // silently absorbed by a catch-all match arm elsewhere.
    }

    /// `connect()` returned success immediately: WAIT_FOR_WRITABLE ->
    /// FIRST_MESSAGE.
    pub fn on_connect_succeeded(&mut self, fd: RawFd) {
        self.socket_fd = Some(fd);
        self.state = SocketState::FirstMessage;
    }

    /// `connect()` is in progress (`EINPROGRESS`): stay in
    /// WAIT_FOR_WRITABLE, waiting on `POLLOUT`.
    pub fn on_connect_in_progress(&mut self, fd: RawFd) {
        self.socket_fd = Some(fd);
    }

    /// `connect()` refused (`ECONNREFUSED`): close the fd, stay in
    /// WAIT_FOR_WRITABLE (the server may not have bound yet).
    pub fn on_connect_refused(&mut self) {
        self.socket_fd = None;
    }

    /// Any other `connect()` failure: WAIT_FOR_WRITABLE -> ERROR_DELAY.
    pub fn on_connect_failed(&mut self) -> ConnectionStatus {
        self.socket_fd = None;
        self.enter_error_delay();
        ConnectionStatus::Disconnected
    }

    /// `CLIENT_CONNECTED` received with a client id: FIRST_MESSAGE ->
    /// CONNECTED.
    pub fn on_client_connected(&mut self, client_id: u16) -> ConnectionStatus {
        self.client_id = Some(client_id);
        self.state = SocketState::Connected;
        ConnectionStatus::Connected
    }

    /// Any other message, or an error, while awaiting the handshake:
    /// FIRST_MESSAGE -> ERROR_DELAY.
    pub fn on_first_message_failed(&mut self) -> ConnectionStatus {
        self.enter_error_delay();
        ConnectionStatus::Disconnected
    }

    /// `POLLHUP` or a hard error while connected: CONNECTED ->
    /// WAIT_FOR_SOCKET, after teardown.
    pub fn on_connection_lost(&mut self) -> ConnectionStatus {
        self.socket_fd = None;
        self.client_id = None;
        self.state = SocketState::WaitForSocket;
        ConnectionStatus::Disconnected
    }

    fn enter_error_delay(&mut self) {
        self.state = SocketState::ErrorDelay;
        self.error_delay_until = Some(Instant::now() + ERROR_DELAY);
    }

    /// Returns `true` (and transitions to WAIT_FOR_SOCKET) once the
    /// backoff timer has expired.
    pub fn poll_error_delay(&mut self, now: Instant) -> bool {
        if self.state != SocketState::ErrorDelay {
            return false;
        }
        if self.error_delay_until.map(|t| now >= t).unwrap_or(false) {
            self.state = SocketState::WaitForSocket;
            self.error_delay_until = None;
            true
        } else {
            false
        }
    }

    pub fn remaining_error_delay(&self, now: Instant) -> Option<Duration> {
        self.error_delay_until.map(|t| t.saturating_duration_since(now))
    }

    pub fn is_connected(&self) -> bool {
        self.state == SocketState::Connected
    }

    pub fn socket_fd(&self) -> Option<RawFd> {
        self.socket_fd
    }
}

impl Default for SocketStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_happy_path_transition() {
        let mut m = SocketStateMachine::new();
        assert_eq!(m.state(), SocketState::Disconnected);

        m.begin_connect();
        assert_eq!(m.state(), SocketState::WaitForSocket);

        m.on_socket_file_created();
        assert_eq!(m.state(), SocketState::WaitForWritable);

        m.on_connect_succeeded(3);
        assert_eq!(m.state(), SocketState::FirstMessage);

        let status = m.on_client_connected(42);
        assert_eq!(status, ConnectionStatus::Connected);
        assert_eq!(m.state(), SocketState::Connected);
        assert_eq!(m.client_id(), Some(42));
    }

    #[test]
    fn connect_refused_stays_in_wait_for_writable() {
        let mut m = SocketStateMachine::new();
        m.begin_connect();
        m.on_socket_file_created();
        m.on_connect_refused();
        assert_eq!(m.state(), SocketState::WaitForWritable);
    }

    #[test]
    fn connection_loss_returns_to_wait_for_socket() {
        let mut m = SocketStateMachine::new();
        m.begin_connect();
        m.on_socket_file_created();
        m.on_connect_succeeded(3);
        m.on_client_connected(1);
        assert!(m.is_connected());

        let status = m.on_connection_lost();
        assert_eq!(status, ConnectionStatus::Disconnected);
        assert_eq!(m.state(), SocketState::WaitForSocket);
        assert_eq!(m.client_id(), None);
    }

    #[test]
    fn error_delay_expires_after_backoff() {
        let mut m = SocketStateMachine::new();
        m.begin_connect();
        m.on_socket_file_created();
        m.on_connect_failed();
        assert_eq!(m.state(), SocketState::ErrorDelay);

        assert!(!m.poll_error_delay(Instant::now()));
        assert!(m.poll_error_delay(Instant::now() + ERROR_DELAY + Duration::from_millis(1)));
        assert_eq!(m.state(), SocketState::WaitForSocket);
    }
}
