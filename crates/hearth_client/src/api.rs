//! The public facade applications call into: a thin, blocking-friendly
//! wrapper over the command pipe into the control task, analogous to the
//! teacher's `AudioEngine` public method surface but reshaped so every
//! call is `command send -> paired reply read`, per §5's shared-resource
//! policy for the client command pipe.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use nix::poll::{PollFd, PollFlags, PollTimeout};

use hearth_proto::{AudioFormat, ConnectionType, Direction, StreamId};

use crate::control::{Command, CommandReply, ConnectionCallback, ConnectionEvent, NotificationKind, StreamErrorCallback};
use crate::error::ClientError;
use crate::stream::AudioCallback;

/// Handle applications hold onto. Cloning is cheap (it's just a sender
/// into the control task's command channel plus a borrowed fd); the
/// control task itself lives on its own thread (see [`crate::thread`]).
#[derive(Clone)]
pub struct Client {
    command_tx: Sender<(Command, Sender<CommandReply>)>,
    server_event_fd: Option<RawFd>,
}

impl Client {
    pub fn new(command_tx: Sender<(Command, Sender<CommandReply>)>) -> Self {
        Self {
            command_tx,
            server_event_fd: None,
        }
    }

    /// Construct a `Client` wired to the owning control task's
    /// `server_event_fd`, enabling the blocking `connect_timeout` API.
    /// `fd` must outlive this `Client` — callers get that for free from
    /// [`crate::thread::ClientHandle`], which owns both.
    pub fn with_server_event_fd(
        command_tx: Sender<(Command, Sender<CommandReply>)>,
        fd: RawFd,
    ) -> Self {
        Self {
            command_tx,
            server_event_fd: Some(fd),
        }
    }

    fn call(&self, cmd: Command) -> Result<CommandReply, ClientError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.command_tx
            .send((cmd, reply_tx))
            .map_err(|_| ClientError::NotConnected)?;
        reply_rx.recv().map_err(|_| ClientError::NotConnected)
    }

    /// Non-blocking: hands off to the control task and returns
    /// immediately. The application learns of the outcome via its
    /// connection callback.
    pub fn connect_async(&self) -> Result<(), ClientError> {
        match self.call(Command::Connect)? {
            CommandReply::Ok => Ok(()),
            CommandReply::Err(e) => Err(e),
            _ => Ok(()),
        }
    }

    /// Blocking variant built on top of the async core by polling the
    /// control task's `server_event_fd` with a deadline, never running
    /// the control loop itself (per §4.4's explicit prohibition on
    /// blocking APIs re-entering the reactor).
    pub fn connect_timeout(&self, timeout: Duration) -> Result<(), ClientError> {
        let fd = self.server_event_fd.ok_or(ClientError::NotConnected)?;
        self.connect_async()?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::ConnectTimedOut);
            }
            let remaining_ms = remaining.as_millis().min(i32::MAX as u128) as i32;
            let poll_timeout = PollTimeout::try_from(remaining_ms.max(1)).unwrap_or(PollTimeout::ZERO);

            let mut fds = [PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                PollFlags::POLLIN,
            )];
            nix::poll::poll(&mut fds, poll_timeout).map_err(|e| ClientError::Errno(e as i32))?;

            if fds[0]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false)
            {
                return Ok(());
            }
        }
    }

    pub fn add_stream(
        &self,
        direction: Direction,
        format: AudioFormat,
        buffer_frames: u32,
        cb_threshold: u32,
        callback: Box<dyn AudioCallback>,
    ) -> Result<StreamId, ClientError> {
        match self.call(Command::AddStream {
            direction,
            format,
            buffer_frames,
            cb_threshold,
            callback,
        })? {
            CommandReply::StreamId(id) => Ok(id),
            CommandReply::Err(e) => Err(e),
            _ => Err(ClientError::NotConnected),
        }
    }

    pub fn remove_stream(&self, id: StreamId) -> Result<(), ClientError> {
        match self.call(Command::RemoveStream(id))? {
            CommandReply::Ok => Ok(()),
            CommandReply::Err(e) => Err(e),
            _ => Ok(()),
        }
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), ClientError> {
        match self.call(Command::SetVolume(volume))? {
            CommandReply::Ok => Ok(()),
            CommandReply::Err(e) => Err(e),
            _ => Ok(()),
        }
    }

    pub fn set_mute(&self, mute: bool) -> Result<(), ClientError> {
        match self.call(Command::SetMute(mute))? {
            CommandReply::Ok => Ok(()),
            CommandReply::Err(e) => Err(e),
            _ => Ok(()),
        }
    }

    pub fn select_node(&self, direction: Direction, node_id: u32) -> Result<(), ClientError> {
        match self.call(Command::SelectNode { direction, node_id })? {
            CommandReply::Ok => Ok(()),
            CommandReply::Err(e) => Err(e),
            _ => Ok(()),
        }
    }

    pub fn register_notification(&self, kind: NotificationKind) -> Result<(), ClientError> {
        match self.call(Command::RegisterNotification(kind))? {
            CommandReply::Ok => Ok(()),
            CommandReply::Err(e) => Err(e),
            _ => Ok(()),
        }
    }

    /// Register the application's connection-status callback
    /// (`CONNECTION_CB` in spec §4.4): invoked by the control task itself,
    /// never from this calling thread, once per transition its reactor
    /// fires.
    pub fn set_connection_callback<F>(&self, callback: F) -> Result<(), ClientError>
    where
        F: Fn(ConnectionEvent) + Send + 'static,
    {
        let cb: ConnectionCallback = Box::new(callback);
        match self.call(Command::SetConnectionCallback(cb))? {
            CommandReply::Ok => Ok(()),
            CommandReply::Err(e) => Err(e),
            _ => Ok(()),
        }
    }

    /// Register the application's per-stream error callback (`err_cb` in
    /// spec §7), fired with a negative errno-style code.
    pub fn set_stream_error_callback<F>(&self, callback: F) -> Result<(), ClientError>
    where
        F: Fn(StreamId, i32) + Send + 'static,
    {
        let cb: StreamErrorCallback = Box::new(callback);
        match self.call(Command::SetStreamErrorCallback(cb))? {
            CommandReply::Ok => Ok(()),
            CommandReply::Err(e) => Err(e),
            _ => Ok(()),
        }
    }

    pub fn shutdown(&self) -> Result<(), ClientError> {
        match self.call(Command::Shutdown)? {
            CommandReply::Ok => Ok(()),
            CommandReply::Err(e) => Err(e),
            _ => Ok(()),
        }
    }
}

/// Parameters for [`Client::add_stream`], split out so call sites don't
/// thread four positional arguments through application code.
#[derive(Debug, Clone, Copy)]
pub struct StreamParams {
    pub direction: Direction,
    pub format: AudioFormat,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
}

/// Convenience constructor bundling a [`Client`] with the connection type
/// it was built for, so callers don't have to remember which socket they
/// dialed.
pub struct ConnectedClient {
    pub client: Client,
    pub connection_type: ConnectionType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CommandReply;
    use crate::stream::CallbackResult;
    use std::thread;
    use std::time::Duration;

    struct NoopCallback;

    impl AudioCallback for NoopCallback {
        fn on_request_data(&mut self, _buf: &mut [u8], _ts: Duration) -> CallbackResult {
            CallbackResult::Eof
        }

        fn on_data_ready(&mut self, _buf: &[u8], _ts: Duration) {}
    }

    #[test]
    fn add_stream_round_trips_through_command_channel() {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let client = Client::new(cmd_tx);

        let handler = thread::spawn(move || {
            let (cmd, reply_tx) = cmd_rx.recv().unwrap();
            assert!(matches!(cmd, Command::AddStream { .. }));
            reply_tx
                .send(CommandReply::StreamId(StreamId::new(1, 0)))
                .unwrap();
        });

        let format = AudioFormat::new(hearth_proto::SampleFormat::S16Le, 48_000, 2);
        let id = client
            .add_stream(Direction::Output, format, 4096, 480, Box::new(NoopCallback))
            .unwrap();
        assert_eq!(id.client_id(), 1);
        handler.join().unwrap();
    }

    #[test]
    fn disconnected_channel_reports_not_connected() {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        drop(cmd_rx);
        let client = Client::new(cmd_tx);
        assert!(matches!(
            client.set_volume(0.5),
            Err(ClientError::NotConnected)
        ));
    }
}
