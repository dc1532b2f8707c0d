//! Spawns a [`ControlTask`] on its own thread, mirroring the teacher's
//! `AudioEngine::with_config` (`gecko_core::engine`): a dedicated thread
//! built with `thread::Builder`, a command channel into it, and a `Drop`
//! impl that signals shutdown and joins the thread rather than leaking it.
//!
//! [`ClientHandle`] is the thing applications actually construct: it owns
//! the thread, hands out cheap [`Client`] clones, and exposes the control
//! task's `server_event_fd` so [`Client::connect_timeout`] has something
//! to poll.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use nix::unistd::{pipe, write};
use tracing::warn;

use hearth_proto::ConnectionType;

use crate::api::Client;
use crate::control::{Command, CommandReply, ControlTask};
use crate::error::ClientError;

pub struct ClientHandle {
    client: Client,
    command_tx: Sender<(Command, Sender<CommandReply>)>,
    wake_fd: OwnedFd,
    thread: Option<JoinHandle<()>>,
}

impl ClientHandle {
    /// Build a [`ControlTask`] for `connection_type` and run it on its own
    /// thread until dropped.
    pub fn spawn(socket_dir: &Path, connection_type: ConnectionType) -> Result<Self, ClientError> {
        let (command_tx, command_rx) = unbounded::<(Command, Sender<CommandReply>)>();
        let (err_r, err_w) = pipe().map_err(|e| ClientError::Errno(e as i32))?;

        let mut task = ControlTask::new(socket_dir, connection_type, command_rx, err_r.as_raw_fd())?;
        let server_event_fd = task.server_event_fd();

        let thread = thread::Builder::new()
            .name("hearth-control".into())
            .spawn(move || {
                // `err_r` must outlive the loop; it's only ever read to
                // unblock the final poll on shutdown, never dispatched.
                let _held = err_r;
                loop {
                    // `run_once` invokes the application's connection and
                    // stream-error callbacks itself before returning; the
                    // `Ok(event)` it also returns is for tests that assert
                    // on a specific transition and has no further consumer
                    // here.
                    if let Err(e) = task.run_once() {
                        warn!("control task error: {e}");
                        break;
                    }
                    if task.should_stop() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            client: Client::with_server_event_fd(command_tx.clone(), server_event_fd),
            command_tx,
            wake_fd: err_w,
            thread: Some(thread),
        })
    }

    /// A cheap clone of the handle applications pass around; the thread
    /// and its shutdown stay owned by the [`ClientHandle`] itself.
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        let (reply_tx, _reply_rx) = crossbeam_channel::bounded(1);
        let _ = self.command_tx.send((Command::Shutdown, reply_tx));
        // The control task's poll() only wakes on fd activity; a byte on
        // the stream-error pipe (always in its poll set) forces it to
        // notice the shutdown command without waiting on socket/watch
        // activity that may never come.
        let _ = write(&self.wake_fd, &[0u8]);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn spawn_and_drop_joins_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ClientHandle::spawn(dir.path(), ConnectionType::Unified).unwrap();
        let client = handle.client();
        assert!(matches!(
            client.connect_timeout(Duration::from_millis(50)),
            Err(ClientError::ConnectTimedOut)
        ));
        drop(handle);
    }
}
