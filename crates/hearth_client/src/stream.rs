//! The per-stream audio loop: one task per attached stream, blocking on
//! `poll({wake_fd, audio_fd})` with no timeout and driving the
//! application's realtime callback against the stream's shared audio
//! buffer.
//!
//! Grounded in the teacher's `stream.rs` cpal+rtrb realtime callback
//! discipline (no allocations in the hot path, a captured timestamp
//! passed to the callback) but reshaped around the real
//! `audio_fd`/`wake_fd` poll reactor the specification requires instead
//! of a cpal-owned callback thread.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace, warn};

use hearth_proto::{AudioMessage, AudioMessageId, Direction};
use hearth_sab::SharedAudioBuffer;

use crate::error::ClientError;

/// `WARMUP` precedes the server's `STREAM_CONNECTED`; only `wake_fd` is
/// polled then. Once the SAB is attached, `RUNNING` adds `audio_fd` to the
/// poll set. `Eof` is terminal: the task has sent `STREAM_EOF` upstream
/// and is winding down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamThreadState {
    Warmup,
    Running,
    Eof,
}

/// Result of one playback callback invocation: either a frame count
/// written, or a negative value signaling end-of-stream.
pub enum CallbackResult {
    Wrote(u32),
    Eof,
}

/// The application-supplied realtime callback. Must not allocate or
/// block: it runs on the stream's dedicated poll loop.
pub trait AudioCallback: Send {
    /// Playback: fill up to `buf.len()` bytes, return how much was
    /// actually produced (clamped by the caller to `cb_threshold`).
    fn on_request_data(&mut self, buf: &mut [u8], timestamp: Duration) -> CallbackResult;

    /// Capture: samples already delivered into `buf`.
    fn on_data_ready(&mut self, buf: &[u8], timestamp: Duration);
}

/// What the audio task reports back to the control task when it exits.
#[derive(Debug)]
pub enum StreamExit {
    Eof,
    Error(ClientError),
}

pub struct ClientStream {
    pub direction: Direction,
    pub sab: SharedAudioBuffer,
    pub audio_fd: RawFd,
    pub wake_fd: RawFd,
    pub cb_threshold: u32,
    pub frame_bytes: u32,
    state: StreamThreadState,
    /// Reference point for the `ts` field's "timespec of next I/O": the
    /// header stores a `Duration`, not an `Instant`, so this is the origin
    /// every captured timestamp is measured against.
    epoch: Instant,
}

impl ClientStream {
    pub fn new(
        direction: Direction,
        sab: SharedAudioBuffer,
        audio_fd: RawFd,
        wake_fd: RawFd,
        cb_threshold: u32,
        frame_bytes: u32,
    ) -> Self {
        Self {
            direction,
            sab,
            audio_fd,
            wake_fd,
            cb_threshold,
            frame_bytes,
            state: StreamThreadState::Warmup,
            epoch: Instant::now(),
        }
    }

    /// Stamp the SAB header's `ts` field with the time of this I/O
    /// (measured from the stream's epoch) and hand back what was just
    /// written, so the callback's timestamp is always read from the
    /// shared header rather than computed ad hoc at the call site.
    fn capture_io_timestamp(&self) -> Duration {
        let now = self.epoch.elapsed();
        self.sab.set_io_timestamp(now);
        self.sab.io_timestamp()
    }

    /// Move from WARMUP to RUNNING once the SAB is attached, per the
    /// stream-connect composed flow (§4.10 step 3).
    pub fn mark_running(&mut self) {
        self.state = StreamThreadState::Running;
    }

    pub fn state(&self) -> StreamThreadState {
        self.state
    }

    /// Block on the stream's fds and process exactly one readiness event.
    /// Returns `Ok(None)` to keep running, `Ok(Some(exit))` when the task
    /// should terminate.
    pub fn poll_once(
        &mut self,
        callback: &mut dyn AudioCallback,
    ) -> Result<Option<StreamExit>, ClientError> {
        let mut fds = vec![PollFd::new(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(self.wake_fd) },
            PollFlags::POLLIN,
        )];
        if self.state == StreamThreadState::Running {
            fds.push(PollFd::new(
                unsafe { std::os::fd::BorrowedFd::borrow_raw(self.audio_fd) },
                PollFlags::POLLIN,
            ));
        }

        let n = nix::poll::poll(&mut fds, PollTimeout::NONE)
            .map_err(|e| ClientError::Errno(e as i32))?;
        if n == 0 {
            return Ok(None);
        }

        if let Some(audio_events) = fds.get(1).and_then(|f| f.revents()) {
            if audio_events.contains(PollFlags::POLLIN) {
                return self.handle_audio_message(callback);
            }
            if audio_events.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                return Ok(Some(StreamExit::Error(ClientError::NotConnected)));
            }
        }

        if let Some(wake_events) = fds.first().and_then(|f| f.revents()) {
            if wake_events.contains(PollFlags::POLLIN) {
                trace!("stream wake fd fired");
                drain_wake_pipe(self.wake_fd);
            }
        }

        Ok(None)
    }

    fn handle_audio_message(
        &mut self,
        callback: &mut dyn AudioCallback,
    ) -> Result<Option<StreamExit>, ClientError> {
        let mut buf = [0u8; hearth_proto::audio_message::AUDIO_MESSAGE_SIZE];
        let n = nix::unistd::read(self.audio_fd, &mut buf)
            .map_err(|e| ClientError::Errno(e as i32))?;
        if n != buf.len() {
            warn!("short read on audio fd: {} of {} bytes", n, buf.len());
            return Ok(Some(StreamExit::Error(ClientError::Proto(
                hearth_proto::ProtoError::AudioMessageSize {
                    expected: buf.len(),
                    actual: n,
                },
            ))));
        }

        let msg = AudioMessage::from_bytes(&buf).map_err(ClientError::Proto)?;
        match msg.id {
            AudioMessageId::RequestData => self.handle_request_data(msg.frames, callback),
            AudioMessageId::DataReady => self.handle_data_ready(msg.frames, callback),
            AudioMessageId::DataCaptured => Ok(None),
        }
    }

    fn handle_request_data(
        &mut self,
        frames_requested: u32,
        callback: &mut dyn AudioCallback,
    ) -> Result<Option<StreamExit>, ClientError> {
        let frames = frames_requested.min(self.cb_threshold);
        let timestamp = self.capture_io_timestamp();

        let write_space = self.sab.write_space();
        let want_bytes = (frames * self.frame_bytes) as usize;
        let bytes = want_bytes.min(write_space.len());

        let result = callback.on_request_data(&mut write_space[..bytes], timestamp);
        match result {
            CallbackResult::Wrote(k) => {
                let committed_bytes = (k * self.frame_bytes) as usize;
                self.sab.commit_write(committed_bytes)?;
                let reply = AudioMessage::data_ready(k, 0);
                write_audio_message(self.audio_fd, reply)?;
                Ok(None)
            }
            CallbackResult::Eof => {
                let reply = AudioMessage::data_ready(0, -1);
                let _ = write_audio_message(self.audio_fd, reply);
                self.state = StreamThreadState::Eof;
                Ok(Some(StreamExit::Eof))
            }
        }
    }

    fn handle_data_ready(
        &mut self,
        frames_available: u32,
        callback: &mut dyn AudioCallback,
    ) -> Result<Option<StreamExit>, ClientError> {
        let readable = self.sab.read_space();
        let want_bytes = (frames_available * self.frame_bytes) as usize;

        if self.sab.overrun_frames() > 0 && want_bytes > readable.len() {
            warn!("capture overrun exceeds requested read; treating buffer as corrupted");
            return Ok(Some(StreamExit::Error(ClientError::Sab(
                hearth_sab::SabError::InsufficientData {
                    requested: want_bytes,
                    available: readable.len(),
                },
            ))));
        }

        let bytes = want_bytes.min(readable.len());
        let timestamp = self.capture_io_timestamp();
        callback.on_data_ready(&readable[..bytes], timestamp);
        self.sab.commit_read(bytes)?;

        let frames_read = bytes as u32 / self.frame_bytes.max(1);
        let ack = AudioMessage::data_captured(frames_read);
        write_audio_message(self.audio_fd, ack)?;
        Ok(None)
    }
}

fn write_audio_message(fd: RawFd, msg: AudioMessage) -> Result<(), ClientError> {
    let bytes = msg.to_bytes();
    nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &bytes)
        .map_err(|e| ClientError::Errno(e as i32))?;
    Ok(())
}

/// Pluggable priority hook: attempt to raise the calling thread to
/// `SCHED_RR` at `priority`. Failure is non-fatal per §4.3 — the audio
/// task keeps running at whatever scheduling class it already has.
pub fn try_raise_realtime_priority(priority: i32) -> bool {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: `param` is a valid `sched_param` for the current thread
    // (pid 0 means "calling thread" to `sched_setscheduler`).
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
    if rc != 0 {
        warn!(
            "failed to raise audio task to SCHED_RR: {}",
            std::io::Error::last_os_error()
        );
        false
    } else {
        true
    }
}

fn drain_wake_pipe(fd: RawFd) {
    let mut scratch = [0u8; 64];
    loop {
        match nix::unistd::read(fd, &mut scratch) {
            Ok(0) => break,
            Ok(n) if n < scratch.len() => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    debug!("drained stream wake pipe");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ZeroFiller {
        frames_per_call: u32,
    }

    impl AudioCallback for ZeroFiller {
        fn on_request_data(&mut self, buf: &mut [u8], _ts: Duration) -> CallbackResult {
            for b in buf.iter_mut() {
                *b = 0;
            }
            CallbackResult::Wrote(self.frames_per_call)
        }

        fn on_data_ready(&mut self, _buf: &[u8], _ts: Duration) {}
    }

    #[test]
    fn request_data_commits_write_and_replies() {
        let (sab, header_fd, samples_fd) =
            hearth_sab::SharedAudioBuffer::create(4, 4096, 1920).unwrap();
        use std::os::unix::io::AsRawFd;
        let _ = (header_fd.as_raw_fd(), samples_fd.as_raw_fd());

        let (sock_a, sock_b) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None,
            nix::sys::socket::SockFlag::empty(),
        )
        .unwrap();

        let mut stream = ClientStream::new(
            Direction::Output,
            sab,
            sock_a.as_raw_fd() as RawFd,
            -1,
            480,
            4,
        );
        stream.mark_running();

        std::thread::sleep(Duration::from_millis(1));

        let mut cb = ZeroFiller { frames_per_call: 480 };
        let result = stream.handle_request_data(480, &mut cb).unwrap();
        assert!(result.is_none());

        let mut reply_buf = [0u8; hearth_proto::audio_message::AUDIO_MESSAGE_SIZE];
        nix::unistd::read(sock_b.as_raw_fd() as RawFd, &mut reply_buf).unwrap();
        let reply = AudioMessage::from_bytes(&reply_buf).unwrap();
        assert_eq!(reply.id, AudioMessageId::DataReady);
        assert_eq!(reply.frames, 480);

        // The callback's timestamp is read back from the SAB header's `ts`
        // field (spec.md:104), not hardcoded to zero.
        assert!(stream.sab.io_timestamp() > Duration::ZERO);
    }
}
