//! Numeric constants both sides of the wire must agree on. Values are
//! fixed by the external interface contract and must not be retuned
//! per-deployment.

use std::time::Duration;

/// How long the server waits for in-flight clients to drain on shutdown.
pub const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Default timeout for a blocking `connect_timeout` call.
pub const SERVER_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Sample rate hotword-detector streams are fixed at.
pub const HOTWORD_FRAME_RATE: u32 = 16_000;

/// Frames per hotword detection block.
pub const HOTWORD_BLOCK_SIZE: u32 = 320;

/// Backoff the client's socket state machine waits in `ERROR_DELAY` before
/// retrying `WAIT_FOR_SOCKET`.
pub const ERROR_DELAY: Duration = Duration::from_secs(2);

/// How long an idle output device with no attached default streams stays
/// open before routing closes it.
pub const IDLE_DEVICE_CLOSE: Duration = Duration::from_secs(10);

/// Delay before retrying a failed device open.
pub const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Floor under any computed poll timeout, to avoid busy-waking on a
/// near-zero idle deadline.
pub const MIN_POLL_SLEEP: Duration = Duration::from_millis(10);

/// Maximum number of distinct flexible-loopback pairs the server will
/// allocate; the request past this returns `-EAGAIN`.
pub const NUM_FLOOP_PAIRS_MAX: usize = 20;

/// Upper bound on devices considered in a single routing decision pass.
pub const MAX_OPEN_DEVICES: usize = 10;

/// Device index 0 is reserved to mean "no device".
pub const NO_DEVICE_IDX: u32 = 0;

/// Device indices below this are reserved for fallback/silent devices.
pub const MAX_SPECIAL_DEVICE_IDX: u32 = 2;

/// Largest single `SOCK_SEQPACKET` control-socket datagram either side will
/// `read()`/`write()` in one syscall. Every control message is header plus
/// payload in a single packet (no message exceeds this), so oversized
/// frames are a protocol error rather than something to buffer across
/// multiple reads.
pub const MAX_CONTROL_FRAME: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floop_cap_matches_spec() {
        assert_eq!(NUM_FLOOP_PAIRS_MAX, 20);
    }

    #[test]
    fn timeouts_are_sane_relative_to_each_other() {
        assert!(ERROR_DELAY < IDLE_DEVICE_CLOSE);
        assert!(MIN_POLL_SLEEP < INIT_RETRY_DELAY);
    }
}
