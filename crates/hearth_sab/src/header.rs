//! Fixed-layout header record for the shared audio buffer.
//!
//! The header is a `repr(C)` struct mapped into both the client's and the
//! server's address space. Every field either belongs exclusively to one
//! side (and is plain), or is read by both sides and is therefore an
//! atomic of matching width so concurrent access is well-defined without a
//! lock — matching the data model's "no locks on the SAB" contract.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Bumped whenever the on-wire layout of [`SabHeader`] changes. A client
/// attaching to a header whose version does not match is a fatal error at
/// attach time, never a silent reinterpretation.
pub const SAB_HEADER_VERSION: u32 = 1;

/// Timestamp stored as seconds + nanoseconds, matching a POSIX
/// `timespec`'s precision without depending on libc's type directly in the
/// shared layout.
#[repr(C)]
#[derive(Debug, Default)]
pub struct RawTimespec {
    pub sec: AtomicU64,
    pub nsec: AtomicU32,
    _pad: u32,
}

impl RawTimespec {
    pub fn store(&self, t: std::time::Duration) {
        self.sec.store(t.as_secs(), Ordering::Release);
        self.nsec.store(t.subsec_nanos(), Ordering::Release);
    }

    pub fn load(&self) -> std::time::Duration {
        std::time::Duration::new(
            self.sec.load(Ordering::Acquire),
            self.nsec.load(Ordering::Acquire),
        )
    }
}

/// The SAB header: everything needed to interpret the ping-pong samples
/// region that follows it in the same mapping.
///
/// Only one side advances each index (the data model's single-producer,
/// single-consumer invariant): the writer owns `write_buf_idx` and
/// `write_offset`, the reader owns `read_buf_idx` and `read_offset`.
/// `volume_scaler` and `mute` are written by the client control task and
/// read by both the audio task and the server without locking.
#[repr(C)]
pub struct SabHeader {
    pub version: AtomicU32,
    pub read_buf_idx: AtomicU32,
    pub write_buf_idx: AtomicU32,
    pub read_offset: [AtomicU32; 2],
    pub write_offset: [AtomicU32; 2],
    pub frame_bytes: AtomicU32,
    pub buffer_frames: AtomicU32,
    pub used_size: AtomicU32,
    /// f32 volume, bit-cast into a u32 so it can be stored/loaded
    /// atomically without torn reads.
    pub volume_scaler_bits: AtomicU32,
    pub mute: AtomicU8,
    pub callback_pending: AtomicU8,
    _pad: [u8; 2],
    pub overrun_frames: AtomicU32,
    pub dropped_samples_duration: RawTimespec,
    pub underrun_duration: RawTimespec,
    pub ts: RawTimespec,
}

pub const SAB_HEADER_SIZE: usize = std::mem::size_of::<SabHeader>();

impl SabHeader {
    /// Initialize a freshly mapped, zeroed header region in place.
    pub fn init(&self, frame_bytes: u32, buffer_frames: u32, used_size: u32) {
        self.version.store(SAB_HEADER_VERSION, Ordering::Release);
        self.read_buf_idx.store(0, Ordering::Release);
        self.write_buf_idx.store(0, Ordering::Release);
        self.read_offset[0].store(0, Ordering::Release);
        self.read_offset[1].store(0, Ordering::Release);
        self.write_offset[0].store(0, Ordering::Release);
        self.write_offset[1].store(0, Ordering::Release);
        self.frame_bytes.store(frame_bytes, Ordering::Release);
        self.buffer_frames.store(buffer_frames, Ordering::Release);
        self.used_size.store(used_size, Ordering::Release);
        self.set_volume_scaler(1.0);
        self.mute.store(0, Ordering::Release);
        self.callback_pending.store(0, Ordering::Release);
        self.overrun_frames.store(0, Ordering::Release);
    }

    pub fn volume_scaler(&self) -> f32 {
        f32::from_bits(self.volume_scaler_bits.load(Ordering::Acquire))
    }

    pub fn set_volume_scaler(&self, v: f32) {
        let clamped = v.clamp(0.0, 1.0);
        self.volume_scaler_bits
            .store(clamped.to_bits(), Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.mute.load(Ordering::Acquire) != 0
    }

    pub fn set_muted(&self, muted: bool) {
        self.mute.store(muted as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_header() -> Box<SabHeader> {
        // SAFETY: all-zero is a valid bit pattern for every field (atomics
        // of primitive integer types), matching how a freshly mmap'd
        // zero-filled page would look before `init` runs.
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn init_sets_expected_defaults() {
        let h = boxed_header();
        h.init(4, 4096, 4096 * 4);
        assert_eq!(h.version.load(Ordering::Acquire), SAB_HEADER_VERSION);
        assert_eq!(h.volume_scaler(), 1.0);
        assert!(!h.is_muted());
    }

    #[test]
    fn volume_scaler_clamps_out_of_range() {
        let h = boxed_header();
        h.init(4, 4096, 4096 * 4);
        h.set_volume_scaler(2.5);
        assert_eq!(h.volume_scaler(), 1.0);
        h.set_volume_scaler(-1.0);
        assert_eq!(h.volume_scaler(), 0.0);
    }

    #[test]
    fn timespec_roundtrips() {
        let h = boxed_header();
        h.init(4, 4096, 4096 * 4);
        h.ts.store(std::time::Duration::new(5, 250));
        let back = h.ts.load();
        assert_eq!(back.as_secs(), 5);
        assert_eq!(back.subsec_nanos(), 250);
    }
}
