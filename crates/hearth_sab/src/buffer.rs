//! The shared audio buffer: a [`SabHeader`] followed in the same mapping
//! region by `2 × used_size` bytes of PCM, organized as a two-buffer
//! ping-pong ring.
//!
//! One side is the producer and the other the consumer for a given
//! direction (client produces on playback, consumes on capture; the
//! server is the mirror image). Each advances only its own offset; the
//! invariant `0 ≤ read_offset[i] ≤ write_offset[i] ≤ used_size` is
//! enforced on every commit.

use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::Ordering;

use memmap2::MmapMut;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;

use crate::error::SabError;
use crate::header::{SabHeader, SAB_HEADER_SIZE, SAB_HEADER_VERSION};

/// Allocate an anonymous, sealable shared-memory file of `size` bytes and
/// return its fd, ready to be sent as an `SCM_RIGHTS` ancillary fd.
pub fn alloc_shm(name: &str, size: usize) -> Result<OwnedFd, SabError> {
    let cname = std::ffi::CString::new(name).unwrap_or_default();
    let fd = memfd_create(&cname, MemFdCreateFlag::MFD_CLOEXEC).map_err(|e| {
        SabError::Mmap(std::io::Error::from_raw_os_error(e as i32))
    })?;
    ftruncate(&fd, size as i64).map_err(|e| SabError::Mmap(std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(fd)
}

fn mmap_fd(fd: RawFd, size: usize) -> Result<MmapMut, SabError> {
    // SAFETY: the fd is a shm/memfd region sized to at least `size` bytes
    // by the caller (enforced via ftruncate on creation, or trusted from
    // the STREAM_CONNECTED reply on the attach side).
    let file = unsafe { File::from_raw_fd(fd) };
    let mmap = unsafe { MmapMut::map_mut(&file)? };
    std::mem::forget(file); // fd ownership stays with the caller
    if mmap.len() < size {
        return Err(SabError::SizeMismatch {
            expected: size,
            actual: mmap.len(),
        });
    }
    Ok(mmap)
}

/// An attached shared audio buffer: header region plus samples region,
/// each backed by its own mapping (and, on the wire, its own fd per the
/// `STREAM_CONNECTED` reply carrying two shm fds).
pub struct SharedAudioBuffer {
    header_map: MmapMut,
    samples_map: MmapMut,
    used_size: usize,
}

impl SharedAudioBuffer {
    /// Create a fresh pair of regions sized for `buffer_frames` frames of
    /// `frame_bytes`-wide audio, with `used_size` bytes usable per
    /// ping-pong half (typically `cb_threshold * frame_bytes`, rounded to
    /// the negotiated buffer geometry).
    pub fn create(frame_bytes: u32, buffer_frames: u32, used_size: u32) -> Result<(Self, OwnedFd, OwnedFd), SabError> {
        let header_fd = alloc_shm("hearth-sab-header", SAB_HEADER_SIZE)?;
        let samples_fd = alloc_shm("hearth-sab-samples", used_size as usize * 2)?;

        let header_map = mmap_fd(header_fd.as_raw_fd(), SAB_HEADER_SIZE)?;
        let samples_map = mmap_fd(samples_fd.as_raw_fd(), used_size as usize * 2)?;

        let sab = Self {
            header_map,
            samples_map,
            used_size: used_size as usize,
        };
        sab.header().init(frame_bytes, buffer_frames, used_size);

        Ok((sab, header_fd, samples_fd))
    }

    /// Attach to regions created by the peer, identified by fds received
    /// over `SCM_RIGHTS`. The header's version is checked immediately;
    /// mismatch is fatal at attach, never silently reinterpreted.
    pub fn attach(header_fd: RawFd, samples_fd: RawFd, used_size: usize) -> Result<Self, SabError> {
        let header_map = mmap_fd(header_fd, SAB_HEADER_SIZE)?;
        let samples_map = mmap_fd(samples_fd, used_size * 2)?;

        let sab = Self {
            header_map,
            samples_map,
            used_size,
        };

        let version = sab.header().version.load(Ordering::Acquire);
        if version != SAB_HEADER_VERSION {
            return Err(SabError::VersionMismatch {
                expected: SAB_HEADER_VERSION,
                actual: version,
            });
        }
        Ok(sab)
    }

    fn header(&self) -> &SabHeader {
        debug_assert!(self.header_map.len() >= SAB_HEADER_SIZE);
        // SAFETY: header_map is exactly SAB_HEADER_SIZE bytes of a valid
        // SabHeader bit pattern (initialized by `create`, or trusted from
        // a peer that itself called `create`).
        unsafe { &*(self.header_map.as_ptr() as *const SabHeader) }
    }

    pub fn volume_scaler(&self) -> f32 {
        self.header().volume_scaler()
    }

    pub fn set_volume_scaler(&self, v: f32) {
        self.header().set_volume_scaler(v)
    }

    pub fn is_muted(&self) -> bool {
        self.header().is_muted()
    }

    pub fn set_muted(&self, m: bool) {
        self.header().set_muted(m)
    }

    pub fn overrun_frames(&self) -> u32 {
        self.header().overrun_frames.load(Ordering::Acquire)
    }

    fn buf_slice(&self, buf_idx: usize) -> &[u8] {
        let start = buf_idx * self.used_size;
        &self.samples_map[start..start + self.used_size]
    }

    fn buf_slice_mut(&mut self, buf_idx: usize) -> &mut [u8] {
        let start = buf_idx * self.used_size;
        &mut self.samples_map[start..start + self.used_size]
    }

    /// Producer-side: the writable region of the currently open write
    /// buffer, from the current write offset to `used_size`.
    pub fn write_space(&mut self) -> &mut [u8] {
        let idx = self.header().write_buf_idx.load(Ordering::Acquire) as usize;
        let offset = self.header().write_offset[idx].load(Ordering::Acquire) as usize;
        &mut self.buf_slice_mut(idx)[offset..]
    }

    /// Commit `bytes` just written into the current write buffer,
    /// advancing `write_offset`. When the half fills, flip
    /// `write_buf_idx` and reset the new half's write offset to zero.
    /// Returns `true` if the half was flipped (i.e. a `DATA_READY`
    /// message should now be sent).
    pub fn commit_write(&mut self, bytes: usize) -> Result<bool, SabError> {
        let h = self.header();
        let idx = h.write_buf_idx.load(Ordering::Acquire) as usize;
        let offset = h.write_offset[idx].load(Ordering::Acquire) as usize;
        let new_offset = offset + bytes;
        if new_offset > self.used_size {
            return Err(SabError::InsufficientSpace {
                requested: bytes,
                available: self.used_size - offset,
            });
        }
        h.write_offset[idx].store(new_offset as u32, Ordering::Release);

        if new_offset == self.used_size {
            let next_idx = 1 - idx;
            h.write_offset[next_idx].store(0, Ordering::Release);
            h.write_buf_idx.store(next_idx as u32, Ordering::Release);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Consumer-side: the readable region of the currently open read
    /// buffer, from the read offset up to the producer's write offset in
    /// that same half (the invariant enforced throughout: read never
    /// passes write).
    pub fn read_space(&self) -> &[u8] {
        let h = self.header();
        let idx = h.read_buf_idx.load(Ordering::Acquire) as usize;
        let read_off = h.read_offset[idx].load(Ordering::Acquire) as usize;
        let write_off = h.write_offset[idx].load(Ordering::Acquire) as usize;
        &self.buf_slice(idx)[read_off..write_off.max(read_off)]
    }

    /// Commit `bytes` just consumed from the current read buffer. When the
    /// half is fully drained and the producer has already moved past it,
    /// flip `read_buf_idx`.
    pub fn commit_read(&mut self, bytes: usize) -> Result<(), SabError> {
        let h = self.header();
        let idx = h.read_buf_idx.load(Ordering::Acquire) as usize;
        let read_off = h.read_offset[idx].load(Ordering::Acquire) as usize;
        let write_off = h.write_offset[idx].load(Ordering::Acquire) as usize;
        let new_read_off = read_off + bytes;
        if new_read_off > write_off {
            return Err(SabError::InvariantViolated {
                read_offset: new_read_off,
                write_offset: write_off,
            });
        }
        h.read_offset[idx].store(new_read_off as u32, Ordering::Release);

        let write_idx = h.write_buf_idx.load(Ordering::Acquire) as usize;
        if new_read_off == self.used_size && write_idx != idx {
            let next_idx = 1 - idx;
            h.read_offset[next_idx].store(0, Ordering::Release);
            h.read_buf_idx.store(next_idx as u32, Ordering::Release);
        }
        Ok(())
    }

    pub fn record_overrun(&self, frames: u32) {
        self.header().overrun_frames.fetch_add(frames, Ordering::AcqRel);
    }

    pub fn set_io_timestamp(&self, t: std::time::Duration) {
        self.header().ts.store(t);
    }

    /// The header's `ts` field: the timespec of the next I/O, per the data
    /// model. Whichever side just performed the I/O stamps it before
    /// handing control back, so the other side (or this same side, for a
    /// stream whose device is out of this crate's scope) always has a
    /// fresh value to derive a callback timestamp from.
    pub fn io_timestamp(&self) -> std::time::Duration {
        self.header().ts.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_attach_roundtrip() {
        let (sab, header_fd, samples_fd) = SharedAudioBuffer::create(4, 4096, 1920).unwrap();
        assert_eq!(sab.volume_scaler(), 1.0);

        let attached = SharedAudioBuffer::attach(header_fd.as_raw_fd(), samples_fd.as_raw_fd(), 1920).unwrap();
        assert_eq!(attached.volume_scaler(), 1.0);
    }

    #[test]
    fn write_then_read_respects_invariant() {
        let (mut sab, _h, _s) = SharedAudioBuffer::create(4, 4096, 16).unwrap();
        {
            let ws = sab.write_space();
            assert_eq!(ws.len(), 16);
            ws[0..4].copy_from_slice(&[1, 2, 3, 4]);
        }
        let flipped = sab.commit_write(4).unwrap();
        assert!(!flipped);

        let rs = sab.read_space();
        assert_eq!(rs, &[1, 2, 3, 4]);
        sab.commit_read(4).unwrap();
    }

    #[test]
    fn overrun_reads_past_write_are_rejected() {
        let (mut sab, _h, _s) = SharedAudioBuffer::create(4, 4096, 16).unwrap();
        let err = sab.commit_read(4).unwrap_err();
        assert!(matches!(err, SabError::InvariantViolated { .. }));
    }

    #[test]
    fn full_half_flips_write_buf_idx() {
        let (mut sab, _h, _s) = SharedAudioBuffer::create(4, 4096, 8).unwrap();
        sab.write_space()[..8].copy_from_slice(&[0; 8]);
        let flipped = sab.commit_write(8).unwrap();
        assert!(flipped);
    }

    #[test]
    fn io_timestamp_roundtrips_through_set_and_get() {
        let (sab, _h, _s) = SharedAudioBuffer::create(4, 4096, 16).unwrap();
        assert_eq!(sab.io_timestamp(), std::time::Duration::ZERO);
        sab.set_io_timestamp(std::time::Duration::new(2, 500));
        assert_eq!(sab.io_timestamp(), std::time::Duration::new(2, 500));
    }

    #[test]
    fn version_mismatch_is_fatal_at_attach() {
        let (_sab, header_fd, samples_fd) = SharedAudioBuffer::create(4, 4096, 16).unwrap();
        // Corrupt the version field directly through a second mapping.
        let map = mmap_fd(header_fd.as_raw_fd(), SAB_HEADER_SIZE).unwrap();
        let h = unsafe { &*(map.as_ptr() as *const SabHeader) };
        h.version.store(999, Ordering::Release);

        let err = SharedAudioBuffer::attach(header_fd.as_raw_fd(), samples_fd.as_raw_fd(), 16).unwrap_err();
        assert!(matches!(err, SabError::VersionMismatch { .. }));
    }
}
