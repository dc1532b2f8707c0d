//! The process-wide server-state shared region: a single-writer,
//! many-reader mapping guarded by a seqlock-style `update_count` protocol
//! instead of a kernel lock, per the redesign note to model global state
//! as an explicit shared object with a documented read protocol rather
//! than hidden module state.
//!
//! `update_count` is odd while the writer is mid-update; readers spin
//! until it is even, fence, read every field, fence again, and retry if
//! the count changed underneath them. This mirrors the SAB's own
//! "single-writer" discipline but is a distinct region: the SAB carries
//! per-stream audio state, this carries system-wide mixer state that
//! every client observes (volume, mute, node list generation).

use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use memmap2::MmapMut;

use crate::buffer::alloc_shm;
use crate::error::SabError;

pub const SERVER_STATE_REGION_SIZE: usize = std::mem::size_of::<ServerStateRegion>();

/// Bumped whenever this region's layout changes; mismatched versions are
/// refused at attach, matching the SAB header's own version gate.
pub const SERVER_STATE_VERSION: u32 = 1;

#[repr(C)]
pub struct ServerStateRegion {
    pub version: AtomicU32,
    /// Odd while being written; even and unchanged across a read means the
    /// read observed a consistent snapshot.
    pub update_count: AtomicU32,
    pub system_volume: AtomicU32,
    pub system_mute: AtomicBool,
    pub system_mute_locked: AtomicBool,
    pub capture_gain: AtomicI32,
    pub capture_mute: AtomicBool,
    pub capture_mute_locked: AtomicBool,
    /// Incremented every time the node list changes shape, so readers can
    /// tell whether their cached copy is stale without re-fetching the
    /// whole list on every poll.
    pub nodes_generation: AtomicU32,
    pub num_output_streams: AtomicU32,
    pub num_input_streams: AtomicU32,
    pub nc_blocked: AtomicBool,
}

impl Default for ServerStateRegion {
    fn default() -> Self {
        Self {
            version: AtomicU32::new(SERVER_STATE_VERSION),
            update_count: AtomicU32::new(0),
            system_volume: AtomicU32::new(100),
            system_mute: AtomicBool::new(false),
            system_mute_locked: AtomicBool::new(false),
            capture_gain: AtomicI32::new(0),
            capture_mute: AtomicBool::new(false),
            capture_mute_locked: AtomicBool::new(false),
            nodes_generation: AtomicU32::new(0),
            num_output_streams: AtomicU32::new(0),
            num_input_streams: AtomicU32::new(0),
            nc_blocked: AtomicBool::new(false),
        }
    }
}

/// A consistent snapshot of the region, returned by [`ServerStateRegion::read`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerStateSnapshot {
    pub system_volume: u32,
    pub system_mute: bool,
    pub capture_gain: i32,
    pub capture_mute: bool,
    pub nodes_generation: u32,
    pub num_output_streams: u32,
    pub num_input_streams: u32,
    pub nc_blocked: bool,
}

impl ServerStateRegion {
    /// Initialize a freshly mapped, zeroed region in place, mirroring
    /// [`crate::header::SabHeader::init`]'s explicit-store-over-zeroed-bytes
    /// shape.
    pub fn init(&self) {
        self.version.store(SERVER_STATE_VERSION, Ordering::Release);
        self.update_count.store(0, Ordering::Release);
        self.system_volume.store(100, Ordering::Release);
        self.system_mute.store(false, Ordering::Release);
        self.system_mute_locked.store(false, Ordering::Release);
        self.capture_gain.store(0, Ordering::Release);
        self.capture_mute.store(false, Ordering::Release);
        self.capture_mute_locked.store(false, Ordering::Release);
        self.nodes_generation.store(0, Ordering::Release);
        self.num_output_streams.store(0, Ordering::Release);
        self.num_input_streams.store(0, Ordering::Release);
        self.nc_blocked.store(false, Ordering::Release);
    }

    /// Single-writer entry point: the server, and only the server, calls
    /// this to mutate the region. `update_count` goes odd, the closure
    /// runs, then it goes even again - two fences bracket the mutation so
    /// readers never observe a torn write.
    pub fn write<F: FnOnce(&Self)>(&self, f: F) {
        let before = self.update_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(before % 2 == 0, "writer re-entered mid-update");
        std::sync::atomic::fence(Ordering::Release);
        f(self);
        std::sync::atomic::fence(Ordering::Release);
        self.update_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Many-reader entry point: spin-yield while `update_count` is odd,
    /// snapshot every field, then retry if the count changed during the
    /// read.
    pub fn read(&self) -> ServerStateSnapshot {
        loop {
            let before = self.update_count.load(Ordering::Acquire);
            if before % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            std::sync::atomic::fence(Ordering::Acquire);
            let snapshot = ServerStateSnapshot {
                system_volume: self.system_volume.load(Ordering::Relaxed),
                system_mute: self.system_mute.load(Ordering::Relaxed),
                capture_gain: self.capture_gain.load(Ordering::Relaxed),
                capture_mute: self.capture_mute.load(Ordering::Relaxed),
                nodes_generation: self.nodes_generation.load(Ordering::Relaxed),
                num_output_streams: self.num_output_streams.load(Ordering::Relaxed),
                num_input_streams: self.num_input_streams.load(Ordering::Relaxed),
                nc_blocked: self.nc_blocked.load(Ordering::Relaxed),
            };
            std::sync::atomic::fence(Ordering::Acquire);
            let after = self.update_count.load(Ordering::Acquire);
            if after == before {
                return snapshot;
            }
        }
    }
}

fn mmap_region(fd: RawFd) -> Result<MmapMut, SabError> {
    // SAFETY: the fd is a memfd region sized to at least
    // `SERVER_STATE_REGION_SIZE` bytes, either just allocated by
    // `ServerStateOwner::create` or trusted from the `CLIENT_CONNECTED`
    // reply that sent it.
    let file = unsafe { File::from_raw_fd(fd) };
    let mmap = unsafe { MmapMut::map_mut(&file)? };
    std::mem::forget(file);
    if mmap.len() < SERVER_STATE_REGION_SIZE {
        return Err(SabError::SizeMismatch {
            expected: SERVER_STATE_REGION_SIZE,
            actual: mmap.len(),
        });
    }
    Ok(mmap)
}

/// The server's own handle on the region it just allocated: kept alive for
/// the process's whole lifetime, since every `CLIENT_CONNECTED` reply
/// hands out a fresh `SCM_RIGHTS` duplicate of the same fd rather than
/// allocating a new region per client.
pub struct ServerStateOwner {
    map: MmapMut,
    fd: OwnedFd,
}

impl ServerStateOwner {
    /// Allocate and initialize a fresh region, returning both the owner
    /// (which the caller keeps for the server's lifetime) and the fd to
    /// send over `SCM_RIGHTS` on every client handshake.
    pub fn create() -> Result<Self, SabError> {
        let fd = alloc_shm("hearth-server-state", SERVER_STATE_REGION_SIZE)?;
        let map = mmap_region(fd.as_raw_fd())?;
        let owner = Self { map, fd };
        owner.region().init();
        Ok(owner)
    }

    pub fn region(&self) -> &ServerStateRegion {
        debug_assert!(self.map.len() >= SERVER_STATE_REGION_SIZE);
        unsafe { &*(self.map.as_ptr() as *const ServerStateRegion) }
    }

    /// A fresh `SCM_RIGHTS`-sendable duplicate of the owning fd. Every
    /// client gets its own dup so each client's socket close doesn't
    /// affect the others' mapping (a shared memfd survives independent
    /// `close()`s on its duplicated fds).
    pub fn dup_fd(&self) -> Result<OwnedFd, SabError> {
        nix::unistd::dup(self.fd.as_raw_fd())
            .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
            .map_err(|e| SabError::Mmap(std::io::Error::from_raw_os_error(e as i32)))
    }
}

/// A client's attached view of the server-state region, received over
/// `SCM_RIGHTS` on `CLIENT_CONNECTED`.
pub struct ServerStateHandle {
    map: MmapMut,
}

impl ServerStateHandle {
    pub fn attach(fd: RawFd) -> Result<Self, SabError> {
        let map = mmap_region(fd)?;
        let handle = Self { map };
        let version = handle.region().version.load(Ordering::Acquire);
        if version != SERVER_STATE_VERSION {
            return Err(SabError::VersionMismatch {
                expected: SERVER_STATE_VERSION,
                actual: version,
            });
        }
        Ok(handle)
    }

    pub fn region(&self) -> &ServerStateRegion {
        debug_assert!(self.map.len() >= SERVER_STATE_REGION_SIZE);
        unsafe { &*(self.map.as_ptr() as *const ServerStateRegion) }
    }

    pub fn read(&self) -> ServerStateSnapshot {
        self.region().read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn write_then_read_observes_new_values() {
        let region = ServerStateRegion::default();
        region.write(|r| {
            r.system_volume.store(42, Ordering::Relaxed);
            r.system_mute.store(true, Ordering::Relaxed);
        });
        let snap = region.read();
        assert_eq!(snap.system_volume, 42);
        assert!(snap.system_mute);
    }

    #[test]
    fn concurrent_reads_during_writes_never_see_a_torn_snapshot() {
        let region = Arc::new(ServerStateRegion::default());
        let writer_region = region.clone();
        let writer = thread::spawn(move || {
            for i in 0..500u32 {
                writer_region.write(|r| {
                    r.system_volume.store(i, Ordering::Relaxed);
                    r.nodes_generation.store(i, Ordering::Relaxed);
                });
            }
        });

        for _ in 0..500 {
            let snap = region.read();
            assert_eq!(snap.system_volume, snap.nodes_generation);
        }
        writer.join().unwrap();
    }

    #[test]
    fn update_count_is_even_between_writes() {
        let region = ServerStateRegion::default();
        region.write(|_| {});
        assert_eq!(region.update_count.load(Ordering::Acquire) % 2, 0);
    }

    #[test]
    fn owner_create_and_handle_attach_roundtrip() {
        let owner = ServerStateOwner::create().unwrap();
        owner.region().write(|r| {
            r.system_volume.store(55, Ordering::Relaxed);
        });

        let dup = owner.dup_fd().unwrap();
        let handle = ServerStateHandle::attach(dup.as_raw_fd()).unwrap();
        assert_eq!(handle.read().system_volume, 55);
    }

    #[test]
    fn handle_attach_rejects_version_mismatch() {
        let owner = ServerStateOwner::create().unwrap();
        owner.region().version.store(999, Ordering::Release);
        let dup = owner.dup_fd().unwrap();
        let err = ServerStateHandle::attach(dup.as_raw_fd()).unwrap_err();
        assert!(matches!(err, SabError::VersionMismatch { .. }));
    }
}
