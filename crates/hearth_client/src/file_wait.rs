//! File-path watcher used by the socket state machine to wait for the
//! server socket file to appear, and to notice its deletion.
//!
//! Ported from `cras_file_wait.c`'s directory-climbing inotify watch: the
//! target path's parent directory is watched; if that directory itself
//! doesn't exist yet, the watch climbs to its parent, and so on, until an
//! existing ancestor is found. A watch on an intermediate ancestor is
//! replaced once the real parent directory appears.

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::inotify::{AddWatchFlags, Inotify, InitFlags, WatchDescriptor};
use nix::unistd::access;
use nix::NixPath;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileWaitEvent {
    Created,
    Deleted,
}

/// Watches a single absolute path for creation/deletion, climbing parent
/// directories as needed when intermediate directories don't exist yet.
pub struct FileWait {
    target: PathBuf,
    inotify: Inotify,
    watch: Option<WatchDescriptor>,
    /// The directory currently watched; `None` until the first successful
    /// `inotify_add_watch`.
    watch_dir: Option<PathBuf>,
    /// Base name being watched for within `watch_dir`.
    watch_file_name: Option<String>,
}

impl FileWait {
    /// Create a watcher for `target` and perform the initial watch setup,
    /// mirroring `cras_file_wait_create`'s eager call into dispatch.
    pub fn new(target: impl AsRef<Path>) -> Result<(Self, Option<FileWaitEvent>), ClientError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| ClientError::Errno(e as i32))?;

        let mut fw = Self {
            target: target.as_ref().to_path_buf(),
            inotify,
            watch: None,
            watch_dir: None,
            watch_file_name: None,
        };
        let event = fw.establish_watch()?;
        Ok((fw, event))
    }

    pub fn fd(&self) -> RawFd {
        self.inotify.as_raw_fd()
    }

    /// Climb from the target path upward until `inotify_add_watch`
    /// succeeds on an existing directory, race-checking for the file's
    /// existence after each watch is armed. Returns `Some(Created)`
    /// synchronously if the race check finds the exact target already
    /// present.
    fn establish_watch(&mut self) -> Result<Option<FileWaitEvent>, ClientError> {
        let mut watch_dir = self.target.clone();

        loop {
            let watch_path = watch_dir.clone();
            let file_name = watch_path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parent = watch_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));

            let flags = AddWatchFlags::IN_CREATE
                | AddWatchFlags::IN_MOVED_TO
                | AddWatchFlags::IN_DELETE
                | AddWatchFlags::IN_MOVED_FROM;

            match self.inotify.add_watch(&parent, flags) {
                Ok(wd) => {
                    self.watch = Some(wd);
                    self.watch_dir = Some(parent.clone());
                    self.watch_file_name = Some(file_name.clone());

                    // Race-check: the file may already exist between the
                    // directory coming into being and the watch being
                    // armed.
                    match access(&watch_path, nix::unistd::AccessFlags::F_OK) {
                        Ok(()) => {
                            if watch_path == self.target {
                                return Ok(Some(FileWaitEvent::Created));
                            }
                            // An intermediate ancestor appeared; drop this
                            // watch and restart from the real target.
                            self.remove_watch();
                            watch_dir = self.target.clone();
                            continue;
                        }
                        Err(nix::errno::Errno::ENOENT) => return Ok(None),
                        Err(e) => return Err(ClientError::Errno(e as i32)),
                    }
                }
                Err(nix::errno::Errno::ENOENT) | Err(nix::errno::Errno::EACCES) => {
                    if parent == watch_dir {
                        // Reached the root without success; give up rather
                        // than loop forever.
                        return Err(ClientError::Errno(nix::errno::Errno::ENOENT as i32));
                    }
                    watch_dir = parent;
                    continue;
                }
                Err(e) => return Err(ClientError::Errno(e as i32)),
            }
        }
    }

    fn remove_watch(&mut self) {
        if let Some(wd) = self.watch.take() {
            let _ = self.inotify.rm_watch(wd);
        }
        self.watch_dir = None;
        self.watch_file_name = None;
    }

    /// Read and process pending inotify events, re-arming the watch if
    /// the kernel removed it (`IN_IGNORED`, e.g. the watched directory was
    /// itself deleted).
    pub fn dispatch(&mut self) -> Result<Vec<FileWaitEvent>, ClientError> {
        let mut out = Vec::new();
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(nix::errno::Errno::EAGAIN) => return Ok(out),
            Err(e) => return Err(ClientError::Errno(e as i32)),
        };

        let Some(watch_file_name) = self.watch_file_name.clone() else {
            return Ok(out);
        };

        for event in events {
            if event.wd != self.watch.clone().expect("watch set while watch_file_name is set") {
                continue;
            }
            if event.mask.contains(nix::sys::inotify::AddWatchFlags::IN_IGNORED) {
                self.watch = None;
                self.watch_dir = None;
                self.watch_file_name = None;
                if let Some(ev) = self.establish_watch()? {
                    out.push(ev);
                }
                continue;
            }

            let Some(name) = event.name.as_ref() else {
                continue;
            };
            if name.to_string_lossy() != watch_file_name {
                continue;
            }

            if event.mask.intersects(
                nix::sys::inotify::AddWatchFlags::IN_CREATE
                    | nix::sys::inotify::AddWatchFlags::IN_MOVED_TO,
            ) {
                out.push(FileWaitEvent::Created);
            } else if event.mask.intersects(
                nix::sys::inotify::AddWatchFlags::IN_DELETE
                    | nix::sys::inotify::AddWatchFlags::IN_MOVED_FROM,
            ) {
                out.push(FileWaitEvent::Deleted);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn watch_armed_on_nonexistent_parent_reports_nothing_yet() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("not-there-yet").join("sock");
        let (fw, ev) = FileWait::new(&target).unwrap();
        assert!(ev.is_none());
        assert!(fw.fd() >= 0);
    }

    #[test]
    fn race_check_detects_file_already_present() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sock");
        fs::write(&target, b"").unwrap();

        let (_fw, ev) = FileWait::new(&target).unwrap();
        assert_eq!(ev, Some(FileWaitEvent::Created));
    }

    #[test]
    fn dispatch_reports_creation_after_watch_armed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sock");
        let (mut fw, ev) = FileWait::new(&target).unwrap();
        assert!(ev.is_none());

        fs::write(&target, b"").unwrap();
        // Give inotify a moment to queue the event in CI environments.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let events = fw.dispatch().unwrap();
        assert!(events.contains(&FileWaitEvent::Created));
    }
}
