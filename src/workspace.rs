//! Request-scoped workspaces.
//!
//! Every request gets its own directory, `<root>/<uuid>`, and every file the
//! pipeline writes lives inside it. A [`Workspace`] is a cheap, cloneable
//! handle; the directory is removed exactly once, either by an explicit
//! [`Workspace::release`] or when the last handle is dropped.
//!
//! The HTTP layer moves a handle into the response body stream, so the
//! directory outlives the request handler and is removed only once the
//! download has been handed to the transport (or the client went away).

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// How a tracked file is disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Intermediate artifact (uploads, rendered messages, attachments).
    Temp,
    /// Final document or archive handed back to the caller.
    Output,
}

#[derive(Debug)]
struct Inner {
    id: String,
    dir: PathBuf,
    tracked: Mutex<Vec<(PathBuf, Disposition)>>,
    released: AtomicBool,
}

/// Handle to one request's workspace directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    inner: Arc<Inner>,
}

impl Workspace {
    /// Creates a fresh, uniquely named directory under `root`.
    pub fn acquire(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let id = Uuid::new_v4().simple().to_string();
        let dir = root.join(&id);
        // create_dir (not create_dir_all) fails if the directory already exists.
        std::fs::create_dir(&dir)?;
        tracing::debug!(workspace = %id, "workspace acquired");
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                dir,
                tracked: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Allocates a collision-proof path `<stem>-<uuid>.<ext>` and tracks it
    /// as a temp file. Nothing is created on disk.
    pub fn temp_path(&self, stem: &str, ext: &str) -> PathBuf {
        let name = format!("{}-{}.{}", stem, Uuid::new_v4().simple(), ext);
        let path = self.inner.dir.join(name);
        self.track(path.clone(), Disposition::Temp);
        path
    }

    /// Tracks an existing file as an intermediate artifact.
    pub fn register_temp(&self, path: &Path) -> io::Result<()> {
        self.register(path, Disposition::Temp)
    }

    /// Tracks a final document or archive.
    pub fn register_output(&self, path: &Path) -> io::Result<()> {
        self.register(path, Disposition::Output)
    }

    /// Paths registered as outputs, in registration order.
    pub fn outputs(&self) -> Vec<PathBuf> {
        self.tracked_with(Disposition::Output)
    }

    /// Paths registered as temp files, in registration order.
    pub fn temps(&self) -> Vec<PathBuf> {
        self.tracked_with(Disposition::Temp)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Removes the workspace directory and everything in it.
    ///
    /// Only the first call does any work; it returns `true`. Later calls,
    /// and the drop of the last handle after a release, are no-ops.
    pub fn release(&self) -> bool {
        self.inner.release()
    }

    fn register(&self, path: &Path, disposition: Disposition) -> io::Result<()> {
        if !path.starts_with(&self.inner.dir) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path lies outside the workspace",
            ));
        }
        self.track(path.to_path_buf(), disposition);
        Ok(())
    }

    fn track(&self, path: PathBuf, disposition: Disposition) {
        let mut tracked = self
            .inner
            .tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match tracked.iter_mut().find(|(p, _)| *p == path) {
            Some(entry) => entry.1 = disposition,
            None => tracked.push((path, disposition)),
        }
    }

    fn tracked_with(&self, disposition: Disposition) -> Vec<PathBuf> {
        let tracked = self
            .inner
            .tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracked
            .iter()
            .filter(|(_, d)| *d == disposition)
            .map(|(p, _)| p.clone())
            .collect()
    }
}

impl Inner {
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }

        let tracked = std::mem::take(
            &mut *self
                .tracked
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut removed = 0usize;
        for (path, _) in &tracked {
            match std::fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(workspace = %self.id, error = %e, "failed to remove workspace file")
                }
            }
        }

        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(workspace = %self.id, error = %e, "failed to remove workspace directory")
            }
        }

        tracing::debug!(
            workspace = %self.id,
            tracked = tracked.len(),
            removed,
            "workspace released"
        );
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.release();
    }
}
