use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ConvertError, ConvertResult};

const SCRATCH_PREFIX: &str = "video_processing_";

/// Per-run working directory for processed frames.
///
/// The directory is removed when the guard is released or dropped, whichever
/// comes first, so every exit path of a run cleans up exactly once.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    created_at: SystemTime,
    released: bool,
}

impl ScratchDir {
    /// Create a fresh directory under the system temp root.
    pub fn acquire() -> ConvertResult<Self> {
        Self::acquire_in(&std::env::temp_dir())
    }

    /// Create a fresh directory under `root`.
    ///
    /// The name carries a nanosecond timestamp; on the rare collision with a
    /// concurrent run the stamp is bumped until creation succeeds.
    pub fn acquire_in(root: &Path) -> ConvertResult<Self> {
        let scratch_err = |source: io::Error| ConvertError::Scratch {
            root: root.to_path_buf(),
            source,
        };

        fs::create_dir_all(root).map_err(scratch_err)?;

        let created_at = SystemTime::now();
        let mut stamp = created_at.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        loop {
            let path = root.join(format!("{SCRATCH_PREFIX}{stamp}"));
            match fs::create_dir(&path) {
                Ok(()) => {
                    log::debug!("created scratch directory {}", path.display());
                    return Ok(Self {
                        path,
                        created_at,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => stamp += 1,
                Err(e) => return Err(scratch_err(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Remove the directory and everything in it.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("removed scratch directory {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "failed to remove scratch directory {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        self.remove();
    }
}
