//! Inter-process resource locks
//!
//! One advisory `flock` per slot. The lock belongs to the open file
//! description, so the kernel drops it once every descriptor sharing it is
//! closed, however the owning processes exit. Forked task processes inherit
//! those descriptors: dropping an [`InterProcessLock`] only closes this
//! process's descriptor and never unlocks, so a slot of a task still running
//! stays locked until that task exits. Lock files are never removed and their
//! existence alone means nothing.

use fs2::FileExt;
use nbeval_core::{NbevalError, NbevalResult, SchedulerConfig};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::slot_pool::SlotKind;

/// Naming scheme of the lock files shared by every scheduler of one user
#[derive(Debug, Clone)]
pub struct LockNamespace {
    dir: PathBuf,
    prefix: String,
    user: String,
}

impl LockNamespace {
    /// Create a namespace rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            user: sanitize(&user.into()),
        }
    }

    /// Namespace described by a scheduler configuration
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let user = config.user.clone().unwrap_or_else(current_user);
        Self::new(&config.lock_dir, &config.lock_prefix, user)
    }

    /// Lock file of one slot, e.g. `/tmp/nbeval_alice_gpu_1`
    pub fn slot_path(&self, kind: SlotKind, index: u32) -> PathBuf {
        self.dir
            .join(format!("{}_{}_{}_{}", self.prefix, self.user, kind, index))
    }

    /// Lock file serializing process starts
    pub fn start_path(&self) -> PathBuf {
        self.dir.join(format!("{}_{}_start", self.prefix, self.user))
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

/// Name of the current OS user
pub fn current_user() -> String {
    for key in ["USER", "LOGNAME", "USERNAME"] {
        if let Ok(user) = std::env::var(key) {
            if !user.is_empty() {
                return user;
            }
        }
    }

    #[cfg(unix)]
    {
        // SAFETY: getuid has no preconditions and cannot fail.
        format!("uid{}", unsafe { libc::getuid() })
    }

    #[cfg(not(unix))]
    {
        "unknown".to_string()
    }
}

fn sanitize(user: &str) -> String {
    user.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Named, non-blocking, inter-process mutual exclusion
#[derive(Debug)]
pub struct InterProcessLock {
    path: PathBuf,
    file: File,
    held: bool,
}

impl InterProcessLock {
    /// Open (creating if needed) the lock file at `path`
    pub fn open(path: impl Into<PathBuf>) -> NbevalResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                NbevalError::Lock(format!(
                    "Failed to create lock directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                NbevalError::Lock(format!(
                    "Failed to open lock file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        Ok(Self {
            path,
            file,
            held: false,
        })
    }

    /// Take the lock if nobody holds it; never blocks
    pub fn try_acquire(&mut self) -> bool {
        debug_assert!(!self.held, "lock {} acquired twice", self.path.display());
        if self.held {
            return true;
        }

        match self.file.try_lock_exclusive() {
            Ok(()) => {
                self.held = true;
                true
            }
            Err(e) if is_contended(&e) => false,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Unexpected lock failure, treating resource as busy"
                );
                false
            }
        }
    }

    /// Release a lock taken by [`try_acquire`](Self::try_acquire)
    ///
    /// Unlocking applies to the shared file description, so this also frees
    /// the slot for task processes that inherited the descriptor.
    pub fn release(&mut self) {
        debug_assert!(
            self.held,
            "released lock {} that is not held",
            self.path.display()
        );
        if !self.held {
            return;
        }

        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to release lock"
            );
        }
        self.held = false;
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}


fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
