use fs2::FileExt;
use rand::Rng;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::trace;

/* Status files are shared between workers of this process and between
 * repeated invocations of the whole program, possibly on a slow network
 * filesystem. An advisory lock next to the status file is the only
 * coordination primitive; it is held across one read or one write, never
 * across a child process run.
 * */

/// bound for a single lock acquisition, matching the status protocol
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const POLL_JITTER_MS: u64 = 100;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("gave up on lock {path} after {waited:?}")]
    Timeout { path: PathBuf, waited: Duration },
    #[error("failed to open or lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusively held advisory lock, released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(error) = self.file.unlock() {
            trace!(path = ?self.path, ?error, "failed to unlock, the fd close will release it");
        }
    }
}

/// Acquire an exclusive lock on `path`, polling until success or `timeout`.
///
/// The lock file is created if it does not exist and is never removed;
/// its flock state is the lock, not its presence.
pub fn acquire(path: &Path, timeout: Duration) -> Result<LockGuard, LockError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let start = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                trace!(path = ?path, "acquired status lock");
                return Ok(LockGuard {
                    file,
                    path: path.to_path_buf(),
                });
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                let waited = start.elapsed();
                if waited >= timeout {
                    return Err(LockError::Timeout {
                        path: path.to_path_buf(),
                        waited,
                    });
                }
                let jitter = rand::thread_rng().gen_range(0..=POLL_JITTER_MS);
                std::thread::sleep(POLL_INTERVAL + Duration::from_millis(jitter));
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}
