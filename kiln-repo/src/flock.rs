//! Advisory file locking (§4.3), grounded on the fixed-interval retry loop
//! used by the repository metadata lock: `flock(2)` is attempted
//! non-blockingly in a loop with a constant sleep between attempts, not an
//! exponential backoff.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::fcntl::{FlockArg, flock};

/// Interval between non-blocking `flock` attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Whether the lock is shared (readers) or exclusive (writers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// Shared lock, taken while only reading the metadata index.
    Read,
    /// Exclusive lock, taken while mutating the metadata index or the
    /// image tree it describes.
    Write,
}

impl LockType {
    fn as_str(self) -> &'static str {
        match self {
            LockType::Read => "read",
            LockType::Write => "write",
        }
    }

    fn flock_arg(self) -> FlockArg {
        match self {
            LockType::Read => FlockArg::LockSharedNonblock,
            LockType::Write => FlockArg::LockExclusiveNonblock,
        }
    }
}

/// A held advisory lock on a repository's lock file.
///
/// Released by `flock(LOCK_UN)` and `close()` on drop. Both are best-effort:
/// a failure there is logged at INFO and otherwise ignored, matching the
/// non-fatal release semantics of the primitive this is grounded on.
#[derive(Debug)]
pub struct Flock {
    file: File,
    path: PathBuf,
    lock_type: LockType,
}

impl Flock {
    /// Acquires a lock on `path`, creating the file if absent.
    ///
    /// Retries a non-blocking `flock` every [`RETRY_INTERVAL`] until
    /// `timeout` elapses, at which point [`crate::Error::LockTimeout`] is
    /// returned. Once `warn_after` has elapsed without success, a `WARN` is
    /// logged every time another multiple of `warn_after` passes.
    pub fn acquire(
        path: &Path,
        lock_type: LockType,
        timeout: Duration,
        warn_after: Duration,
    ) -> crate::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        let mut warnings_emitted = 0u32;

        loop {
            match flock(file.as_raw_fd(), lock_type.flock_arg()) {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                        lock_type,
                    });
                }
                Err(nix::errno::Errno::EWOULDBLOCK) => {}
                Err(errno) => return Err(std::io::Error::from(errno).into()),
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(crate::Error::LockTimeout {
                    path: path.display().to_string(),
                    lock_type: lock_type.as_str(),
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }

            if !warn_after.is_zero() {
                let crossed = (elapsed.as_nanos() / warn_after.as_nanos().max(1)) as u32;
                if crossed > warnings_emitted {
                    warnings_emitted = crossed;
                    tracing::warn!(
                        path = %path.display(),
                        lock_type = lock_type.as_str(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "still waiting for repository lock",
                    );
                }
            }

            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Path of the underlying lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Flock {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::UnlockNonblock) {
            tracing::info!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_releases_write_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json.lock");
        let lock = Flock::acquire(
            &path,
            LockType::Write,
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
        .unwrap();
        assert_eq!(lock.path(), path.as_path());
        drop(lock);

        let _second = Flock::acquire(
            &path,
            LockType::Write,
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
        .unwrap();
    }

    #[test]
    fn second_exclusive_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json.lock");
        let _held = Flock::acquire(
            &path,
            LockType::Write,
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
        .unwrap();

        let err = Flock::acquire(
            &path,
            LockType::Write,
            Duration::from_millis(250),
            Duration::from_millis(500),
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::LockTimeout { .. }));
    }

    #[test]
    fn shared_locks_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json.lock");
        let _a = Flock::acquire(
            &path,
            LockType::Read,
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
        .unwrap();
        let _b = Flock::acquire(
            &path,
            LockType::Read,
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
        .unwrap();
    }
}
