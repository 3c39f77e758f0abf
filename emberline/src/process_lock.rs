//! Process-level lock for the upload command.
//!
//! The uploader already coalesces concurrent requests within one process;
//! this lock extends the single-flight guarantee across processes sharing a
//! database. Locks are advisory OS file locks (flock), held for process
//! lifetime.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const UPLOAD_LOCK_FILE: &str = "emberline-upload.lock";

/// Guard held by the uploading process.
pub struct UploadProcessGuard {
    /// Held for full process lifetime to mark the upload process active.
    _lock: ProcessLock,
}

/// Acquire the upload lock for a database.
///
/// Fails if another emberline upload for the same database is running.
pub fn acquire_upload_guard(db_path: &Path) -> Result<UploadProcessGuard> {
    let lock = acquire_lock(UPLOAD_LOCK_FILE, db_path).with_context(|| {
        "refusing to upload: another emberline upload appears to be running for this database"
    })?;

    Ok(UploadProcessGuard { _lock: lock })
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        // Best-effort cleanup of lock file itself (not required for correctness).
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_lock(filename: &str, db_path: &Path) -> Result<ProcessLock> {
    match try_acquire_lock(filename, db_path)? {
        Some(lock) => Ok(lock),
        None => anyhow::bail!("lock is already held: {}", filename),
    }
}

fn try_acquire_lock(filename: &str, db_path: &Path) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, db_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Write basic owner info for debugging.
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();

            Ok(Some(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("emberline");
    dir
}

fn scoped_lock_filename(base_filename: &str, db_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    db_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("emberline process locks currently require Unix (macOS/Linux)");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_per_database() {
        let db_path = std::env::temp_dir().join(format!(
            "emberline-lock-test-{}.db",
            std::process::id()
        ));

        let first = try_acquire_lock(UPLOAD_LOCK_FILE, &db_path).unwrap();
        assert!(first.is_some());

        // A second descriptor cannot take the lock while the first holds it
        let contended = try_acquire_lock(UPLOAD_LOCK_FILE, &db_path).unwrap();
        assert!(contended.is_none());

        // Released on drop
        drop(first);
        let second = try_acquire_lock(UPLOAD_LOCK_FILE, &db_path).unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn test_scoped_lock_filename_differs_per_database() {
        let a = scoped_lock_filename(UPLOAD_LOCK_FILE, Path::new("/tmp/a.db"));
        let b = scoped_lock_filename(UPLOAD_LOCK_FILE, Path::new("/tmp/b.db"));
        assert_ne!(a, b);
        assert!(a.starts_with(UPLOAD_LOCK_FILE));
    }
}
