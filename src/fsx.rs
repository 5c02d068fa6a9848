//! Thin filesystem wrapper for the direct (non-shell) code paths.
//!
//! Re-exports `std::fs` and adds the few POSIX calls the standard library does not expose:
//! `mkfifo`, path-based `utimensat` and plain mode changes. Everything here acts on the
//! process's own identity, so it is only useful when that identity already has the required
//! privileges (or when operating on the caller's own files).

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub use std::fs::*;

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

/// Set POSIX permission bits (including setuid/setgid/sticky).
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Create a named pipe. The final mode is applied separately by the caller.
pub fn make_fifo(path: &Path, mode: u32) -> io::Result<()> {
    let c = c_path(path)?;
    // SAFETY: `c` is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c.as_ptr(), mode as libc::mode_t) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Set the modification time (seconds) without touching the access time and without opening
/// the file, so FIFOs do not block. A final symlink is not followed.
pub fn set_mod_time(path: &Path, secs: i64) -> io::Result<()> {
    let c = c_path(path)?;
    let times = [
        libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
        libc::timespec { tv_sec: secs as libc::time_t, tv_nsec: 0 },
    ];
    // SAFETY: `c` and `times` outlive the call; AT_FDCWD makes the path resolve normally.
    let rc = unsafe {
        libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW)
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Remove whatever non-directory object sits at `path` (file, link, fifo). Missing is fine.
pub fn remove_non_directory(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => std::fs::remove_file(path),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}
