//! The intercepted deletion entry points.
//!
//! `intercept_unlink` / `intercept_unlinkat` log the call and forward it to
//! the genuine implementation held in [`crate::reals`]. How they are bound
//! to the public names depends on the platform:
//!
//! - ELF targets export `unlink` and `unlinkat` directly; `LD_PRELOAD`
//!   puts them ahead of libc in the search order.
//! - macOS registers them in the `__DATA,__interpose` table for dyld.

use crate::macros::CPath;
use crate::reals::{RealSymbol, ResolveError, REAL_UNLINK, REAL_UNLINKAT};
use libc::{c_char, c_int, c_void};
use std::ffi::CStr;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

type UnlinkFn = unsafe extern "C" fn(*const c_char) -> c_int;
type UnlinkatFn = unsafe extern "C" fn(c_int, *const c_char, c_int) -> c_int;

pub static UNLINK_CALLS: AtomicU64 = AtomicU64::new(0);
pub static UNLINKAT_CALLS: AtomicU64 = AtomicU64::new(0);

pub unsafe extern "C" fn intercept_unlink(path: *const c_char) -> c_int {
    UNLINK_CALLS.fetch_add(1, Ordering::Relaxed);
    forward_unlink(&REAL_UNLINK, path)
}

pub unsafe extern "C" fn intercept_unlinkat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
) -> c_int {
    UNLINKAT_CALLS.fetch_add(1, Ordering::Relaxed);
    forward_unlinkat(&REAL_UNLINKAT, dirfd, path, flags)
}

/// Logs an `unlink` call and forwards it through `real`.
pub unsafe fn forward_unlink(real: &RealSymbol, path: *const c_char) -> c_int {
    rim_info!("unlink(path=\"{}\")", CPath::new(path));

    let f = match real.get_excluding(own_unlink()) {
        Ok(f) => std::mem::transmute::<*mut c_void, UnlinkFn>(f.as_ptr()),
        Err(e) => return resolution_failed(real, e),
    };
    f(path)
}

/// Logs an `unlinkat` call and forwards it through `real`.
pub unsafe fn forward_unlinkat(
    real: &RealSymbol,
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
) -> c_int {
    rim_info!(
        "unlinkat(fd={}, path=\"{}\", flags={})",
        DirFd(dirfd),
        CPath::new(path),
        AtFlags(flags)
    );

    let f = match real.get_excluding(own_unlinkat()) {
        Ok(f) => std::mem::transmute::<*mut c_void, UnlinkatFn>(f.as_ptr()),
        Err(e) => return resolution_failed(real, e),
    };
    f(dirfd, path, flags)
}

/// Single failure path for every wrapper: nothing is deleted, the caller
/// sees `-1` with `errno = ENOSYS`.
unsafe fn resolution_failed(sym: &RealSymbol, err: ResolveError) -> c_int {
    let name = sym.name().to_string_lossy();
    match loader_detail(&err) {
        Some(detail) => rim_error!(
            "{}; {}(2) not forwarded: {}",
            err,
            name,
            detail.to_string_lossy()
        ),
        None => rim_error!("{}; {}(2) not forwarded", err, name),
    }
    crate::set_errno(libc::ENOSYS);
    -1
}

/// The loader's message for `err`. Only loader failures have one; for the
/// others any pending `dlerror()` text belongs to an unrelated call.
unsafe fn loader_detail<'a>(err: &ResolveError) -> Option<&'a CStr> {
    match err {
        ResolveError::LibraryUnavailable { .. } | ResolveError::MissingSymbol { .. } => {
            crate::dl::last_error()
        }
        ResolveError::SelfReference { .. } => None,
    }
}

struct DirFd(c_int);

impl fmt::Display for DirFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == libc::AT_FDCWD {
            f.write_str("AT_FDCWD")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

struct AtFlags(c_int);

impl fmt::Display for AtFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rest = self.0 & !libc::AT_REMOVEDIR;
        match (self.0 & libc::AT_REMOVEDIR != 0, rest) {
            (false, _) => write!(f, "{:#x}", self.0),
            (true, 0) => f.write_str("AT_REMOVEDIR"),
            (true, rest) => write!(f, "AT_REMOVEDIR|{:#x}", rest),
        }
    }
}

// ============================================================================
// ELF exports
// ============================================================================

#[cfg(not(target_os = "macos"))]
#[no_mangle]
pub unsafe extern "C" fn unlink(path: *const c_char) -> c_int {
    intercept_unlink(path)
}

#[cfg(not(target_os = "macos"))]
#[no_mangle]
pub unsafe extern "C" fn unlinkat(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    intercept_unlinkat(dirfd, path, flags)
}

#[cfg(not(target_os = "macos"))]
fn own_unlink() -> *const c_void {
    unlink as UnlinkFn as *const c_void
}

#[cfg(not(target_os = "macos"))]
fn own_unlinkat() -> *const c_void {
    unlinkat as UnlinkatFn as *const c_void
}

// ============================================================================
// macOS interpose table
// ============================================================================

#[cfg(target_os = "macos")]
#[repr(C)]
pub struct Interpose {
    pub new_func: *const (),
    pub old_func: *const (),
}

#[cfg(target_os = "macos")]
unsafe impl Sync for Interpose {}

#[cfg(target_os = "macos")]
#[link_section = "__DATA,__interpose"]
#[used]
pub static IT_UNLINK: Interpose = Interpose {
    new_func: intercept_unlink as *const (),
    old_func: libc::unlink as *const (),
};

#[cfg(target_os = "macos")]
#[link_section = "__DATA,__interpose"]
#[used]
pub static IT_UNLINKAT: Interpose = Interpose {
    new_func: intercept_unlinkat as *const (),
    old_func: libc::unlinkat as *const (),
};

#[cfg(target_os = "macos")]
fn own_unlink() -> *const c_void {
    intercept_unlink as UnlinkFn as *const c_void
}

#[cfg(target_os = "macos")]
fn own_unlinkat() -> *const c_void {
    intercept_unlinkat as UnlinkatFn as *const c_void
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirfd_display() {
        assert_eq!(DirFd(libc::AT_FDCWD).to_string(), "AT_FDCWD");
        assert_eq!(DirFd(5).to_string(), "5");
    }

    #[test]
    fn test_at_flags_display() {
        assert_eq!(AtFlags(0).to_string(), "0x0");
        assert_eq!(AtFlags(libc::AT_REMOVEDIR).to_string(), "AT_REMOVEDIR");
        assert_eq!(
            AtFlags(libc::AT_REMOVEDIR | 0x1).to_string(),
            "AT_REMOVEDIR|0x1"
        );
    }

    #[test]
    fn test_self_reference_ignores_pending_loader_error() {
        let ledger = crate::dl::HandleLedger::new();
        unsafe {
            // Leaves a dlerror() message pending on this thread
            assert!(crate::dl::LibraryHandle::open(c"librim-missing.so.0", &ledger).is_none());
            let err = ResolveError::SelfReference { symbol: c"unlink" };
            assert!(loader_detail(&err).is_none());
            let err = ResolveError::LibraryUnavailable {
                library: c"librim-missing.so.0",
            };
            assert!(loader_detail(&err).is_some());
        }
    }

    #[test]
    fn test_own_entry_points_are_not_the_genuine_ones() {
        unsafe {
            assert_ne!(
                REAL_UNLINK.get_excluding(own_unlink()).unwrap().as_ptr() as *const c_void,
                own_unlink()
            );
            assert_ne!(
                REAL_UNLINKAT.get_excluding(own_unlinkat()).unwrap().as_ptr() as *const c_void,
                own_unlinkat()
            );
        }
    }
}
