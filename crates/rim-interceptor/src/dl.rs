//! Scoped dynamic-loader handles.
//!
//! A [`LibraryHandle`] is opened for exactly one lookup and closed when it
//! drops, on every exit path. Each handle reports to a [`HandleLedger`] so
//! the open/close balance of a resolution can be observed.

use libc::{c_int, c_void};
use std::ffi::CStr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Library searched when a genuine function has to be resolved on demand.
#[cfg(target_os = "macos")]
pub const DEFAULT_LIBRARY: &CStr = c"libc.dylib";
#[cfg(all(not(target_os = "macos"), target_env = "musl"))]
pub const DEFAULT_LIBRARY: &CStr = c"libc.so";
#[cfg(all(not(target_os = "macos"), not(target_env = "musl")))]
pub const DEFAULT_LIBRARY: &CStr = c"libc.so.6";

// Symbols looked up through a handle must stay mapped after dlclose.
const OPEN_FLAGS: c_int = libc::RTLD_LAZY | libc::RTLD_LOCAL | libc::RTLD_NODELETE;

#[derive(Debug, Default)]
pub struct HandleLedger {
    opened: AtomicUsize,
    live: AtomicUsize,
}

impl HandleLedger {
    pub const fn new() -> Self {
        Self {
            opened: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }

    /// Handles ever opened against this ledger.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// Handles opened but not yet closed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

pub struct LibraryHandle<'a> {
    raw: NonNull<c_void>,
    ledger: &'a HandleLedger,
}

impl<'a> LibraryHandle<'a> {
    /// Opens `library`, or returns `None` if the loader cannot find it.
    pub unsafe fn open(library: &CStr, ledger: &'a HandleLedger) -> Option<Self> {
        let raw = NonNull::new(libc::dlopen(library.as_ptr(), OPEN_FLAGS))?;
        ledger.opened.fetch_add(1, Ordering::AcqRel);
        ledger.live.fetch_add(1, Ordering::AcqRel);
        Some(Self { raw, ledger })
    }

    pub unsafe fn lookup(&self, symbol: &CStr) -> Option<NonNull<c_void>> {
        NonNull::new(libc::dlsym(self.raw.as_ptr(), symbol.as_ptr()))
    }
}

impl Drop for LibraryHandle<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.raw.as_ptr());
        }
        self.ledger.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// "Next definition in search order" lookup, skipping the calling module.
pub unsafe fn next_in_search_order(symbol: &CStr) -> Option<NonNull<c_void>> {
    NonNull::new(libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr()))
}

/// The loader's pending error message. Only valid until the next `dl*`
/// call on this thread, so use it immediately.
pub unsafe fn last_error<'a>() -> Option<&'a CStr> {
    let msg = libc::dlerror();
    if msg.is_null() {
        None
    } else {
        Some(CStr::from_ptr(msg))
    }
}
