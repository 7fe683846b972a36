//! Real Symbol Storage
//!
//! Each intercepted entry point keeps the address of the genuine libc
//! implementation in a [`RealSymbol`]. A slot is either unresolved (null) or
//! resolved; it is written at most once through a compare-and-swap and never
//! changes afterwards. The wrappers only ever call through these slots, never
//! through the public symbol name they themselves occupy.

use crate::dl::{self, HandleLedger, LibraryHandle};
use libc::c_void;
use std::ffi::CStr;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("could not open {}", .library.to_string_lossy())]
    LibraryUnavailable { library: &'static CStr },
    #[error(
        "could not find the symbol for {}(2) in {}",
        .symbol.to_string_lossy(),
        .library.to_string_lossy()
    )]
    MissingSymbol {
        symbol: &'static CStr,
        library: &'static CStr,
    },
    #[error("{} resolved to the interceptor itself", .symbol.to_string_lossy())]
    SelfReference { symbol: &'static CStr },
}

pub struct RealSymbol {
    ptr: AtomicPtr<c_void>,
    name: &'static CStr,
    library: Option<&'static CStr>,
    attempts: AtomicUsize,
    handles: HandleLedger,
}

impl RealSymbol {
    /// Slot for `name`, resolved on demand from the platform C library
    /// (or `RIM_LIBC_PATH` when set).
    pub const fn new(name: &'static CStr) -> Self {
        Self::build(name, None)
    }

    /// Slot for `name`, resolved on demand from `library`.
    pub const fn with_library(name: &'static CStr, library: &'static CStr) -> Self {
        Self::build(name, Some(library))
    }

    const fn build(name: &'static CStr, library: Option<&'static CStr>) -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            name,
            library,
            attempts: AtomicUsize::new(0),
            handles: HandleLedger::new(),
        }
    }

    pub fn name(&self) -> &'static CStr {
        self.name
    }

    pub fn library(&self) -> &'static CStr {
        self.library
            .or_else(crate::state::library_override)
            .unwrap_or(dl::DEFAULT_LIBRARY)
    }

    /// The resolved address, without attempting resolution.
    pub fn peek(&self) -> Option<NonNull<c_void>> {
        NonNull::new(self.ptr.load(Ordering::Acquire))
    }

    pub fn is_resolved(&self) -> bool {
        self.peek().is_some()
    }

    pub fn state(&self) -> &'static str {
        if self.is_resolved() {
            "resolved"
        } else {
            "unresolved"
        }
    }

    /// Number of times this slot tried to resolve (priming included).
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    /// Library handles ever opened while resolving this slot.
    pub fn handles_opened(&self) -> usize {
        self.handles.opened()
    }

    /// Library handles currently open on behalf of this slot.
    pub fn open_handles(&self) -> usize {
        self.handles.live()
    }

    /// Best-effort resolution through "next in search order". Stores the
    /// result if one was found; a miss leaves the slot for `get()`.
    pub unsafe fn prime(&self) -> bool {
        if self.is_resolved() {
            return true;
        }
        self.attempts.fetch_add(1, Ordering::AcqRel);
        match dl::next_in_search_order(self.name) {
            Some(f) => {
                self.install(f);
                true
            }
            None => false,
        }
    }

    /// Returns the genuine implementation, resolving it through a scoped
    /// library handle if nothing has been stored yet.
    pub unsafe fn get(&self) -> Result<NonNull<c_void>, ResolveError> {
        self.get_excluding(ptr::null())
    }

    /// Like [`get`](Self::get), but refuses an address equal to `own`, the
    /// caller's own entry point.
    pub unsafe fn get_excluding(
        &self,
        own: *const c_void,
    ) -> Result<NonNull<c_void>, ResolveError> {
        if let Some(f) = self.peek() {
            return Ok(f);
        }
        let f = self.resolve_on_demand()?;
        if f.as_ptr() as *const c_void == own {
            return Err(ResolveError::SelfReference { symbol: self.name });
        }
        Ok(self.install(f))
    }

    unsafe fn resolve_on_demand(&self) -> Result<NonNull<c_void>, ResolveError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let library = self.library();
        let handle = LibraryHandle::open(library, &self.handles)
            .ok_or(ResolveError::LibraryUnavailable { library })?;
        let f = handle.lookup(self.name).ok_or(ResolveError::MissingSymbol {
            symbol: self.name,
            library,
        })?;
        crate::rim_debug!(
            "resolved {} from {} at {:p}",
            self.name.to_string_lossy(),
            library.to_string_lossy(),
            f.as_ptr()
        );
        Ok(f)
    }

    /// Set-once store. A thread that loses the race adopts the winner's value.
    fn install(&self, f: NonNull<c_void>) -> NonNull<c_void> {
        match self.ptr.compare_exchange(
            ptr::null_mut(),
            f.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => f,
            // SAFETY: only non-null values are ever stored.
            Err(existing) => unsafe { NonNull::new_unchecked(existing) },
        }
    }
}

pub static REAL_UNLINK: RealSymbol = RealSymbol::new(c"unlink");
pub static REAL_UNLINKAT: RealSymbol = RealSymbol::new(c"unlinkat");

/// Primes every slot. Used by the module initializer.
pub unsafe fn prime_all() {
    REAL_UNLINK.prime();
    REAL_UNLINKAT.prime();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_resolves_on_demand_once() {
        let sym = RealSymbol::with_library(c"unlink", dl::DEFAULT_LIBRARY);
        assert!(!sym.is_resolved());

        let first = unsafe { sym.get() }.unwrap();
        let second = unsafe { sym.get() }.unwrap();
        assert_eq!(first, second);
        assert_eq!(sym.attempts(), 1);
        assert_eq!(sym.handles_opened(), 1);
        assert_eq!(sym.open_handles(), 0);
    }

    #[test]
    fn test_missing_symbol_releases_handle() {
        let sym = RealSymbol::with_library(c"rim_no_such_symbol", dl::DEFAULT_LIBRARY);
        let err = unsafe { sym.get() }.unwrap_err();
        assert_eq!(
            err,
            ResolveError::MissingSymbol {
                symbol: c"rim_no_such_symbol",
                library: dl::DEFAULT_LIBRARY,
            }
        );
        assert!(!sym.is_resolved());
        assert_eq!(sym.handles_opened(), 1);
        assert_eq!(sym.open_handles(), 0);
    }

    #[test]
    fn test_missing_library_is_reported() {
        let sym = RealSymbol::with_library(c"unlink", c"librim-missing.so.0");
        let err = unsafe { sym.get() }.unwrap_err();
        assert!(matches!(err, ResolveError::LibraryUnavailable { .. }));
        assert_eq!(err.to_string(), "could not open librim-missing.so.0");
        assert_eq!(sym.handles_opened(), 0);
        assert_eq!(sym.open_handles(), 0);
    }

    #[test]
    fn test_failed_resolution_is_retried() {
        let sym = RealSymbol::with_library(c"rim_no_such_symbol", dl::DEFAULT_LIBRARY);
        assert!(unsafe { sym.get() }.is_err());
        assert!(unsafe { sym.get() }.is_err());
        assert_eq!(sym.attempts(), 2);
        assert_eq!(sym.open_handles(), 0);
    }

    #[test]
    fn test_prime_skips_handle() {
        let sym = RealSymbol::with_library(c"unlinkat", c"librim-missing.so.0");
        assert!(unsafe { sym.prime() });
        assert!(sym.is_resolved());
        // Already resolved, so the unusable library is never touched.
        assert!(unsafe { sym.get() }.is_ok());
        assert_eq!(sym.handles_opened(), 0);
        assert_eq!(sym.attempts(), 1);
    }

    #[test]
    fn test_prime_and_on_demand_agree() {
        let primed = RealSymbol::new(c"unlinkat");
        let loaded = RealSymbol::with_library(c"unlinkat", dl::DEFAULT_LIBRARY);
        unsafe {
            assert!(primed.prime());
            assert_eq!(primed.get().unwrap(), loaded.get().unwrap());
        }
    }

    #[test]
    fn test_rejects_own_address() {
        let sym = RealSymbol::with_library(c"unlink", dl::DEFAULT_LIBRARY);
        let real = unsafe { dl::next_in_search_order(c"unlink") }.unwrap();
        let err = unsafe { sym.get_excluding(real.as_ptr()) }.unwrap_err();
        assert_eq!(err, ResolveError::SelfReference { symbol: c"unlink" });
        assert!(!sym.is_resolved());
        assert_eq!(sym.open_handles(), 0);
    }

    #[test]
    fn test_error_messages_name_symbol_and_library() {
        let err = ResolveError::MissingSymbol {
            symbol: c"unlink",
            library: c"libc.so.6",
        };
        assert_eq!(
            err.to_string(),
            "could not find the symbol for unlink(2) in libc.so.6"
        );
    }
}
