//! # rim-interceptor
//!
//! LD_PRELOAD / DYLD_INSERT_LIBRARIES interposition layer for the `unlink`
//! and `unlinkat` deletion entry points. Each call is logged and then
//! forwarded, unchanged, to the genuine C library implementation.
//!
//! ## Usage (Linux)
//!
//! ```bash
//! LD_PRELOAD=/path/to/librim_interceptor.so rm /tmp/t1
//! ```
//!
//! ## Usage (macOS)
//!
//! ```bash
//! DYLD_INSERT_LIBRARIES=/path/to/librim_interceptor.dylib rm /tmp/t1
//! ```
//!
//! ## Environment Variables
//!
//! - `RIM_LOG_LEVEL`: `trace`, `debug`, `info` (default), `warn`, `error` or `off`
//! - `RIM_LOG_FD`: descriptor that receives diagnostic lines (default `2`; negative disables)
//! - `RIM_LIBC_PATH`: library opened when a genuine symbol must be resolved on demand
//!
//! Nothing in this crate allocates or panics on the interception path: it
//! runs inside arbitrary host processes, possibly before `main`.

// Allow unsafe FFI functions without safety docs - these are inherently unsafe C ABI
#![allow(clippy::missing_safety_doc)]

// Macros must be defined before modules that use them
#[macro_use]
pub mod macros;

pub mod dl;
pub mod interpose;
pub mod reals;
pub mod state;

pub use interpose::{forward_unlink, forward_unlinkat, intercept_unlink, intercept_unlinkat};
pub use reals::{RealSymbol, ResolveError, REAL_UNLINK, REAL_UNLINKAT};
pub use state::LOGGER;

use libc::{c_char, c_int};
use std::sync::atomic::Ordering;

// ============================================================================
// Module initializer
// ============================================================================

/// Runs before the host's `main`: reads configuration and primes the
/// genuine-function slots. Misses are left for on-demand resolution.
unsafe extern "C" fn init_interceptor() {
    state::init_from_env();
    reals::prime_all();
    rim_info!(
        "interceptor loaded (unlink={}, unlinkat={})",
        REAL_UNLINK.state(),
        REAL_UNLINKAT.state()
    );
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
#[link_section = ".init_array"]
#[used]
pub static RIM_INIT: unsafe extern "C" fn() = init_interceptor;

#[cfg(target_os = "macos")]
#[link_section = "__DATA,__mod_init_func"]
#[used]
pub static RIM_INIT: unsafe extern "C" fn() = init_interceptor;

// ============================================================================
// Platform-specific errno handling
// ============================================================================

#[cfg(target_os = "linux")]
pub(crate) fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[cfg(target_os = "linux")]
pub(crate) fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub(crate) fn errno() -> c_int {
    unsafe { *libc::__error() }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub(crate) fn set_errno(e: c_int) {
    unsafe { *libc::__error() = e }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
pub(crate) fn errno() -> c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
pub(crate) fn set_errno(_e: c_int) {
    // Unsupported platform - no-op
}

// ============================================================================
// Telemetry
// ============================================================================

/// Writes a NUL-terminated JSON summary of the interceptor into `buf`.
/// Returns the length written (terminator excluded), or -1 if `buf` is null
/// or too small.
#[no_mangle]
pub unsafe extern "C" fn rim_interceptor_stats(buf: *mut c_char, buf_size: usize) -> c_int {
    use std::fmt::Write;
    if buf.is_null() || buf_size == 0 {
        return -1;
    }

    let mut scratch = [0u8; 1024];
    let mut writer = macros::StackWriter::new(&mut scratch);

    let _ = writeln!(writer, "{{");
    let _ = writeln!(writer, "  \"pid\": {},", libc::getpid());
    let _ = writeln!(
        writer,
        "  \"log_level\": \"{}\",",
        state::LogLevel::from_u8(state::LOG_LEVEL.load(Ordering::Relaxed)).tag()
    );
    let _ = writeln!(writer, "  \"symbols\": {{");
    let symbols = [&REAL_UNLINK, &REAL_UNLINKAT];
    for (i, sym) in symbols.iter().enumerate() {
        let _ = writeln!(
            writer,
            "    \"{}\": {{ \"state\": \"{}\", \"attempts\": {}, \"handles_opened\": {}, \"open_handles\": {} }}{}",
            sym.name().to_string_lossy(),
            sym.state(),
            sym.attempts(),
            sym.handles_opened(),
            sym.open_handles(),
            if i + 1 < symbols.len() { "," } else { "" }
        );
    }
    let _ = writeln!(writer, "  }},");
    let _ = writeln!(writer, "  \"calls\": {{");
    let _ = writeln!(
        writer,
        "    \"unlink\": {},",
        interpose::UNLINK_CALLS.load(Ordering::Relaxed)
    );
    let _ = writeln!(
        writer,
        "    \"unlinkat\": {}",
        interpose::UNLINKAT_CALLS.load(Ordering::Relaxed)
    );
    let _ = writeln!(writer, "  }},");
    let _ = writeln!(writer, "  \"log_bytes\": {}", LOGGER.written());
    let _ = write!(writer, "}}");

    if writer.is_truncated() {
        return -1;
    }
    let out = writer.as_bytes();
    let len = out.len();
    if len >= buf_size {
        return -1;
    }
    std::ptr::copy_nonoverlapping(out.as_ptr(), buf as *mut u8, len);
    *buf.add(len) = 0;
    len as c_int
}

/// Writes the in-memory log ring to `fd`.
#[no_mangle]
pub extern "C" fn rim_interceptor_dump_log(fd: c_int) {
    LOGGER.dump(fd);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "macos"))]
    #[test]
    fn test_initializer_primed_both_slots_before_main() {
        for sym in [&REAL_UNLINK, &REAL_UNLINKAT] {
            assert!(sym.is_resolved());
            assert!(sym.attempts() >= 1);
            // Primed through the search order, never through a library handle
            assert_eq!(sym.handles_opened(), 0);
        }

        let mut out = vec![0u8; state::LOG_BUF_SIZE];
        let n = LOGGER.snapshot(&mut out);
        let text = String::from_utf8_lossy(&out[..n]);
        assert!(text.contains("interceptor loaded (unlink=resolved, unlinkat=resolved)"));
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "macos"))]
    #[test]
    fn test_set_errno_roundtrip() {
        set_errno(libc::ENOSYS);
        assert_eq!(errno(), libc::ENOSYS);
        set_errno(0);
        assert_eq!(errno(), 0);
    }
}
